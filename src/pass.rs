//! The pass surface and pipeline manager.
//!
//! A pass sees the pipeline three times: `configure` once before anything
//! runs, `run` with a read-write view of the scope, and `metrics` after its
//! run to publish named counters. Configuration is a JSON object keyed by
//! pass name, with typed getters over defaults.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hierarchy::{build_type_hierarchy, ClassHierarchy};
use crate::ir::{DexContext, Scope};

/// The configuration slice a single pass sees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassConfig {
    value: Value,
}

impl PassConfig {
    /// Wraps a JSON object (or `null` for "all defaults").
    #[must_use]
    pub fn new(value: Value) -> Self {
        PassConfig { value }
    }

    /// A boolean option.
    #[must_use]
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.value
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// An integer option.
    #[must_use]
    pub fn get_i64(&self, name: &str, default: i64) -> i64 {
        self.value
            .get(name)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    /// A string option.
    #[must_use]
    pub fn get_str(&self, name: &str, default: &str) -> String {
        self.value
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    /// A list-of-strings option.
    #[must_use]
    pub fn get_str_list(&self, name: &str) -> Vec<String> {
        self.value
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// An optimization pass over a scope.
pub trait Pass {
    /// Unique name, also the key of the pass's configuration object.
    fn name(&self) -> &'static str;

    /// Called once before the pipeline begins; reads named options with
    /// defaults.
    fn configure(&mut self, _config: &PassConfig) {}

    /// Called during the pipeline with a read-write view of the scope.
    /// All IR mutations go through the interning context, so shared handles
    /// stay consistent.
    fn run(&mut self, scope: &mut Scope, ctx: &DexContext, mgr: &mut PassManager);

    /// Publishes named counters after the run.
    fn metrics(&self, _mgr: &mut PassManager) {}
}

/// Drives a pass pipeline and collects its metrics.
pub struct PassManager {
    config: Value,
    metrics: FxHashMap<String, i64>,
    current_pass: String,
    hierarchy: Option<ClassHierarchy>,
}

impl PassManager {
    /// A manager with the given root configuration (an object keyed by pass
    /// name).
    #[must_use]
    pub fn new(config: Value) -> Self {
        PassManager {
            config,
            metrics: FxHashMap::default(),
            current_pass: String::new(),
            hierarchy: None,
        }
    }

    /// Runs each pass in order: configure, run, metrics.
    pub fn run_passes(
        &mut self,
        passes: &mut [Box<dyn Pass>],
        scope: &mut Scope,
        ctx: &DexContext,
    ) {
        for pass in passes.iter_mut() {
            let slice = PassConfig::new(
                self.config
                    .get(pass.name())
                    .cloned()
                    .unwrap_or(Value::Null),
            );
            pass.configure(&slice);
        }
        for pass in passes.iter_mut() {
            self.current_pass = pass.name().to_string();
            log::debug!("running pass {}", self.current_pass);
            pass.run(scope, ctx, self);
            pass.metrics(self);
        }
        self.current_pass.clear();
    }

    /// Adds `value` to the named counter, scoped by the running pass.
    pub fn incr_metric(&mut self, name: &str, value: i64) {
        let key = if self.current_pass.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.current_pass, name)
        };
        *self.metrics.entry(key).or_insert(0) += value;
    }

    /// The collected counters.
    #[must_use]
    pub fn metrics(&self) -> &FxHashMap<String, i64> {
        &self.metrics
    }

    /// The hierarchy index over `scope`, built on first use. Invalidate
    /// after class additions or super/interface mutations.
    pub fn class_hierarchy(&mut self, ctx: &DexContext, scope: &Scope) -> &ClassHierarchy {
        if self.hierarchy.is_none() {
            self.hierarchy = Some(build_type_hierarchy(ctx, scope));
        }
        self.hierarchy.as_ref().expect("hierarchy just built")
    }

    /// Drops the cached hierarchy; the next query rebuilds it.
    pub fn invalidate_hierarchy(&mut self) {
        self.hierarchy = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CountingPass {
        threshold: i64,
        seen: usize,
    }

    impl Pass for CountingPass {
        fn name(&self) -> &'static str {
            "CountingPass"
        }

        fn configure(&mut self, config: &PassConfig) {
            self.threshold = config.get_i64("threshold", 10);
        }

        fn run(&mut self, scope: &mut Scope, _ctx: &DexContext, mgr: &mut PassManager) {
            self.seen = scope.len();
            mgr.incr_metric("classes_seen", self.seen as i64);
            mgr.incr_metric("threshold", self.threshold);
        }
    }

    #[test]
    fn test_configure_run_metrics() {
        let ctx = DexContext::new();
        let mut scope = Scope::new();
        let config = json!({ "CountingPass": { "threshold": 42 } });
        let mut mgr = PassManager::new(config);
        let mut passes: Vec<Box<dyn Pass>> = vec![Box::new(CountingPass {
            threshold: 0,
            seen: 0,
        })];
        mgr.run_passes(&mut passes, &mut scope, &ctx);
        assert_eq!(mgr.metrics()["CountingPass.threshold"], 42);
        assert_eq!(mgr.metrics()["CountingPass.classes_seen"], 0);
    }

    #[test]
    fn test_defaults_when_unconfigured() {
        let config = PassConfig::new(Value::Null);
        assert!(config.get_bool("missing", true));
        assert_eq!(config.get_i64("missing", 7), 7);
        assert_eq!(config.get_str("missing", "x"), "x");
        assert!(config.get_str_list("missing").is_empty());
    }
}
