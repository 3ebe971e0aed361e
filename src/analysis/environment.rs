//! Abstract environments: maps from program variables to domain elements.
//!
//! An environment is itself an abstract domain. Variables not explicitly
//! bound have the value Top, which keeps the underlying tables small and
//! lets environments range over unbounded variable sets. By definition, a
//! binding to Bottom means no valid execution state exists, so the whole
//! environment collapses to Bottom the moment one appears.
//!
//! Two implementations share one surface: a hashtable-backed one for small
//! dense variable sets, and a Patricia-tree-backed one whose persistent
//! structure makes join/meet/leq between similar environments sublinear.

use std::hash::Hash;

use rustc_hash::FxHashMap;

use crate::analysis::domain::Domain;
use crate::collections::{AbstractMapValue, PatriciaKey, PatriciaTreeMap};

/// Hashtable-backed environment with implicit-Top bindings.
#[derive(Debug, Clone)]
pub enum HashedAbstractEnvironment<Var: Eq + Hash + Clone, D: Domain> {
    /// No valid execution state.
    Bottom,
    /// Explicit non-Top bindings; an empty map is the Top environment.
    Value(FxHashMap<Var, D>),
}

impl<Var: Eq + Hash + Clone, D: Domain> Default for HashedAbstractEnvironment<Var, D> {
    fn default() -> Self {
        HashedAbstractEnvironment::Value(FxHashMap::default())
    }
}

impl<Var: Eq + Hash + Clone, D: Domain> HashedAbstractEnvironment<Var, D> {
    /// The Top environment (every variable unconstrained).
    #[must_use]
    pub fn top() -> Self {
        HashedAbstractEnvironment::default()
    }

    /// The Bottom environment.
    #[must_use]
    pub fn bottom() -> Self {
        HashedAbstractEnvironment::Bottom
    }

    /// True for Bottom.
    #[must_use]
    pub fn is_bottom(&self) -> bool {
        matches!(self, HashedAbstractEnvironment::Bottom)
    }

    /// True for Top (no explicit bindings).
    #[must_use]
    pub fn is_top(&self) -> bool {
        matches!(self, HashedAbstractEnvironment::Value(map) if map.is_empty())
    }

    /// Number of explicit bindings.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            HashedAbstractEnvironment::Bottom => 0,
            HashedAbstractEnvironment::Value(map) => map.len(),
        }
    }

    /// The explicit bindings, when not Bottom.
    #[must_use]
    pub fn bindings(&self) -> Option<&FxHashMap<Var, D>> {
        match self {
            HashedAbstractEnvironment::Bottom => None,
            HashedAbstractEnvironment::Value(map) => Some(map),
        }
    }

    /// The value of `var`: Bottom in the Bottom environment, Top when
    /// unbound.
    #[must_use]
    pub fn get(&self, var: &Var) -> D {
        match self {
            HashedAbstractEnvironment::Bottom => D::bottom(),
            HashedAbstractEnvironment::Value(map) => {
                map.get(var).cloned().unwrap_or_else(D::top)
            }
        }
    }

    /// Binds `var` to `value`. Binding Top removes the entry; binding Bottom
    /// collapses the environment.
    pub fn set(&mut self, var: Var, value: D) -> &mut Self {
        let HashedAbstractEnvironment::Value(map) = self else {
            return self;
        };
        if value.is_bottom() {
            *self = HashedAbstractEnvironment::Bottom;
            return self;
        }
        if value.is_top() {
            map.remove(&var);
        } else {
            map.insert(var, value);
        }
        self
    }

    /// Applies `operation` to the value at `var` (implicitly Top when
    /// unbound) and re-canonicalizes.
    pub fn update(&mut self, var: Var, operation: impl FnOnce(&D) -> D) -> &mut Self {
        let current = self.get(&var);
        if self.is_bottom() {
            return self;
        }
        let new = operation(&current);
        self.set(var, new)
    }

    fn join_like(&mut self, other: &Self, op: impl Fn(&mut D, &D)) {
        match (&mut *self, other) {
            (HashedAbstractEnvironment::Bottom, _) => *self = other.clone(),
            (_, HashedAbstractEnvironment::Bottom) => {}
            (
                HashedAbstractEnvironment::Value(map),
                HashedAbstractEnvironment::Value(other_map),
            ) => {
                map.retain(|var, value| match other_map.get(var) {
                    // The other value is Top: the binding disappears.
                    None => false,
                    Some(other_value) => {
                        op(value, other_value);
                        !value.is_top()
                    }
                });
            }
        }
    }

    fn meet_like(&mut self, other: &Self, op: impl Fn(&mut D, &D)) {
        let mut collapsed = false;
        match (&mut *self, other) {
            (HashedAbstractEnvironment::Bottom, _) => {}
            (_, HashedAbstractEnvironment::Bottom) => {
                collapsed = true;
            }
            (
                HashedAbstractEnvironment::Value(map),
                HashedAbstractEnvironment::Value(other_map),
            ) => {
                for (var, other_value) in other_map {
                    match map.get_mut(var) {
                        // Top is the identity for meet-like operations.
                        None => {
                            map.insert(var.clone(), other_value.clone());
                        }
                        Some(value) => {
                            op(value, other_value);
                            if value.is_bottom() {
                                collapsed = true;
                                break;
                            }
                        }
                    }
                }
            }
        }
        if collapsed {
            *self = HashedAbstractEnvironment::Bottom;
        }
    }

    /// Pointwise order.
    #[must_use]
    pub fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (HashedAbstractEnvironment::Bottom, _) => true,
            (_, HashedAbstractEnvironment::Bottom) => false,
            (
                HashedAbstractEnvironment::Value(map),
                HashedAbstractEnvironment::Value(other_map),
            ) => {
                // A variable bound (non-Top) in `other` but not here means
                // this side is Top there, and Top ≤ non-Top fails.
                other_map.keys().all(|var| map.contains_key(var))
                    && map.iter().all(|(var, value)| {
                        other_map.get(var).is_none_or(|o| value.leq(o))
                    })
            }
        }
    }

    /// Pointwise equality.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (HashedAbstractEnvironment::Bottom, HashedAbstractEnvironment::Bottom) => true,
            (
                HashedAbstractEnvironment::Value(map),
                HashedAbstractEnvironment::Value(other_map),
            ) => {
                map.len() == other_map.len()
                    && map.iter().all(|(var, value)| {
                        other_map.get(var).is_some_and(|o| value.equals(o))
                    })
            }
            _ => false,
        }
    }

    /// Pointwise join.
    pub fn join_with(&mut self, other: &Self) {
        self.join_like(other, |a, b| a.join_with(b));
    }

    /// Pointwise widening.
    pub fn widen_with(&mut self, other: &Self) {
        self.join_like(other, |a, b| a.widen_with(b));
    }

    /// Pointwise meet.
    pub fn meet_with(&mut self, other: &Self) {
        self.meet_like(other, |a, b| a.meet_with(b));
    }

    /// Pointwise narrowing.
    pub fn narrow_with(&mut self, other: &Self) {
        self.meet_like(other, |a, b| a.narrow_with(b));
    }
}

/// Patricia-tree-backed environment with implicit-Top bindings.
///
/// Join/meet/leq complete in sublinear time when the operands share
/// structure, which is the common case across fixpoint iterations.
#[derive(Debug, Clone)]
pub enum PatriciaTreeMapAbstractEnvironment<K: PatriciaKey, D: Domain + AbstractMapValue> {
    /// No valid execution state.
    Bottom,
    /// Explicit non-Top bindings; the empty map is the Top environment.
    Value(PatriciaTreeMap<K, D>),
}

impl<K: PatriciaKey, D: Domain + AbstractMapValue> Default
    for PatriciaTreeMapAbstractEnvironment<K, D>
{
    fn default() -> Self {
        PatriciaTreeMapAbstractEnvironment::Value(PatriciaTreeMap::new())
    }
}

impl<K: PatriciaKey, D: Domain + AbstractMapValue> PatriciaTreeMapAbstractEnvironment<K, D> {
    /// The Top environment.
    #[must_use]
    pub fn top() -> Self {
        PatriciaTreeMapAbstractEnvironment::default()
    }

    /// The Bottom environment.
    #[must_use]
    pub fn bottom() -> Self {
        PatriciaTreeMapAbstractEnvironment::Bottom
    }

    /// True for Bottom.
    #[must_use]
    pub fn is_bottom(&self) -> bool {
        matches!(self, PatriciaTreeMapAbstractEnvironment::Bottom)
    }

    /// True for Top.
    #[must_use]
    pub fn is_top(&self) -> bool {
        matches!(self, PatriciaTreeMapAbstractEnvironment::Value(map) if map.is_empty())
    }

    /// Number of explicit bindings.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            PatriciaTreeMapAbstractEnvironment::Bottom => 0,
            PatriciaTreeMapAbstractEnvironment::Value(map) => map.len(),
        }
    }

    /// The underlying map, when not Bottom.
    #[must_use]
    pub fn bindings(&self) -> Option<&PatriciaTreeMap<K, D>> {
        match self {
            PatriciaTreeMapAbstractEnvironment::Bottom => None,
            PatriciaTreeMapAbstractEnvironment::Value(map) => Some(map),
        }
    }

    /// The value of `var`.
    #[must_use]
    pub fn get(&self, var: K) -> D {
        match self {
            PatriciaTreeMapAbstractEnvironment::Bottom => D::bottom(),
            PatriciaTreeMapAbstractEnvironment::Value(map) => map.at(var),
        }
    }

    /// Binds `var` to `value`; Bottom collapses the environment.
    pub fn set(&mut self, var: K, value: D) -> &mut Self {
        let PatriciaTreeMapAbstractEnvironment::Value(map) = self else {
            return self;
        };
        if value.is_bottom() {
            *self = PatriciaTreeMapAbstractEnvironment::Bottom;
            return self;
        }
        map.insert_or_assign(var, value);
        self
    }

    /// Applies `operation` to the value at `var` (implicitly Top when
    /// unbound) and re-canonicalizes.
    pub fn update(&mut self, var: K, operation: impl Fn(&D) -> D) -> &mut Self {
        let PatriciaTreeMapAbstractEnvironment::Value(map) = self else {
            return self;
        };
        // The combining function receives (existing, new); the unary
        // operation only looks at the existing value.
        map.update(|existing| operation(existing), var);
        if map.iter().any(|(_, v)| v.is_bottom()) {
            *self = PatriciaTreeMapAbstractEnvironment::Bottom;
        }
        self
    }

    /// Pointwise order.
    #[must_use]
    pub fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (PatriciaTreeMapAbstractEnvironment::Bottom, _) => true,
            (_, PatriciaTreeMapAbstractEnvironment::Bottom) => false,
            (
                PatriciaTreeMapAbstractEnvironment::Value(map),
                PatriciaTreeMapAbstractEnvironment::Value(other_map),
            ) => map.leq(other_map),
        }
    }

    /// Pointwise equality; sublinear on shared structure.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (
                PatriciaTreeMapAbstractEnvironment::Bottom,
                PatriciaTreeMapAbstractEnvironment::Bottom,
            ) => true,
            (
                PatriciaTreeMapAbstractEnvironment::Value(map),
                PatriciaTreeMapAbstractEnvironment::Value(other_map),
            ) => map.equals(other_map),
            _ => false,
        }
    }

    /// Pointwise join: only keys bound on both sides survive (Top wins
    /// elsewhere), so this is an intersection of the maps.
    pub fn join_with(&mut self, other: &Self) {
        self.join_like(other, |a: &D, b: &D| {
            let mut out = a.clone();
            out.join_with(b);
            out
        });
    }

    /// Pointwise widening.
    pub fn widen_with(&mut self, other: &Self) {
        self.join_like(other, |a: &D, b: &D| {
            let mut out = a.clone();
            out.widen_with(b);
            out
        });
    }

    /// Pointwise meet: Top is the identity, so this is a union of the maps;
    /// a Bottom binding collapses the environment.
    pub fn meet_with(&mut self, other: &Self) {
        self.meet_like(other, |a: &D, b: &D| {
            let mut out = a.clone();
            out.meet_with(b);
            out
        });
    }

    /// Pointwise narrowing.
    pub fn narrow_with(&mut self, other: &Self) {
        self.meet_like(other, |a: &D, b: &D| {
            let mut out = a.clone();
            out.narrow_with(b);
            out
        });
    }

    fn join_like(&mut self, other: &Self, combine: impl Fn(&D, &D) -> D) {
        match (&mut *self, other) {
            (PatriciaTreeMapAbstractEnvironment::Bottom, _) => *self = other.clone(),
            (_, PatriciaTreeMapAbstractEnvironment::Bottom) => {}
            (
                PatriciaTreeMapAbstractEnvironment::Value(map),
                PatriciaTreeMapAbstractEnvironment::Value(other_map),
            ) => {
                map.intersection_with(combine, other_map);
            }
        }
    }

    fn meet_like(&mut self, other: &Self, combine: impl Fn(&D, &D) -> D) {
        match (&mut *self, other) {
            (PatriciaTreeMapAbstractEnvironment::Bottom, _) => {}
            (_, PatriciaTreeMapAbstractEnvironment::Bottom) => {
                *self = PatriciaTreeMapAbstractEnvironment::Bottom;
            }
            (
                PatriciaTreeMapAbstractEnvironment::Value(map),
                PatriciaTreeMapAbstractEnvironment::Value(other_map),
            ) => {
                map.union_with(combine, other_map);
                if map.iter().any(|(_, v)| v.is_bottom()) {
                    *self = PatriciaTreeMapAbstractEnvironment::Bottom;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::domain::HashedSetAbstractDomain;

    type Dom = HashedSetAbstractDomain<&'static str>;
    type Env = PatriciaTreeMapAbstractEnvironment<u32, Dom>;
    type HEnv = HashedAbstractEnvironment<u32, Dom>;

    fn dom(elems: &[&'static str]) -> Dom {
        Dom::from_elements(elems.iter().copied())
    }

    #[test]
    fn test_lattice_operations() {
        let mut e1 = Env::top();
        e1.set(1, dom(&["a", "b"]))
            .set(2, dom(&["c"]))
            .set(3, dom(&["d", "e", "f"]))
            .set(4, dom(&["a", "f"]));
        let mut e2 = Env::top();
        e2.set(0, dom(&["c", "f"]))
            .set(2, dom(&["c", "d"]))
            .set(3, dom(&["d", "e", "g", "h"]));

        assert_eq!(e1.size(), 4);
        assert_eq!(e2.size(), 3);

        assert!(Env::bottom().leq(&e1));
        assert!(!e1.leq(&Env::bottom()));
        assert!(!Env::top().leq(&e1));
        assert!(e1.leq(&Env::top()));
        assert!(!e1.leq(&e2));
        assert!(!e2.leq(&e1));

        let mut join = e1.clone();
        join.join_with(&e2);
        assert!(e1.leq(&join));
        assert!(e2.leq(&join));
        assert_eq!(join.size(), 2);
        let mut j2: Vec<_> = join.get(2).elements().into_iter().copied().collect();
        j2.sort_unstable();
        assert_eq!(j2, vec!["c", "d"]);

        let mut meet = e1.clone();
        meet.meet_with(&e2);
        assert!(meet.leq(&e1));
        assert!(meet.leq(&e2));
        assert_eq!(meet.size(), 5);
        assert_eq!(meet.get(2).elements(), vec![&"c"]);
        let mut m3: Vec<_> = meet.get(3).elements().into_iter().copied().collect();
        m3.sort_unstable();
        assert_eq!(m3, vec!["d", "e"]);
    }

    #[test]
    fn test_join_with_sentinel_environments() {
        let mut e1 = Env::top();
        e1.set(1, dom(&["a"]));
        let mut j = e1.clone();
        j.join_with(&Env::top());
        assert!(j.is_top());
        let mut j = e1.clone();
        j.join_with(&Env::bottom());
        assert!(j.equals(&e1));
        let mut m = e1.clone();
        m.meet_with(&Env::bottom());
        assert!(m.is_bottom());
        let mut m = e1.clone();
        m.meet_with(&Env::top());
        assert!(m.equals(&e1));
    }

    #[test]
    fn test_update_preserves_structure_when_unchanged() {
        let mut e = Env::top();
        e.set(1, dom(&["a"]));
        let before = e.bindings().unwrap().root_ptr();
        e.update(1, |_| dom(&["a"]));
        assert_eq!(e.bindings().unwrap().root_ptr(), before);
        let mut m = e.clone();
        m.meet_with(&e.clone());
        assert_eq!(m.bindings().unwrap().root_ptr(), before);
        let mut j = e.clone();
        j.join_with(&e.clone());
        assert_eq!(j.bindings().unwrap().root_ptr(), before);
    }

    #[test]
    fn test_hashed_environment_matches_patricia() {
        let mut he1 = HEnv::top();
        he1.set(1, dom(&["a"])).set(2, dom(&["b"]));
        let mut he2 = HEnv::top();
        he2.set(2, dom(&["b", "c"])).set(3, dom(&["d"]));

        let mut join = he1.clone();
        join.join_with(&he2);
        assert_eq!(join.size(), 1);
        let mut j: Vec<_> = join.get(&2).elements().into_iter().copied().collect();
        j.sort_unstable();
        assert_eq!(j, vec!["b", "c"]);

        let mut meet = he1.clone();
        meet.meet_with(&he2);
        assert_eq!(meet.size(), 3);
        assert_eq!(meet.get(&2).elements(), vec![&"b"]);
    }

    #[test]
    fn test_bottom_binding_collapses() {
        use crate::analysis::domain::SimpleValueAbstractDomain;
        type IEnv = HashedAbstractEnvironment<u32, SimpleValueAbstractDomain<i64>>;
        let mut e = IEnv::top();
        e.set(1, SimpleValueAbstractDomain::of(1));
        e.set(2, SimpleValueAbstractDomain::bottom());
        assert!(e.is_bottom());
    }
}
