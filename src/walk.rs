//! Scope walkers.
//!
//! Walk all methods of all classes in a scope, serially or fanned out over
//! the work queue. The parallel variants partition by class, so a pass that
//! mutates method bodies touches a disjoint class set per thread. Within a
//! class, direct methods are visited before virtual methods; within each
//! group, insertion order.

use crate::ir::{ClassRef, MethodRef, Scope};
use crate::workqueue::{default_num_threads, WorkQueue};

/// Calls `f` on every class in the scope.
pub fn walk_classes(scope: &Scope, mut f: impl FnMut(&ClassRef)) {
    for cls in scope {
        f(cls);
    }
}

/// Calls `f` on every method in the scope, d-methods before v-methods.
pub fn walk_methods(scope: &Scope, mut f: impl FnMut(&MethodRef)) {
    for cls in scope {
        for method in cls.dmethods() {
            f(&method);
        }
        for method in cls.vmethods() {
            f(&method);
        }
    }
}

/// Walks all methods in parallel, one class per work item.
///
/// Per-thread state is built once per worker by `data_init`; `reducer` must
/// be associative; `init` seeds the per-class fold.
pub fn walk_methods_parallel<Data, Output>(
    scope: &Scope,
    walker: impl Fn(&mut Data, &MethodRef) -> Output + Sync,
    reducer: impl Fn(Output, Output) -> Output + Sync,
    data_init: impl Fn(usize) -> Data + Sync,
    init: Output,
    num_threads: usize,
) -> Output
where
    Output: Send + Sync + Clone,
{
    let mut queue = WorkQueue::new(
        |data: &mut Data, cls: ClassRef| {
            let mut out = init.clone();
            for method in cls.dmethods() {
                out = reducer(out, walker(data, &method));
            }
            for method in cls.vmethods() {
                out = reducer(out, walker(data, &method));
            }
            out
        },
        &reducer,
        data_init,
        num_threads,
    );
    for cls in scope {
        queue.add_item(cls.clone());
    }
    let result = queue.run_all();
    drop(queue);
    result.unwrap_or(init)
}

/// The simple variant: call `walker` on all methods in parallel, with the
/// default thread count.
pub fn walk_methods_parallel_simple(scope: &Scope, walker: impl Fn(&MethodRef) + Sync) {
    walk_methods_parallel(
        scope,
        |(), method| walker(method),
        |(), ()| (),
        |_| (),
        (),
        default_num_threads(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AccessFlags, ClassSpec, DexContext, MethodSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn build_scope(ctx: &DexContext, classes: usize, methods_per_class: usize) -> Scope {
        let proto = ctx.make_proto(ctx.make_type("V"), ctx.make_type_list(vec![]));
        let mut scope = Scope::new();
        for c in 0..classes {
            let cls = ctx
                .make_class(ClassSpec {
                    type_: ctx.make_type(&format!("Lc{c};")),
                    access: AccessFlags::PUBLIC,
                    super_class: None,
                    interfaces: ctx.make_type_list(vec![]),
                    source_file: None,
                    external: false,
                })
                .unwrap();
            for m in 0..methods_per_class {
                let method = ctx.make_method(MethodSpec {
                    cls: cls.type_().clone(),
                    name: ctx.make_string(&format!("m{m}")),
                    proto: proto.clone(),
                });
                method.make_concrete(AccessFlags::PUBLIC, None, m % 2 == 0);
                cls.add_method(method);
            }
            scope.push(cls);
        }
        scope
    }

    #[test]
    fn test_serial_walk_order() {
        let ctx = DexContext::new();
        let scope = build_scope(&ctx, 2, 4);
        let mut seen = Vec::new();
        walk_methods(&scope, |m| {
            seen.push((m.cls().to_string(), m.is_virtual()));
        });
        assert_eq!(seen.len(), 8);
        // Direct methods come before virtual ones within each class.
        for pair in seen.chunks(4) {
            assert!(!pair[0].1 && !pair[1].1 && pair[2].1 && pair[3].1);
        }
    }

    #[test]
    fn test_parallel_counts_every_method() {
        let ctx = DexContext::new();
        let scope = build_scope(&ctx, 7, 3);
        let total = walk_methods_parallel(
            &scope,
            |_: &mut (), _method| 1usize,
            |a, b| a + b,
            |_| (),
            0usize,
            4,
        );
        assert_eq!(total, 21);
    }

    #[test]
    fn test_parallel_simple_visits_all() {
        let ctx = DexContext::new();
        let scope = build_scope(&ctx, 5, 2);
        static VISITS: AtomicUsize = AtomicUsize::new(0);
        VISITS.store(0, Ordering::SeqCst);
        walk_methods_parallel_simple(&scope, |_m| {
            VISITS.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(VISITS.load(Ordering::SeqCst), 10);
    }
}
