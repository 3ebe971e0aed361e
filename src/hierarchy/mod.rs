//! The class-hierarchy and virtual-dispatch index.
//!
//! Built by one pass over a scope, the index answers "who extends X", "who
//! implements X", "which concrete method does this virtual call bind to",
//! and "would this rename collide with anything reachable through dynamic
//! dispatch". Both index structures are pure functions of the scope and must
//! be rebuilt after any class addition or super/interface mutation.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{
    ClassRef, DexContext, DexStringRef, DexTypeRef, MethodRef, ProtoRef, Scope, OBJECT_TYPE,
};

/// Parent type → ordered set of immediate children.
///
/// Child order is insertion order (scope order, then external classes),
/// stable across runs given the same inputs.
#[derive(Debug, Default)]
pub struct ClassHierarchy {
    children: FxHashMap<DexTypeRef, Vec<DexTypeRef>>,
    member: FxHashSet<(DexTypeRef, DexTypeRef)>,
}

impl ClassHierarchy {
    fn add_child(&mut self, parent: DexTypeRef, child: DexTypeRef) {
        let key = (parent.clone(), child.clone());
        if self.member.insert(key) {
            self.children.entry(parent).or_default().push(child);
        }
    }

    fn ensure_entry(&mut self, type_: DexTypeRef) {
        self.children.entry(type_).or_default();
    }

    /// Immediate subclasses of `type_`.
    #[must_use]
    pub fn get_children(&self, type_: &DexTypeRef) -> &[DexTypeRef] {
        self.children.get(type_).map_or(&[], Vec::as_slice)
    }

    /// Transitive subclasses of `type_`, not including `type_` itself.
    /// Order: direct children first, then each child's descendants.
    #[must_use]
    pub fn get_all_children(&self, type_: &DexTypeRef) -> Vec<DexTypeRef> {
        let mut out = Vec::new();
        self.collect_children(type_, &mut out);
        out
    }

    fn collect_children(&self, type_: &DexTypeRef, out: &mut Vec<DexTypeRef>) {
        for child in self.get_children(type_) {
            out.push(child.clone());
            self.collect_children(child, out);
        }
    }

    /// Every type with an entry in the index.
    pub fn types(&self) -> impl Iterator<Item = &DexTypeRef> {
        self.children.keys()
    }
}

/// Interface type → set of implementing class types.
#[derive(Debug, Default)]
pub struct InterfaceMap {
    implementors: FxHashMap<DexTypeRef, FxHashSet<DexTypeRef>>,
}

impl InterfaceMap {
    /// Classes whose class or any supertype declares `intf` (directly or via
    /// interface inheritance).
    #[must_use]
    pub fn get_implementors(&self, intf: &DexTypeRef) -> Vec<DexTypeRef> {
        self.implementors
            .get(intf)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when `cls` is a known implementor of `intf`.
    #[must_use]
    pub fn implements(&self, cls: &DexTypeRef, intf: &DexTypeRef) -> bool {
        self.implementors
            .get(intf)
            .is_some_and(|set| set.contains(cls))
    }
}

/// Walks up the hierarchy recording parent → child edges for one class.
/// A class with no super that is not the object root is retrofitted as a
/// child of the object root. Unknown types end the walk.
fn build_class_hierarchy(ctx: &DexContext, hierarchy: &mut ClassHierarchy, cls: &ClassRef) {
    hierarchy.ensure_entry(cls.type_().clone());
    let type_ = cls.type_().clone();
    match cls.super_class() {
        Some(super_type) => {
            hierarchy.add_child(super_type, type_);
        }
        None => {
            let object = ctx.make_type(OBJECT_TYPE);
            if type_ != object {
                hierarchy.add_child(object, type_);
            }
        }
    }
}

/// Builds the parent → children index over a scope plus all external
/// non-interface classes known to the context.
#[must_use]
pub fn build_type_hierarchy(ctx: &DexContext, scope: &Scope) -> ClassHierarchy {
    let mut hierarchy = ClassHierarchy::default();
    for cls in scope {
        if cls.is_interface() {
            continue;
        }
        build_class_hierarchy(ctx, &mut hierarchy, cls);
    }
    ctx.walk_type_class(|_, cls| {
        if !cls.is_external() || cls.is_interface() {
            return;
        }
        build_class_hierarchy(ctx, &mut hierarchy, cls);
    });
    hierarchy
}

fn record_interfaces(
    ctx: &DexContext,
    interfaces: &mut InterfaceMap,
    current: &ClassRef,
    implementors: &FxHashSet<DexTypeRef>,
) {
    for intf in current.interfaces().types() {
        interfaces
            .implementors
            .entry(intf.clone())
            .or_default()
            .extend(implementors.iter().cloned());
        if let Some(intf_cls) = ctx.type_class(intf) {
            // Implementing an interface implements everything it extends.
            record_interfaces(ctx, interfaces, &intf_cls, implementors);
        }
    }
}

/// Builds the interface → implementors index from a hierarchy.
#[must_use]
pub fn build_interface_map(ctx: &DexContext, hierarchy: &ClassHierarchy) -> InterfaceMap {
    let mut interfaces = InterfaceMap::default();
    for type_ in hierarchy.types() {
        let Some(cls) = ctx.type_class(type_) else {
            continue;
        };
        if cls.is_interface() {
            continue;
        }
        let mut implementors: FxHashSet<DexTypeRef> =
            hierarchy.get_all_children(type_).into_iter().collect();
        implementors.insert(type_.clone());
        record_interfaces(ctx, &mut interfaces, &cls, &implementors);
    }
    interfaces
}

// Collects interfaces that (transitively) extend `intf`.
fn gather_intf_extenders(
    ctx: &DexContext,
    extender: &DexTypeRef,
    intf: &DexTypeRef,
    extenders: &mut FxHashSet<DexTypeRef>,
) -> bool {
    let Some(extender_cls) = ctx.type_class(extender) else {
        return false;
    };
    if !extender_cls.is_interface() {
        return false;
    }
    let mut extends = false;
    for declared in extender_cls.interfaces().types() {
        if declared == intf || gather_intf_extenders(ctx, declared, intf, extenders) {
            extenders.insert(extender.clone());
            extends = true;
        }
    }
    extends
}

/// All classes in `scope` whose class or any supertype declares `intf` or an
/// interface extending it.
#[must_use]
pub fn get_all_implementors(
    ctx: &DexContext,
    scope: &Scope,
    intf: &DexTypeRef,
) -> Vec<DexTypeRef> {
    let mut extenders = FxHashSet::default();
    for cls in scope {
        gather_intf_extenders(ctx, cls.type_(), intf, &mut extenders);
    }
    let mut interesting = extenders;
    interesting.insert(intf.clone());

    let mut impls = Vec::new();
    for cls in scope {
        let mut cur = Some(cls.clone());
        'walk: while let Some(c) = cur {
            for declared in c.interfaces().types() {
                if interesting.contains(declared) {
                    impls.push(cls.type_().clone());
                    break 'walk;
                }
            }
            cur = c.super_class().and_then(|t| ctx.type_class(&t));
        }
    }
    impls
}

fn match_method(name: &DexStringRef, proto: &ProtoRef, method: &MethodRef) -> bool {
    let spec = method.spec();
    &spec.name == name && &spec.proto == proto
}

/// Walks the super chain of `cls` for a virtual method with the given
/// signature. Returns `None` when resolution finds no target; callers decide
/// whether that is an error or "external, leave alone".
#[must_use]
pub fn resolve_virtual(
    ctx: &DexContext,
    cls: &ClassRef,
    name: &DexStringRef,
    proto: &ProtoRef,
) -> Option<MethodRef> {
    let mut cur = Some(cls.clone());
    while let Some(c) = cur {
        if let Some(found) = c.vmethods().into_iter().find(|m| match_method(name, proto, m)) {
            return Some(found);
        }
        cur = c.super_class().and_then(|t| ctx.type_class(&t));
    }
    None
}

fn check_vmethods(
    ctx: &DexContext,
    name: &DexStringRef,
    proto: &ProtoRef,
    type_: &DexTypeRef,
) -> Option<MethodRef> {
    let cls = ctx.type_class(type_)?;
    cls.vmethods().into_iter().find(|m| match_method(name, proto, m))
}

fn check_dmethods(
    ctx: &DexContext,
    name: &DexStringRef,
    proto: &ProtoRef,
    type_: &DexTypeRef,
) -> Option<MethodRef> {
    let cls = ctx.type_class(type_)?;
    cls.dmethods().into_iter().find(|m| match_method(name, proto, m))
}

/// Looks for a method other than `except` that a rename to
/// `(name, proto)` on `cls` would collide with: first the class's own
/// methods, then (for virtual renames) anything virtually resolvable in an
/// ancestor, then the descendants (v-methods always, d-methods only when
/// `check_direct`). Returns the first colliding method found.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn find_collision_excepting(
    ctx: &DexContext,
    hierarchy: &ClassHierarchy,
    except: Option<&MethodRef>,
    name: &DexStringRef,
    proto: &ProtoRef,
    cls: &ClassRef,
    is_virtual: bool,
    check_direct: bool,
) -> Option<MethodRef> {
    let differs = |m: &MethodRef| except.is_none_or(|e| m != e);
    for method in cls.dmethods() {
        if match_method(name, proto, &method) && differs(&method) {
            return Some(method);
        }
    }
    for method in cls.vmethods() {
        if match_method(name, proto, &method) && differs(&method) {
            return Some(method);
        }
    }
    if !is_virtual {
        return None;
    }

    if let Some(super_cls) = cls.super_class().and_then(|t| ctx.type_class(&t)) {
        if let Some(method) = resolve_virtual(ctx, &super_cls, name, proto) {
            if differs(&method) {
                return Some(method);
            }
        }
    }

    for child in hierarchy.get_all_children(cls.type_()) {
        if let Some(method) = check_vmethods(ctx, name, proto, &child) {
            if differs(&method) {
                return Some(method);
            }
        }
        if check_direct {
            if let Some(method) = check_dmethods(ctx, name, proto, &child) {
                if differs(&method) {
                    return Some(method);
                }
            }
        }
    }
    None
}

/// Convenience wrapper: a collision query for renaming `method` itself.
#[must_use]
pub fn find_collision(
    ctx: &DexContext,
    hierarchy: &ClassHierarchy,
    method: &MethodRef,
    new_name: &DexStringRef,
) -> Option<MethodRef> {
    let cls = ctx.type_class(&method.cls())?;
    find_collision_excepting(
        ctx,
        hierarchy,
        Some(method),
        new_name,
        &method.proto(),
        &cls,
        method.is_virtual(),
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AccessFlags, ClassSpec, MethodSpec};

    struct Fixture {
        ctx: DexContext,
        scope: Scope,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                ctx: DexContext::new(),
                scope: Vec::new(),
            }
        }

        fn class(
            &mut self,
            name: &str,
            super_name: Option<&str>,
            access: AccessFlags,
            interfaces: &[&str],
        ) -> ClassRef {
            let interfaces = self
                .ctx
                .make_type_list(interfaces.iter().map(|i| self.ctx.make_type(i)).collect());
            let cls = self
                .ctx
                .make_class(ClassSpec {
                    type_: self.ctx.make_type(name),
                    access,
                    super_class: super_name.map(|s| self.ctx.make_type(s)),
                    interfaces,
                    source_file: None,
                    external: false,
                })
                .unwrap();
            self.scope.push(cls.clone());
            cls
        }

        fn vmethod(&self, cls: &ClassRef, name: &str) -> MethodRef {
            let proto = self
                .ctx
                .make_proto(self.ctx.make_type("V"), self.ctx.make_type_list(vec![]));
            let m = self.ctx.make_method(MethodSpec {
                cls: cls.type_().clone(),
                name: self.ctx.make_string(name),
                proto,
            });
            m.make_concrete(AccessFlags::PUBLIC, None, true);
            cls.add_method(m.clone());
            m
        }
    }

    #[test]
    fn test_children_closure() {
        let mut f = Fixture::new();
        let _a = f.class("La;", None, AccessFlags::PUBLIC, &[]);
        let _b = f.class("Lb;", Some("La;"), AccessFlags::PUBLIC, &[]);
        let _c = f.class("Lc;", Some("Lb;"), AccessFlags::PUBLIC, &[]);
        let _d = f.class("Ld;", Some("La;"), AccessFlags::PUBLIC, &[]);
        let ch = build_type_hierarchy(&f.ctx, &f.scope);

        let a = f.ctx.make_type("La;");
        let direct: Vec<_> = ch.get_children(&a).to_vec();
        assert_eq!(direct.len(), 2);

        let all = ch.get_all_children(&a);
        assert_eq!(all.len(), 3);
        // A class never appears among its own descendants.
        assert!(!all.contains(&a));
        // Rootless classes hang off the object root.
        let object = f.ctx.make_type(OBJECT_TYPE);
        assert!(ch.get_all_children(&object).contains(&a));
    }

    #[test]
    fn test_interface_map() {
        let mut f = Fixture::new();
        let _i = f.class(
            "Li;",
            None,
            AccessFlags::PUBLIC | AccessFlags::INTERFACE,
            &[],
        );
        let _j = f.class(
            "Lj;",
            None,
            AccessFlags::PUBLIC | AccessFlags::INTERFACE,
            &["Li;"],
        );
        let _base = f.class("Lbase;", None, AccessFlags::PUBLIC, &["Lj;"]);
        let _sub = f.class("Lsub;", Some("Lbase;"), AccessFlags::PUBLIC, &[]);
        let ch = build_type_hierarchy(&f.ctx, &f.scope);
        let im = build_interface_map(&f.ctx, &ch);

        let i = f.ctx.make_type("Li;");
        let j = f.ctx.make_type("Lj;");
        let base = f.ctx.make_type("Lbase;");
        let sub = f.ctx.make_type("Lsub;");
        // base implements j directly, i transitively; sub inherits both.
        assert!(im.implements(&base, &j));
        assert!(im.implements(&base, &i));
        assert!(im.implements(&sub, &j));
        assert!(im.implements(&sub, &i));

        let impls = get_all_implementors(&f.ctx, &f.scope, &i);
        assert!(impls.contains(&base));
        assert!(impls.contains(&sub));
    }

    #[test]
    fn test_collision_query() {
        let mut f = Fixture::new();
        let a = f.class("La;", None, AccessFlags::PUBLIC, &[]);
        let b = f.class("Lb;", Some("La;"), AccessFlags::PUBLIC, &[]);
        let a_m = f.vmethod(&a, "m");
        let b_m = f.vmethod(&b, "m");
        let ch = build_type_hierarchy(&f.ctx, &f.scope);

        // Renaming b.m to "m" collides with a.m through the super chain.
        let name = f.ctx.make_string("m");
        let found = find_collision_excepting(
            &f.ctx,
            &ch,
            Some(&b_m),
            &name,
            &b_m.proto(),
            &b,
            true,
            false,
        )
        .expect("collision");
        assert_eq!(found, a_m);
        let spec = found.spec();
        assert_eq!(spec.name, name);
        assert_eq!(spec.proto, b_m.proto());

        // Renaming a.m to "m2" sees the descendant only if it matches.
        let m2 = f.ctx.make_string("m2");
        assert!(find_collision_excepting(
            &f.ctx,
            &ch,
            Some(&a_m),
            &m2,
            &a_m.proto(),
            &a,
            true,
            false
        )
        .is_none());

        // A descendant with the target signature is found.
        let _b_m2 = f.vmethod(&b, "m2");
        let found = find_collision_excepting(
            &f.ctx,
            &ch,
            Some(&a_m),
            &m2,
            &a_m.proto(),
            &a,
            true,
            false,
        );
        assert!(found.is_some());
    }

    #[test]
    fn test_resolve_virtual() {
        let mut f = Fixture::new();
        let a = f.class("La;", None, AccessFlags::PUBLIC, &[]);
        let b = f.class("Lb;", Some("La;"), AccessFlags::PUBLIC, &[]);
        let a_m = f.vmethod(&a, "m");
        let name = f.ctx.make_string("m");
        // b has no m of its own: resolution walks to a.
        let resolved = resolve_virtual(&f.ctx, &b, &name, &a_m.proto()).unwrap();
        assert_eq!(resolved, a_m);
        let missing = f.ctx.make_string("nope");
        assert!(resolve_virtual(&f.ctx, &b, &missing, &a_m.proto()).is_none());
    }
}
