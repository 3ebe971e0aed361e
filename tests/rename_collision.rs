//! Renames gated by virtual-dispatch collisions.

use dexopt::hierarchy::{build_type_hierarchy, find_collision_excepting};
use dexopt::ir::{AccessFlags, ClassRef, ClassSpec, DexContext, MethodRef, MethodSpec, Scope};
use dexopt::Error;

struct Fixture {
    ctx: DexContext,
    scope: Scope,
}

impl Fixture {
    fn new() -> Self {
        Fixture {
            ctx: DexContext::new(),
            scope: Scope::new(),
        }
    }

    fn class(&mut self, name: &str, super_name: Option<&str>) -> ClassRef {
        let cls = self
            .ctx
            .make_class(ClassSpec {
                type_: self.ctx.make_type(name),
                access: AccessFlags::PUBLIC,
                super_class: super_name.map(|s| self.ctx.make_type(s)),
                interfaces: self.ctx.make_type_list(vec![]),
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
        let method = self.ctx.make_method(MethodSpec {
            cls: cls.type_().clone(),
            name: self.ctx.make_string(name),
            proto,
        });
        method.make_concrete(AccessFlags::PUBLIC, None, true);
        cls.add_method(method.clone());
        method
    }

    fn rename_spec(&self, method: &MethodRef, new_name: &str) -> MethodSpec {
        MethodSpec {
            cls: method.cls(),
            name: self.ctx.make_string(new_name),
            proto: method.proto(),
        }
    }
}

#[test]
fn rename_with_collision_in_hierarchy() {
    // A { m(): void }, B extends A { m(): void }.
    let mut f = Fixture::new();
    let a = f.class("LA;", None);
    let b = f.class("LB;", Some("LA;"));
    let a_m = f.vmethod(&a, "m");
    let b_m = f.vmethod(&b, "m");

    // Renaming A.m to m2 succeeds: nothing in A's world binds m2.
    f.ctx
        .mutate_method(&a_m, f.rename_spec(&a_m, "m2"), false)
        .expect("first rename succeeds");
    assert_eq!(a_m.name().bytes(), b"m2");

    // Renaming B.m to m2 must fail: calling A.m2 on a B would now bind to
    // the renamed method.
    let err = f
        .ctx
        .mutate_method(&b_m, f.rename_spec(&b_m, "m2"), false)
        .expect_err("second rename collides");
    assert!(matches!(err, Error::NameCollision(_)));
    assert_eq!(b_m.name().bytes(), b"m");

    // With rename_on_collision the rename succeeds under a fresh name.
    f.ctx
        .mutate_method(&b_m, f.rename_spec(&b_m, "m2"), true)
        .expect("collision-avoiding rename succeeds");
    assert_ne!(b_m.name().bytes(), b"m2");
    assert_ne!(b_m.name().bytes(), b"m");
    // The new identity resolves, the old one does not.
    assert_eq!(f.ctx.get_method(&b_m.spec()).as_ref(), Some(&b_m));
    let old_spec = f.rename_spec(&b_m, "m");
    assert!(f.ctx.get_method(&old_spec).is_none());
}

#[test]
fn collision_query_result_matches_signature() {
    // Collision symmetry: whatever find_collision_excepting returns has the
    // queried signature and is never the excepted method.
    let mut f = Fixture::new();
    let a = f.class("LA;", None);
    let b = f.class("LB;", Some("LA;"));
    let _c = f.class("LC;", Some("LB;"));
    let a_m = f.vmethod(&a, "run");
    let b_m = f.vmethod(&b, "run");
    let hierarchy = build_type_hierarchy(&f.ctx, &f.scope);

    let name = f.ctx.make_string("run");
    for (cls, except) in [(&a, &a_m), (&b, &b_m)] {
        if let Some(found) = find_collision_excepting(
            &f.ctx,
            &hierarchy,
            Some(except),
            &name,
            &except.proto(),
            cls,
            true,
            false,
        ) {
            assert_ne!(&found, except);
            let spec = found.spec();
            assert_eq!(spec.name, name);
            assert_eq!(spec.proto, except.proto());
        }
    }

    // From A's side, the descendant B.run is a collision for "run".
    let found = find_collision_excepting(
        &f.ctx,
        &hierarchy,
        Some(&a_m),
        &name,
        &a_m.proto(),
        &a,
        true,
        false,
    )
    .expect("descendant collision found");
    assert_eq!(found, b_m);
}

#[test]
fn direct_rename_ignores_hierarchy() {
    // Non-virtual methods collide only on exact identity.
    let mut f = Fixture::new();
    let a = f.class("LA;", None);
    let b = f.class("LB;", Some("LA;"));
    let proto = f
        .ctx
        .make_proto(f.ctx.make_type("V"), f.ctx.make_type_list(vec![]));
    let a_helper = f.ctx.make_method(MethodSpec {
        cls: a.type_().clone(),
        name: f.ctx.make_string("helper"),
        proto: proto.clone(),
    });
    a_helper.make_concrete(AccessFlags::PUBLIC | AccessFlags::STATIC, None, false);
    a.add_method(a_helper.clone());
    let b_helper = f.ctx.make_method(MethodSpec {
        cls: b.type_().clone(),
        name: f.ctx.make_string("other"),
        proto,
    });
    b_helper.make_concrete(AccessFlags::PUBLIC | AccessFlags::STATIC, None, false);
    b.add_method(b_helper.clone());

    // B.other → helper is fine: different container, not virtual.
    f.ctx
        .mutate_method(&b_helper, f.rename_spec(&b_helper, "helper"), false)
        .expect("direct rename succeeds");
    assert_eq!(b_helper.name().bytes(), b"helper");
}
