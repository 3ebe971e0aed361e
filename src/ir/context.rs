//! The process-wide interning context.
//!
//! Every identity-bearing IR value is created here exactly once; handles are
//! non-owning pointers into this context and outlive any single pass. All
//! lookups are get-or-create (`make_*`) or nullable (`get_*`); the re-keying
//! operations (`alias_type_name`, `mutate_field`, `mutate_method`,
//! `erase_*`) never create new handles, they rewire the lookup indexes so the
//! old key stops resolving and the new one resolves to the existing handle.
//!
//! # Concurrency
//!
//! The intern maps are concurrent: `make_*` / `get_*` may be called from any
//! thread. Re-keying operations serialize on a commit lock and must only run
//! during single-threaded driver phases, as they are not atomic with respect
//! to concurrent readers of the same key.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;

use crate::ir::{
    class::{ClassSpec, DexClass, DexField, DexMethod},
    refs::{FieldSpec, MethodSpec},
    strings::DexString,
    types::{DexProto, DexType, DexTypeList},
    ClassRef, DexStringRef, DexTypeRef, FieldRef, MethodRef, ProtoRef, TypeListRef,
};
use crate::{Error, Result};

/// Descriptor of the object root type.
pub const OBJECT_TYPE: &str = "Ljava/lang/Object;";

/// The interning context. See the module docs for the ownership and
/// concurrency contract.
pub struct DexContext {
    strings: DashMap<Vec<u8>, DexStringRef>,
    types: DashMap<DexStringRef, DexTypeRef>,
    type_lists: DashMap<Vec<DexTypeRef>, TypeListRef>,
    protos: DashMap<(DexTypeRef, TypeListRef), ProtoRef>,
    fields: DashMap<FieldSpec, FieldRef>,
    methods: DashMap<MethodSpec, MethodRef>,
    classes: DashMap<DexTypeRef, ClassRef>,
    classes_by_name: SkipMap<Vec<u8>, ClassRef>,
    commit_lock: Mutex<()>,
}

impl Default for DexContext {
    fn default() -> Self {
        DexContext::new()
    }
}

impl DexContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        DexContext {
            strings: DashMap::new(),
            types: DashMap::new(),
            type_lists: DashMap::new(),
            protos: DashMap::new(),
            fields: DashMap::new(),
            methods: DashMap::new(),
            classes: DashMap::new(),
            classes_by_name: SkipMap::new(),
            commit_lock: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Strings

    /// Interns a byte string. Equal byte sequences yield identical handles.
    pub fn make_string_bytes(&self, bytes: &[u8]) -> DexStringRef {
        if let Some(existing) = self.strings.get(bytes) {
            return existing.clone();
        }
        self.strings
            .entry(bytes.to_vec())
            .or_insert_with(|| DexStringRef(Arc::new(DexString::new(bytes.to_vec()))))
            .clone()
    }

    /// Interns a UTF-8 string.
    pub fn make_string(&self, s: &str) -> DexStringRef {
        self.make_string_bytes(s.as_bytes())
    }

    /// Looks up an existing string.
    #[must_use]
    pub fn get_string(&self, bytes: &[u8]) -> Option<DexStringRef> {
        self.strings.get(bytes).map(|r| r.clone())
    }

    // ------------------------------------------------------------------
    // Types

    /// Interns a type by name handle.
    pub fn make_type_from(&self, name: DexStringRef) -> DexTypeRef {
        if let Some(existing) = self.types.get(&name) {
            return existing.clone();
        }
        self.types
            .entry(name.clone())
            .or_insert_with(|| DexTypeRef(Arc::new(DexType::new(name))))
            .clone()
    }

    /// Interns a type by descriptor string.
    pub fn make_type(&self, descriptor: &str) -> DexTypeRef {
        self.make_type_from(self.make_string(descriptor))
    }

    /// Looks up an existing type by descriptor string.
    #[must_use]
    pub fn get_type(&self, descriptor: &str) -> Option<DexTypeRef> {
        let name = self.get_string(descriptor.as_bytes())?;
        self.types.get(&name).map(|r| r.clone())
    }

    /// Re-keys an existing type handle to a new name.
    ///
    /// Subsequent `get_type(old)` returns `None` and `get_type(new)` returns
    /// the existing handle; the class-by-name index follows.
    ///
    /// # Errors
    /// [`Error::NameCollision`] when the new name is already bound to a type.
    pub fn alias_type_name(&self, type_: &DexTypeRef, new_name: &str) -> Result<()> {
        let _commit = self
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let new_name = self.make_string(new_name);
        if let Some(occupant) = self.types.get(&new_name) {
            if occupant.value() == type_ {
                return Ok(());
            }
            return Err(Error::NameCollision(new_name.to_string()));
        }
        let old_name = type_.name();
        self.types.remove(&old_name);
        self.types.insert(new_name.clone(), type_.clone());
        if let Some(cls_entry) = self.classes_by_name.remove(old_name.bytes()) {
            self.classes_by_name
                .insert(new_name.bytes().to_vec(), cls_entry.value().clone());
        }
        type_.set_name(new_name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Type lists and protos

    /// Interns an ordered sequence of types.
    pub fn make_type_list(&self, types: Vec<DexTypeRef>) -> TypeListRef {
        if let Some(existing) = self.type_lists.get(&types) {
            return existing.clone();
        }
        self.type_lists
            .entry(types.clone())
            .or_insert_with(|| TypeListRef(Arc::new(DexTypeList::new(types))))
            .clone()
    }

    /// Looks up an existing type list.
    #[must_use]
    pub fn get_type_list(&self, types: &[DexTypeRef]) -> Option<TypeListRef> {
        self.type_lists.get(types).map(|r| r.clone())
    }

    /// Interns a prototype; the shorty string is derived.
    pub fn make_proto(&self, rtype: DexTypeRef, args: TypeListRef) -> ProtoRef {
        let key = (rtype.clone(), args.clone());
        if let Some(existing) = self.protos.get(&key) {
            return existing.clone();
        }
        let mut shorty = String::new();
        shorty.push(rtype.shorty_char());
        for arg in args.types() {
            shorty.push(arg.shorty_char());
        }
        let shorty = self.make_string(&shorty);
        self.protos
            .entry(key)
            .or_insert_with(|| ProtoRef(Arc::new(DexProto::new(rtype, args, shorty))))
            .clone()
    }

    /// Looks up an existing prototype.
    #[must_use]
    pub fn get_proto(&self, rtype: &DexTypeRef, args: &TypeListRef) -> Option<ProtoRef> {
        self.protos
            .get(&(rtype.clone(), args.clone()))
            .map(|r| r.clone())
    }

    // ------------------------------------------------------------------
    // Fields

    /// Interns a field reference.
    pub fn make_field(&self, spec: FieldSpec) -> FieldRef {
        if let Some(existing) = self.fields.get(&spec) {
            return existing.clone();
        }
        self.fields
            .entry(spec.clone())
            .or_insert_with(|| FieldRef(Arc::new(DexField::new(spec))))
            .clone()
    }

    /// Looks up an existing field reference.
    #[must_use]
    pub fn get_field(&self, spec: &FieldSpec) -> Option<FieldRef> {
        self.fields.get(spec).map(|r| r.clone())
    }

    /// Re-keys an existing field to a new identity.
    ///
    /// # Errors
    /// [`Error::NameCollision`] when the new identity is occupied and
    /// `rename_on_collision` is false. With `rename_on_collision` a fresh
    /// `name$<n>` suffix is chosen instead.
    pub fn mutate_field(
        &self,
        field: &FieldRef,
        new_spec: FieldSpec,
        rename_on_collision: bool,
    ) -> Result<()> {
        let _commit = self
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut spec = new_spec;
        if let Some(occupant) = self.fields.get(&spec) {
            if occupant.value() == field {
                return Ok(());
            }
            if !rename_on_collision {
                return Err(Error::NameCollision(spec.to_string()));
            }
            spec.name = self.fresh_suffix(&spec.name, |name| {
                let probe = FieldSpec {
                    cls: spec.cls.clone(),
                    name: name.clone(),
                    ftype: spec.ftype.clone(),
                };
                !self.fields.contains_key(&probe)
            });
        }
        self.fields.remove(&field.spec());
        self.fields.insert(spec.clone(), field.clone());
        field.set_spec(spec);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Methods

    /// Interns a method reference.
    pub fn make_method(&self, spec: MethodSpec) -> MethodRef {
        if let Some(existing) = self.methods.get(&spec) {
            return existing.clone();
        }
        self.methods
            .entry(spec.clone())
            .or_insert_with(|| MethodRef(Arc::new(DexMethod::new(spec))))
            .clone()
    }

    /// Looks up an existing method reference.
    #[must_use]
    pub fn get_method(&self, spec: &MethodSpec) -> Option<MethodRef> {
        self.methods.get(spec).map(|r| r.clone())
    }

    /// Re-keys an existing method to a new identity.
    ///
    /// Beyond exact-key occupancy, a virtual method also collides when the
    /// new signature already resolves virtually in an ancestor: the rename
    /// would silently change dispatch for the subclass.
    ///
    /// # Errors
    /// [`Error::NameCollision`] when the new identity collides and
    /// `rename_on_collision` is false. With `rename_on_collision` a fresh
    /// `name$<n>` suffix is chosen instead.
    pub fn mutate_method(
        &self,
        method: &MethodRef,
        new_spec: MethodSpec,
        rename_on_collision: bool,
    ) -> Result<()> {
        let _commit = self
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut spec = new_spec;
        let collides = |s: &MethodSpec| {
            if let Some(occupant) = self.methods.get(s) {
                if occupant.value() != method {
                    return true;
                }
            }
            method.is_virtual() && self.resolves_in_ancestor(s, method)
        };
        if collides(&spec) {
            if let Some(occupant) = self.methods.get(&spec) {
                if occupant.value() == method {
                    return Ok(());
                }
            }
            if !rename_on_collision {
                return Err(Error::NameCollision(spec.to_string()));
            }
            spec.name = self.fresh_suffix(&spec.name, |name| {
                let probe = MethodSpec {
                    cls: spec.cls.clone(),
                    name: name.clone(),
                    proto: spec.proto.clone(),
                };
                !collides(&probe)
            });
        }
        self.methods.remove(&method.spec());
        self.methods.insert(spec.clone(), method.clone());
        method.set_spec(spec);
        Ok(())
    }

    /// Removes a concrete method definition from resolution. The handle
    /// survives, but name/container lookups stop finding it.
    pub fn erase_method(&self, method: &MethodRef) {
        let _commit = self
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.methods.remove(&method.spec());
    }

    // ------------------------------------------------------------------
    // Classes

    /// Registers a class definition for its type.
    ///
    /// # Errors
    /// [`Error::NameCollision`] when the type already has a class.
    pub fn make_class(&self, spec: ClassSpec) -> Result<ClassRef> {
        let type_ = spec.type_.clone();
        if self.classes.contains_key(&type_) {
            return Err(Error::NameCollision(type_.to_string()));
        }
        let class = ClassRef(Arc::new(DexClass::new(spec)));
        self.classes.insert(type_.clone(), class.clone());
        self.classes_by_name
            .insert(type_.name().bytes().to_vec(), class.clone());
        Ok(class)
    }

    /// O(1) reverse index from a type to its class, when one is loaded.
    #[must_use]
    pub fn type_class(&self, type_: &DexTypeRef) -> Option<ClassRef> {
        self.classes.get(type_).map(|r| r.clone())
    }

    /// Removes a class definition. Its type handle stays interned, but
    /// `type_class` stops resolving it.
    pub fn erase_class(&self, class: &ClassRef) {
        let _commit = self
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.classes.remove(class.type_());
        self.classes_by_name.remove(class.name().bytes());
    }

    /// Walks every (type, class) pair in name order.
    pub fn walk_type_class(&self, mut f: impl FnMut(&DexTypeRef, &ClassRef)) {
        for entry in self.classes_by_name.iter() {
            let class = entry.value();
            f(class.type_(), class);
        }
    }

    // ------------------------------------------------------------------

    /// Walks the super chain of `spec.cls` looking for a virtual method with
    /// the same (name, proto).
    fn resolves_in_ancestor(&self, spec: &MethodSpec, except: &MethodRef) -> bool {
        let mut cur = self
            .type_class(&spec.cls)
            .and_then(|c| c.super_class())
            .and_then(|t| self.type_class(&t));
        while let Some(cls) = cur {
            for m in cls.vmethods() {
                if &m == except {
                    continue;
                }
                let ms = m.spec();
                if ms.name == spec.name && ms.proto == spec.proto {
                    return true;
                }
            }
            cur = cls.super_class().and_then(|t| self.type_class(&t));
        }
        false
    }

    /// Picks the first `base$<n>` name accepted by `free`.
    fn fresh_suffix(
        &self,
        base: &DexStringRef,
        free: impl Fn(&DexStringRef) -> bool,
    ) -> DexStringRef {
        let base_str = base.as_str().into_owned();
        let mut n = 0u32;
        loop {
            let candidate = self.make_string(&format!("{base_str}${n}"));
            if free(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::AccessFlags;

    fn simple_proto(ctx: &DexContext) -> ProtoRef {
        ctx.make_proto(ctx.make_type("V"), ctx.make_type_list(vec![]))
    }

    #[test]
    fn test_intern_uniqueness() {
        let ctx = DexContext::new();
        assert_eq!(ctx.make_string("abc"), ctx.make_string("abc"));
        assert_ne!(ctx.make_string("abc"), ctx.make_string("abd"));
        assert_eq!(ctx.make_type("Lfoo;"), ctx.make_type("Lfoo;"));
        let tl1 = ctx.make_type_list(vec![ctx.make_type("I"), ctx.make_type("J")]);
        let tl2 = ctx.make_type_list(vec![ctx.make_type("I"), ctx.make_type("J")]);
        assert_eq!(tl1, tl2);
        let p1 = ctx.make_proto(ctx.make_type("V"), tl1.clone());
        let p2 = ctx.make_proto(ctx.make_type("V"), tl2);
        assert_eq!(p1, p2);
        assert_eq!(p1.shorty().bytes(), b"VIJ");
    }

    #[test]
    fn test_get_is_nullable() {
        let ctx = DexContext::new();
        assert!(ctx.get_type("Lmissing;").is_none());
        ctx.make_type("Lmissing;");
        assert!(ctx.get_type("Lmissing;").is_some());
    }

    #[test]
    fn test_alias_type_name() {
        let ctx = DexContext::new();
        let t = ctx.make_type("La;");
        ctx.alias_type_name(&t, "Lb;").unwrap();
        assert!(ctx.get_type("La;").is_none());
        assert_eq!(ctx.get_type("Lb;").unwrap(), t);
        assert_eq!(t.name().bytes(), b"Lb;");
        // Colliding alias fails and changes nothing.
        let u = ctx.make_type("Lc;");
        assert!(matches!(
            ctx.alias_type_name(&u, "Lb;"),
            Err(Error::NameCollision(_))
        ));
        assert_eq!(u.name().bytes(), b"Lc;");
    }

    #[test]
    fn test_mutate_method_exact_collision() {
        let ctx = DexContext::new();
        let cls = ctx.make_type("La;");
        let proto = simple_proto(&ctx);
        let m1 = ctx.make_method(MethodSpec {
            cls: cls.clone(),
            name: ctx.make_string("f"),
            proto: proto.clone(),
        });
        let _m2 = ctx.make_method(MethodSpec {
            cls: cls.clone(),
            name: ctx.make_string("g"),
            proto: proto.clone(),
        });
        let clash = MethodSpec {
            cls,
            name: ctx.make_string("g"),
            proto,
        };
        assert!(matches!(
            ctx.mutate_method(&m1, clash.clone(), false),
            Err(Error::NameCollision(_))
        ));
        // With rename_on_collision the context picks a fresh suffix.
        ctx.mutate_method(&m1, clash, true).unwrap();
        assert_eq!(m1.name().bytes(), b"g$0");
        assert!(ctx.get_method(&m1.spec()).is_some());
    }

    #[test]
    fn test_erase_method_keeps_handle() {
        let ctx = DexContext::new();
        let spec = MethodSpec {
            cls: ctx.make_type("La;"),
            name: ctx.make_string("f"),
            proto: simple_proto(&ctx),
        };
        let m = ctx.make_method(spec.clone());
        m.make_concrete(AccessFlags::PUBLIC, None, false);
        ctx.erase_method(&m);
        assert!(ctx.get_method(&spec).is_none());
        // The handle still answers questions.
        assert!(m.is_concrete());
    }
}
