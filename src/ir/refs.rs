//! Re-keying payloads for field and method identity.
//!
//! A spec is the identity key of a ref: what [`crate::ir::DexContext`]
//! interns by, and what a mutation rewrites. All components are interned
//! handles, so specs hash and compare in O(1).

use std::fmt;

use crate::ir::{DexStringRef, DexTypeRef, ProtoRef};

/// Identity of a field: (container type, name, field type).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    /// Containing class type.
    pub cls: DexTypeRef,
    /// Field name.
    pub name: DexStringRef,
    /// Field type.
    pub ftype: DexTypeRef,
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.cls, self.name, self.ftype)
    }
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldSpec({self})")
    }
}

/// Identity of a method: (container type, name, prototype).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MethodSpec {
    /// Containing class type.
    pub cls: DexTypeRef,
    /// Method name.
    pub name: DexStringRef,
    /// Method prototype.
    pub proto: ProtoRef,
}

impl fmt::Display for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.cls, self.name, self.proto.shorty())
    }
}

impl fmt::Debug for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodSpec({self})")
    }
}
