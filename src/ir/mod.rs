//! The interned IR model for dex-style register bytecode.
//!
//! Everything that has an identity in a dex file — strings, types, type
//! lists, prototypes, field and method references, classes — lives behind an
//! interned handle created by [`DexContext`]. The context is the sole owner;
//! two handles compare equal exactly when their values are equal, and both
//! equality and hashing are O(1) pointer operations.
//!
//! Method bodies exist in two forms: the flat [`DexCode`] used only at the
//! load/store boundary, and the editable [`IrCode`] sequence of
//! [`MethodItemEntry`] items that every analysis and transformation works on.
//!
//! # Key Components
//!
//! - [`DexContext`] - the process-wide interning context
//! - [`DexString`], [`DexType`], [`DexTypeList`], [`DexProto`] - interned values
//! - [`DexClass`], [`DexMethod`], [`DexField`] - definitions with bodies
//! - [`IrCode`] / [`IrInstruction`] - the editable method body
//! - [`Opcode`] - table-driven opcode predicates and encoding limits

mod access;
mod class;
mod code;
mod context;
mod instruction;
pub mod opcode;
mod refs;
mod strings;
mod types;

pub use access::AccessFlags;
pub use class::{
    AnnotationSet, ClassRef, ClassSpec, DexClass, DexField, DexMethod, FieldRef, MethodRef, Scope,
};
pub use code::{
    DexCode, DexDebugEvent, DexDebugItem, DexPosition, DexTryItem, EntryId, IrCode,
    MethodItemEntry,
};
pub use context::{DexContext, OBJECT_TYPE};
pub use instruction::{IrInstruction, Reg};
pub use opcode::Opcode;
pub use refs::{FieldSpec, MethodSpec};
pub use strings::{DexString, DexStringRef};
pub use types::{DexProto, DexType, DexTypeList, DexTypeRef, ProtoRef, TypeListRef};

/// Generates an interned handle: a cheap clone-able pointer wrapper whose
/// equality and hash are on the pointer, which is sound because the
/// [`DexContext`] guarantees one allocation per value.
macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident => $target:ty) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(pub(crate) std::sync::Arc<$target>);

        impl $name {
            /// Stable integer identity of this handle, usable as a
            /// Patricia-tree key.
            #[must_use]
            pub fn as_key(&self) -> u64 {
                std::sync::Arc::as_ptr(&self.0) as usize as u64
            }
        }

        impl std::ops::Deref for $name {
            type Target = $target;
            fn deref(&self) -> &$target {
                &self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                std::sync::Arc::ptr_eq(&self.0, &other.0)
            }
        }

        impl Eq for $name {}

        impl std::hash::Hash for $name {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                state.write_usize(std::sync::Arc::as_ptr(&self.0) as usize);
            }
        }
    };
}

pub(crate) use handle_type;
