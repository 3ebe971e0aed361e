//! Interned types, type lists and method prototypes.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::ir::{handle_type, strings::compare_strings, DexStringRef};

/// An interned type, identified by its descriptor string (`Lfoo/Bar;`, `I`,
/// `[J`, ...).
///
/// The name lives behind a lock so [`crate::ir::DexContext::alias_type_name`]
/// can re-key an existing handle without creating a new one; every structure
/// holding a `DexTypeRef` observes the rename for free.
#[derive(Debug)]
pub struct DexType {
    name: RwLock<DexStringRef>,
}

impl DexType {
    pub(crate) fn new(name: DexStringRef) -> Self {
        DexType {
            name: RwLock::new(name),
        }
    }

    /// Current descriptor string of this type.
    #[must_use]
    pub fn name(&self) -> DexStringRef {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_name(&self, name: DexStringRef) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name;
    }
}

handle_type! {
    /// Interned handle to a [`DexType`].
    DexTypeRef => DexType
}

impl fmt::Debug for DexTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DexTypeRef({})", self.name())
    }
}

impl fmt::Display for DexTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl DexTypeRef {
    /// True for `J` and `D`: values occupying two registers.
    #[must_use]
    pub fn is_wide(&self) -> bool {
        matches!(self.name().bytes(), b"J" | b"D")
    }

    /// True for class and array types.
    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self.name().bytes().first(), Some(b'L') | Some(b'['))
    }

    /// True for `V`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.name().bytes() == b"V"
    }

    /// The shorty character summarizing this type in a prototype: the
    /// primitive descriptor itself, or `L` for any reference type.
    #[must_use]
    pub fn shorty_char(&self) -> char {
        if self.is_object() {
            'L'
        } else {
            self.name().bytes().first().copied().unwrap_or(b'V') as char
        }
    }
}

/// Dex-spec type ordering (by descriptor string).
#[must_use]
pub fn compare_types(a: &DexTypeRef, b: &DexTypeRef) -> std::cmp::Ordering {
    compare_strings(&a.name(), &b.name())
}

/// An interned ordered sequence of types.
#[derive(Debug)]
pub struct DexTypeList {
    list: Vec<DexTypeRef>,
}

impl DexTypeList {
    pub(crate) fn new(list: Vec<DexTypeRef>) -> Self {
        DexTypeList { list }
    }

    /// The types, in declaration order.
    #[must_use]
    pub fn types(&self) -> &[DexTypeRef] {
        &self.list
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True when the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

handle_type! {
    /// Interned handle to a [`DexTypeList`].
    TypeListRef => DexTypeList
}

impl fmt::Debug for TypeListRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.types()).finish()
    }
}

/// An interned method prototype: return type, argument list, shorty.
#[derive(Debug)]
pub struct DexProto {
    rtype: DexTypeRef,
    args: TypeListRef,
    shorty: DexStringRef,
}

impl DexProto {
    pub(crate) fn new(rtype: DexTypeRef, args: TypeListRef, shorty: DexStringRef) -> Self {
        DexProto {
            rtype,
            args,
            shorty,
        }
    }

    /// Return type.
    #[must_use]
    pub fn rtype(&self) -> &DexTypeRef {
        &self.rtype
    }

    /// Argument type list.
    #[must_use]
    pub fn args(&self) -> &TypeListRef {
        &self.args
    }

    /// The shorty string (`V` return, one character per parameter slot).
    #[must_use]
    pub fn shorty(&self) -> &DexStringRef {
        &self.shorty
    }

    /// True when the return type is `V`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.rtype.is_void()
    }
}

handle_type! {
    /// Interned handle to a [`DexProto`].
    ProtoRef => DexProto
}

impl fmt::Debug for ProtoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtoRef({})", self.shorty())
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::DexContext;

    #[test]
    fn test_type_predicates() {
        let ctx = DexContext::new();
        assert!(ctx.make_type("J").is_wide());
        assert!(ctx.make_type("D").is_wide());
        assert!(!ctx.make_type("I").is_wide());
        assert!(ctx.make_type("Ljava/lang/Object;").is_object());
        assert!(ctx.make_type("[I").is_object());
        assert!(ctx.make_type("V").is_void());
        assert_eq!(ctx.make_type("Lfoo/Bar;").shorty_char(), 'L');
        assert_eq!(ctx.make_type("I").shorty_char(), 'I');
    }
}
