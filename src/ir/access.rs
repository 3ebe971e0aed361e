//! Dex access flags.
#![allow(missing_docs)]

use bitflags::bitflags;

bitflags! {
    /// Access flags carried by classes, methods and fields.
    ///
    /// The overlapping flag values (`VOLATILE`/`BRIDGE`,
    /// `TRANSIENT`/`VARARGS`) follow the dex specification; which reading
    /// applies depends on the kind of the carrying definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x1_0000;
        const DECLARED_SYNCHRONIZED = 0x2_0000;
    }
}

impl AccessFlags {
    /// True when the flags mark an interface.
    #[must_use]
    pub fn is_interface(self) -> bool {
        self.contains(AccessFlags::INTERFACE)
    }

    /// True when the flags mark a static member.
    #[must_use]
    pub fn is_static(self) -> bool {
        self.contains(AccessFlags::STATIC)
    }
}
