//! Classes, methods and fields: refs that can become concrete definitions.
//!
//! A [`DexMethod`] or [`DexField`] starts life as a pure reference (identity
//! only) and becomes concrete when a definition is attached. External
//! definitions are declared elsewhere and treated as read-only. Classes own
//! their member lists; direct methods are kept apart from virtual methods,
//! static fields apart from instance fields, as the container format does.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::ir::{
    handle_type, refs::{FieldSpec, MethodSpec}, types::compare_types, AccessFlags, DexStringRef,
    DexTypeRef, IrCode, ProtoRef, TypeListRef,
};
use crate::ir::code::DexCode;
use crate::ir::strings::compare_strings;

/// A set of annotation class types attached to a definition.
///
/// The optimizer only needs annotations as an opaque set it can carry,
/// inspect by type, or drop.
#[derive(Debug, Clone, Default)]
pub struct AnnotationSet {
    types: Vec<DexTypeRef>,
}

impl AnnotationSet {
    /// Creates a set from annotation class types.
    #[must_use]
    pub fn new(types: Vec<DexTypeRef>) -> Self {
        AnnotationSet { types }
    }

    /// The annotation class types.
    #[must_use]
    pub fn types(&self) -> &[DexTypeRef] {
        &self.types
    }
}

#[derive(Debug, Default)]
struct FieldDef {
    access: AccessFlags,
    concrete: bool,
    external: bool,
    annotations: Option<AnnotationSet>,
}

/// A field reference that may carry a concrete definition.
#[derive(Debug)]
pub struct DexField {
    spec: RwLock<FieldSpec>,
    def: RwLock<FieldDef>,
}

impl DexField {
    pub(crate) fn new(spec: FieldSpec) -> Self {
        DexField {
            spec: RwLock::new(spec),
            def: RwLock::new(FieldDef::default()),
        }
    }

    /// Current identity of this field.
    #[must_use]
    pub fn spec(&self) -> FieldSpec {
        self.spec
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_spec(&self, spec: FieldSpec) {
        *self.spec.write().unwrap_or_else(PoisonError::into_inner) = spec;
    }

    /// Containing class type.
    #[must_use]
    pub fn cls(&self) -> DexTypeRef {
        self.spec().cls
    }

    /// Field name.
    #[must_use]
    pub fn name(&self) -> DexStringRef {
        self.spec().name
    }

    /// Field type.
    #[must_use]
    pub fn ftype(&self) -> DexTypeRef {
        self.spec().ftype
    }

    /// True once a definition has been attached.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        self.def.read().unwrap_or_else(PoisonError::into_inner).concrete
    }

    /// True when declared elsewhere (read-only).
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.def.read().unwrap_or_else(PoisonError::into_inner).external
    }

    /// True for concrete or external fields.
    #[must_use]
    pub fn is_def(&self) -> bool {
        self.is_concrete() || self.is_external()
    }

    /// Access flags of the definition.
    #[must_use]
    pub fn access(&self) -> AccessFlags {
        self.def.read().unwrap_or_else(PoisonError::into_inner).access
    }

    /// Replaces the access flags. External fields are read-only.
    pub fn set_access(&self, access: AccessFlags) {
        let mut def = self.def.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!def.external, "unexpected external field {}", self.spec());
        def.access = access;
    }

    /// Attaches a concrete definition.
    pub fn make_concrete(&self, access: AccessFlags) {
        let mut def = self.def.write().unwrap_or_else(PoisonError::into_inner);
        def.access = access;
        def.concrete = true;
    }

    /// Marks the field as externally defined.
    pub fn set_external(&self) {
        let mut def = self.def.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!def.concrete, "unexpected concrete field {}", self.spec());
        def.external = true;
    }

    /// Attaches an annotation set.
    pub fn attach_annotations(&self, annotations: AnnotationSet) {
        self.def
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .annotations = Some(annotations);
    }

    /// Removes all annotations.
    pub fn clear_annotations(&self) {
        self.def
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .annotations = None;
    }
}

handle_type! {
    /// Interned handle to a [`DexField`].
    FieldRef => DexField
}

impl fmt::Debug for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldRef({})", self.spec())
    }
}

#[derive(Debug, Default)]
struct MethodDef {
    access: AccessFlags,
    concrete: bool,
    is_virtual: bool,
    external: bool,
    annotations: Option<AnnotationSet>,
}

/// A method reference that may carry a concrete definition and body.
#[derive(Debug)]
pub struct DexMethod {
    spec: RwLock<MethodSpec>,
    def: RwLock<MethodDef>,
    code: RwLock<Option<IrCode>>,
    dex_code: RwLock<Option<DexCode>>,
}

impl DexMethod {
    pub(crate) fn new(spec: MethodSpec) -> Self {
        DexMethod {
            spec: RwLock::new(spec),
            def: RwLock::new(MethodDef::default()),
            code: RwLock::new(None),
            dex_code: RwLock::new(None),
        }
    }

    /// Current identity of this method.
    #[must_use]
    pub fn spec(&self) -> MethodSpec {
        self.spec
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_spec(&self, spec: MethodSpec) {
        *self.spec.write().unwrap_or_else(PoisonError::into_inner) = spec;
    }

    /// Containing class type.
    #[must_use]
    pub fn cls(&self) -> DexTypeRef {
        self.spec().cls
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> DexStringRef {
        self.spec().name
    }

    /// Method prototype.
    #[must_use]
    pub fn proto(&self) -> ProtoRef {
        self.spec().proto
    }

    /// True once a definition has been attached.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        self.def.read().unwrap_or_else(PoisonError::into_inner).concrete
    }

    /// True when the method participates in virtual dispatch.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.def.read().unwrap_or_else(PoisonError::into_inner).is_virtual
    }

    /// True when declared elsewhere (read-only).
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.def.read().unwrap_or_else(PoisonError::into_inner).external
    }

    /// True for concrete or external methods.
    #[must_use]
    pub fn is_def(&self) -> bool {
        self.is_concrete() || self.is_external()
    }

    /// Access flags of the definition.
    #[must_use]
    pub fn access(&self) -> AccessFlags {
        self.def.read().unwrap_or_else(PoisonError::into_inner).access
    }

    /// Replaces the access flags. External methods are read-only.
    pub fn set_access(&self, access: AccessFlags) {
        let mut def = self.def.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!def.external, "unexpected external method {}", self.spec());
        def.access = access;
    }

    /// Flips virtual-ness.
    pub fn set_virtual(&self, is_virtual: bool) {
        let mut def = self.def.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!def.external, "unexpected external method {}", self.spec());
        def.is_virtual = is_virtual;
    }

    /// Marks the method as externally defined.
    pub fn set_external(&self) {
        let mut def = self.def.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!def.concrete, "unexpected concrete method {}", self.spec());
        def.external = true;
    }

    /// Attaches a concrete definition with an optional editable body.
    pub fn make_concrete(&self, access: AccessFlags, code: Option<IrCode>, is_virtual: bool) {
        {
            let mut def = self.def.write().unwrap_or_else(PoisonError::into_inner);
            def.access = access;
            def.concrete = true;
            def.is_virtual = is_virtual;
        }
        *self.code.write().unwrap_or_else(PoisonError::into_inner) = code;
    }

    /// Detaches the definition; the handle stays interned but stops being a
    /// def.
    pub fn make_non_concrete(&self) {
        {
            let mut def = self.def.write().unwrap_or_else(PoisonError::into_inner);
            def.concrete = false;
        }
        *self.code.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// True when an editable body is attached.
    #[must_use]
    pub fn has_code(&self) -> bool {
        self.code
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replaces the editable body.
    pub fn set_code(&self, code: Option<IrCode>) {
        *self.code.write().unwrap_or_else(PoisonError::into_inner) = code;
    }

    /// Runs `f` with shared access to the editable body, when present.
    pub fn with_code<R>(&self, f: impl FnOnce(&IrCode) -> R) -> Option<R> {
        let guard = self.code.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f)
    }

    /// Runs `f` with exclusive access to the editable body, when present.
    ///
    /// Bodies are owned by the enclosing class; when a pass touches multiple
    /// methods in parallel, each thread must confine itself to a disjoint
    /// class set.
    pub fn with_code_mut<R>(&self, f: impl FnOnce(&mut IrCode) -> R) -> Option<R> {
        let mut guard = self.code.write().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().map(f)
    }

    /// Replaces the raw (load/store boundary) body.
    pub fn set_dex_code(&self, code: Option<DexCode>) {
        *self.dex_code.write().unwrap_or_else(PoisonError::into_inner) = code;
    }

    /// Runs `f` with shared access to the raw body, when present.
    pub fn with_dex_code<R>(&self, f: impl FnOnce(&DexCode) -> R) -> Option<R> {
        let guard = self.dex_code.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f)
    }

    /// Converts the raw body into editable form in place.
    pub fn balloon(&self) {
        let raw = self
            .dex_code
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(raw) = raw {
            let is_static = self.access().is_static();
            self.set_code(Some(IrCode::balloon(&raw, &self.proto(), is_static)));
        }
    }

    /// Converts the editable body back into raw form in place.
    pub fn sync(&self) {
        let code = self
            .code
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(code) = code {
            self.set_dex_code(Some(code.sync()));
        }
    }

    /// Attaches an annotation set.
    pub fn attach_annotations(&self, annotations: AnnotationSet) {
        self.def
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .annotations = Some(annotations);
    }

    /// Removes all annotations.
    pub fn clear_annotations(&self) {
        self.def
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .annotations = None;
    }
}

handle_type! {
    /// Interned handle to a [`DexMethod`].
    MethodRef => DexMethod
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodRef({})", self.spec())
    }
}

/// Everything needed to register a new class with the context.
pub struct ClassSpec {
    /// The class's own type.
    pub type_: DexTypeRef,
    /// Access flags.
    pub access: AccessFlags,
    /// Super type; `None` only for the object root.
    pub super_class: Option<DexTypeRef>,
    /// Implemented interfaces.
    pub interfaces: TypeListRef,
    /// Source file attribution, when known.
    pub source_file: Option<DexStringRef>,
    /// True when the class is declared elsewhere.
    pub external: bool,
}

#[derive(Debug)]
struct ClassState {
    access: AccessFlags,
    super_class: Option<DexTypeRef>,
    interfaces: TypeListRef,
    source_file: Option<DexStringRef>,
    annotations: Option<AnnotationSet>,
    external: bool,
    dmethods: Vec<MethodRef>,
    vmethods: Vec<MethodRef>,
    sfields: Vec<FieldRef>,
    ifields: Vec<FieldRef>,
}

/// A class definition owning its member lists.
#[derive(Debug)]
pub struct DexClass {
    type_: DexTypeRef,
    state: RwLock<ClassState>,
}

impl DexClass {
    pub(crate) fn new(spec: ClassSpec) -> Self {
        DexClass {
            type_: spec.type_,
            state: RwLock::new(ClassState {
                access: spec.access,
                super_class: spec.super_class,
                interfaces: spec.interfaces,
                source_file: spec.source_file,
                annotations: None,
                external: spec.external,
                dmethods: Vec::new(),
                vmethods: Vec::new(),
                sfields: Vec::new(),
                ifields: Vec::new(),
            }),
        }
    }

    /// The class's own type.
    #[must_use]
    pub fn type_(&self) -> &DexTypeRef {
        &self.type_
    }

    /// Current descriptor string of the class.
    #[must_use]
    pub fn name(&self) -> DexStringRef {
        self.type_.name()
    }

    /// Access flags.
    #[must_use]
    pub fn access(&self) -> AccessFlags {
        self.state.read().unwrap_or_else(PoisonError::into_inner).access
    }

    /// Replaces the access flags. External classes are read-only.
    pub fn set_access(&self, access: AccessFlags) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!state.external, "unexpected external class {}", self.type_);
        state.access = access;
    }

    /// True when the flags mark an interface.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.access().is_interface()
    }

    /// True when declared elsewhere (read-only).
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).external
    }

    /// Super type; `None` only for the object root.
    #[must_use]
    pub fn super_class(&self) -> Option<DexTypeRef> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .super_class
            .clone()
    }

    /// Rewrites the super type. Invalidates any hierarchy index built over a
    /// scope containing this class.
    pub fn set_super_class(&self, super_class: Option<DexTypeRef>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!state.external, "unexpected external class {}", self.type_);
        state.super_class = super_class;
    }

    /// Declared interfaces.
    #[must_use]
    pub fn interfaces(&self) -> TypeListRef {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .interfaces
            .clone()
    }

    /// Rewrites the interface list. Invalidates any hierarchy index built
    /// over a scope containing this class.
    pub fn set_interfaces(&self, interfaces: TypeListRef) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!state.external, "unexpected external class {}", self.type_);
        state.interfaces = interfaces;
    }

    /// Source file attribution.
    #[must_use]
    pub fn source_file(&self) -> Option<DexStringRef> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .source_file
            .clone()
    }

    /// Sets the source file attribution.
    pub fn set_source_file(&self, source_file: Option<DexStringRef>) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .source_file = source_file;
    }

    /// Attaches an annotation set.
    pub fn attach_annotations(&self, annotations: AnnotationSet) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .annotations = Some(annotations);
    }

    /// Removes all annotations.
    pub fn clear_annotations(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .annotations = None;
    }

    /// Direct methods (constructors, private, static), insertion order.
    #[must_use]
    pub fn dmethods(&self) -> Vec<MethodRef> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dmethods
            .clone()
    }

    /// Virtual methods, insertion order.
    #[must_use]
    pub fn vmethods(&self) -> Vec<MethodRef> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .vmethods
            .clone()
    }

    /// Static fields, insertion order.
    #[must_use]
    pub fn sfields(&self) -> Vec<FieldRef> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sfields
            .clone()
    }

    /// Instance fields, insertion order.
    #[must_use]
    pub fn ifields(&self) -> Vec<FieldRef> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ifields
            .clone()
    }

    /// Adds a concrete method to the appropriate member list.
    pub fn add_method(&self, method: MethodRef) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!state.external, "unexpected external class {}", self.type_);
        if method.is_virtual() {
            state.vmethods.push(method);
        } else {
            state.dmethods.push(method);
        }
    }

    /// Removes a method from this class.
    pub fn remove_method(&self, method: &MethodRef) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.dmethods.retain(|m| m != method);
        state.vmethods.retain(|m| m != method);
    }

    /// Adds a concrete field to the appropriate member list.
    pub fn add_field(&self, field: FieldRef) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!state.external, "unexpected external class {}", self.type_);
        if field.access().is_static() {
            state.sfields.push(field);
        } else {
            state.ifields.push(field);
        }
    }

    /// Removes a field from this class.
    pub fn remove_field(&self, field: &FieldRef) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.sfields.retain(|f| f != field);
        state.ifields.retain(|f| f != field);
    }

    /// The class initializer, when present.
    #[must_use]
    pub fn get_clinit(&self) -> Option<MethodRef> {
        self.dmethods()
            .into_iter()
            .find(|m| m.name().bytes() == b"<clinit>")
    }

    /// Looks up a field by name and type across both member lists.
    #[must_use]
    pub fn find_field(&self, name: &DexStringRef, ftype: &DexTypeRef) -> Option<FieldRef> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .sfields
            .iter()
            .chain(state.ifields.iter())
            .find(|f| {
                let spec = f.spec();
                &spec.name == name && &spec.ftype == ftype
            })
            .cloned()
    }

    /// Sorts both method lists into dex-spec order.
    pub fn sort_methods(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let cmp = |a: &MethodRef, b: &MethodRef| {
            let (sa, sb) = (a.spec(), b.spec());
            compare_types(&sa.cls, &sb.cls)
                .then_with(|| compare_strings(&sa.name, &sb.name))
                .then_with(|| compare_strings(sa.proto.shorty(), sb.proto.shorty()))
        };
        state.dmethods.sort_by(cmp);
        state.vmethods.sort_by(cmp);
    }

    /// Sorts both field lists into dex-spec order.
    pub fn sort_fields(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let cmp = |a: &FieldRef, b: &FieldRef| {
            let (sa, sb) = (a.spec(), b.spec());
            compare_types(&sa.cls, &sb.cls)
                .then_with(|| compare_strings(&sa.name, &sb.name))
                .then_with(|| compare_types(&sa.ftype, &sb.ftype))
        };
        state.sfields.sort_by(cmp);
        state.ifields.sort_by(cmp);
    }
}

handle_type! {
    /// Interned handle to a [`DexClass`].
    ClassRef => DexClass
}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassRef({})", self.name())
    }
}

/// The sequence of classes a pass is allowed to mutate; external classes are
/// visible but read-only.
pub type Scope = Vec<ClassRef>;
