#![deny(missing_docs)]

//! # dexopt
//!
//! A whole-program optimizer substrate for dex-style register bytecode.
//! Built in pure Rust, `dexopt` provides the analysis and transformation
//! core every optimization pass is built on: an interned IR with
//! pointer-equality semantics, a class-hierarchy and virtual-dispatch index,
//! an abstract-interpretation framework over persistent environments, a
//! graph-colouring register allocator specialised for dex operand encodings,
//! a bit-exact codec for the ahead-of-time (OAT) container format, and a
//! parallel pass driver.
//!
//! # Architecture
//!
//! The components stack from leaves to drivers:
//!
//! - **IR Layer** ([`crate::ir`]): the interned model — strings, types,
//!   prototypes, classes, methods, fields — owned by a process-wide
//!   [`crate::ir::DexContext`], plus the editable method body every pass
//!   works on
//! - **Hierarchy Layer** ([`crate::hierarchy`]): parent→children and
//!   interface→implementors indexes, virtual resolution and rename-collision
//!   queries
//! - **Collections** ([`crate::collections`]): persistent Patricia-tree sets
//!   and maps with structural sharing
//! - **Analysis Layer** ([`crate::analysis`]): abstract-domain scaffolding,
//!   environments, control-flow graphs, the monotonic fixpoint iterator,
//!   liveness, nullness and aliasing domains
//! - **Register Allocator** ([`crate::regalloc`]): Chaitin-Briggs colouring
//!   with coalescing, range handling, parameter placement, and live-range
//!   splitting
//! - **OAT Codec** ([`crate::oat`]): version-aware parse and build of the
//!   AOT container, with the optional ELF wrapper
//! - **Drivers** ([`crate::workqueue`], [`crate::walk`], [`crate::pass`]):
//!   the parallel work queue, scope walkers, and the pass pipeline surface
//!
//! # Usage Examples
//!
//! ## Interning and hierarchy
//!
//! ```rust
//! use dexopt::ir::{AccessFlags, ClassSpec, DexContext};
//!
//! let ctx = DexContext::new();
//! let object = ctx.make_type("Ljava/lang/Object;");
//! let cls = ctx.make_class(ClassSpec {
//!     type_: ctx.make_type("Lcom/example/Foo;"),
//!     access: AccessFlags::PUBLIC,
//!     super_class: Some(object),
//!     interfaces: ctx.make_type_list(vec![]),
//!     source_file: None,
//!     external: false,
//! })?;
//! assert_eq!(ctx.type_class(cls.type_()).as_ref(), Some(&cls));
//! # Ok::<(), dexopt::Error>(())
//! ```
//!
//! ## Building an OAT container
//!
//! ```rust,no_run
//! use dexopt::oat::{build, BuildConfig, DexInput, OatFile};
//!
//! let dexes = vec![DexInput {
//!     data: std::fs::read("classes.dex")?,
//!     location: "classes.dex".into(),
//! }];
//! let mut out = Vec::new();
//! build(&mut out, &dexes, &BuildConfig::default())?;
//! let parsed = OatFile::parse(&out)?;
//! parsed.expect_success()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Concurrency
//!
//! Interning (`make_*` / `get_*`) is safe from any thread; re-keying
//! operations (`alias_type_name`, `mutate_*`, `erase_*`) must run in
//! single-threaded driver phases. The hierarchy index is immutable for the
//! duration of a pass. Method bodies are owned by their class: parallel
//! passes partition work by class through [`crate::walk`] /
//! [`crate::workqueue`]. Patricia trees are immutable and freely shareable.

pub mod analysis;
pub mod collections;
mod error;
pub mod file;
pub mod hierarchy;
pub mod ir;
pub mod oat;
pub mod pass;
pub mod regalloc;
pub mod walk;
pub mod workqueue;

pub use error::{Error, Result};
