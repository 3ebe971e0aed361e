//! The abstract-interpretation kit.
//!
//! This module provides everything a dataflow analysis over a method body
//! needs:
//!
//! - [`domain`] - the `AbstractValue` capability trait and the
//!   Top/Value/Bottom scaffolding, plus the stock domains (hashed set,
//!   simple value, finite lattice)
//! - [`environment`] - variable → domain environments with implicit Top
//! - [`nullness`] - the 4-point nullness lattice and its transfer
//! - [`aliased`] - the register-aliasing domain used by copy propagation
//! - [`cfg`] - basic-block control-flow graphs over editable bodies
//! - [`fixpoint`] - the monotonic fixpoint iterator
//! - [`liveness`] - backward liveness over Patricia sets
//!
//! Analyses are single-threaded within one method; the structures here are
//! freely shareable across threads because the environments are persistent.

mod aliased;
mod cfg;
mod domain;
mod environment;
mod finite;
mod fixpoint;
mod liveness;
pub mod nullness;

pub use aliased::{AliasDomain, AliasedRegisters, RegisterValue};
pub use cfg::{Block, BlockId, ControlFlowGraph, Edge, EdgeKind};
pub use domain::{
    AbstractDomain, AbstractValue, AbstractValueKind, Domain, HashedSetAbstractDomain, SetValue,
    SimpleValue, SimpleValueAbstractDomain,
};
pub use environment::{HashedAbstractEnvironment, PatriciaTreeMapAbstractEnvironment};
pub use finite::{FiniteAbstractDomain, FiniteLattice, FiniteValue};
pub use fixpoint::{Direction, FixpointDomain, FixpointTransfer, MonotonicFixpointIterator};
pub use liveness::{LivenessDomain, LivenessFixpointIterator};
pub use nullness::{Nullness, NullnessDomain};
