//! # classflow-core
//!
//! Per-instruction control-flow and value-provenance graphs for JVM
//! bytecode, exported as a portable XML document.
//!
//! The crate is built around a fixpoint abstract interpreter: it
//! symbolically executes a method's stack machine instructions, tracks
//! where every stack and local slot value originated, merges values at
//! control-flow joins into deduplicated phi-like nodes, discovers normal
//! and exceptional edges, and iterates until the frame states stabilise.
//! A second, coarser layer discovers every method transitively reachable
//! from a set of entry classes and analyses each exactly once.
//!
//! ## Modules
//!
//! - **[`ir`]** - decoded classfile representation and descriptors
//! - **[`flow`]** - value model, transfer functions, fixpoint engine,
//!   per-method analysis and serialisation
//! - **[`driver`]** - whole-program worklist over loader/decoder traits
//! - **[`xml`]** - document model and writer for the exported graph
//! - **[`error`]** - recoverable vs fatal failure split

pub mod driver;
pub mod error;
pub mod flow;
pub mod ir;
pub mod xml;

pub use driver::{ClassDecoder, ClassLoader, ClassWorklist, ProgramAnalysis};
pub use error::{AnalysisError, AnalysisResult, DecodeError};
pub use flow::{Edge, EdgeMap, Frame, MethodGraph, Value, ValueArena, ValueId};
pub use ir::{ClassDef, ConstValue, Insn, InsnKind, JvmType, MethodDef};
