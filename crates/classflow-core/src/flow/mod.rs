//! Per-method provenance analysis
//!
//! This module implements the per-method half of the analyser:
//! - Provenance value model with structural deduplication
//! - Per-opcode transfer functions
//! - Worklist-based fixpoint engine over frames and control-flow edges
//! - Method-level orchestration and graph serialisation

mod engine;
mod interp;
mod method;
mod value;

pub use engine::{analyze, Edge, EdgeMap, Frame, FlowResult};
pub use method::MethodGraph;
pub use value::{Value, ValueArena, ValueId};
