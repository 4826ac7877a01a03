//! # classflow-classfile
//!
//! The loader/decoder collaborators of the classflow analyser: a
//! self-contained JVM classfile decoder producing the structured
//! representation `classflow-core` consumes, and a class-path loader over
//! filesystem directories and jar archives.

mod bytecode;
mod classpath;
mod parser;

pub use classpath::{ClassPath, ClassPathError};
pub use parser::{decode_class, ClassFileDecoder};
