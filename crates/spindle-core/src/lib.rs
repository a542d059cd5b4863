//! Core value types and the program IR for spindle.
//!
//! This crate provides the backend-independent vocabulary shared by the
//! runtime and its backends:
//! - Element types, layouts and shapes (`ElementType`, `Layout`, `ArrayShape`, `Shape`)
//! - Host-resident values with layout normalization (`Literal`, `Value`)
//! - The program IR executed by backends (`Program`, `ProgramBuilder`)
//!
//! # Example
//!
//! ```
//! use spindle_core::{ElementType, ProgramBuilder, Shape};
//!
//! let vec4 = Shape::array(ElementType::F32, vec![4]);
//! let mut builder = ProgramBuilder::new("add");
//! let a = builder.parameter(vec4.clone());
//! let b = builder.parameter(vec4);
//! let sum = builder.add(a, b).unwrap();
//! let program = builder.build(sum).unwrap();
//!
//! assert_eq!(program.parameter_shapes().len(), 2);
//! ```

pub mod literal;
pub mod program;
pub mod types;

pub use literal::{Literal, Value};
pub use program::{BinaryOp, Instruction, Op, Program, ProgramBuilder, UnaryOp, ValueId};
pub use types::{ArrayShape, ElementType, Layout, Shape};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for spindle-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Layout error: {0}")]
    Layout(String),

    #[error("Literal error: {0}")]
    Literal(String),

    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    #[error("program:{line}: parse error: {message}")]
    Parse { line: usize, message: String },
}
