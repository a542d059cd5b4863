//! Shared helpers for runtime integration tests.

#![allow(dead_code)]

use spindle_core::{BinaryOp, ElementType, Program, ProgramBuilder, Shape};

/// Install a test-friendly tracing subscriber; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn i32_bytes(values: &[i32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn to_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Program applying `op` to two parameters of `element_type[dims]`.
///
/// Returns the program and its argument shapes.
pub fn binary_program(
    op: BinaryOp,
    element_type: ElementType,
    dims: &[usize],
) -> (Program, Vec<Shape>) {
    let shape = Shape::array(element_type, dims.to_vec());
    let mut builder = ProgramBuilder::new(format!("{}_{}", op.name(), element_type.name()));
    let a = builder.parameter(shape.clone());
    let b = builder.parameter(shape.clone());
    let c = builder
        .binary(op, a, b)
        .expect("binary operands should match");
    let program = builder.build(c).expect("program should validate");
    (program, vec![shape.clone(), shape])
}
