//! Generated WGSL compute kernels for element-wise instructions.
//!
//! Each kernel covers one array of a fixed length, so the length and the
//! 2D dispatch stride are baked in as WGSL constants. Sources are parsed
//! and validated with naga before pipeline creation, and pipelines are
//! cached by source text.

use crate::error::{Result, RuntimeError};
use spindle_core::{BinaryOp, ElementType, UnaryOp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Threads per workgroup.
pub(crate) const WORKGROUP_SIZE: u32 = 256;

/// Per-dimension workgroup limit guaranteed by WebGPU.
const MAX_WORKGROUPS_PER_DIM: u32 = 65535;

/// What one kernel computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KernelOp {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Convert,
}

impl KernelOp {
    pub(crate) fn arity(&self) -> usize {
        match self {
            KernelOp::Binary(_) => 2,
            KernelOp::Unary(_) | KernelOp::Convert => 1,
        }
    }
}

/// WGSL scalar type for an element type, if kernels support it.
pub(crate) fn wgsl_type(element_type: ElementType) -> Option<&'static str> {
    match element_type {
        ElementType::F32 => Some("f32"),
        ElementType::S32 => Some("i32"),
        ElementType::U32 => Some("u32"),
        _ => None,
    }
}

/// Split `num_workgroups` over X and Y so neither exceeds the limit.
///
/// Returns the dispatch size and the number of threads per Y row.
pub(crate) fn compute_dispatch_size(num_workgroups: u32) -> ([u32; 2], u32) {
    if num_workgroups <= MAX_WORKGROUPS_PER_DIM {
        return ([num_workgroups, 1], num_workgroups * WORKGROUP_SIZE);
    }
    let y = num_workgroups.div_ceil(MAX_WORKGROUPS_PER_DIM);
    let x = num_workgroups.div_ceil(y);
    ([x, y], x * WORKGROUP_SIZE)
}

fn expression(op: KernelOp, input: &str, output: &str) -> String {
    match op {
        KernelOp::Unary(UnaryOp::Neg) => "-src[i]".to_string(),
        KernelOp::Unary(unary) => format!("{}(src[i])", unary.name()),
        KernelOp::Binary(BinaryOp::Add) => "lhs[i] + rhs[i]".to_string(),
        KernelOp::Binary(BinaryOp::Sub) => "lhs[i] - rhs[i]".to_string(),
        KernelOp::Binary(BinaryOp::Mul) => "lhs[i] * rhs[i]".to_string(),
        // Integer division by zero yields all ones, matching the host backend.
        KernelOp::Binary(BinaryOp::Div) => match input {
            "i32" => "select(lhs[i] / rhs[i], -1i, rhs[i] == 0i)".to_string(),
            "u32" => "select(lhs[i] / rhs[i], 0xffffffffu, rhs[i] == 0u)".to_string(),
            _ => "lhs[i] / rhs[i]".to_string(),
        },
        KernelOp::Binary(BinaryOp::Max) => "max(lhs[i], rhs[i])".to_string(),
        KernelOp::Binary(BinaryOp::Min) => "min(lhs[i], rhs[i])".to_string(),
        KernelOp::Convert => format!("{output}(src[i])"),
    }
}

/// WGSL source for `op` over `len` elements.
///
/// # Errors
/// Returns [`RuntimeError::CompileError`] if either element type has no
/// kernel support.
pub(crate) fn kernel_source(
    op: KernelOp,
    input: ElementType,
    output: ElementType,
    len: u32,
) -> Result<String> {
    let unsupported = |ty: ElementType| {
        RuntimeError::CompileError(format!(
            "gpu kernels support f32, s32 and u32 elements, not {ty}"
        ))
    };
    let input_ty = wgsl_type(input).ok_or_else(|| unsupported(input))?;
    let output_ty = wgsl_type(output).ok_or_else(|| unsupported(output))?;
    let (_, row) = compute_dispatch_size(len.div_ceil(WORKGROUP_SIZE));

    let bindings = if op.arity() == 2 {
        format!(
            "@group(0) @binding(0) var<storage, read> lhs: array<{input_ty}>;\n\
             @group(0) @binding(1) var<storage, read> rhs: array<{input_ty}>;\n\
             @group(0) @binding(2) var<storage, read_write> dst: array<{output_ty}>;\n"
        )
    } else {
        format!(
            "@group(0) @binding(0) var<storage, read> src: array<{input_ty}>;\n\
             @group(0) @binding(1) var<storage, read_write> dst: array<{output_ty}>;\n"
        )
    };

    Ok(format!(
        "{bindings}\n\
         const LEN: u32 = {len}u;\n\
         const ROW: u32 = {row}u;\n\
         \n\
         @compute @workgroup_size({WORKGROUP_SIZE})\n\
         fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{\n\
         \x20   let i = gid.x + gid.y * ROW;\n\
         \x20   if (i >= LEN) {{\n\
         \x20       return;\n\
         \x20   }}\n\
         \x20   dst[i] = {};\n\
         }}\n",
        expression(op, input_ty, output_ty)
    ))
}

/// Parse and validate WGSL with naga.
pub(crate) fn parse_and_validate(source: &str) -> Result<naga::Module> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| RuntimeError::ShaderError(e.emit_to_string(source)))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| RuntimeError::ShaderError(format!("Module validation failed: {e}")))?;
    Ok(module)
}

/// A ready-to-dispatch kernel.
pub(crate) struct Kernel {
    pub(crate) pipeline: wgpu::ComputePipeline,
    pub(crate) workgroups: [u32; 2],
    pub(crate) len: u32,
    pub(crate) arity: usize,
}

/// Pipeline cache keyed by generated source.
#[derive(Default)]
pub(crate) struct KernelCache {
    kernels: Mutex<HashMap<String, Arc<Kernel>>>,
}

impl KernelCache {
    pub(crate) fn get_or_create(
        &self,
        device: &wgpu::Device,
        op: KernelOp,
        input: ElementType,
        output: ElementType,
        len: usize,
    ) -> Result<Arc<Kernel>> {
        let len = u32::try_from(len).map_err(|_| {
            RuntimeError::CompileError(format!("{len} elements exceed the gpu kernel limit"))
        })?;
        let source = kernel_source(op, input, output, len)?;

        let mut kernels = self.kernels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(kernel) = kernels.get(&source) {
            return Ok(Arc::clone(kernel));
        }

        let module = parse_and_validate(&source)?;
        let label = format!("{op:?}_{input}_{output}_{len}");
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::Naga(std::borrow::Cow::Owned(module)),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&label),
            layout: None,
            module: &shader_module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        let (workgroups, _) = compute_dispatch_size(len.div_ceil(WORKGROUP_SIZE));

        tracing::trace!(kernel = %label, "created pipeline");
        let kernel = Arc::new(Kernel {
            pipeline,
            workgroups,
            len,
            arity: op.arity(),
        });
        kernels.insert(source, Arc::clone(&kernel));
        Ok(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_size() {
        assert_eq!(compute_dispatch_size(4), ([4, 1], 4 * WORKGROUP_SIZE));
        let (size, row) = compute_dispatch_size(70_000);
        assert!(size[0] <= 65535 && size[1] == 2);
        assert!(size[0] * size[1] >= 70_000);
        assert_eq!(row, size[0] * WORKGROUP_SIZE);
    }

    #[test]
    fn test_generated_kernels_validate() {
        for op in UnaryOp::ALL {
            let ty = if op.requires_float() { ElementType::F32 } else { ElementType::S32 };
            let source = kernel_source(KernelOp::Unary(op), ty, ty, 1000).unwrap();
            parse_and_validate(&source).unwrap_or_else(|e| panic!("{op:?}: {e}\n{source}"));
        }
        for op in BinaryOp::ALL {
            for ty in [ElementType::F32, ElementType::S32, ElementType::U32] {
                let source = kernel_source(KernelOp::Binary(op), ty, ty, 17).unwrap();
                parse_and_validate(&source).unwrap_or_else(|e| panic!("{op:?}: {e}\n{source}"));
            }
        }
        let source =
            kernel_source(KernelOp::Convert, ElementType::F32, ElementType::U32, 5).unwrap();
        parse_and_validate(&source).unwrap();
    }

    #[test]
    fn test_unsupported_types_are_rejected() {
        let result = kernel_source(KernelOp::Unary(UnaryOp::Neg), ElementType::F64, ElementType::F64, 4);
        assert!(matches!(result, Err(RuntimeError::CompileError(_))));
        let result = kernel_source(KernelOp::Convert, ElementType::F32, ElementType::U8, 4);
        assert!(result.is_err());
    }
}
