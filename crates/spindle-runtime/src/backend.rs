//! The capability set a device runtime must provide.
//!
//! [`DeviceClient`](crate::DeviceClient) and everything above it talk to
//! devices only through these traits. Two implementations live in this crate:
//! the threaded host backend ([`crate::host`]) and the wgpu backend
//! ([`crate::gpu`]).

use crate::error::{Result, RuntimeError};
use spindle_core::{ArrayShape, Literal, Program, Shape, Value};
use std::any::Any;
use std::fmt;
use std::str::FromStr;

/// Which backend a client drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Platform {
    /// Threaded CPU backend.
    #[default]
    Host,
    /// wgpu compute backend.
    Gpu,
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Host => "host",
            Platform::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" | "cpu" => Ok(Platform::Host),
            "gpu" => Ok(Platform::Gpu),
            other => Err(RuntimeError::InvalidArgument(format!(
                "unknown platform '{other}' (expected host, cpu or gpu)"
            ))),
        }
    }
}

/// Static description of one addressable device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub id: usize,
    pub platform: Platform,
    /// Device class, e.g. `cpu` or the adapter's device type.
    pub kind: String,
    pub name: String,
}

impl fmt::Display for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({}, {})", self.platform, self.id, self.kind, self.name)
    }
}

/// Options that shape the compiled executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableBuildOptions {
    /// Device the executable targets by default.
    pub device_ordinal: Option<usize>,
    pub num_replicas: usize,
    pub num_partitions: usize,
}

impl Default for ExecutableBuildOptions {
    fn default() -> Self {
        Self {
            device_ordinal: None,
            num_replicas: 1,
            num_partitions: 1,
        }
    }
}

/// Everything a backend receives at compile time.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Argument shapes with explicit layouts cleared.
    pub argument_layouts: Vec<Shape>,
    /// Always false: parameters arrive as a flat list.
    pub parameter_is_tupled_arguments: bool,
    pub build_options: ExecutableBuildOptions,
    /// Compile for execution on any single device chosen at run time.
    pub compile_portable_executable: bool,
}

/// Per-execution options.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions {
    /// Split a tuple result into one buffer per element.
    pub untuple_result: bool,
    /// Reject arguments whose layout differs from the compiled one.
    pub strict_shape_checking: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            untuple_result: true,
            strict_shape_checking: false,
        }
    }
}

/// A device runtime.
pub trait Backend: Send + Sync {
    fn platform(&self) -> Platform;

    fn devices(&self) -> &[DeviceDescription];

    /// Resolve a device id.
    ///
    /// # Errors
    /// Returns [`RuntimeError::NotFound`] if no device has this id.
    fn lookup_device(&self, id: usize) -> Result<&DeviceDescription> {
        self.devices().iter().find(|d| d.id == id).ok_or_else(|| {
            RuntimeError::NotFound(format!(
                "no {} device with id {id} ({} available)",
                self.platform(),
                self.devices().len()
            ))
        })
    }

    /// Begin an asynchronous host-to-device transfer.
    ///
    /// `data` is interpreted in `shape`'s layout and must hold exactly
    /// `shape.size_bytes()` bytes.
    fn buffer_from_host(
        &self,
        data: &[u8],
        shape: &ArrayShape,
        device: usize,
    ) -> Result<Box<dyn BackendBuffer>>;

    fn compile(
        &self,
        program: &Program,
        options: &CompileOptions,
    ) -> Result<Box<dyn BackendExecutable>>;

    /// Cache key for a compiled executable, if the backend provides one.
    fn executable_fingerprint(&self, executable: &dyn BackendExecutable) -> Option<String> {
        executable.fingerprint()
    }

    /// Enqueue a value on a device's infeed queue.
    fn transfer_to_infeed(&self, device: usize, value: Value) -> Result<()>;

    /// Block until a value is available on a device's outfeed queue.
    fn transfer_from_outfeed(&self, device: usize, shape: &ArrayShape) -> Result<Literal>;
}

/// One on-device allocation.
///
/// Dropping the buffer releases its device memory.
pub trait BackendBuffer: Send + Sync {
    /// Shape as stored on the device, including its layout.
    fn on_device_shape(&self) -> &ArrayShape;

    fn device(&self) -> usize;

    /// Wait for the transfer or execution producing this buffer.
    fn block_until_ready(&self) -> Result<()>;

    /// Copy the contents to host memory in the on-device layout.
    fn to_literal(&self) -> Result<Literal>;

    fn as_any(&self) -> &dyn Any;
}

/// A compiled program.
pub trait BackendExecutable: Send + Sync {
    fn name(&self) -> &str;

    fn num_replicas(&self) -> usize;

    fn is_portable(&self) -> bool;

    fn fingerprint(&self) -> Option<String>;

    /// Run a portable executable on one device.
    fn execute_portable(
        &self,
        arguments: &[&dyn BackendBuffer],
        device: usize,
        options: &ExecuteOptions,
    ) -> Result<Vec<Box<dyn BackendBuffer>>>;

    /// Run with one argument list per replica, returning per-replica outputs.
    fn execute(
        &self,
        arguments: &[Vec<&dyn BackendBuffer>],
        options: &ExecuteOptions,
    ) -> Result<Vec<Vec<Box<dyn BackendBuffer>>>>;
}

/// Checks shared by every backend's `compile`.
pub(crate) fn check_compile_options(program: &Program, options: &CompileOptions) -> Result<()> {
    program
        .validate()
        .map_err(|e| RuntimeError::CompileError(e.to_string()))?;

    if options.parameter_is_tupled_arguments {
        return Err(RuntimeError::CompileError(
            "tupled parameters are not supported".to_string(),
        ));
    }
    if options.build_options.num_replicas == 0 || options.build_options.num_partitions != 1 {
        return Err(RuntimeError::CompileError(format!(
            "unsupported replica/partition count {}x{}",
            options.build_options.num_replicas, options.build_options.num_partitions
        )));
    }

    let parameters = program.parameter_shapes();
    if parameters.len() != options.argument_layouts.len() {
        return Err(RuntimeError::InvalidArgument(format!(
            "program '{}' takes {} parameters, {} argument shapes given",
            program.name,
            parameters.len(),
            options.argument_layouts.len()
        )));
    }
    for (index, (parameter, argument)) in
        parameters.iter().zip(&options.argument_layouts).enumerate()
    {
        if parameter.is_tuple() {
            return Err(RuntimeError::CompileError(format!(
                "parameter {index} has tuple shape {parameter}"
            )));
        }
        if !parameter.compatible(argument) {
            return Err(RuntimeError::InvalidArgument(format!(
                "argument {index} has shape {argument}, parameter expects {parameter}"
            )));
        }
    }

    let result = program
        .result_shape()
        .map_err(|e| RuntimeError::CompileError(e.to_string()))?;
    if let Shape::Tuple(elements) = result
        && elements.iter().any(Shape::is_tuple)
    {
        return Err(RuntimeError::CompileError(format!(
            "nested tuple result {result} cannot be untupled into buffers"
        )));
    }
    Ok(())
}

/// Check an argument list against compiled parameter shapes.
///
/// Returns, per argument, whether it needs a relayout to match.
pub(crate) fn check_arguments(
    parameters: &[ArrayShape],
    arguments: &[&dyn BackendBuffer],
    device: usize,
    options: &ExecuteOptions,
) -> Result<Vec<bool>> {
    if arguments.len() != parameters.len() {
        return Err(RuntimeError::InvalidArgument(format!(
            "expected {} arguments, got {}",
            parameters.len(),
            arguments.len()
        )));
    }
    parameters
        .iter()
        .zip(arguments)
        .enumerate()
        .map(|(index, (parameter, argument))| {
            let shape = argument.on_device_shape();
            if argument.device() != device {
                return Err(RuntimeError::InvalidArgument(format!(
                    "argument {index} lives on device {} but execution targets device {device}",
                    argument.device()
                )));
            }
            if !parameter.compatible(shape) {
                return Err(RuntimeError::InvalidArgument(format!(
                    "argument {index} has shape {shape}, parameter expects {parameter}"
                )));
            }
            let relayout = !parameter.layout_equal(shape);
            if relayout && options.strict_shape_checking {
                return Err(RuntimeError::InvalidArgument(format!(
                    "argument {index} layout {shape} differs from compiled layout {parameter}"
                )));
            }
            Ok(relayout)
        })
        .collect()
}

/// Leaf shapes of an execution result, after optional untupling.
pub(crate) fn output_shapes(result: &Shape, options: &ExecuteOptions) -> Result<Vec<ArrayShape>> {
    match result {
        Shape::Array(array) => Ok(vec![array.without_layout()]),
        Shape::Tuple(elements) if options.untuple_result => elements
            .iter()
            .map(|element| {
                element
                    .as_array()
                    .map(ArrayShape::without_layout)
                    .ok_or_else(|| {
                        RuntimeError::ExecutionError(format!("nested tuple result {result}"))
                    })
            })
            .collect(),
        Shape::Tuple(_) => Err(RuntimeError::ExecutionError(format!(
            "tuple result {result} requires untuple_result"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::{ElementType, ProgramBuilder};

    fn add_program() -> Program {
        let shape = Shape::array(ElementType::F32, vec![4]);
        let mut builder = ProgramBuilder::new("add");
        let a = builder.parameter(shape.clone());
        let b = builder.parameter(shape);
        let sum = builder.add(a, b).unwrap();
        builder.build(sum).unwrap()
    }

    fn options(argument_layouts: Vec<Shape>) -> CompileOptions {
        CompileOptions {
            argument_layouts,
            parameter_is_tupled_arguments: false,
            build_options: ExecutableBuildOptions::default(),
            compile_portable_executable: false,
        }
    }

    #[test]
    fn test_platform_from_str() {
        assert_eq!("cpu".parse::<Platform>().unwrap(), Platform::Host);
        assert_eq!("GPU".parse::<Platform>().unwrap(), Platform::Gpu);
        assert!("tpu".parse::<Platform>().is_err());
    }

    #[test]
    fn test_check_compile_options() {
        let program = add_program();
        let vec4 = Shape::array(ElementType::F32, vec![4]);
        check_compile_options(&program, &options(vec![vec4.clone(), vec4.clone()])).unwrap();

        let err = check_compile_options(&program, &options(vec![vec4.clone()])).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));

        let wrong = Shape::array(ElementType::S32, vec![4]);
        assert!(check_compile_options(&program, &options(vec![vec4, wrong])).is_err());
    }

    #[test]
    fn test_output_shapes_untuple() {
        let a = Shape::array(ElementType::F32, vec![2]);
        let b = Shape::array(ElementType::S32, vec![]);
        let tuple = Shape::tuple(vec![a, b]);
        let shapes = output_shapes(&tuple, &ExecuteOptions::default()).unwrap();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[1].element_type, ElementType::S32);

        let keep = ExecuteOptions {
            untuple_result: false,
            strict_shape_checking: false,
        };
        assert!(output_shapes(&tuple, &keep).is_err());
    }
}
