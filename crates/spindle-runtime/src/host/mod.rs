//! Threaded CPU backend.
//!
//! Each logical device owns a [`Stream`]: a worker thread that runs
//! transfers and executions in submission order. Buffers hold a
//! [`Completion`] that resolves once the producing job has run, so a
//! caller gets a handle back before the work is done and blocks only when
//! it reads.

mod interpreter;
mod stream;

use crate::backend::{
    Backend, BackendBuffer, BackendExecutable, CompileOptions, DeviceDescription, ExecuteOptions,
    Platform, check_arguments, check_compile_options, output_shapes,
};
use crate::error::{Result, RuntimeError};
use crate::feed::DeviceFeeds;
use sha2::{Digest, Sha256};
use spindle_core::{ArrayShape, Literal, Program, Value};
use std::any::Any;
use std::sync::Arc;
use stream::{Completion, Stream};

/// Host backend configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    /// Number of logical devices, each with its own stream.
    pub device_count: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self { device_count: 1 }
    }
}

type LiteralEvent = Completion<Arc<Literal>>;

struct HostDevice {
    description: DeviceDescription,
    stream: Stream,
    feeds: Arc<DeviceFeeds>,
}

/// CPU backend with `device_count` stream-ordered devices.
pub struct HostBackend {
    devices: Arc<Vec<HostDevice>>,
    descriptions: Vec<DeviceDescription>,
}

impl HostBackend {
    /// # Errors
    /// Returns an error if `device_count` is zero or a stream thread cannot
    /// be spawned.
    pub fn new(options: &HostOptions) -> Result<Self> {
        if options.device_count == 0 {
            return Err(RuntimeError::InitError(
                "host backend needs at least one device".to_string(),
            ));
        }

        let devices = (0..options.device_count)
            .map(|id| {
                Ok(HostDevice {
                    description: DeviceDescription {
                        id,
                        platform: Platform::Host,
                        kind: "cpu".to_string(),
                        name: format!("host:{id}"),
                    },
                    stream: Stream::new(format!("spindle-host-{id}"))?,
                    feeds: Arc::new(DeviceFeeds::default()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let descriptions = devices.iter().map(|d| d.description.clone()).collect();

        tracing::debug!(devices = options.device_count, "host backend ready");
        Ok(Self {
            devices: Arc::new(devices),
            descriptions,
        })
    }

    fn device(&self, id: usize) -> Result<&HostDevice> {
        self.lookup_device(id)?;
        self.devices
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no host device with id {id}")))
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        // Wake programs parked on an empty infeed so the streams can drain.
        for device in self.devices.iter() {
            device.feeds.close();
        }
    }
}

impl Backend for HostBackend {
    fn platform(&self) -> Platform {
        Platform::Host
    }

    fn devices(&self) -> &[DeviceDescription] {
        &self.descriptions
    }

    fn buffer_from_host(
        &self,
        data: &[u8],
        shape: &ArrayShape,
        device: usize,
    ) -> Result<Box<dyn BackendBuffer>> {
        let target = self.device(device)?;
        if data.len() != shape.size_bytes() {
            return Err(RuntimeError::InvalidArgument(format!(
                "{} bytes supplied for shape {shape} ({} expected)",
                data.len(),
                shape.size_bytes()
            )));
        }

        let event = LiteralEvent::pending();
        let bytes = data.to_vec();
        let layout_shape = shape.clone();
        {
            let event = Arc::clone(&event);
            target.stream.enqueue(move || {
                let result = Literal::from_bytes(layout_shape, bytes)
                    .map(Arc::new)
                    .map_err(|e| e.to_string());
                event.complete(result);
            })?;
        }

        Ok(Box::new(HostBuffer {
            shape: shape.clone(),
            device,
            event,
        }))
    }

    fn compile(
        &self,
        program: &Program,
        options: &CompileOptions,
    ) -> Result<Box<dyn BackendExecutable>> {
        check_compile_options(program, options)?;

        let num_replicas = options.build_options.num_replicas;
        let default_device = options.build_options.device_ordinal.unwrap_or(0);
        self.device(default_device)?;
        if default_device + num_replicas > self.devices.len() {
            return Err(RuntimeError::CompileError(format!(
                "{num_replicas} replicas starting at device {default_device} need more than the {} host devices",
                self.devices.len()
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(program.fingerprint().as_bytes());
        hasher.update(
            format!(
                "replicas={num_replicas};portable={}",
                options.compile_portable_executable
            )
            .as_bytes(),
        );

        Ok(Box::new(HostExecutable {
            program: Arc::new(program.clone()),
            parameters: interpreter::parameter_arrays(program)?,
            replica_devices: (default_device..default_device + num_replicas).collect(),
            portable: options.compile_portable_executable,
            fingerprint: format!("{:x}", hasher.finalize()),
            devices: Arc::clone(&self.devices),
        }))
    }

    fn transfer_to_infeed(&self, device: usize, value: Value) -> Result<()> {
        self.device(device)?.feeds.infeed.push(value)
    }

    fn transfer_from_outfeed(&self, device: usize, shape: &ArrayShape) -> Result<Literal> {
        let value = self.device(device)?.feeds.outfeed.pop()?;
        let literal = value
            .into_literal()
            .map_err(|e| RuntimeError::TransferError(e.to_string()))?;
        if !literal.shape().compatible(shape) {
            return Err(RuntimeError::TransferError(format!(
                "outfeed produced {}, caller expected {shape}",
                literal.shape()
            )));
        }
        Ok(literal.relayout(&shape.layout())?)
    }
}

/// A host allocation filled by a stream job.
struct HostBuffer {
    shape: ArrayShape,
    device: usize,
    event: Arc<LiteralEvent>,
}

impl HostBuffer {
    fn literal(&self) -> Result<Arc<Literal>> {
        self.event
            .wait()
            .map_err(RuntimeError::ExecutionError)
    }
}

impl BackendBuffer for HostBuffer {
    fn on_device_shape(&self) -> &ArrayShape {
        &self.shape
    }

    fn device(&self) -> usize {
        self.device
    }

    fn block_until_ready(&self) -> Result<()> {
        self.literal().map(|_| ())
    }

    fn to_literal(&self) -> Result<Literal> {
        Ok(self.literal()?.as_ref().clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct HostExecutable {
    program: Arc<Program>,
    parameters: Vec<ArrayShape>,
    /// Device of each replica, in replica order.
    replica_devices: Vec<usize>,
    portable: bool,
    fingerprint: String,
    devices: Arc<Vec<HostDevice>>,
}

impl HostExecutable {
    /// Enqueue one execution on `device` and return its pending outputs.
    fn launch(
        &self,
        arguments: &[&dyn BackendBuffer],
        device: usize,
        options: &ExecuteOptions,
    ) -> Result<Vec<Box<dyn BackendBuffer>>> {
        let target = self
            .devices
            .get(device)
            .ok_or_else(|| RuntimeError::NotFound(format!("no host device with id {device}")))?;
        check_arguments(&self.parameters, arguments, device, options)?;

        let inputs = arguments
            .iter()
            .map(|argument| {
                argument
                    .as_any()
                    .downcast_ref::<HostBuffer>()
                    .map(|buffer| Arc::clone(&buffer.event))
                    .ok_or_else(|| {
                        RuntimeError::InvalidArgument(
                            "argument buffer belongs to a different backend".to_string(),
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let result_shape = self.program.result_shape()?;
        let outputs: Vec<(ArrayShape, Arc<LiteralEvent>)> = output_shapes(result_shape, options)?
            .into_iter()
            .map(|shape| (shape, LiteralEvent::pending()))
            .collect();

        let program = Arc::clone(&self.program);
        let feeds = Arc::clone(&target.feeds);
        let events: Vec<Arc<LiteralEvent>> =
            outputs.iter().map(|(_, event)| Arc::clone(event)).collect();
        let untuple_result = options.untuple_result;
        target.stream.enqueue(move || {
            let _span = tracing::debug_span!("host_execute", program = %program.name, device).entered();
            let result = inputs
                .iter()
                .map(|event| event.wait().map(|literal| literal.as_ref().clone()))
                .collect::<std::result::Result<Vec<_>, String>>()
                .map_err(|e| format!("argument unavailable: {e}"))
                .and_then(|arguments| {
                    interpreter::evaluate(&program, arguments, &feeds)
                        .and_then(|value| interpreter::untuple(value, untuple_result))
                        .map_err(|e| e.to_string())
                });
            match result {
                Ok(literals) => {
                    for (event, literal) in events.iter().zip(literals) {
                        event.complete(Ok(Arc::new(literal)));
                    }
                }
                Err(message) => {
                    tracing::warn!(program = %program.name, device, "execution failed: {message}");
                    for event in &events {
                        event.complete(Err(message.clone()));
                    }
                }
            }
        })?;

        Ok(outputs
            .into_iter()
            .map(|(shape, event)| Box::new(HostBuffer { shape, device, event }) as Box<dyn BackendBuffer>)
            .collect())
    }
}

impl BackendExecutable for HostExecutable {
    fn name(&self) -> &str {
        &self.program.name
    }

    fn num_replicas(&self) -> usize {
        self.replica_devices.len()
    }

    fn is_portable(&self) -> bool {
        self.portable
    }

    fn fingerprint(&self) -> Option<String> {
        Some(self.fingerprint.clone())
    }

    fn execute_portable(
        &self,
        arguments: &[&dyn BackendBuffer],
        device: usize,
        options: &ExecuteOptions,
    ) -> Result<Vec<Box<dyn BackendBuffer>>> {
        if !self.portable {
            return Err(RuntimeError::FailedPrecondition(format!(
                "executable '{}' was not compiled as portable",
                self.program.name
            )));
        }
        self.launch(arguments, device, options)
    }

    fn execute(
        &self,
        arguments: &[Vec<&dyn BackendBuffer>],
        options: &ExecuteOptions,
    ) -> Result<Vec<Vec<Box<dyn BackendBuffer>>>> {
        if self.portable {
            return Err(RuntimeError::FailedPrecondition(format!(
                "portable executable '{}' must be run on an explicit device",
                self.program.name
            )));
        }
        if arguments.len() != self.replica_devices.len() {
            return Err(RuntimeError::InvalidArgument(format!(
                "{} argument lists supplied for {} replicas",
                arguments.len(),
                self.replica_devices.len()
            )));
        }
        arguments
            .iter()
            .zip(&self.replica_devices)
            .map(|(replica_arguments, &device)| self.launch(replica_arguments, device, options))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutableBuildOptions;
    use spindle_core::{ElementType, ProgramBuilder, Shape};

    fn backend(devices: usize) -> HostBackend {
        HostBackend::new(&HostOptions {
            device_count: devices,
        })
        .unwrap()
    }

    fn add_program() -> (Program, Vec<Shape>) {
        let shape = Shape::array(ElementType::S32, vec![3]);
        let mut builder = ProgramBuilder::new("add");
        let a = builder.parameter(shape.clone());
        let b = builder.parameter(shape.clone());
        let sum = builder.add(a, b).unwrap();
        (builder.build(sum).unwrap(), vec![shape.clone(), shape])
    }

    fn compile(backend: &HostBackend, portable: bool) -> Box<dyn BackendExecutable> {
        let (program, argument_layouts) = add_program();
        backend
            .compile(
                &program,
                &CompileOptions {
                    argument_layouts,
                    parameter_is_tupled_arguments: false,
                    build_options: ExecutableBuildOptions::default(),
                    compile_portable_executable: portable,
                },
            )
            .unwrap()
    }

    fn upload(backend: &HostBackend, values: &[i32], device: usize) -> Box<dyn BackendBuffer> {
        backend
            .buffer_from_host(
                bytemuck::cast_slice(values),
                &ArrayShape::new(ElementType::S32, vec![values.len()]),
                device,
            )
            .unwrap()
    }

    #[test]
    fn test_lookup_device() {
        let backend = backend(2);
        assert_eq!(backend.devices().len(), 2);
        assert_eq!(backend.lookup_device(1).unwrap().name, "host:1");
        assert!(matches!(backend.lookup_device(2), Err(RuntimeError::NotFound(_))));
    }

    #[test]
    fn test_portable_execution_on_second_device() {
        let backend = backend(2);
        let executable = compile(&backend, true);
        let a = upload(&backend, &[1, 2, 3], 1);
        let b = upload(&backend, &[10, 20, 30], 1);

        let outputs = executable
            .execute_portable(&[a.as_ref(), b.as_ref()], 1, &ExecuteOptions::default())
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].device(), 1);
        let literal = outputs[0].to_literal().unwrap();
        assert_eq!(literal.to_vec::<i32>().unwrap(), vec![11, 22, 33]);
    }

    #[test]
    fn test_execution_path_must_match_portability() {
        let backend = backend(1);
        let a = upload(&backend, &[1, 2, 3], 0);
        let b = upload(&backend, &[1, 2, 3], 0);

        let portable = compile(&backend, true);
        let err = portable
            .execute(&[vec![a.as_ref(), b.as_ref()]], &ExecuteOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::FailedPrecondition(_)));

        let fixed = compile(&backend, false);
        let err = fixed
            .execute_portable(&[a.as_ref(), b.as_ref()], 0, &ExecuteOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::FailedPrecondition(_)));
    }

    #[test]
    fn test_argument_on_wrong_device_is_rejected() {
        let backend = backend(2);
        let executable = compile(&backend, true);
        let a = upload(&backend, &[1, 2, 3], 0);
        let b = upload(&backend, &[1, 2, 3], 1);
        let err = executable
            .execute_portable(&[a.as_ref(), b.as_ref()], 1, &ExecuteOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[test]
    fn test_replicas_must_fit_devices() {
        let backend = backend(1);
        let (program, argument_layouts) = add_program();
        let result = backend.compile(
            &program,
            &CompileOptions {
                argument_layouts,
                parameter_is_tupled_arguments: false,
                build_options: ExecutableBuildOptions {
                    num_replicas: 2,
                    ..Default::default()
                },
                compile_portable_executable: false,
            },
        );
        assert!(matches!(result, Err(RuntimeError::CompileError(_))));
    }

    #[test]
    fn test_fingerprint_depends_on_program() {
        let backend = backend(1);
        let first = compile(&backend, false).fingerprint().unwrap();
        let again = compile(&backend, false).fingerprint().unwrap();
        let portable = compile(&backend, true).fingerprint().unwrap();
        assert_eq!(first, again);
        assert_ne!(first, portable);
    }

    #[test]
    fn test_upload_size_mismatch() {
        let backend = backend(1);
        let result = backend.buffer_from_host(
            &[0u8; 3],
            &ArrayShape::new(ElementType::S32, vec![1]),
            0,
        );
        assert!(matches!(result, Err(RuntimeError::InvalidArgument(_))));
    }
}
