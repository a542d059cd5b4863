//! wgpu compute backend.
//!
//! Exposes the selected adapter as device 0. Element-wise instructions on
//! 32-bit types run as generated WGSL kernels; data movement instructions
//! (reshape, tuple, get-tuple-element) only route buffers. Infeed and
//! outfeed go through host-side queues with an upload or download.

mod kernels;

use crate::backend::{
    Backend, BackendBuffer, BackendExecutable, CompileOptions, DeviceDescription, ExecuteOptions,
    Platform, check_arguments, check_compile_options, output_shapes,
};
use crate::error::{Result, RuntimeError};
use crate::feed::DeviceFeeds;
use kernels::{Kernel, KernelCache, KernelOp};
use spindle_core::{ArrayShape, Literal, Op, Program, Shape, Value, ValueId};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// GPU backend configuration.
#[derive(Debug, Clone)]
pub struct GpuOptions {
    pub power_preference: wgpu::PowerPreference,
    /// Upper bound on bytes allocated through this backend.
    pub memory_limit: Option<u64>,
    pub force_fallback_adapter: bool,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            memory_limit: None,
            force_fallback_adapter: false,
        }
    }
}

/// Byte budget shared by all allocations of one backend.
#[derive(Debug)]
struct MemoryBudget {
    limit: Option<u64>,
    used: AtomicU64,
}

impl MemoryBudget {
    fn reserve(&self, bytes: u64) -> Result<()> {
        let previous = self.used.fetch_add(bytes, Ordering::SeqCst);
        if let Some(limit) = self.limit
            && previous + bytes > limit
        {
            self.used.fetch_sub(bytes, Ordering::SeqCst);
            return Err(RuntimeError::AllocationError(format!(
                "{bytes} bytes requested with {previous} of {limit} bytes in use"
            )));
        }
        Ok(())
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// A device buffer whose size counts against the budget until dropped.
struct Allocation {
    buffer: wgpu::Buffer,
    reserved: u64,
    budget: Arc<MemoryBudget>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.budget.release(self.reserved);
    }
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    budget: Arc<MemoryBudget>,
    kernels: KernelCache,
    feeds: DeviceFeeds,
}

impl GpuContext {
    /// Allocate a storage buffer of at least `size_bytes`, padded to 4 bytes.
    fn allocate(&self, size_bytes: usize) -> Result<Arc<Allocation>> {
        let reserved = size_bytes.max(4).next_multiple_of(4) as u64;
        self.budget.reserve(reserved)?;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: reserved,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(Arc::new(Allocation {
            buffer,
            reserved,
            budget: Arc::clone(&self.budget),
        }))
    }

    /// Upload a literal in row-major order.
    fn upload(&self, literal: &Literal) -> Result<Arc<Allocation>> {
        let literal = literal.to_row_major()?;
        let allocation = self.allocate(literal.size_bytes())?;
        let mut data = literal.into_data();
        data.resize(allocation.reserved as usize, 0);
        self.queue.write_buffer(&allocation.buffer, 0, &data);
        Ok(allocation)
    }

    fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| RuntimeError::ExecutionError(format!("GPU poll failed: {e:?}")))?;
        Ok(())
    }

    /// Read back the first `size_bytes` of an allocation.
    fn download(&self, allocation: &Allocation, size_bytes: usize) -> Result<Vec<u8>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("download_staging"),
            size: allocation.reserved,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("download_copy"),
            });
        encoder.copy_buffer_to_buffer(&allocation.buffer, 0, &staging, 0, allocation.reserved);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait_idle()?;

        pollster::block_on(receiver)
            .map_err(|_| RuntimeError::TransferError("Failed to receive map result".to_string()))??;

        let mut data = slice.get_mapped_range().to_vec();
        staging.unmap();
        data.truncate(size_bytes);
        Ok(data)
    }
}

/// Backend driving one wgpu adapter.
pub struct GpuBackend {
    context: Arc<GpuContext>,
    adapter_info: wgpu::AdapterInfo,
    devices: Vec<DeviceDescription>,
}

impl GpuBackend {
    /// Initialize with the adapter chosen by `options`.
    ///
    /// # Errors
    /// Returns an error if no suitable adapter is found or device creation
    /// fails.
    pub async fn new(options: &GpuOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                compatible_surface: None,
                force_fallback_adapter: options.force_fallback_adapter,
            })
            .await
            .map_err(|e| {
                RuntimeError::InitError(format!("Failed to find suitable GPU adapter: {e}"))
            })?;

        Self::with_adapter(&adapter, options).await
    }

    /// Initialize with a specific adapter.
    ///
    /// # Errors
    /// Returns an error if device creation fails.
    pub async fn with_adapter(adapter: &wgpu::Adapter, options: &GpuOptions) -> Result<Self> {
        let adapter_info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .map_err(|e| RuntimeError::InitError(format!("Failed to create device: {e}")))?;

        tracing::info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "gpu backend ready");
        let devices = vec![DeviceDescription {
            id: 0,
            platform: Platform::Gpu,
            kind: format!("{:?}", adapter_info.device_type).to_lowercase(),
            name: adapter_info.name.clone(),
        }];
        Ok(Self {
            context: Arc::new(GpuContext {
                device,
                queue,
                budget: Arc::new(MemoryBudget {
                    limit: options.memory_limit,
                    used: AtomicU64::new(0),
                }),
                kernels: KernelCache::default(),
                feeds: DeviceFeeds::default(),
            }),
            adapter_info,
            devices,
        })
    }

    /// Information about the GPU adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Bytes currently allocated against the memory budget.
    pub fn allocated_bytes(&self) -> u64 {
        self.context.budget.used.load(Ordering::SeqCst)
    }
}

impl Drop for GpuBackend {
    fn drop(&mut self) {
        self.context.feeds.close();
    }
}

impl Backend for GpuBackend {
    fn platform(&self) -> Platform {
        Platform::Gpu
    }

    fn devices(&self) -> &[DeviceDescription] {
        &self.devices
    }

    fn buffer_from_host(
        &self,
        data: &[u8],
        shape: &ArrayShape,
        device: usize,
    ) -> Result<Box<dyn BackendBuffer>> {
        self.lookup_device(device)?;
        let literal = Literal::from_bytes(shape.clone(), data.to_vec())
            .map_err(|e| RuntimeError::InvalidArgument(e.to_string()))?;
        // Device storage is always row-major.
        let allocation = self.context.upload(&literal)?;
        Ok(Box::new(GpuBuffer {
            allocation,
            shape: shape.without_layout(),
            context: Arc::clone(&self.context),
        }))
    }

    fn compile(
        &self,
        program: &Program,
        options: &CompileOptions,
    ) -> Result<Box<dyn BackendExecutable>> {
        check_compile_options(program, options)?;
        if options.build_options.num_replicas != 1 {
            return Err(RuntimeError::CompileError(format!(
                "gpu backend has one device, {} replicas requested",
                options.build_options.num_replicas
            )));
        }
        if let Some(ordinal) = options.build_options.device_ordinal {
            self.lookup_device(ordinal)?;
        }

        let steps = program
            .instructions
            .iter()
            .map(|inst| self.compile_step(program, &inst.op, &inst.shape))
            .collect::<Result<Vec<_>>>()?;
        let parameters = program
            .parameter_shapes()
            .into_iter()
            .map(|shape| shape.expect_array("parameter").map(ArrayShape::without_layout))
            .collect::<spindle_core::Result<Vec<_>>>()?;

        tracing::debug!(program = %program.name, steps = steps.len(), "compiled gpu executable");
        Ok(Box::new(GpuExecutable {
            name: program.name.clone(),
            steps,
            shapes: program.instructions.iter().map(|inst| inst.shape.clone()).collect(),
            root: program.root,
            result_shape: program.result_shape()?.clone(),
            parameters,
            portable: options.compile_portable_executable,
            context: Arc::clone(&self.context),
        }))
    }

    fn transfer_to_infeed(&self, device: usize, value: Value) -> Result<()> {
        self.lookup_device(device)?;
        self.context.feeds.infeed.push(value)
    }

    fn transfer_from_outfeed(&self, device: usize, shape: &ArrayShape) -> Result<Literal> {
        self.lookup_device(device)?;
        let literal = self
            .context
            .feeds
            .outfeed
            .pop()?
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

impl GpuBackend {
    fn compile_step(&self, program: &Program, op: &Op, shape: &Shape) -> Result<Step> {
        let operand_type = |id: ValueId| -> Result<spindle_core::ElementType> {
            let operand = program
                .instruction(id)
                .ok_or_else(|| RuntimeError::CompileError(format!("{id} is not defined")))?;
            Ok(operand.shape.expect_array("kernel operand")?.element_type)
        };
        let kernel = |kernel_op: KernelOp, input: spindle_core::ElementType, inputs: Vec<ValueId>| -> Result<Step> {
            let output = shape.expect_array("kernel result")?;
            let kernel = self.context.kernels.get_or_create(
                &self.context.device,
                kernel_op,
                input,
                output.element_type,
                output.element_count(),
            )?;
            Ok(Step::Kernel { kernel, inputs })
        };

        match op {
            Op::Parameter(n) => Ok(Step::Parameter(*n)),
            Op::Constant(literal) => Ok(Step::Constant(self.context.upload(literal)?)),
            Op::Unary(unary, x) => kernel(KernelOp::Unary(*unary), operand_type(*x)?, vec![*x]),
            Op::Binary(binary, lhs, rhs) => kernel(
                KernelOp::Binary(*binary),
                operand_type(*lhs)?,
                vec![*lhs, *rhs],
            ),
            Op::Convert(x) => kernel(KernelOp::Convert, operand_type(*x)?, vec![*x]),
            Op::Reshape(x) => Ok(Step::Reshape(*x)),
            Op::Tuple(elements) => Ok(Step::Tuple(elements.clone())),
            Op::GetTupleElement(x, index) => Ok(Step::GetTupleElement(*x, *index)),
            Op::Infeed => Ok(Step::Infeed),
            Op::Outfeed(x) => Ok(Step::Outfeed(*x)),
        }
    }
}

/// A device-resident intermediate value.
#[derive(Clone)]
enum DeviceValue {
    Array(Arc<Allocation>, ArrayShape),
    Tuple(Vec<DeviceValue>),
}

enum Step {
    Parameter(usize),
    Constant(Arc<Allocation>),
    Kernel {
        kernel: Arc<Kernel>,
        inputs: Vec<ValueId>,
    },
    Reshape(ValueId),
    Tuple(Vec<ValueId>),
    GetTupleElement(ValueId, usize),
    Infeed,
    Outfeed(ValueId),
}

struct GpuBuffer {
    allocation: Arc<Allocation>,
    shape: ArrayShape,
    context: Arc<GpuContext>,
}

impl BackendBuffer for GpuBuffer {
    fn on_device_shape(&self) -> &ArrayShape {
        &self.shape
    }

    fn device(&self) -> usize {
        0
    }

    fn block_until_ready(&self) -> Result<()> {
        self.context.wait_idle()
    }

    fn to_literal(&self) -> Result<Literal> {
        let data = self
            .context
            .download(&self.allocation, self.shape.size_bytes())?;
        Ok(Literal::from_bytes(self.shape.clone(), data)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct GpuExecutable {
    name: String,
    steps: Vec<Step>,
    shapes: Vec<Shape>,
    root: ValueId,
    result_shape: Shape,
    parameters: Vec<ArrayShape>,
    portable: bool,
    context: Arc<GpuContext>,
}

impl GpuExecutable {
    fn value<'a>(values: &'a [DeviceValue], id: ValueId) -> Result<&'a DeviceValue> {
        values
            .get(id.0)
            .ok_or_else(|| RuntimeError::ExecutionError(format!("{id} used before it was computed")))
    }

    fn array(values: &[DeviceValue], id: ValueId) -> Result<(&Arc<Allocation>, &ArrayShape)> {
        match Self::value(values, id)? {
            DeviceValue::Array(allocation, shape) => Ok((allocation, shape)),
            DeviceValue::Tuple(_) => Err(RuntimeError::ExecutionError(format!(
                "{id} is a tuple where an array was expected"
            ))),
        }
    }

    fn upload_value(&self, value: &Value) -> Result<DeviceValue> {
        match value {
            Value::Array(literal) => Ok(DeviceValue::Array(
                self.context.upload(literal)?,
                literal.shape().without_layout(),
            )),
            Value::Tuple(elements) => elements
                .iter()
                .map(|element| self.upload_value(element))
                .collect::<Result<Vec<_>>>()
                .map(DeviceValue::Tuple),
        }
    }

    fn download_value(&self, value: &DeviceValue) -> Result<Value> {
        match value {
            DeviceValue::Array(allocation, shape) => {
                let data = self.context.download(allocation, shape.size_bytes())?;
                Ok(Value::Array(Literal::from_bytes(shape.clone(), data)?))
            }
            DeviceValue::Tuple(elements) => elements
                .iter()
                .map(|element| self.download_value(element))
                .collect::<Result<Vec<_>>>()
                .map(Value::Tuple),
        }
    }

    fn run(
        &self,
        arguments: &[&dyn BackendBuffer],
        options: &ExecuteOptions,
    ) -> Result<Vec<Box<dyn BackendBuffer>>> {
        let relayout = check_arguments(&self.parameters, arguments, 0, options)?;
        let arguments = arguments
            .iter()
            .zip(relayout)
            .map(|(argument, relayout)| {
                let buffer = argument.as_any().downcast_ref::<GpuBuffer>().ok_or_else(|| {
                    RuntimeError::InvalidArgument(
                        "argument buffer belongs to a different backend".to_string(),
                    )
                })?;
                if relayout {
                    let literal = buffer.to_literal()?;
                    return self.context.upload(&literal);
                }
                Ok(Arc::clone(&buffer.allocation))
            })
            .collect::<Result<Vec<_>>>()?;

        let device = &self.context.device;
        let mut encoder: Option<wgpu::CommandEncoder> = None;
        let mut values: Vec<DeviceValue> = Vec::with_capacity(self.steps.len());

        for (step, shape) in self.steps.iter().zip(&self.shapes) {
            let value = match step {
                Step::Parameter(n) => DeviceValue::Array(
                    Arc::clone(arguments.get(*n).ok_or_else(|| {
                        RuntimeError::ExecutionError(format!("missing argument {n}"))
                    })?),
                    shape.expect_array("parameter")?.without_layout(),
                ),
                Step::Constant(allocation) => DeviceValue::Array(
                    Arc::clone(allocation),
                    shape.expect_array("constant")?.without_layout(),
                ),
                Step::Kernel { kernel, inputs } => {
                    let output_shape = shape.expect_array("kernel result")?.without_layout();
                    let output = self.context.allocate(output_shape.size_bytes())?;
                    if kernel.len > 0 {
                        let mut buffers = inputs
                            .iter()
                            .map(|id| Self::array(&values, *id).map(|(a, _)| &a.buffer))
                            .collect::<Result<Vec<_>>>()?;
                        buffers.push(&output.buffer);
                        debug_assert_eq!(buffers.len(), kernel.arity + 1);

                        let layout = kernel.pipeline.get_bind_group_layout(0);
                        let entries: Vec<wgpu::BindGroupEntry> = buffers
                            .iter()
                            .enumerate()
                            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                                binding: binding as u32,
                                resource: buffer.as_entire_binding(),
                            })
                            .collect();
                        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                            label: None,
                            layout: &layout,
                            entries: &entries,
                        });

                        let encoder = encoder.get_or_insert_with(|| {
                            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                                label: Some(self.name.as_str()),
                            })
                        });
                        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                            label: None,
                            timestamp_writes: None,
                        });
                        pass.set_pipeline(&kernel.pipeline);
                        pass.set_bind_group(0, &bind_group, &[]);
                        pass.dispatch_workgroups(kernel.workgroups[0], kernel.workgroups[1], 1);
                    }
                    DeviceValue::Array(output, output_shape)
                }
                Step::Reshape(x) => {
                    let (allocation, _) = Self::array(&values, *x)?;
                    DeviceValue::Array(
                        Arc::clone(allocation),
                        shape.expect_array("reshape")?.without_layout(),
                    )
                }
                Step::Tuple(elements) => DeviceValue::Tuple(
                    elements
                        .iter()
                        .map(|id| Self::value(&values, *id).cloned())
                        .collect::<Result<Vec<_>>>()?,
                ),
                Step::GetTupleElement(x, index) => match Self::value(&values, *x)? {
                    DeviceValue::Tuple(elements) => elements.get(*index).cloned().ok_or_else(|| {
                        RuntimeError::ExecutionError(format!("{x} has no element {index}"))
                    })?,
                    DeviceValue::Array(..) => {
                        return Err(RuntimeError::ExecutionError(format!(
                            "get-tuple-element on array {x}"
                        )));
                    }
                },
                Step::Infeed => {
                    let fed = self.context.feeds.infeed.pop()?;
                    if !fed.shape().compatible(shape) {
                        return Err(RuntimeError::ExecutionError(format!(
                            "infeed expected {shape}, got {}",
                            fed.shape()
                        )));
                    }
                    self.upload_value(&fed)?
                }
                Step::Outfeed(x) => {
                    // Earlier kernels must land before the operand is read.
                    if let Some(pending) = encoder.take() {
                        self.context.queue.submit(std::iter::once(pending.finish()));
                    }
                    let value = self.download_value(Self::value(&values, *x)?)?;
                    self.context.feeds.outfeed.push(value)?;
                    DeviceValue::Tuple(Vec::new())
                }
            };
            values.push(value);
        }

        if let Some(pending) = encoder.take() {
            self.context.queue.submit(std::iter::once(pending.finish()));
        }

        let root = Self::value(&values, self.root)?.clone();
        let leaves = match root {
            DeviceValue::Array(..) => vec![root],
            DeviceValue::Tuple(elements) => elements,
        };
        let shapes = output_shapes(&self.result_shape, options)?;
        leaves
            .into_iter()
            .zip(shapes)
            .map(|(leaf, shape)| match leaf {
                DeviceValue::Array(allocation, _) => Ok(Box::new(GpuBuffer {
                    allocation,
                    shape,
                    context: Arc::clone(&self.context),
                }) as Box<dyn BackendBuffer>),
                DeviceValue::Tuple(_) => Err(RuntimeError::ExecutionError(
                    "nested tuple result".to_string(),
                )),
            })
            .collect()
    }
}

impl BackendExecutable for GpuExecutable {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_replicas(&self) -> usize {
        1
    }

    fn is_portable(&self) -> bool {
        self.portable
    }

    /// The wgpu backend does not provide a compilation cache key.
    fn fingerprint(&self) -> Option<String> {
        None
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
                self.name
            )));
        }
        if device != 0 {
            return Err(RuntimeError::NotFound(format!("no gpu device with id {device}")));
        }
        self.run(arguments, options)
    }

    fn execute(
        &self,
        arguments: &[Vec<&dyn BackendBuffer>],
        options: &ExecuteOptions,
    ) -> Result<Vec<Vec<Box<dyn BackendBuffer>>>> {
        if self.portable {
            return Err(RuntimeError::FailedPrecondition(format!(
                "portable executable '{}' must be run on an explicit device",
                self.name
            )));
        }
        match arguments {
            [replica] => Ok(vec![self.run(replica, options)?]),
            _ => Err(RuntimeError::InvalidArgument(format!(
                "{} argument lists supplied for 1 replica",
                arguments.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_budget() {
        let budget = MemoryBudget {
            limit: Some(16),
            used: AtomicU64::new(0),
        };
        budget.reserve(12).unwrap();
        assert!(matches!(budget.reserve(8), Err(RuntimeError::AllocationError(_))));
        assert_eq!(budget.used.load(Ordering::SeqCst), 12);
        budget.release(12);
        budget.reserve(16).unwrap();
    }

    #[test]
    fn test_unlimited_budget() {
        let budget = MemoryBudget {
            limit: None,
            used: AtomicU64::new(0),
        };
        budget.reserve(u32::MAX as u64).unwrap();
    }
}
