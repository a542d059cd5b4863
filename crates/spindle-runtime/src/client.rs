//! Client construction and device-level operations.

use crate::backend::{Backend, DeviceDescription, ExecutableBuildOptions, CompileOptions, Platform};
use crate::buffer::DeviceBuffer;
use crate::error::{Result, RuntimeError};
use crate::executable::CompiledExecutable;
use crate::gpu::{GpuBackend, GpuOptions};
use crate::host::{HostBackend, HostOptions};
use spindle_core::{Program, Shape, Value};
use std::fmt;
use std::sync::Arc;

/// Which backend to create and how to configure it.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub platform: Platform,
    pub host: HostOptions,
    pub gpu: GpuOptions,
}

impl ClientConfig {
    /// Host backend with `device_count` devices.
    pub fn host(device_count: usize) -> Self {
        Self {
            platform: Platform::Host,
            host: HostOptions { device_count },
            ..Default::default()
        }
    }

    /// GPU backend with default adapter selection.
    pub fn gpu() -> Self {
        Self {
            platform: Platform::Gpu,
            ..Default::default()
        }
    }
}

pub(crate) struct ClientInner {
    backend: Box<dyn Backend>,
}

/// Handle to one backend instance.
///
/// Cloning is cheap. Buffers and executables keep their client alive, so
/// a client outlives everything created through it.
///
/// # Example
/// ```
/// # use spindle_runtime::{ClientConfig, DeviceClient};
/// # use spindle_core::{ElementType, Shape};
/// let client = DeviceClient::new(&ClientConfig::host(1))?;
/// let shape = Shape::array(ElementType::S32, vec![2]);
/// let bytes: Vec<u8> = [7i32, 9].iter().flat_map(|v| v.to_le_bytes()).collect();
/// let buffer = client.buffer_from_host(&bytes, &shape, 0, false)?;
/// assert_eq!(buffer.to_binary(None)?, bytes);
/// # Ok::<(), spindle_runtime::RuntimeError>(())
/// ```
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClient")
            .field("platform", &self.platform())
            .field("devices", &self.device_count())
            .finish()
    }
}

impl DeviceClient {
    /// Create a client for `config.platform`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::InitError`] if the backend cannot start.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let backend: Box<dyn Backend> = match config.platform {
            Platform::Host => Box::new(HostBackend::new(&config.host)?),
            Platform::Gpu => Box::new(pollster::block_on(GpuBackend::new(&config.gpu))?),
        };
        Ok(Self::from_backend(backend))
    }

    /// Wrap an already-initialized backend.
    pub fn from_backend(backend: Box<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(ClientInner { backend }),
        }
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    pub fn platform(&self) -> Platform {
        self.backend().platform()
    }

    pub fn devices(&self) -> &[DeviceDescription] {
        self.backend().devices()
    }

    pub fn device_count(&self) -> usize {
        self.devices().len()
    }

    /// The device used when a caller names none.
    pub fn default_device(&self) -> usize {
        self.devices().first().map_or(0, |device| device.id)
    }

    /// # Errors
    /// Returns [`RuntimeError::NotFound`] if `id` names no device.
    pub fn lookup_device(&self, id: usize) -> Result<&DeviceDescription> {
        self.backend().lookup_device(id)
    }

    /// Start copying `data`, laid out per `shape`, to `device`.
    ///
    /// Returns before the transfer necessarily completes; readers of the
    /// buffer wait for it.
    ///
    /// # Errors
    /// Returns [`RuntimeError::InvalidArgument`] for a tuple shape, an
    /// invalid layout or a byte count that doesn't match the shape, and
    /// [`RuntimeError::NotFound`] for an unknown device.
    pub fn buffer_from_host(
        &self,
        data: &[u8],
        shape: &Shape,
        device: usize,
        release_after_run: bool,
    ) -> Result<DeviceBuffer> {
        let array = shape
            .as_array()
            .ok_or_else(|| RuntimeError::InvalidArgument(format!("cannot allocate a buffer of tuple shape {shape}")))?;
        shape
            .validate()
            .map_err(|e| RuntimeError::InvalidArgument(e.to_string()))?;
        if data.len() != array.size_bytes() {
            return Err(RuntimeError::InvalidArgument(format!(
                "{} bytes supplied for shape {array} ({} expected)",
                data.len(),
                array.size_bytes()
            )));
        }
        self.lookup_device(device)?;

        let raw = self.backend().buffer_from_host(data, array, device)?;
        tracing::trace!(shape = %array, device, release_after_run, "buffer from host");
        Ok(DeviceBuffer::new(raw, release_after_run, self.clone()))
    }

    /// Compile `program` for arguments of `argument_shapes`.
    ///
    /// Explicit layouts on the argument shapes are cleared; the backend picks
    /// the device layout.
    ///
    /// # Errors
    /// Returns [`RuntimeError::CompileError`] if the program is malformed or
    /// doesn't accept the given argument shapes.
    #[tracing::instrument(skip_all, fields(program = %program.name, portable))]
    pub fn compile(
        &self,
        program: &Program,
        argument_shapes: &[Shape],
        build_options: ExecutableBuildOptions,
        portable: bool,
    ) -> Result<CompiledExecutable> {
        let default_device = build_options.device_ordinal.unwrap_or(self.default_device());
        let options = CompileOptions {
            argument_layouts: argument_shapes.iter().map(Shape::without_layout).collect(),
            parameter_is_tupled_arguments: false,
            build_options,
            compile_portable_executable: portable,
        };

        let executable = self.backend().compile(program, &options)?;
        let fingerprint = self.backend().executable_fingerprint(executable.as_ref());
        tracing::debug!(fingerprint = ?fingerprint, "compiled");
        Ok(CompiledExecutable::new(
            executable,
            fingerprint,
            default_device,
            self.clone(),
        ))
    }

    /// Enqueue one value on `device`'s infeed.
    ///
    /// A tuple shape takes one chunk per element in order; an array shape
    /// takes the first chunk.
    ///
    /// # Errors
    /// Returns [`RuntimeError::InvalidArgument`] for an empty chunk list, a
    /// nested tuple shape or chunks that don't match the shape.
    pub fn transfer_to_infeed(&self, chunks: &[&[u8]], shape: &Shape, device: usize) -> Result<()> {
        if chunks.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "infeed operation expects a list of binaries".to_string(),
            ));
        }
        let value = match shape {
            Shape::Tuple(elements) => {
                if shape.is_nested_tuple() {
                    return Err(RuntimeError::InvalidArgument(
                        "nested tuples are not supported in infeed operation".to_string(),
                    ));
                }
                if chunks.len() != elements.len() {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "infeed of {shape} expects {} binaries, got {}",
                        elements.len(),
                        chunks.len()
                    )));
                }
                Value::from_chunks(shape, chunks)
            }
            Shape::Array(_) => Value::from_chunks(shape, &chunks[..1]),
        }
        .map_err(|e| RuntimeError::InvalidArgument(e.to_string()))?;

        self.lookup_device(device)?;
        self.backend().transfer_to_infeed(device, value)
    }

    /// Block until one value of `shape` arrives on `device`'s outfeed.
    ///
    /// # Errors
    /// Returns [`RuntimeError::InvalidArgument`] for a tuple shape and
    /// [`RuntimeError::TransferError`] if the dequeued value has a
    /// different shape.
    pub fn transfer_from_outfeed(&self, device: usize, shape: &Shape) -> Result<Vec<u8>> {
        let array = shape.as_array().ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("outfeed of tuple shape {shape} is not supported"))
        })?;
        shape
            .validate()
            .map_err(|e| RuntimeError::InvalidArgument(e.to_string()))?;
        self.lookup_device(device)?;
        let literal = self.backend().transfer_from_outfeed(device, array)?;
        Ok(literal.into_data())
    }
}
