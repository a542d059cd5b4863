//! Shared handles to on-device buffers.

use crate::backend::BackendBuffer;
use crate::client::DeviceClient;
use crate::error::{Result, RuntimeError};
use spindle_core::{ArrayShape, Literal};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct BufferSlot {
    /// `None` once deallocated.
    raw: Mutex<Option<Arc<dyn BackendBuffer>>>,
    shape: ArrayShape,
    device: usize,
    release_after_run: bool,
    _client: DeviceClient,
}

/// A handle to one on-device allocation.
///
/// Clones share the allocation. [`DeviceBuffer::deallocate`] releases the
/// device memory for every clone at once; dropping the last clone releases
/// it too. An execution already using the buffer keeps its own reference
/// until it finishes.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferSlot>,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("shape", &self.inner.shape.to_string())
            .field("device", &self.inner.device)
            .field("release_after_run", &self.inner.release_after_run)
            .field("deallocated", &self.is_deallocated())
            .finish()
    }
}

impl DeviceBuffer {
    pub(crate) fn new(raw: Box<dyn BackendBuffer>, release_after_run: bool, client: DeviceClient) -> Self {
        let shape = raw.on_device_shape().clone();
        let device = raw.device();
        Self {
            inner: Arc::new(BufferSlot {
                raw: Mutex::new(Some(Arc::from(raw))),
                shape,
                device,
                release_after_run,
                _client: client,
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn BackendBuffer>>> {
        self.inner.raw.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The backend buffer, unless deallocated.
    pub(crate) fn raw(&self) -> Result<Arc<dyn BackendBuffer>> {
        self.slot().clone().ok_or_else(|| {
            RuntimeError::FailedPrecondition(format!(
                "buffer of shape {} has been deallocated",
                self.inner.shape
            ))
        })
    }

    /// Shape as stored on the device, including its layout.
    pub fn shape(&self) -> &ArrayShape {
        &self.inner.shape
    }

    pub fn device_id(&self) -> usize {
        self.inner.device
    }

    /// True for buffers materialized from host arguments of a run.
    pub fn release_after_run(&self) -> bool {
        self.inner.release_after_run
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.shape.size_bytes()
    }

    pub fn is_deallocated(&self) -> bool {
        self.slot().is_none()
    }

    /// True if both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait for the transfer or execution producing this buffer.
    ///
    /// # Errors
    /// Fails if the buffer was deallocated or its producer failed.
    pub fn block_host_until_ready(&self) -> Result<()> {
        self.raw()?.block_until_ready()
    }

    /// Read the value back in canonical row-major layout.
    pub fn to_literal(&self) -> Result<Literal> {
        let raw = self.raw()?;
        raw.block_until_ready()?;
        let literal = raw.to_literal()?;
        if literal.is_row_major() {
            return Ok(literal);
        }
        Ok(literal.to_row_major()?)
    }

    /// Read the value back as row-major bytes.
    ///
    /// With `max_size` of `None`, or one at least the full size, all bytes
    /// are returned; otherwise exactly the first `max_size` bytes.
    ///
    /// # Errors
    /// Fails with [`RuntimeError::FailedPrecondition`] after deallocation,
    /// or with the backend's error if readback fails.
    pub fn to_binary(&self, max_size: Option<usize>) -> Result<Vec<u8>> {
        let mut data = self.to_literal()?.into_data();
        if let Some(max_size) = max_size {
            data.truncate(max_size);
        }
        Ok(data)
    }

    /// Release the device memory now.
    ///
    /// # Errors
    /// Returns [`RuntimeError::FailedPrecondition`] if already deallocated.
    pub fn deallocate(&self) -> Result<()> {
        match self.slot().take() {
            Some(_) => {
                tracing::trace!(shape = %self.inner.shape, device = self.inner.device, "deallocated");
                Ok(())
            }
            None => Err(RuntimeError::FailedPrecondition(
                "Attempt to deallocate already deallocated buffer.".to_string(),
            )),
        }
    }
}
