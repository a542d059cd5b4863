//! Compiled executables and the run pipeline.

use crate::backend::{BackendBuffer, BackendExecutable, ExecuteOptions};
use crate::client::DeviceClient;
use crate::error::{Result, RuntimeError};
use crate::marshal::{Argument, BufferTracker, Output, pack_results, unpack_arguments};
use std::fmt;

/// A compiled program bound to the client that built it.
pub struct CompiledExecutable {
    raw: Box<dyn BackendExecutable>,
    fingerprint: Option<String>,
    default_device: usize,
    client: DeviceClient,
}

impl fmt::Debug for CompiledExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledExecutable")
            .field("name", &self.name())
            .field("portable", &self.is_portable())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl CompiledExecutable {
    pub(crate) fn new(
        raw: Box<dyn BackendExecutable>,
        fingerprint: Option<String>,
        default_device: usize,
        client: DeviceClient,
    ) -> Self {
        Self {
            raw,
            fingerprint,
            default_device,
            client,
        }
    }

    pub fn name(&self) -> &str {
        self.raw.name()
    }

    /// Backend cache key, when the backend provides one.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn is_portable(&self) -> bool {
        self.raw.is_portable()
    }

    pub fn num_replicas(&self) -> usize {
        self.raw.num_replicas()
    }

    /// Device that host arguments land on when `run` names none.
    pub fn default_device(&self) -> usize {
        self.default_device
    }

    pub fn client(&self) -> &DeviceClient {
        &self.client
    }

    /// Execute with `arguments`.
    ///
    /// `Some(device)` runs a portable executable on that device. `None` runs
    /// the compiled replica configuration and returns the first replica's
    /// results. Host arguments are materialized first and handed to
    /// `tracker`, so they remain reachable if a later step fails.
    ///
    /// # Errors
    /// Fails with [`RuntimeError::NotFound`] for an unknown device, with
    /// [`RuntimeError::FailedPrecondition`] for a deallocated argument, and
    /// with the backend's error if execution or readback fails. No partial
    /// output list is returned.
    #[tracing::instrument(skip_all, fields(executable = %self.raw.name(), device = ?device, keep_on_device))]
    pub fn run(
        &self,
        arguments: &[Argument<'_>],
        keep_on_device: bool,
        device: Option<usize>,
        tracker: &mut dyn BufferTracker,
    ) -> Result<Vec<Output>> {
        let options = ExecuteOptions {
            untuple_result: true,
            strict_shape_checking: false,
        };

        let target = device.unwrap_or(self.default_device);
        let buffers = unpack_arguments(&self.client, arguments, target, tracker)?;
        let raw_buffers = buffers
            .iter()
            .map(|buffer| buffer.raw())
            .collect::<Result<Vec<_>>>()?;
        let raw_arguments: Vec<&dyn BackendBuffer> =
            raw_buffers.iter().map(|raw| raw.as_ref()).collect();

        let results = match device {
            Some(id) => {
                let device = self.client.lookup_device(id)?;
                self.raw.execute_portable(&raw_arguments, device.id, &options)?
            }
            None => {
                if self.raw.num_replicas() != 1 {
                    return Err(RuntimeError::FailedPrecondition(format!(
                        "executable '{}' has {} replicas; only single-replica execution is supported",
                        self.name(),
                        self.raw.num_replicas()
                    )));
                }
                self.raw
                    .execute(&[raw_arguments], &options)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        RuntimeError::ExecutionError("execution produced no replicas".to_string())
                    })?
            }
        };

        tracing::debug!(outputs = results.len(), "executed");
        pack_results(&self.client, results, keep_on_device)
    }
}
