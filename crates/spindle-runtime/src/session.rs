//! Handle-based facade for callers that cannot hold Rust references.
//!
//! A [`Session`] owns clients, buffers and executables and hands out opaque
//! integer handles. Device ids are `i32`: on `run` a negative id selects
//! the default replica path, everywhere else it is an unknown device.

use crate::backend::ExecutableBuildOptions;
use crate::buffer::DeviceBuffer;
use crate::client::{ClientConfig, DeviceClient};
use crate::error::{Result, RuntimeError};
use crate::executable::CompiledExecutable;
use crate::marshal::{Argument, BufferTracker, Output};
use spindle_core::{Program, Shape};
use std::collections::HashMap;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

handle_type!(
    /// Opaque reference to a client owned by a [`Session`].
    ClientHandle
);
handle_type!(
    /// Opaque reference to a device buffer owned by a [`Session`].
    BufferHandle
);
handle_type!(
    /// Opaque reference to a compiled executable owned by a [`Session`].
    ExecutableHandle
);

/// An argument to [`Session::run`].
#[derive(Debug, Clone, Copy)]
pub enum SessionArgument<'a> {
    /// Host bytes with their shape.
    Binary { data: &'a [u8], shape: &'a Shape },
    Buffer(BufferHandle),
}

/// A result of [`Session::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Buffer(BufferHandle),
    Binary(Vec<u8>),
}

/// Registers buffers materialized during a run under fresh handles and
/// reports each handle to the caller.
struct HandleTracker<'a> {
    buffers: &'a mut HashMap<u64, DeviceBuffer>,
    next_handle: &'a mut u64,
    handles: &'a mut Vec<BufferHandle>,
}

impl BufferTracker for HandleTracker<'_> {
    fn track(&mut self, buffer: DeviceBuffer) {
        let handle = next(self.next_handle);
        self.buffers.insert(handle, buffer);
        self.handles.push(BufferHandle(handle));
    }
}

fn next(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

fn device_id(id: i32) -> Result<usize> {
    usize::try_from(id).map_err(|_| RuntimeError::NotFound(format!("invalid device id {id}")))
}

/// Arena of clients, buffers and executables addressed by handles.
///
/// Buffers stay registered after [`Session::deallocate_buffer`] so that a
/// second deallocation reports a precondition failure rather than an
/// unknown handle; [`Session::release_buffer`] forgets a handle entirely.
#[derive(Debug, Default)]
pub struct Session {
    next_handle: u64,
    clients: HashMap<u64, DeviceClient>,
    buffers: HashMap<u64, DeviceBuffer>,
    executables: HashMap<u64, CompiledExecutable>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_client(&mut self, config: &ClientConfig) -> Result<ClientHandle> {
        let client = DeviceClient::new(config)?;
        let handle = next(&mut self.next_handle);
        self.clients.insert(handle, client);
        Ok(ClientHandle(handle))
    }

    pub fn client(&self, handle: ClientHandle) -> Result<&DeviceClient> {
        self.clients
            .get(&handle.0)
            .ok_or_else(|| RuntimeError::NotFound(format!("unknown client handle {}", handle.0)))
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&DeviceBuffer> {
        self.buffers
            .get(&handle.0)
            .ok_or_else(|| RuntimeError::NotFound(format!("unknown buffer handle {}", handle.0)))
    }

    pub fn executable(&self, handle: ExecutableHandle) -> Result<&CompiledExecutable> {
        self.executables.get(&handle.0).ok_or_else(|| {
            RuntimeError::NotFound(format!("unknown executable handle {}", handle.0))
        })
    }

    fn register_buffer(&mut self, buffer: DeviceBuffer) -> BufferHandle {
        let handle = next(&mut self.next_handle);
        self.buffers.insert(handle, buffer);
        BufferHandle(handle)
    }

    pub fn buffer_from_binary(
        &mut self,
        client: ClientHandle,
        data: &[u8],
        shape: &Shape,
        device: i32,
    ) -> Result<BufferHandle> {
        let buffer = self
            .client(client)?
            .buffer_from_host(data, shape, device_id(device)?, false)?;
        Ok(self.register_buffer(buffer))
    }

    /// Read a buffer back; a negative `max_size` reads everything.
    pub fn buffer_to_binary(&self, buffer: BufferHandle, max_size: i64) -> Result<Vec<u8>> {
        self.buffer(buffer)?.to_binary(usize::try_from(max_size).ok())
    }

    pub fn deallocate_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.buffer(buffer)?.deallocate()
    }

    /// Forget a buffer handle, releasing the allocation if nothing else
    /// holds it. Returns false for an unknown handle.
    pub fn release_buffer(&mut self, buffer: BufferHandle) -> bool {
        self.buffers.remove(&buffer.0).is_some()
    }

    /// Deallocate and forget every buffer materialized from host arguments.
    ///
    /// Returns the number of handles released.
    pub fn release_transient_buffers(&mut self) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|handle, buffer| {
            if !buffer.release_after_run() {
                return true;
            }
            match buffer.deallocate() {
                // Already deallocated; only the handle needs forgetting.
                Ok(()) | Err(RuntimeError::FailedPrecondition(_)) => {}
                Err(e) => {
                    tracing::warn!(handle, error = %e, "failed to deallocate transient buffer");
                }
            }
            false
        });
        before - self.buffers.len()
    }

    /// Number of registered buffers that still hold device memory.
    pub fn live_buffers(&self) -> usize {
        self.buffers
            .values()
            .filter(|buffer| !buffer.is_deallocated())
            .count()
    }

    pub fn compile(
        &mut self,
        client: ClientHandle,
        program: &Program,
        argument_shapes: &[Shape],
        options: ExecutableBuildOptions,
        portable: bool,
    ) -> Result<ExecutableHandle> {
        let executable = self
            .client(client)?
            .compile(program, argument_shapes, options, portable)?;
        let handle = next(&mut self.next_handle);
        self.executables.insert(handle, executable);
        Ok(ExecutableHandle(handle))
    }

    pub fn executable_fingerprint(&self, executable: ExecutableHandle) -> Result<Option<&str>> {
        Ok(self.executable(executable)?.fingerprint())
    }

    /// Run an executable; the status element of the result is always 0.
    ///
    /// A `device` of zero or more runs a portable executable on that device;
    /// a negative one runs the default replica configuration.
    ///
    /// Buffers materialized from binary arguments are registered with the
    /// session before execution starts and their handles are appended to
    /// `materialized`, on failure as well as on success. The caller owns
    /// them and releases them with [`Session::release_buffer`].
    pub fn run(
        &mut self,
        executable: ExecutableHandle,
        arguments: &[SessionArgument<'_>],
        keep_on_device: bool,
        device: i32,
        materialized: &mut Vec<BufferHandle>,
    ) -> Result<(Vec<SessionOutput>, i32)> {
        let buffers = arguments
            .iter()
            .filter_map(|argument| match argument {
                SessionArgument::Buffer(handle) => Some(self.buffer(*handle).cloned()),
                SessionArgument::Binary { .. } => None,
            })
            .collect::<Result<Vec<_>>>()?;
        let mut passed = buffers.iter();
        let arguments: Vec<Argument<'_>> = arguments
            .iter()
            .filter_map(|argument| match *argument {
                SessionArgument::Binary { data, shape } => Some(Argument::Host { data, shape }),
                SessionArgument::Buffer(_) => passed.next().map(Argument::Buffer),
            })
            .collect();
        let device = usize::try_from(device).ok();

        let executable = self.executables.get(&executable.0).ok_or_else(|| {
            RuntimeError::NotFound(format!("unknown executable handle {}", executable.0))
        })?;
        let mut tracker = HandleTracker {
            buffers: &mut self.buffers,
            next_handle: &mut self.next_handle,
            handles: materialized,
        };
        let outputs = executable.run(&arguments, keep_on_device, device, &mut tracker)?;

        let outputs = outputs
            .into_iter()
            .map(|output| match output {
                Output::Buffer(buffer) => SessionOutput::Buffer(self.register_buffer(buffer)),
                Output::Binary(data) => SessionOutput::Binary(data),
            })
            .collect();
        Ok((outputs, 0))
    }

    pub fn transfer_to_infeed(
        &self,
        client: ClientHandle,
        chunks: &[&[u8]],
        shape: &Shape,
        device: i32,
    ) -> Result<()> {
        self.client(client)?
            .transfer_to_infeed(chunks, shape, device_id(device)?)
    }

    pub fn transfer_from_outfeed(
        &self,
        client: ClientHandle,
        device: i32,
        shape: &Shape,
    ) -> Result<Vec<u8>> {
        self.client(client)?
            .transfer_from_outfeed(device_id(device)?, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use spindle_core::{ArrayShape, ElementType, ProgramBuilder};

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    fn setup() -> (Session, ClientHandle, ExecutableHandle, Shape) {
        let mut session = Session::new();
        let client = session.create_client(&ClientConfig::host(1)).unwrap();
        let vec4 = Shape::array(ElementType::F32, vec![4]);
        let mut builder = ProgramBuilder::new("add");
        let a = builder.parameter(vec4.clone());
        let b = builder.parameter(vec4.clone());
        let sum = builder.add(a, b).unwrap();
        let program = builder.build(sum).unwrap();
        let executable = session
            .compile(
                client,
                &program,
                &[vec4.clone(), vec4.clone()],
                ExecutableBuildOptions::default(),
                false,
            )
            .unwrap();
        (session, client, executable, vec4)
    }

    #[test]
    fn test_run_with_binaries() {
        let (mut session, _, executable, vec4) = setup();
        let mut materialized = Vec::new();
        let a = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);
        let b = f32_bytes(&[5.0, 6.0, 7.0, 8.0]);
        let (outputs, status) = session
            .run(
                executable,
                &[
                    SessionArgument::Binary { data: &a, shape: &vec4 },
                    SessionArgument::Binary { data: &b, shape: &vec4 },
                ],
                false,
                -1,
                &mut materialized,
            )
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(outputs, vec![SessionOutput::Binary(f32_bytes(&[6.0, 8.0, 10.0, 12.0]))]);

        // Materialized inputs stay registered until released.
        assert_eq!(materialized.len(), 2);
        assert_eq!(session.live_buffers(), 2);
        assert_eq!(session.release_transient_buffers(), 2);
        assert_eq!(session.live_buffers(), 0);
    }

    #[test]
    fn test_repeated_runs_release_materialized_buffers() {
        let (mut session, client, executable, vec4) = setup();
        let held = session
            .buffer_from_binary(client, &f32_bytes(&[1.0; 4]), &vec4, 0)
            .unwrap();
        let baseline = session.live_buffers();
        let a = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);

        for _ in 0..100 {
            let mut materialized = Vec::new();
            session
                .run(
                    executable,
                    &[
                        SessionArgument::Binary { data: &a, shape: &vec4 },
                        SessionArgument::Binary { data: &a, shape: &vec4 },
                    ],
                    false,
                    -1,
                    &mut materialized,
                )
                .unwrap();
            assert_eq!(materialized.len(), 2);
            assert_eq!(session.live_buffers(), baseline + 2);
            for handle in materialized {
                assert!(session.buffer(handle).unwrap().release_after_run());
                assert!(session.release_buffer(handle));
            }
            assert_eq!(session.live_buffers(), baseline);
        }
        assert!(session.buffer(held).is_ok());
    }

    #[test]
    fn test_failed_run_reports_materialized_buffers() {
        let (mut session, _, executable, vec4) = setup();
        let a = f32_bytes(&[1.0; 4]);
        let mut materialized = Vec::new();
        // Device 0 on a non-portable executable fails after unpacking.
        let err = session
            .run(
                executable,
                &[
                    SessionArgument::Binary { data: &a, shape: &vec4 },
                    SessionArgument::Binary { data: &a, shape: &vec4 },
                ],
                false,
                0,
                &mut materialized,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert_eq!(materialized.len(), 2);
        assert_eq!(session.live_buffers(), 2);
        for handle in materialized {
            session.deallocate_buffer(handle).unwrap();
            assert!(session.release_buffer(handle));
        }
        assert_eq!(session.live_buffers(), 0);
    }

    #[test]
    fn test_release_transient_skips_deallocated_buffers() {
        let (mut session, _, executable, vec4) = setup();
        let a = f32_bytes(&[1.0; 4]);
        let mut materialized = Vec::new();
        session
            .run(
                executable,
                &[
                    SessionArgument::Binary { data: &a, shape: &vec4 },
                    SessionArgument::Binary { data: &a, shape: &vec4 },
                ],
                false,
                -1,
                &mut materialized,
            )
            .unwrap();
        session.deallocate_buffer(materialized[0]).unwrap();
        assert_eq!(session.release_transient_buffers(), 2);
        assert!(materialized.iter().all(|&handle| session.buffer(handle).is_err()));
    }

    #[test]
    fn test_oversized_shape_is_invalid_argument() {
        let (mut session, client, _, _) = setup();
        let huge = Shape::Array(ArrayShape::new(
            ElementType::F32,
            vec![1 << 32, 1 << 32, 1 << 32],
        ));
        let err = session
            .buffer_from_binary(client, &[0u8; 4], &huge, 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = session
            .transfer_to_infeed(client, &[&[0u8; 4]], &huge, 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(session.live_buffers(), 0);
    }

    #[test]
    fn test_run_keep_on_device_with_buffer_argument() {
        let (mut session, client, executable, vec4) = setup();
        let a = session
            .buffer_from_binary(client, &f32_bytes(&[1.0, 1.0, 1.0, 1.0]), &vec4, 0)
            .unwrap();
        let b = f32_bytes(&[0.5, 1.5, 2.5, 3.5]);
        let (outputs, _) = session
            .run(
                executable,
                &[
                    SessionArgument::Buffer(a),
                    SessionArgument::Binary { data: &b, shape: &vec4 },
                ],
                true,
                -1,
                &mut Vec::new(),
            )
            .unwrap();
        let SessionOutput::Buffer(result) = outputs[0].clone() else {
            panic!("expected a buffer output, got {:?}", outputs[0]);
        };
        assert_eq!(
            session.buffer_to_binary(result, -1).unwrap(),
            f32_bytes(&[1.5, 2.5, 3.5, 4.5])
        );
        assert_eq!(session.buffer_to_binary(result, 4).unwrap(), f32_bytes(&[1.5]));
    }

    #[test]
    fn test_handle_errors() {
        let (mut session, client, executable, vec4) = setup();
        let buffer = session
            .buffer_from_binary(client, &f32_bytes(&[0.0; 4]), &vec4, 0)
            .unwrap();
        session.deallocate_buffer(buffer).unwrap();
        assert_eq!(
            session.deallocate_buffer(buffer).unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
        assert!(session.release_buffer(buffer));
        assert_eq!(
            session.buffer_to_binary(buffer, -1).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            session
                .buffer_from_binary(client, &f32_bytes(&[0.0; 4]), &vec4, -1)
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
        let err = session
            .run(executable, &[SessionArgument::Buffer(buffer)], false, -1, &mut Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(session.executable_fingerprint(executable).unwrap().is_some());
    }
}
