//! Device buffers and execution dispatch for spindle programs.
//!
//! This crate moves data between host memory and devices, compiles
//! [`spindle_core::Program`]s for a backend, and runs them.
//!
//! # Architecture
//!
//! - **Backends** - [`HostBackend`] interprets programs on per-device worker
//!   threads; [`GpuBackend`] lowers them to WGSL compute kernels via `wgpu`.
//!   Both sit behind the [`Backend`] trait.
//! - **Clients** - [`DeviceClient`] wraps one backend and owns the buffers
//!   and executables created through it.
//! - **Execution** - [`CompiledExecutable::run`] materializes host
//!   arguments, dispatches, and either keeps results on the device or reads
//!   them back.
//! - **Sessions** - [`Session`] exposes the same operations through opaque
//!   integer handles.
//!
//! # Example
//!
//! ```
//! use spindle_core::{ElementType, ProgramBuilder, Shape};
//! use spindle_runtime::{Argument, ClientConfig, DeviceClient, ExecutableBuildOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DeviceClient::new(&ClientConfig::host(1))?;
//!
//! let vec4 = Shape::array(ElementType::F32, vec![4]);
//! let mut builder = ProgramBuilder::new("add");
//! let a = builder.parameter(vec4.clone());
//! let b = builder.parameter(vec4.clone());
//! let sum = builder.add(a, b)?;
//! let program = builder.build(sum)?;
//!
//! let executable = client.compile(
//!     &program,
//!     &[vec4.clone(), vec4.clone()],
//!     ExecutableBuildOptions::default(),
//!     false,
//! )?;
//!
//! let lhs: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]).to_vec();
//! let rhs: Vec<u8> = bytemuck::cast_slice(&[5.0f32, 6.0, 7.0, 8.0]).to_vec();
//! let mut materialized = Vec::new();
//! let outputs = executable.run(
//!     &[
//!         Argument::Host { data: &lhs, shape: &vec4 },
//!         Argument::Host { data: &rhs, shape: &vec4 },
//!     ],
//!     false,
//!     None,
//!     &mut materialized,
//! )?;
//!
//! let sum: &[f32] = bytemuck::cast_slice(outputs[0].as_binary().unwrap_or_default());
//! assert_eq!(sum, &[6.0, 8.0, 10.0, 12.0]);
//! # Ok(())
//! # }
//! ```

mod backend;
mod buffer;
mod client;
mod error;
mod executable;
mod feed;
pub mod gpu;
pub mod host;
mod marshal;
mod session;

// Public exports
pub use backend::{
    Backend, BackendBuffer, BackendExecutable, CompileOptions, DeviceDescription,
    ExecutableBuildOptions, ExecuteOptions, Platform,
};
pub use buffer::DeviceBuffer;
pub use client::{ClientConfig, DeviceClient};
pub use error::{ErrorKind, Result, RuntimeError};
pub use executable::CompiledExecutable;
pub use gpu::{GpuBackend, GpuOptions};
pub use host::{HostBackend, HostOptions};
pub use marshal::{Argument, BufferTracker, Output, pack_results, unpack_arguments};
pub use session::{
    BufferHandle, ClientHandle, ExecutableHandle, Session, SessionArgument, SessionOutput,
};
