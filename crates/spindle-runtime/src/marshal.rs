//! Conversion between call arguments/results and device buffers.

use crate::backend::BackendBuffer;
use crate::buffer::DeviceBuffer;
use crate::client::DeviceClient;
use crate::error::Result;
use spindle_core::Shape;

/// One positional argument of a run.
#[derive(Debug, Clone, Copy)]
pub enum Argument<'a> {
    /// Host bytes laid out per `shape`, copied to the device for this run.
    Host { data: &'a [u8], shape: &'a Shape },
    /// A buffer already on the device.
    Buffer(&'a DeviceBuffer),
}

/// One result of a run.
#[derive(Debug)]
pub enum Output {
    /// Result kept on the device.
    Buffer(DeviceBuffer),
    /// Result read back to row-major host bytes.
    Binary(Vec<u8>),
}

impl Output {
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Output::Binary(data) => Some(data),
            Output::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&DeviceBuffer> {
        match self {
            Output::Buffer(buffer) => Some(buffer),
            Output::Binary(_) => None,
        }
    }
}

/// Receives the buffers a run materializes from host arguments.
///
/// Tracked buffers stay reachable for explicit cleanup even when the run
/// fails after materializing them.
pub trait BufferTracker {
    fn track(&mut self, buffer: DeviceBuffer);
}

impl BufferTracker for Vec<DeviceBuffer> {
    fn track(&mut self, buffer: DeviceBuffer) {
        self.push(buffer);
    }
}

/// Turn arguments into device buffers on `device`.
///
/// Host arguments become new buffers tagged `release_after_run`; each is
/// handed to `tracker` as soon as it exists and then waited on.
///
/// # Errors
/// Fails on the first argument that cannot be materialized.
pub fn unpack_arguments(
    client: &DeviceClient,
    arguments: &[Argument<'_>],
    device: usize,
    tracker: &mut dyn BufferTracker,
) -> Result<Vec<DeviceBuffer>> {
    arguments
        .iter()
        .map(|argument| match argument {
            Argument::Host { data, shape } => {
                let buffer = client.buffer_from_host(data, shape, device, true)?;
                tracker.track(buffer.clone());
                buffer.block_host_until_ready()?;
                Ok(buffer)
            }
            Argument::Buffer(buffer) => Ok((*buffer).clone()),
        })
        .collect()
}

/// Wrap execution results for the caller.
///
/// With `keep_on_device` every result stays a buffer handle; otherwise each
/// is read back and its device memory released immediately.
///
/// # Errors
/// Fails on the first readback error; remaining results are released.
pub fn pack_results(
    client: &DeviceClient,
    results: Vec<Box<dyn BackendBuffer>>,
    keep_on_device: bool,
) -> Result<Vec<Output>> {
    results
        .into_iter()
        .map(|raw| {
            let buffer = DeviceBuffer::new(raw, false, client.clone());
            if keep_on_device {
                return Ok(Output::Buffer(buffer));
            }
            let data = buffer.to_binary(None)?;
            buffer.deallocate()?;
            Ok(Output::Binary(data))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use spindle_core::ElementType;

    #[test]
    fn test_unpack_tracks_materialized_buffers() {
        let client = DeviceClient::new(&ClientConfig::host(1)).unwrap();
        let shape = Shape::array(ElementType::U8, vec![2]);
        let existing = client.buffer_from_host(&[1, 2], &shape, 0, false).unwrap();

        let mut tracked: Vec<DeviceBuffer> = Vec::new();
        let buffers = unpack_arguments(
            &client,
            &[
                Argument::Host {
                    data: &[3, 4],
                    shape: &shape,
                },
                Argument::Buffer(&existing),
            ],
            0,
            &mut tracked,
        )
        .unwrap();

        assert_eq!(buffers.len(), 2);
        assert_eq!(tracked.len(), 1);
        assert!(tracked[0].release_after_run());
        assert!(tracked[0].same_allocation(&buffers[0]));
        assert!(buffers[1].same_allocation(&existing));
        assert!(!buffers[1].release_after_run());
    }

    #[test]
    fn test_unpack_failure_keeps_earlier_buffers_tracked() {
        let client = DeviceClient::new(&ClientConfig::host(1)).unwrap();
        let shape = Shape::array(ElementType::U8, vec![2]);
        let mut tracked: Vec<DeviceBuffer> = Vec::new();
        let result = unpack_arguments(
            &client,
            &[
                Argument::Host {
                    data: &[1, 2],
                    shape: &shape,
                },
                Argument::Host {
                    data: &[1, 2, 3],
                    shape: &shape,
                },
            ],
            0,
            &mut tracked,
        );
        assert!(result.is_err());
        assert_eq!(tracked.len(), 1);
        tracked[0].deallocate().unwrap();
    }
}
