//! Capture device abstraction.
//!
//! A [`CaptureDevice`] knows how to open a [`FrameStream`]; the stream owns the
//! device handle for as long as it lives and releases it on drop. Callers that
//! need "at most one open handle" semantics must therefore drop the previous
//! stream before calling [`CaptureDevice::open`] again.

use crate::camera::CameraError;
use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

impl From<CameraError> for CaptureError {
    fn from(err: CameraError) -> Self {
        match err {
            CameraError::DeviceNotFound(_)
            | CameraError::DeviceBusy
            | CameraError::FormatNegotiationFailed(_)
            | CameraError::StreamingNotSupported => Self::DeviceUnavailable(err.to_string()),
            CameraError::CaptureFailed(_) => Self::ReadFailed(err.to_string()),
        }
    }
}

/// Something that can be opened for frame capture.
pub trait CaptureDevice: Send + Sync {
    /// Claim the device. Fails immediately, without retry, if it cannot be opened.
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError>;

    /// Human-readable identifier for logs.
    fn describe(&self) -> String;
}

/// An open capture handle. Dropping it releases the device.
pub trait FrameStream: Send {
    /// Read the next frame. `Ok(None)` signals end of stream.
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}
