//! faceward-hw: frames and capture devices.
//!
//! Provides the luma [`Frame`] type shared by the pipeline, the
//! [`CaptureDevice`] abstraction the recognition loop runs against, and a
//! V4L2-backed implementation of it.

pub mod camera;
pub mod capture;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, V4l2Device};
pub use capture::{CaptureDevice, CaptureError, FrameStream};
pub use frame::{Frame, FrameError};
