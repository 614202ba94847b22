//! Live preview of the recognition loop.

use crate::types::LabeledFace;
use faceward_hw::Frame;

/// Renders labelled boxes over captured frames and relays a local quit request.
///
/// Boxes arrive already scaled to the frame's resolution.
pub trait DisplayOverlay: Send {
    fn render(&mut self, frame: &Frame, faces: &[LabeledFace]);

    /// `true` once the user asked the loop to stop (e.g. pressed `q`).
    fn quit_requested(&mut self) -> bool;

    /// Release any window or surface. Called exactly once when the loop exits.
    fn close(&mut self);
}

/// No window; rendered faces go to the trace log.
#[derive(Debug, Default)]
pub struct HeadlessOverlay {
    frames: u64,
}

impl HeadlessOverlay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DisplayOverlay for HeadlessOverlay {
    fn render(&mut self, frame: &Frame, faces: &[LabeledFace]) {
        self.frames += 1;
        for face in faces {
            tracing::trace!(
                sequence = frame.sequence,
                label = face.label(),
                x = face.bbox.x,
                y = face.bbox.y,
                width = face.bbox.width,
                height = face.bbox.height,
                "overlay box"
            );
        }
    }

    fn quit_requested(&mut self) -> bool {
        false
    }

    fn close(&mut self) {
        tracing::debug!(frames = self.frames, "headless overlay closed");
    }
}
