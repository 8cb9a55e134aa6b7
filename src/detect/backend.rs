use anyhow::Result;

use crate::detect::result::Detection;
use crate::stream::Frame;

/// Detector backend trait.
///
/// The model itself is outside this crate: a backend is an opaque function
/// from a frame to a list of detections. Implementations must treat the frame
/// as read-only and must not retain it beyond the `detect` call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
