use anyhow::Result;

use crate::detect::result::{Detection, InferenceParams};
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend is an opaque capability: given an image and inference
/// parameters, it returns axis-aligned boxes with a class id and confidence.
/// Confidence filtering and non-maximum suppression happen inside the backend;
/// callers trust every returned class id as-is.
///
/// Boxes are reported in the coordinate space of the `frame` passed in, which
/// is usually the preprocessed frame rather than the decoded one.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Implementations must treat the pixels as read-only and must not keep
    /// them past the call.
    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<Detection>> {
        (**self).detect(frame, params)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
