use anyhow::Result;

use crate::decode::Frame;
use crate::detect::HitBox;

/// Detector contract.
///
/// The pipeline calls `infer` in frame order with monotonically
/// non-decreasing timestamps and never re-enters a detector concurrently for
/// one run. Implementations may carry internal state across calls (e.g. a
/// tracking stage feeding a secondary classifier); the timestamp is the
/// stream-relative presentation offset of the frame.
///
/// A failed call is treated by the pipeline as zero detections for that
/// frame, not as a run failure.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one frame.
    fn infer(&mut self, frame: &Frame, t_secs: f64) -> Result<Vec<HitBox>>;
}
