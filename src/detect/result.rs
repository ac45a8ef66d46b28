use serde::{Deserialize, Serialize};

/// One detection within a frame.
///
/// Geometry is a normalized center/size box: `x, y` are the box center and
/// `w, h` its extent, all in `[0, 1]` relative to the frame. `c` is the
/// detector's confidence in `[0, 1]`. `track_id` is a stable identity
/// assigned by the detector's internal tracker, absent when untracked.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HitBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub c: f64,
    pub track_id: Option<i64>,
}
