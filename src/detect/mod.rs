mod backend;
mod result;
mod stub;

pub use backend::Detector;
pub use result::HitBox;
pub use stub::StubDetector;
