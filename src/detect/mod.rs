mod backend;
mod backends;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
pub use result::{summarize, BoundingBox, Detection, ObjectClass};
