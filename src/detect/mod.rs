mod backend;
mod backends;
mod registry;

pub use backend::{Detector, DetectorSettings};
pub use backends::{ReplayDetector, SyntheticDetector};
pub use registry::DetectorRegistry;
