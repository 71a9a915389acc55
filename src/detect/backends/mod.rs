mod replay;
mod synthetic;

pub use replay::ReplayDetector;
pub use synthetic::SyntheticDetector;
