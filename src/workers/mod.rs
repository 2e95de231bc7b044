pub mod delayed_resolution;

pub use delayed_resolution::{DelayedResolutionConfig, DelayedResolutionWorker};
