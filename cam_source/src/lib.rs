//! Video sources feeding the detection loop.
pub mod sensors;
pub mod video;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
