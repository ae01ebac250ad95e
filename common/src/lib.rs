//! Common code shared between `detect_server` and `cam_source`.
pub mod detection;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
