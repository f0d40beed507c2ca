//! Concrete camera, detector and preview implementations.

#[cfg(feature = "opencv")]
pub mod cv;
