pub mod annotate;
pub mod backends;
pub mod blur;
pub mod clock;
pub mod locator;
pub mod mjpeg;
pub mod orchestrator;
pub mod sink;
pub mod source;
pub mod storage;
pub mod throttle;
