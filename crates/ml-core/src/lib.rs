//! Object-detection collaborator used by the hub's detection stream.
//!
//! The model itself lives outside this workspace; `HttpDetector` talks to it
//! over HTTP and `PassthroughDetector` stands in when none is configured.

pub mod detector;
pub mod http;

pub use detector::{Detection, Detector, DetectorError, PassthroughDetector};
pub use http::HttpDetector;
