pub mod cache;
pub mod capture_service;

pub use cache::CaptureCache;
pub use capture_service::{BackgroundCapture, CaptureService};
