//! attend-capture: Frame producers for the recognition loop.
//!
//! A capture thread pulls encoded frames from a [`FrameSource`] (a V4L2
//! camera or a directory of images) and
//! publishes them into a single-slot [`LatestFrame`] buffer. The
//! recognition loop polls that slot on its own schedule and only ever
//! sees the newest frame.

pub mod camera;
pub mod frame;
pub mod source;
pub mod worker;

pub use camera::CameraSource;
pub use frame::{Frame, LatestFrame};
pub use source::{CaptureError, DirectorySource, FrameSource};
pub use worker::{CaptureLiveness, CaptureWorker};
