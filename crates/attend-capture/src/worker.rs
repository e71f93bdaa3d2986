//! Producer thread feeding a [`LatestFrame`] slot.

use crate::frame::LatestFrame;
use crate::source::{CaptureError, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Granularity of the stop-flag check while waiting between frames.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Handle to a running capture thread.
///
/// Dropping the handle stops the thread and joins it.
pub struct CaptureWorker {
    stop: Arc<AtomicBool>,
    running: CaptureLiveness,
    handle: Option<JoinHandle<()>>,
}

/// Cloneable view of whether the capture thread is still producing.
#[derive(Debug, Clone)]
pub struct CaptureLiveness(Arc<AtomicBool>);

impl CaptureLiveness {
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the liveness flag when the thread ends, panics included.
struct ExitGuard(CaptureLiveness);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        (self.0).0.store(false, Ordering::Release);
    }
}

impl CaptureWorker {
    /// Spawn a thread that pulls from `source` every `frame_interval` and
    /// publishes into `slot`.
    ///
    /// Per-frame source errors are logged and skipped. The thread exits when
    /// the source is exhausted or [`stop`](Self::stop) is called.
    pub fn spawn(
        mut source: Box<dyn FrameSource>,
        slot: Arc<LatestFrame>,
        frame_interval: Duration,
    ) -> Result<Self, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let running = CaptureLiveness(Arc::new(AtomicBool::new(true)));
        let guard = ExitGuard(running.clone());

        let handle = std::thread::Builder::new()
            .name("attend-capture".into())
            .spawn(move || {
                let _guard = guard;
                tracing::info!(source = source.name(), "capture thread started");
                let mut failures = 0u64;
                while !flag.load(Ordering::Acquire) {
                    match source.next_frame() {
                        Ok(Some(data)) => {
                            let seq = slot.publish(data);
                            tracing::trace!(seq, "frame published");
                        }
                        Ok(None) => {
                            tracing::info!(source = source.name(), "frame source exhausted");
                            break;
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::warn!(error = %e, failures, "frame capture failed; skipping");
                        }
                    }
                    sleep_unless_stopped(&flag, frame_interval);
                }
                tracing::info!(published = slot.published(), dropped = slot.dropped(), "capture thread exiting");
            })
            .map_err(CaptureError::Spawn)?;

        Ok(Self {
            stop,
            running,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit. Does not block.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn liveness(&self) -> CaptureLiveness {
        self.running.clone()
    }

    /// Stop the thread and wait for it.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sleep_unless_stopped(flag: &AtomicBool, total: Duration) {
    let mut remaining = total;
    while !remaining.is_zero() && !flag.load(Ordering::Acquire) {
        let step = remaining.min(STOP_POLL);
        std::thread::sleep(step);
        remaining -= step;
    }
}
