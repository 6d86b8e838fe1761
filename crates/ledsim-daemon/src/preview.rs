//! Headless preview consumer
//!
//! Polls the runtime the way an attached display would: consume the dirty
//! flag, refresh the per-output render buffers, and report frame
//! statistics.

use ledsim_core::DeviceRuntime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// How often the consumer polls for a completed frame
const TICK: Duration = Duration::from_millis(50);
/// How often a frame-rate summary is logged while frames arrive
const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run(runtime: Arc<DeviceRuntime>, stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(TICK);
    let mut window_frames: u64 = 0;
    let mut window_start = tokio::time::Instant::now();

    while !*stop_rx.borrow() {
        ticker.tick().await;

        if runtime.consume_dirty() {
            runtime.fill_output_buffers();
            window_frames += 1;

            if tracing::enabled!(tracing::Level::DEBUG) {
                for (output, frame) in runtime.outputs().iter().zip(runtime.output_frames()) {
                    debug!(
                        output = output.id.as_str(),
                        width = frame.width,
                        height = frame.height,
                        "Refreshed output"
                    );
                }
            }
        }

        let elapsed = window_start.elapsed();
        if elapsed >= SUMMARY_INTERVAL {
            if window_frames > 0 {
                let fps = window_frames as f64 / elapsed.as_secs_f64();
                info!(frames = window_frames, fps, "Preview window");
            }
            window_frames = 0;
            window_start = tokio::time::Instant::now();
        }
    }

    debug!("Preview loop exited");
}
