use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    detections: AtomicU64,
    failed_detections: AtomicU64,
    streamed_frames: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            detections: AtomicU64::new(0),
            failed_detections: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_detection(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_failed_detection(&self) {
        self.failed_detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_detections(&self) -> u64 {
        self.detections.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_failed_detections(&self) -> u64 {
        self.failed_detections.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_streamed(&self) -> u64 {
        self.streamed_frames.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let detections = METER.get_reset_detections();
            let failed_detections = METER.get_reset_failed_detections();
            let streamed_frames = METER.get_reset_streamed();
            let elapsed = start.elapsed().as_secs_f32();
            let fps_detections = detections as f32 / elapsed;
            let fps_streamed = streamed_frames as f32 / elapsed;

            if detections > 0 {
                log::info!("Detections per second: {fps_detections:.2}")
            }
            if failed_detections > 0 {
                log::warn!("Failed detections in the last {elapsed:.1}s: {failed_detections}")
            }
            if streamed_frames > 0 {
                log::info!("Streamed frames per second: {fps_streamed:.2}")
            }
        }
    })
}
