//! Pipeline supervision.
//!
//! One monitor task reconciles running pipelines against viewer
//! display interest every 100 ms: pipelines for displays nobody
//! watches are stopped, faulted pipelines are reclaimed (and restarted
//! on the same tick when still wanted), and missing pipelines are
//! started.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use glimpse_capture::frame::DisplayInfo;
use glimpse_capture::service::ScreenshotService;
use glimpse_encode::FrameEncoder;
use glimpse_protocol::connection::Connection;

use crate::pipeline::{CapturePipeline, PipelineContext};

/// Reconciliation cadence.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

pub const MIN_FPS: u32 = 10;
pub const MAX_FPS: u32 = 120;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("target fps {0} outside {MIN_FPS}..={MAX_FPS}")]
pub struct FpsOutOfRange(pub u32);

/// Supervises one pipeline per watched display.
pub struct CaptureManager {
    displays: Vec<DisplayInfo>,
    pipelines: Arc<Mutex<HashMap<String, CapturePipeline>>>,
    target_fps: Arc<AtomicU32>,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureManager {
    /// Start supervising. `displays` is the advertised display set.
    #[must_use]
    pub fn start(
        displays: Vec<DisplayInfo>,
        service: Arc<ScreenshotService>,
        encoder: Arc<FrameEncoder>,
        connection: Arc<Connection>,
        target_fps: u32,
    ) -> Self {
        let target_fps = Arc::new(AtomicU32::new(target_fps.clamp(MIN_FPS, MAX_FPS)));
        let pipelines = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let ctx = PipelineContext {
            service,
            encoder,
            connection,
            target_fps: Arc::clone(&target_fps),
        };
        let monitor = tokio::spawn(monitor_loop(
            displays.clone(),
            ctx,
            Arc::clone(&pipelines),
            cancel.clone(),
        ));

        Self {
            displays,
            pipelines,
            target_fps,
            cancel,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    #[must_use]
    pub fn displays(&self) -> &[DisplayInfo] {
        &self.displays
    }

    /// Change the capture rate for all pipelines.
    pub fn set_target_fps(&self, fps: u32) -> Result<(), FpsOutOfRange> {
        if !(MIN_FPS..=MAX_FPS).contains(&fps) {
            return Err(FpsOutOfRange(fps));
        }
        self.target_fps.store(fps, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn target_fps(&self) -> u32 {
        self.target_fps.load(Ordering::Relaxed)
    }

    /// Display ids with a live pipeline (for tests and status output).
    #[must_use]
    pub fn active_displays(&self) -> Vec<String> {
        self.pipelines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Stop the monitor, then every pipeline.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
        let pipelines = {
            let mut map = self
                .pipelines
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *map)
        };
        for (_, pipeline) in pipelines {
            pipeline.dispose().await;
        }
    }
}

async fn monitor_loop(
    displays: Vec<DisplayInfo>,
    ctx: PipelineContext,
    pipelines: Arc<Mutex<HashMap<String, CapturePipeline>>>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(MONITOR_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            () = cancel.cancelled() => break,
        }

        let needed: HashSet<String> = ctx
            .connection
            .viewers()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.selected_display_id)
            .filter(|id| displays.iter().any(|d| &d.id == id))
            .collect();

        // Decide under the lock, dispose outside it.
        let to_stop: Vec<CapturePipeline> = {
            let mut map = pipelines
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let stop_ids: Vec<String> = map
                .iter()
                .filter(|(id, pipeline)| !needed.contains(*id) || pipeline.is_faulted())
                .map(|(id, _)| id.clone())
                .collect();
            stop_ids
                .into_iter()
                .filter_map(|id| {
                    let pipeline = map.remove(&id)?;
                    if pipeline.is_faulted() {
                        tracing::warn!(display = %id, "Reclaiming faulted pipeline");
                    }
                    Some(pipeline)
                })
                .collect()
        };
        for pipeline in to_stop {
            pipeline.dispose().await;
        }

        for id in &needed {
            let mut map = pipelines
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if map.contains_key(id) {
                continue;
            }
            let Some(display) = displays.iter().find(|d| &d.id == id) else {
                continue;
            };
            map.insert(id.clone(), CapturePipeline::start(display.clone(), &ctx));
        }
    }
}
