//! Per-display capture pipeline: grab -> encode -> send.
//!
//! Three cooperative tasks joined by two 1-slot drop-oldest channels.
//! The capture task paces itself to the target FPS; when encode or
//! send cannot keep up, displaced frames are dropped (and their pooled
//! buffers released) instead of queueing latency. Any unexpected error
//! inside a loop marks the pipeline faulted and exits; the manager
//! reclaims faulted pipelines on its next tick.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use glimpse_capture::frame::{DisplayInfo, GrabContent, GrabResult};
use glimpse_capture::pacing::{sleep_until_precise, RateTracker};
use glimpse_capture::service::ScreenshotService;
use glimpse_encode::{EncodedRegion, FrameEncoder};
use glimpse_protocol::connection::{Connection, ConnectionError};
use glimpse_protocol::messages::{FrameCodec, FrameMessage, TileRegion};

use crate::slot;

/// Grace period for the three tasks to exit on dispose.
pub const DISPOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Idle delays after uneventful or failed grabs.
const NO_CHANGES_DELAY: Duration = Duration::from_millis(1);
const FAILURE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Faulted,
    Stopped,
}

/// A grabbed frame travelling to the encode task.
struct CapturedFrame {
    frame_number: u64,
    content: GrabContent,
}

/// An encoded frame travelling to the send task.
struct EncodedFrame {
    frame_number: u64,
    timestamp_ms: i64,
    regions: Vec<EncodedRegion>,
}

/// Everything a pipeline needs from the outside.
pub struct PipelineContext {
    pub service: Arc<ScreenshotService>,
    pub encoder: Arc<FrameEncoder>,
    pub connection: Arc<Connection>,
    /// Shared target FPS, mutable at runtime.
    pub target_fps: Arc<AtomicU32>,
}

/// One running grab/encode/send triple.
pub struct CapturePipeline {
    display: DisplayInfo,
    cancel: CancellationToken,
    faulted: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CapturePipeline {
    /// Spawn the three tasks for `display`.
    #[must_use]
    pub fn start(display: DisplayInfo, ctx: &PipelineContext) -> Self {
        let cancel = CancellationToken::new();
        let faulted = Arc::new(AtomicBool::new(false));

        let (captured_tx, captured_rx) = slot::channel::<CapturedFrame>();
        let (encoded_tx, encoded_rx) = slot::channel::<EncodedFrame>();

        let capture = tokio::spawn(capture_loop(
            display.clone(),
            Arc::clone(&ctx.service),
            Arc::clone(&ctx.target_fps),
            captured_tx,
            cancel.clone(),
        ));
        let encode = tokio::spawn(encode_loop(
            display.clone(),
            Arc::clone(&ctx.encoder),
            captured_rx,
            encoded_tx,
            Arc::clone(&faulted),
            cancel.clone(),
        ));
        let send = tokio::spawn(send_loop(
            display.clone(),
            Arc::clone(&ctx.connection),
            ctx.encoder.quality(),
            encoded_rx,
            Arc::clone(&faulted),
            cancel.clone(),
        ));

        let display_id = &display.id;
        tracing::info!(display = %display_id, "Capture pipeline started");
        Self {
            display,
            cancel,
            faulted,
            tasks: Mutex::new(vec![capture, encode, send]),
        }
    }

    #[must_use]
    pub fn display_id(&self) -> &str {
        &self.display.id
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        if self.faulted.load(Ordering::Acquire) {
            PipelineState::Faulted
        } else if self.cancel.is_cancelled() {
            PipelineState::Stopped
        } else {
            PipelineState::Running
        }
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Cancel and join all three tasks. Items still sitting in the
    /// stage channels are dropped with them, which releases their
    /// pooled buffers.
    pub async fn dispose(self) {
        self.cancel.cancel();
        let tasks = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        let display_id = &self.display.id;
        for task in tasks {
            if tokio::time::timeout(DISPOSE_TIMEOUT, task).await.is_err() {
                tracing::warn!(display = %display_id, "Pipeline task did not exit in time");
            }
        }
        tracing::info!(display = %display_id, "Capture pipeline disposed");
    }
}

async fn capture_loop(
    display: DisplayInfo,
    service: Arc<ScreenshotService>,
    target_fps: Arc<AtomicU32>,
    out: slot::SlotSender<CapturedFrame>,
    cancel: CancellationToken,
) {
    let mut frame_number: u64 = 0;
    let display_id = display.id.clone();

    while !cancel.is_cancelled() {
        let started = Instant::now();

        match service.capture(&display).await {
            GrabResult::Success(content) => {
                let frame = CapturedFrame {
                    frame_number,
                    content,
                };
                frame_number += 1;
                match out.send(frame) {
                    Ok(None) => {}
                    Ok(Some(displaced)) => {
                        tracing::debug!(
                            display = %display_id,
                            frame = displaced.frame_number,
                            "Captured frame displaced before encode"
                        );
                    }
                    Err(_refused) => break,
                }
            }
            GrabResult::NoChanges => {
                tokio::select! {
                    () = tokio::time::sleep(NO_CHANGES_DELAY) => {}
                    () = cancel.cancelled() => break,
                }
            }
            GrabResult::Failed => {
                tokio::select! {
                    () = tokio::time::sleep(FAILURE_DELAY) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }

        let fps = target_fps.load(Ordering::Relaxed).max(1);
        let interval = Duration::from_millis(1000 / u64::from(fps));
        sleep_until_precise(started + interval, &cancel).await;
    }

    out.close();
    tracing::debug!(display = %display_id, "Capture loop exited");
}

async fn encode_loop(
    display: DisplayInfo,
    encoder: Arc<FrameEncoder>,
    mut input: slot::SlotReceiver<CapturedFrame>,
    out: slot::SlotSender<EncodedFrame>,
    faulted: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let display_id = display.id.clone();
    loop {
        let captured = tokio::select! {
            captured = input.recv() => match captured {
                Some(captured) => captured,
                None => break,
            },
            () = cancel.cancelled() => break,
        };

        let regions =
            match encoder.process_frame(captured.content, display.width(), display.height()) {
                Ok(regions) => regions,
                Err(e) => {
                    tracing::error!(display = %display_id, "Encode failed: {e}");
                    faulted.store(true, Ordering::Release);
                    break;
                }
            };
        if regions.is_empty() {
            continue;
        }

        #[allow(clippy::cast_possible_truncation)]
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let frame = EncodedFrame {
            frame_number: captured.frame_number,
            timestamp_ms,
            regions,
        };
        match out.send(frame) {
            Ok(None) => {}
            Ok(Some(displaced)) => {
                tracing::debug!(
                    display = %display_id,
                    frame = displaced.frame_number,
                    "Encoded frame displaced before send"
                );
            }
            Err(_refused) => break,
        }
    }

    out.close();
    input.close();
    tracing::debug!(display = %display_id, "Encode loop exited");
}

async fn send_loop(
    display: DisplayInfo,
    connection: Arc<Connection>,
    quality: u8,
    mut input: slot::SlotReceiver<EncodedFrame>,
    faulted: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let display_id = display.id.clone();
    let mut rate = RateTracker::new(Duration::from_secs(5));
    let mut last_rate_log = Instant::now();

    loop {
        let encoded = tokio::select! {
            encoded = input.recv() => match encoded {
                Some(encoded) => encoded,
                None => break,
            },
            () = cancel.cancelled() => break,
        };

        let regions: Vec<TileRegion> = encoded
            .regions
            .iter()
            .map(|r: &EncodedRegion| TileRegion {
                is_keyframe: r.is_keyframe,
                x: r.x,
                y: r.y,
                w: r.w,
                h: r.h,
                jpeg: r.jpeg.as_slice().to_vec(),
            })
            .collect();
        let payload: usize = regions.iter().map(|r| r.jpeg.len()).sum();

        let frame = FrameMessage {
            display_id: display.id.clone(),
            frame_number: encoded.frame_number,
            timestamp_ms: encoded.timestamp_ms,
            codec: FrameCodec::Jpeg,
            width: display.width(),
            height: display.height(),
            quality,
            regions,
        };

        match connection.send_frame(frame).await {
            Ok(()) => {
                rate.record(payload);
                if last_rate_log.elapsed() >= Duration::from_secs(5) {
                    tracing::debug!(
                        display = %display_id,
                        bytes_per_s = rate.bytes_per_second() as u64,
                        "Frame bandwidth"
                    );
                    last_rate_log = Instant::now();
                }
            }
            Err(ConnectionError::Closed) => break,
            Err(e) => {
                tracing::error!(display = %display_id, "Frame send failed: {e}");
                faulted.store(true, Ordering::Release);
                break;
            }
        }
    }

    input.close();
    tracing::debug!(display = %display_id, "Send loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use glimpse_capture::frame::Rect;
    use glimpse_capture::grabber::ScreenGrabber;
    use glimpse_capture::pool::BufferPool;
    use glimpse_protocol::connection::MessageOutlet;
    use glimpse_protocol::messages::{
        decode_message, ChannelMessage, ClientId, MessageDestination, MessageKind,
    };
    use glimpse_protocol::rpc::{ConnectionInfo, ParticipantInfo};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn display() -> DisplayInfo {
        DisplayInfo {
            id: "d0".into(),
            friendly_name: "Test".into(),
            is_primary: true,
            bounds: Rect::from_size(0, 0, 32, 32),
        }
    }

    /// Grabber producing a solid full frame every capture.
    struct SolidGrabber {
        pool: Arc<BufferPool>,
        captures: AtomicUsize,
        fail_from: Option<usize>,
    }

    #[async_trait]
    impl ScreenGrabber for SolidGrabber {
        fn priority(&self) -> i32 {
            50
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn capture(&self, display: &DisplayInfo, _force: bool) -> GrabResult {
            let n = self.captures.fetch_add(1, Ordering::SeqCst);
            if self.fail_from.is_some_and(|from| n >= from) {
                return GrabResult::Failed;
            }
            let len = (display.width() * display.height()) as usize * 4;
            let mut buf = self.pool.rent(len);
            #[allow(clippy::cast_possible_truncation)]
            buf.as_mut_slice().unwrap().fill(n as u8);
            GrabResult::Success(GrabContent::FullFrame(buf))
        }
    }

    /// Outlet capturing decoded frame messages.
    #[derive(Default)]
    struct FrameCollector {
        frames: Mutex<Vec<FrameMessage>>,
    }

    #[async_trait]
    impl MessageOutlet for FrameCollector {
        async fn send_message(
            &self,
            _connection_id: &str,
            kind: MessageKind,
            data: Vec<u8>,
            _destination: MessageDestination,
            _targets: Option<Vec<ClientId>>,
        ) -> Result<(), ConnectionError> {
            if kind == MessageKind::ScreenFrame {
                if let Ok(ChannelMessage::ScreenFrame(frame)) = decode_message(&data) {
                    self.frames.lock().unwrap().push(frame);
                }
            }
            Ok(())
        }
    }

    fn watching_connection(outlet: Arc<FrameCollector>) -> Arc<Connection> {
        let (connection, _events) = Connection::presenter("s1".into(), "c1".into(), outlet);
        connection.apply_connection_info(&ConnectionInfo {
            connection_id: "s1".into(),
            presenter: ParticipantInfo {
                client_id: "c1".into(),
                display_name: "Host".into(),
            },
            viewers: vec![ParticipantInfo {
                client_id: "c2".into(),
                display_name: "Guest".into(),
            }],
            properties: HashMap::new(),
        });
        let select = glimpse_protocol::messages::encode_message(&ChannelMessage::DisplaySelect {
            display_id: "d0".into(),
        })
        .unwrap();
        connection.handle_message("c2", &select);
        connection
    }

    fn context(grabber: Arc<dyn ScreenGrabber>, outlet: Arc<FrameCollector>) -> PipelineContext {
        let pool = BufferPool::new();
        PipelineContext {
            service: Arc::new(ScreenshotService::new(vec![grabber])),
            encoder: Arc::new(FrameEncoder::new(75, pool)),
            connection: watching_connection(outlet),
            target_fps: Arc::new(AtomicU32::new(60)),
        }
    }

    #[tokio::test]
    async fn frames_flow_end_to_end_with_increasing_numbers() {
        let pool = BufferPool::new();
        let grabber = Arc::new(SolidGrabber {
            pool,
            captures: AtomicUsize::new(0),
            fail_from: None,
        });
        let outlet = Arc::new(FrameCollector::default());
        let ctx = context(grabber, Arc::clone(&outlet));

        let pipeline = CapturePipeline::start(display(), &ctx);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if outlet.frames.lock().unwrap().len() >= 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("frames did not arrive");
        assert_eq!(pipeline.state(), PipelineState::Running);
        pipeline.dispose().await;

        let frames = outlet.frames.lock().unwrap();
        // Monotonically increasing frame numbers, first one is zero and
        // a keyframe (the service forces it).
        assert_eq!(frames[0].frame_number, 0);
        assert!(frames[0].regions[0].is_keyframe);
        assert!(frames.windows(2).all(|w| w[0].frame_number < w[1].frame_number));
        assert!(frames.iter().all(|f| f.codec == FrameCodec::Jpeg));
    }

    #[tokio::test]
    async fn dispose_stops_all_tasks_quickly() {
        let pool = BufferPool::new();
        let grabber = Arc::new(SolidGrabber {
            pool,
            captures: AtomicUsize::new(0),
            fail_from: None,
        });
        let outlet = Arc::new(FrameCollector::default());
        let ctx = context(grabber, outlet);

        let pipeline = CapturePipeline::start(display(), &ctx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        pipeline.dispose().await;
        assert!(started.elapsed() < DISPOSE_TIMEOUT);
    }

    #[tokio::test]
    async fn failing_grabs_do_not_fault_the_pipeline() {
        let pool = BufferPool::new();
        let grabber = Arc::new(SolidGrabber {
            pool,
            captures: AtomicUsize::new(0),
            fail_from: Some(2),
        });
        let outlet = Arc::new(FrameCollector::default());
        let ctx = context(grabber, Arc::clone(&outlet));

        let pipeline = CapturePipeline::start(display(), &ctx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Grab failures are transient: retried with a short delay.
        assert_eq!(pipeline.state(), PipelineState::Running);
        pipeline.dispose().await;
        assert!(!outlet.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_connection_ends_the_send_loop_cleanly() {
        let pool = BufferPool::new();
        let grabber = Arc::new(SolidGrabber {
            pool,
            captures: AtomicUsize::new(0),
            fail_from: None,
        });
        let outlet = Arc::new(FrameCollector::default());
        let ctx = context(grabber, Arc::clone(&outlet));

        let pipeline = CapturePipeline::start(display(), &ctx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.connection.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Closed connection is a clean stop, not a fault.
        assert!(!pipeline.is_faulted());
        pipeline.dispose().await;
    }
}
