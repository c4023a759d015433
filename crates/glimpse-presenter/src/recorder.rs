//! Privileged recorder grabber.
//!
//! When a system recorder service owns the desktop (elevated session,
//! secure desktop access), capture and input injection are delegated
//! to it over the session pipe. Pixels normally travel inline; with a
//! shared-memory region mapped, full frames cross the process boundary
//! at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use glimpse_capture::buffer::SharedBuffer;
use glimpse_capture::frame::{
    DirtyRegion, DisplayInfo, GrabContent, GrabResult, MoveRegion, BYTES_PER_PIXEL,
};
use glimpse_capture::grabber::ScreenGrabber;
use glimpse_capture::pool::BufferPool;
use glimpse_protocol::framing::frame_duplex;
use glimpse_protocol::ipc::{RecorderGrab, RecorderRequest, RecorderResponse};
use glimpse_protocol::messages::{CodecError, DisplayDescriptor, KeyModifiers, MouseButton};

pub const RECORDER_PRIORITY: i32 = 200;

/// A connected request/response channel to the recorder.
#[async_trait]
pub trait RecorderChannel: Send + Sync {
    async fn call(&self, request: RecorderRequest) -> Result<RecorderResponse, CodecError>;
}

/// [`RecorderChannel`] over any duplex byte stream (the session pipe).
/// Calls serialize through one lock, matching the pipe's one-request-
/// at-a-time framing.
pub struct PipeRecorderChannel<T> {
    framed: Mutex<Framed<T, LengthDelimitedCodec>>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PipeRecorderChannel<T> {
    pub fn new(io: T) -> Self {
        Self {
            framed: Mutex::new(frame_duplex(io)),
        }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RecorderChannel for PipeRecorderChannel<T> {
    async fn call(&self, request: RecorderRequest) -> Result<RecorderResponse, CodecError> {
        let mut framed = self.framed.lock().await;
        let bytes = bincode::serialize(&request)?;
        framed.send(bytes.into()).await?;
        match framed.next().await {
            Some(frame) => Ok(bincode::deserialize(&frame?)?),
            None => Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "recorder pipe closed",
            ))),
        }
    }
}

/// Resolver for shared-memory frame tokens.
pub trait SharedFrameMap: Send + Sync {
    /// Copy the frame addressed by `token` into `dest`; `false` when
    /// the token is unknown or the region is gone.
    fn copy_frame(&self, token: &str, dest: &mut [u8]) -> bool;
}

/// Grabber delegating to the recorder service.
pub struct RecorderGrabber {
    channel: Arc<dyn RecorderChannel>,
    pool: Arc<BufferPool>,
    shared: Option<Arc<dyn SharedFrameMap>>,
    healthy: AtomicBool,
    /// Negotiated shared-memory token per display; `None` means the
    /// recorder answered "no shared region for this display".
    tokens: std::sync::Mutex<std::collections::HashMap<String, Option<String>>>,
}

impl RecorderGrabber {
    #[must_use]
    pub fn new(
        channel: Arc<dyn RecorderChannel>,
        pool: Arc<BufferPool>,
        shared: Option<Arc<dyn SharedFrameMap>>,
    ) -> Self {
        Self {
            channel,
            pool,
            shared,
            healthy: AtomicBool::new(true),
            tokens: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Fetch the recorder's display list.
    pub async fn displays(&self) -> Result<Vec<DisplayDescriptor>, CodecError> {
        match self.channel.call(RecorderRequest::GetDisplays).await? {
            RecorderResponse::Displays(displays) => Ok(displays),
            RecorderResponse::Error { message } => {
                tracing::warn!(%message, "Recorder refused GetDisplays");
                Ok(Vec::new())
            }
            other => {
                tracing::warn!(?other, "Unexpected recorder response to GetDisplays");
                Ok(Vec::new())
            }
        }
    }

    fn negotiated_token(&self, display_id: &str) -> Option<Option<String>> {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(display_id)
            .cloned()
    }

    fn store_token(&self, display_id: &str, token: Option<String>) {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(display_id.to_string(), token);
    }

    /// Negotiate the display's shared-memory token once; captures may
    /// then deliver `FullShared` frames carrying it.
    async fn ensure_token(&self, display_id: &str) {
        if self.negotiated_token(display_id).is_some() {
            return;
        }
        let request = RecorderRequest::GetSharedMemoryToken {
            display_id: display_id.to_string(),
        };
        match self.channel.call(request).await {
            Ok(RecorderResponse::SharedMemoryToken { token }) => {
                tracing::info!(display = %display_id, ?token, "Shared-memory token negotiated");
                self.store_token(display_id, token);
            }
            Ok(RecorderResponse::Error { message }) => {
                tracing::warn!(display = %display_id, %message, "Shared-memory negotiation refused");
                self.store_token(display_id, None);
            }
            Ok(other) => {
                tracing::warn!(?other, "Unexpected recorder response to GetSharedMemoryToken");
                self.store_token(display_id, None);
            }
            Err(e) => {
                // Leave the slot empty; the capture call below surfaces
                // the dead pipe.
                tracing::warn!(display = %display_id, "Shared-memory negotiation failed: {e}");
            }
        }
    }

    fn inline_buffer(&self, pixels: &[u8]) -> SharedBuffer {
        let mut buf = self.pool.rent(pixels.len());
        buf.as_mut_slice()
            .expect("freshly rented buffer is unique")
            .copy_from_slice(pixels);
        buf
    }

    fn grab_to_result(&self, display: &DisplayInfo, grab: RecorderGrab) -> GrabResult {
        match grab {
            RecorderGrab::Full {
                width,
                height,
                pixels,
            } => {
                if pixels.len() != (width * height) as usize * BYTES_PER_PIXEL {
                    tracing::warn!(width, height, "Recorder full frame has wrong length");
                    return GrabResult::Failed;
                }
                GrabResult::Success(GrabContent::FullFrame(self.inline_buffer(&pixels)))
            }
            RecorderGrab::FullShared {
                width,
                height,
                token,
            } => {
                let Some(shared) = &self.shared else {
                    tracing::warn!("Recorder offered shared frame but no region is mapped");
                    return GrabResult::Failed;
                };
                // Only tokens from this display's negotiation are
                // trusted into the shared region.
                if self.negotiated_token(&display.id).flatten().as_deref() != Some(token.as_str())
                {
                    let display_id = &display.id;
                    tracing::warn!(token, display = %display_id, "Unnegotiated shared token");
                    return GrabResult::Failed;
                }
                let len = (width * height) as usize * BYTES_PER_PIXEL;
                let mut buf = self.pool.rent(len);
                let ok = shared.copy_frame(
                    &token,
                    buf.as_mut_slice().expect("freshly rented buffer is unique"),
                );
                if !ok {
                    tracing::warn!(token, "Shared frame token did not resolve");
                    return GrabResult::Failed;
                }
                GrabResult::Success(GrabContent::FullFrame(buf))
            }
            RecorderGrab::Regions { dirty, moves } => {
                let mut regions = Vec::with_capacity(dirty.len());
                for r in dirty {
                    if r.pixels.len() != (r.w * r.h) as usize * BYTES_PER_PIXEL {
                        tracing::warn!(r.w, r.h, "Recorder region has wrong length");
                        return GrabResult::Failed;
                    }
                    regions.push(DirtyRegion {
                        x: r.x,
                        y: r.y,
                        w: r.w,
                        h: r.h,
                        pixels: self.inline_buffer(&r.pixels),
                    });
                }
                GrabResult::Success(GrabContent::Regions {
                    dirty: regions,
                    moves: moves
                        .into_iter()
                        .map(|m| MoveRegion {
                            src_x: m.src_x,
                            src_y: m.src_y,
                            dst_x: m.dst_x,
                            dst_y: m.dst_y,
                            w: m.w,
                            h: m.h,
                        })
                        .collect(),
                })
            }
            RecorderGrab::NoChanges => GrabResult::NoChanges,
            RecorderGrab::Failed => GrabResult::Failed,
        }
    }
}

#[async_trait]
impl ScreenGrabber for RecorderGrabber {
    fn priority(&self) -> i32 {
        RECORDER_PRIORITY
    }

    fn is_available(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    async fn capture(&self, display: &DisplayInfo, force_keyframe: bool) -> GrabResult {
        if self.shared.is_some() {
            self.ensure_token(&display.id).await;
        }

        let request = RecorderRequest::CaptureDisplay {
            display_id: display.id.clone(),
            force_keyframe,
        };
        match self.channel.call(request).await {
            Ok(RecorderResponse::Capture(grab)) => self.grab_to_result(display, grab),
            Ok(RecorderResponse::Error { message }) => {
                let display_id = &display.id;
                tracing::warn!(display = %display_id, %message, "Recorder refused the capture");
                GrabResult::Failed
            }
            Ok(other) => {
                tracing::warn!(?other, "Unexpected recorder response to CaptureDisplay");
                GrabResult::Failed
            }
            Err(e) => {
                // A dead pipe disables the grabber; lower-priority
                // backends take over on the next service call.
                let display_id = &display.id;
                tracing::warn!(display = %display_id, "Recorder call failed: {e}");
                self.healthy.store(false, Ordering::Release);
                GrabResult::Failed
            }
        }
    }
}

/// Input sink forwarding to the recorder (used when the recorder owns
/// the desktop; injection happens in its session).
pub struct RecorderInputSink {
    channel: Arc<dyn RecorderChannel>,
    display_id: std::sync::Mutex<String>,
}

impl RecorderInputSink {
    #[must_use]
    pub fn new(channel: Arc<dyn RecorderChannel>) -> Self {
        Self {
            channel,
            display_id: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set_display(&self, display_id: &str) {
        *self
            .display_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = display_id.to_string();
    }

    fn display(&self) -> String {
        self.display_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn fire(&self, request: RecorderRequest) {
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move {
            match channel.call(request).await {
                Ok(RecorderResponse::Ack) => {}
                Ok(RecorderResponse::Error { message }) => {
                    tracing::debug!(%message, "Recorder rejected an input event");
                }
                Ok(other) => {
                    tracing::warn!(?other, "Unexpected recorder response to an input event");
                }
                Err(e) => {
                    tracing::debug!("Recorder input call failed: {e}");
                }
            }
        });
    }

    /// Ctrl+Alt+Del on the recorded session.
    pub fn send_secure_attention(&self) {
        self.fire(RecorderRequest::SendSecureAttentionSequence);
    }
}

impl glimpse_input::InputSink for RecorderInputSink {
    fn mouse_move(&self, x: i32, y: i32) {
        #[allow(clippy::cast_precision_loss)]
        self.fire(RecorderRequest::InjectMouseMove {
            display_id: self.display(),
            x: x as f32,
            y: y as f32,
        });
    }

    fn mouse_button(&self, button: MouseButton, pressed: bool, x: i32, y: i32) {
        #[allow(clippy::cast_precision_loss)]
        self.fire(RecorderRequest::InjectMouseButton {
            display_id: self.display(),
            button,
            pressed,
            x: x as f32,
            y: y as f32,
        });
    }

    fn mouse_wheel(&self, dx: f32, dy: f32, x: i32, y: i32) {
        #[allow(clippy::cast_precision_loss)]
        self.fire(RecorderRequest::InjectMouseWheel {
            display_id: self.display(),
            dx,
            dy,
            x: x as f32,
            y: y as f32,
        });
    }

    fn key(&self, scan_code: u16, extended: bool, modifiers: KeyModifiers, pressed: bool) {
        self.fire(RecorderRequest::InjectKey {
            key_code: 0,
            modifiers,
            pressed,
            scan_code: Some(scan_code),
            is_extended: Some(extended),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glimpse_capture::frame::Rect;
    use glimpse_protocol::ipc::RecorderRegion;

    struct ScriptedChannel {
        responses: Mutex<Vec<RecorderResponse>>,
    }

    #[async_trait]
    impl RecorderChannel for ScriptedChannel {
        async fn call(&self, _request: RecorderRequest) -> Result<RecorderResponse, CodecError> {
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Err(CodecError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe gone",
                )));
            }
            Ok(responses.remove(0))
        }
    }

    fn display() -> DisplayInfo {
        DisplayInfo {
            id: "d0".into(),
            friendly_name: "Test".into(),
            is_primary: true,
            bounds: Rect::from_size(0, 0, 8, 8),
        }
    }

    fn grabber(responses: Vec<RecorderResponse>) -> RecorderGrabber {
        RecorderGrabber::new(
            Arc::new(ScriptedChannel {
                responses: Mutex::new(responses),
            }),
            BufferPool::new(),
            None,
        )
    }

    #[tokio::test]
    async fn inline_full_frame_is_pooled() {
        let g = grabber(vec![RecorderResponse::Capture(RecorderGrab::Full {
            width: 8,
            height: 8,
            pixels: vec![0x55; 8 * 8 * 4],
        })]);
        match g.capture(&display(), true).await {
            GrabResult::Success(GrabContent::FullFrame(buf)) => {
                assert_eq!(buf.len(), 8 * 8 * 4);
                assert!(buf.as_slice().iter().all(|&b| b == 0x55));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn region_grabs_map_to_dirty_regions() {
        let g = grabber(vec![RecorderResponse::Capture(RecorderGrab::Regions {
            dirty: vec![RecorderRegion {
                x: 2,
                y: 2,
                w: 2,
                h: 2,
                pixels: vec![1; 2 * 2 * 4],
            }],
            moves: vec![],
        })]);
        match g.capture(&display(), false).await {
            GrabResult::Success(GrabContent::Regions { dirty, .. }) => {
                assert_eq!(dirty.len(), 1);
                assert_eq!(dirty[0].pixels.len(), 16);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn shared_frame_without_mapping_fails() {
        let g = grabber(vec![RecorderResponse::Capture(RecorderGrab::FullShared {
            width: 8,
            height: 8,
            token: "shm-1".into(),
        })]);
        assert!(matches!(g.capture(&display(), true).await, GrabResult::Failed));
    }

    struct OneToken;

    impl SharedFrameMap for OneToken {
        fn copy_frame(&self, token: &str, dest: &mut [u8]) -> bool {
            if token != "shm-1" {
                return false;
            }
            dest.fill(0x77);
            true
        }
    }

    fn shared_grabber(responses: Vec<RecorderResponse>) -> RecorderGrabber {
        RecorderGrabber::new(
            Arc::new(ScriptedChannel {
                responses: Mutex::new(responses),
            }),
            BufferPool::new(),
            Some(Arc::new(OneToken)),
        )
    }

    #[tokio::test]
    async fn shared_frame_resolves_through_the_negotiated_token() {
        // The grabber negotiates the token first, then captures.
        let g = shared_grabber(vec![
            RecorderResponse::SharedMemoryToken {
                token: Some("shm-1".into()),
            },
            RecorderResponse::Capture(RecorderGrab::FullShared {
                width: 8,
                height: 8,
                token: "shm-1".into(),
            }),
        ]);
        match g.capture(&display(), true).await {
            GrabResult::Success(GrabContent::FullFrame(buf)) => {
                assert!(buf.as_slice().iter().all(|&b| b == 0x77));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unnegotiated_shared_token_is_rejected() {
        // The recorder denied a shared region, then offers a shared
        // frame anyway: the token is not trusted.
        let g = shared_grabber(vec![
            RecorderResponse::SharedMemoryToken { token: None },
            RecorderResponse::Capture(RecorderGrab::FullShared {
                width: 8,
                height: 8,
                token: "shm-1".into(),
            }),
        ]);
        assert!(matches!(g.capture(&display(), true).await, GrabResult::Failed));
    }

    #[tokio::test]
    async fn token_negotiation_happens_once_per_display() {
        let g = shared_grabber(vec![
            RecorderResponse::SharedMemoryToken {
                token: Some("shm-1".into()),
            },
            RecorderResponse::Capture(RecorderGrab::NoChanges),
            // Second capture must not renegotiate: the next scripted
            // response is the capture itself.
            RecorderResponse::Capture(RecorderGrab::NoChanges),
        ]);
        let d = display();
        assert!(matches!(g.capture(&d, false).await, GrabResult::NoChanges));
        assert!(matches!(g.capture(&d, false).await, GrabResult::NoChanges));
    }

    #[tokio::test]
    async fn error_response_fails_the_grab_but_keeps_the_pipe() {
        let g = grabber(vec![RecorderResponse::Error {
            message: "display detached".into(),
        }]);
        assert!(matches!(g.capture(&display(), false).await, GrabResult::Failed));
        // An application-level refusal is not a dead pipe.
        assert!(g.is_available());
    }

    #[tokio::test]
    async fn dead_pipe_marks_the_grabber_unavailable() {
        let g = grabber(vec![]);
        assert!(g.is_available());
        assert!(matches!(g.capture(&display(), false).await, GrabResult::Failed));
        assert!(!g.is_available());
    }

    #[tokio::test]
    async fn pipe_channel_round_trips_over_a_stream() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);

        // Fake recorder answering one capture.
        tokio::spawn(async move {
            let mut framed = frame_duplex(theirs);
            let frame = framed.next().await.unwrap().unwrap();
            let request: RecorderRequest = bincode::deserialize(&frame).unwrap();
            assert!(matches!(request, RecorderRequest::CaptureDisplay { .. }));
            let response = RecorderResponse::Capture(RecorderGrab::NoChanges);
            framed
                .send(bincode::serialize(&response).unwrap().into())
                .await
                .unwrap();
        });

        let channel = PipeRecorderChannel::new(ours);
        let response = channel
            .call(RecorderRequest::CaptureDisplay {
                display_id: "d0".into(),
                force_keyframe: false,
            })
            .await
            .unwrap();
        assert_eq!(response, RecorderResponse::Capture(RecorderGrab::NoChanges));
    }
}
