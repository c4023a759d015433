//! CPU full-frame grabber with software change detection.
//!
//! Always copies the whole frame from the OS frame source, then diffs
//! it against the previously captured frame to report changed regions
//! only. The fallback when no GPU duplication backend is available.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::buffer::SharedBuffer;
use crate::diff::diff_frames;
use crate::frame::{
    copy_region, DirtyRegion, DisplayInfo, GrabContent, GrabResult, BYTES_PER_PIXEL,
};
use crate::grabber::ScreenGrabber;
use crate::pool::BufferPool;

pub const CPU_PRIORITY: i32 = 50;

#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("display not found: {0}")]
    DisplayNotFound(String),
    #[error("frame source: {0}")]
    Backend(String),
}

/// OS primitive producing full frames (GDI, X11, Quartz, …).
///
/// `dest` is sized `width * height * 4`; implementations fill it with
/// tightly packed BGRA, top-to-bottom.
pub trait FrameSource: Send + Sync {
    fn capture_frame(
        &self,
        display: &DisplayInfo,
        dest: &mut [u8],
    ) -> Result<(), FrameSourceError>;
}

/// Full-frame grabber; keeps the previous frame per display for the
/// software diff.
pub struct CpuGrabber {
    source: Arc<dyn FrameSource>,
    pool: Arc<BufferPool>,
    previous: Mutex<HashMap<String, SharedBuffer>>,
}

impl CpuGrabber {
    #[must_use]
    pub fn new(source: Arc<dyn FrameSource>, pool: Arc<BufferPool>) -> Self {
        Self {
            source,
            pool,
            previous: Mutex::new(HashMap::new()),
        }
    }

    fn take_previous(&self, display_id: &str) -> Option<SharedBuffer> {
        self.previous
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(display_id)
            .cloned()
    }

    fn store_previous(&self, display_id: &str, frame: SharedBuffer) {
        self.previous
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(display_id.to_string(), frame);
    }

    /// Drop the remembered frame for a display (e.g. on resize).
    pub fn reset_display(&self, display_id: &str) {
        self.previous
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(display_id);
    }
}

#[async_trait]
impl ScreenGrabber for CpuGrabber {
    fn priority(&self) -> i32 {
        CPU_PRIORITY
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn capture(&self, display: &DisplayInfo, force_keyframe: bool) -> GrabResult {
        let width = display.width();
        let height = display.height();
        let frame_len = (width * height) as usize * BYTES_PER_PIXEL;

        let mut current = self.pool.rent(frame_len);
        {
            let dest = current.as_mut_slice().expect("freshly rented buffer is unique");
            if let Err(e) = self.source.capture_frame(display, dest) {
                let display_id = &display.id;
                tracing::warn!(display = %display_id, "CPU frame capture failed: {e}");
                return GrabResult::Failed;
            }
        }

        let previous = self.take_previous(&display.id);
        let previous = match (force_keyframe, previous) {
            (false, Some(prev)) if prev.len() == frame_len => prev,
            _ => {
                self.store_previous(&display.id, current.clone());
                return GrabResult::Success(GrabContent::FullFrame(current));
            }
        };

        match diff_frames(current.as_slice(), previous.as_slice(), width, height) {
            // Too much changed: cheaper to resend everything.
            None => {
                self.store_previous(&display.id, current.clone());
                GrabResult::Success(GrabContent::FullFrame(current))
            }
            Some(rects) if rects.is_empty() => GrabResult::NoChanges,
            Some(rects) => {
                let mut dirty = Vec::with_capacity(rects.len());
                for rect in rects {
                    let (w, h) = (rect.width(), rect.height());
                    let mut pixels = self.pool.rent((w * h) as usize * BYTES_PER_PIXEL);
                    copy_region(
                        current.as_slice(),
                        width,
                        rect,
                        pixels.as_mut_slice().expect("freshly rented buffer is unique"),
                    );
                    dirty.push(DirtyRegion {
                        x: rect.left as u32,
                        y: rect.top as u32,
                        w,
                        h,
                        pixels,
                    });
                }
                self.store_previous(&display.id, current);
                GrabResult::Success(GrabContent::Regions {
                    dirty,
                    moves: Vec::new(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rect;

    /// Frame source replaying a scripted sequence of frames.
    struct ScriptedSource {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(frames),
            })
        }
    }

    impl FrameSource for ScriptedSource {
        fn capture_frame(
            &self,
            _display: &DisplayInfo,
            dest: &mut [u8],
        ) -> Result<(), FrameSourceError> {
            let mut frames = self.frames.lock().unwrap();
            if frames.is_empty() {
                return Err(FrameSourceError::Backend("script exhausted".into()));
            }
            dest.copy_from_slice(&frames.remove(0));
            Ok(())
        }
    }

    fn display(width: u32, height: u32) -> DisplayInfo {
        DisplayInfo {
            id: "disp-0".into(),
            friendly_name: "Test".into(),
            is_primary: true,
            bounds: Rect::from_size(0, 0, width, height),
        }
    }

    fn solid(width: u32, height: u32, fill: u8) -> Vec<u8> {
        vec![fill; (width * height) as usize * BYTES_PER_PIXEL]
    }

    #[tokio::test]
    async fn first_capture_is_a_full_frame() {
        let source = ScriptedSource::new(vec![solid(64, 64, 1)]);
        let grabber = CpuGrabber::new(source, BufferPool::new());
        let result = grabber.capture(&display(64, 64), false).await;
        assert!(result.is_full_frame());
    }

    #[tokio::test]
    async fn unchanged_frame_reports_no_changes() {
        let source = ScriptedSource::new(vec![solid(64, 64, 1), solid(64, 64, 1)]);
        let grabber = CpuGrabber::new(source, BufferPool::new());
        let d = display(64, 64);
        grabber.capture(&d, false).await;
        assert!(matches!(grabber.capture(&d, false).await, GrabResult::NoChanges));
    }

    #[tokio::test]
    async fn local_change_yields_dirty_regions() {
        let base = solid(64, 64, 1);
        let mut changed = base.clone();
        changed[0] = 0xFF; // top-left block
        let source = ScriptedSource::new(vec![base, changed]);
        let grabber = CpuGrabber::new(source, BufferPool::new());
        let d = display(64, 64);
        grabber.capture(&d, false).await;

        match grabber.capture(&d, false).await {
            GrabResult::Success(GrabContent::Regions { dirty, .. }) => {
                assert_eq!(dirty.len(), 1);
                let r = &dirty[0];
                assert_eq!(r.pixels.len(), (r.w * r.h) as usize * BYTES_PER_PIXEL);
                assert_eq!(r.pixels.as_slice()[0], 0xFF);
            }
            other => panic!("expected regions, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wholesale_change_upgrades_to_full_frame() {
        let source = ScriptedSource::new(vec![solid(64, 64, 1), solid(64, 64, 2)]);
        let grabber = CpuGrabber::new(source, BufferPool::new());
        let d = display(64, 64);
        grabber.capture(&d, false).await;
        assert!(grabber.capture(&d, false).await.is_full_frame());
    }

    #[tokio::test]
    async fn forced_keyframe_skips_the_diff() {
        let source = ScriptedSource::new(vec![solid(64, 64, 1), solid(64, 64, 1)]);
        let grabber = CpuGrabber::new(source, BufferPool::new());
        let d = display(64, 64);
        grabber.capture(&d, false).await;
        assert!(grabber.capture(&d, true).await.is_full_frame());
    }

    #[tokio::test]
    async fn source_error_is_a_failed_grab() {
        let source = ScriptedSource::new(vec![]);
        let grabber = CpuGrabber::new(source, BufferPool::new());
        assert!(matches!(
            grabber.capture(&display(8, 8), false).await,
            GrabResult::Failed
        ));
    }
}
