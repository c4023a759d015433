//! GPU desktop-duplication grabber.
//!
//! The OS duplication primitive (DXGI output duplication and friends)
//! sits behind [`DuplicationBackend`]; this module owns everything
//! above it: zero-timeout acquire semantics, dirty/move rect queries
//! with fixed scratch capacity, tight BGRA extraction from pitched
//! surfaces, and self-reset on surface loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::buffer::SharedBuffer;
use crate::frame::{
    copy_region, DirtyRegion, DisplayInfo, GrabContent, GrabResult, MoveRegion, Rect,
    BYTES_PER_PIXEL,
};
use crate::grabber::ScreenGrabber;
use crate::pool::BufferPool;

/// Scratch capacity for dirty/move rect queries. A query needing more
/// entries reports [`DuplicationError::InsufficientBuffer`] and that
/// list is skipped for the frame.
pub const RECT_SCRATCH_LEN: usize = 100;

pub const DUPLICATION_PRIORITY: i32 = 100;

#[derive(Debug, Error)]
pub enum DuplicationError {
    /// The desktop surface was lost (mode switch, secure desktop, …).
    /// The per-display output must be recreated.
    #[error("duplication access lost")]
    AccessLost,
    /// The caller's scratch buffer cannot hold the rect list.
    #[error("rect list exceeds scratch capacity")]
    InsufficientBuffer,
    #[error("duplication backend: {0}")]
    Backend(String),
}

/// Metadata of an acquired frame.
#[derive(Debug, Clone, Copy)]
pub struct AcquiredFrame {
    /// Number of desktop updates accumulated since the last acquire.
    /// Zero means nothing changed within the zero timeout.
    pub accumulated_frames: u32,
}

/// A mapped view of the captured surface. `row_pitch` may exceed
/// `width * 4`; rows must be packed when extracting.
pub struct SurfaceView<'a> {
    pub data: &'a [u8],
    pub row_pitch: usize,
}

/// A move-rect as reported by the duplication primitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMoveRect {
    pub src_x: i32,
    pub src_y: i32,
    pub dest: Rect,
}

/// One open duplication stream for a single display.
pub trait DuplicationOutput: Send {
    /// Acquire the next frame with zero timeout.
    fn acquire_frame(&mut self) -> Result<AcquiredFrame, DuplicationError>;

    /// Copy the frame's dirty rects into `out`, returning the count.
    fn dirty_rects(&mut self, out: &mut [Rect]) -> Result<usize, DuplicationError>;

    /// Copy the frame's move rects into `out`, returning the count.
    fn move_rects(&mut self, out: &mut [RawMoveRect]) -> Result<usize, DuplicationError>;

    /// Map the current surface for reading. Valid until release.
    fn map_surface(&mut self) -> Result<SurfaceView<'_>, DuplicationError>;

    /// Release the acquired frame.
    fn release_frame(&mut self);
}

/// Factory for per-display duplication outputs.
pub trait DuplicationBackend: Send + Sync {
    /// Whether duplication is supported on this machine at all.
    fn is_supported(&self) -> bool;

    fn open(&self, display: &DisplayInfo) -> Result<Box<dyn DuplicationOutput>, DuplicationError>;
}

struct OutputSlot {
    output: Option<Box<dyn DuplicationOutput>>,
}

/// Grabber producing native dirty/move regions from the GPU
/// duplication primitive.
pub struct DuplicationGrabber {
    backend: Arc<dyn DuplicationBackend>,
    pool: Arc<BufferPool>,
    outputs: Mutex<HashMap<String, Arc<tokio::sync::Mutex<OutputSlot>>>>,
}

impl DuplicationGrabber {
    #[must_use]
    pub fn new(backend: Arc<dyn DuplicationBackend>, pool: Arc<BufferPool>) -> Self {
        Self {
            backend,
            pool,
            outputs: Mutex::new(HashMap::new()),
        }
    }

    fn slot_for(&self, display_id: &str) -> Arc<tokio::sync::Mutex<OutputSlot>> {
        let mut outputs = self.outputs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            outputs
                .entry(display_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(OutputSlot { output: None }))),
        )
    }

    /// Pack the full pitched surface into a tight BGRA buffer.
    fn copy_full_surface(
        &self,
        output: &mut dyn DuplicationOutput,
        width: u32,
        height: u32,
    ) -> Result<SharedBuffer, DuplicationError> {
        let row_bytes = width as usize * BYTES_PER_PIXEL;
        let mut buf = self.pool.rent(row_bytes * height as usize);
        {
            let surface = output.map_surface()?;
            let dest = buf.as_mut_slice().expect("freshly rented buffer is unique");
            if surface.row_pitch == row_bytes {
                dest.copy_from_slice(&surface.data[..dest.len()]);
            } else {
                for (row, dest_row) in dest.chunks_exact_mut(row_bytes).enumerate() {
                    let start = row * surface.row_pitch;
                    dest_row.copy_from_slice(&surface.data[start..start + row_bytes]);
                }
            }
        }
        Ok(buf)
    }

    fn extract_regions(
        &self,
        output: &mut dyn DuplicationOutput,
        display: &DisplayInfo,
        rects: &[Rect],
    ) -> Result<Vec<DirtyRegion>, DuplicationError> {
        let width = display.width();
        let height = display.height();
        let surface = output.map_surface()?;
        let pitch = surface.row_pitch;

        let mut regions = Vec::with_capacity(rects.len());
        for rect in rects {
            let rect = rect.clamp_to(width, height);
            if rect.is_empty() {
                continue;
            }
            let (w, h) = (rect.width(), rect.height());
            let mut pixels = self.pool.rent((w * h) as usize * BYTES_PER_PIXEL);
            {
                let dest = pixels.as_mut_slice().expect("freshly rented buffer is unique");
                if pitch == width as usize * BYTES_PER_PIXEL {
                    copy_region(surface.data, width, rect, dest);
                } else {
                    let row_bytes = w as usize * BYTES_PER_PIXEL;
                    for (row, dest_row) in dest.chunks_exact_mut(row_bytes).enumerate() {
                        let start = (rect.top as usize + row) * pitch
                            + rect.left as usize * BYTES_PER_PIXEL;
                        dest_row.copy_from_slice(&surface.data[start..start + row_bytes]);
                    }
                }
            }
            regions.push(DirtyRegion {
                x: rect.left as u32,
                y: rect.top as u32,
                w,
                h,
                pixels,
            });
        }
        Ok(regions)
    }

    fn capture_inner(
        &self,
        slot: &mut OutputSlot,
        display: &DisplayInfo,
        force_keyframe: bool,
    ) -> Result<GrabResult, DuplicationError> {
        if slot.output.is_none() {
            slot.output = Some(self.backend.open(display)?);
        }
        let output = slot.output.as_mut().expect("output opened above").as_mut();

        let acquired = output.acquire_frame()?;
        if acquired.accumulated_frames == 0 {
            output.release_frame();
            return Ok(GrabResult::NoChanges);
        }

        if force_keyframe {
            let result = self.copy_full_surface(output, display.width(), display.height());
            output.release_frame();
            return Ok(GrabResult::Success(GrabContent::FullFrame(result?)));
        }

        // A rect list that overflows the scratch is skipped; the empty
        // result makes the screenshot service schedule a keyframe.
        let mut dirty_scratch = [Rect::default(); RECT_SCRATCH_LEN];
        let dirty = match output.dirty_rects(&mut dirty_scratch) {
            Ok(n) => dirty_scratch[..n].to_vec(),
            Err(DuplicationError::InsufficientBuffer) => {
                let display_id = &display.id;
                tracing::debug!(display = %display_id, "Dirty rect list overflow, skipping");
                Vec::new()
            }
            Err(e) => {
                output.release_frame();
                return Err(e);
            }
        };

        let mut move_scratch = [RawMoveRect::default(); RECT_SCRATCH_LEN];
        let moves = match output.move_rects(&mut move_scratch) {
            Ok(n) => move_scratch[..n]
                .iter()
                .map(|m| MoveRegion {
                    src_x: m.src_x,
                    src_y: m.src_y,
                    dst_x: m.dest.left,
                    dst_y: m.dest.top,
                    w: m.dest.width(),
                    h: m.dest.height(),
                })
                .collect(),
            Err(DuplicationError::InsufficientBuffer) => {
                let display_id = &display.id;
                tracing::debug!(display = %display_id, "Move rect list overflow, skipping");
                Vec::new()
            }
            Err(e) => {
                output.release_frame();
                return Err(e);
            }
        };

        let regions = self.extract_regions(output, display, &dirty);
        output.release_frame();
        Ok(GrabResult::Success(GrabContent::Regions {
            dirty: regions?,
            moves,
        }))
    }
}

#[async_trait]
impl ScreenGrabber for DuplicationGrabber {
    fn priority(&self) -> i32 {
        DUPLICATION_PRIORITY
    }

    fn is_available(&self) -> bool {
        self.backend.is_supported()
    }

    async fn capture(&self, display: &DisplayInfo, force_keyframe: bool) -> GrabResult {
        let slot = self.slot_for(&display.id);
        let mut slot = slot.lock().await;
        match self.capture_inner(&mut slot, display, force_keyframe) {
            Ok(result) => result,
            Err(e) => {
                // Surface errors invalidate the output; recreate on the
                // next attempt.
                let display_id = &display.id;
                tracing::warn!(display = %display_id, "Duplication capture failed: {e}");
                slot.output = None;
                GrabResult::Failed
            }
        }
    }
}
