//! Frame compositing onto a persistent canvas.
//!
//! Keyframes replace the canvas (reallocating on size changes); delta
//! frames decode each JPEG tile into a pooled scratch buffer and blit
//! the clamped rectangle row by row. Stale deltas are rejected by the
//! frame-number watermark; keyframes are always accepted and reset it.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use glimpse_capture::buffer::SharedBuffer;
use glimpse_capture::frame::BYTES_PER_PIXEL;
use glimpse_capture::pool::BufferPool;
use glimpse_encode::jpeg::decode_bgra;
use glimpse_protocol::messages::{FrameMessage, TileRegion};

#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("jpeg tile failed to decode: {0}")]
    Decode(#[from] glimpse_encode::EncodeError),
    #[error("keyframe with no regions")]
    EmptyKeyframe,
    #[error("tile decoded to {actual_w}x{actual_h}, header says {header_w}x{header_h}")]
    TileSizeMismatch {
        header_w: u32,
        header_h: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

/// Border thickness of the debug overlay rectangles.
const OVERLAY_BORDER: u32 = 2;

struct State {
    canvas: Option<Canvas>,
    /// Highest frame number applied since the last keyframe.
    last_frame_number: Option<u64>,
    base_frame_number: Option<u64>,
    overlay: Option<Vec<u8>>,
}

/// Applies received frames onto a BGRA canvas.
pub struct FrameCompositor {
    pool: Arc<BufferPool>,
    debug_overlay: bool,
    state: Mutex<State>,
}

impl FrameCompositor {
    #[must_use]
    pub fn new(pool: Arc<BufferPool>, debug_overlay: bool) -> Self {
        Self {
            pool,
            debug_overlay,
            state: Mutex::new(State {
                canvas: None,
                last_frame_number: None,
                base_frame_number: None,
                overlay: None,
            }),
        }
    }

    /// Apply one frame; `Ok(false)` means it was dropped (stale delta
    /// or delta before any keyframe).
    pub fn apply_frame(&self, frame: &FrameMessage) -> Result<bool, CompositorError> {
        let is_keyframe = frame.regions.iter().any(|r| r.is_keyframe);
        if is_keyframe {
            self.apply_keyframe(&frame.regions, frame.frame_number)?;
            return Ok(true);
        }
        self.apply_delta(&frame.regions, frame.frame_number)
    }

    /// Replace canvas contents; the first region sizes the canvas.
    fn apply_keyframe(
        &self,
        regions: &[TileRegion],
        frame_number: u64,
    ) -> Result<(), CompositorError> {
        let first = regions.first().ok_or(CompositorError::EmptyKeyframe)?;
        let (width, height) = (first.w, first.h);

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let needs_alloc = state
            .canvas
            .as_ref()
            .is_none_or(|c| c.width != width || c.height != height);
        if needs_alloc {
            tracing::debug!(width, height, "Allocating canvas");
            state.canvas = Some(Canvas {
                width,
                height,
                pixels: vec![0; (width * height) as usize * BYTES_PER_PIXEL],
            });
            state.overlay = None;
        }

        for region in regions {
            let tile = self.decode_tile(region)?;
            let canvas = state.canvas.as_mut().expect("canvas allocated above");
            blit(canvas, region, tile.as_slice());
        }

        state.base_frame_number = Some(frame_number);
        state.last_frame_number = Some(frame_number);
        Ok(())
    }

    /// Blit delta regions; a no-op without a canvas.
    fn apply_delta(
        &self,
        regions: &[TileRegion],
        frame_number: u64,
    ) -> Result<bool, CompositorError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.canvas.is_none() {
            return Ok(false);
        }
        if state
            .last_frame_number
            .is_some_and(|last| frame_number <= last)
        {
            tracing::debug!(frame_number, "Stale delta dropped");
            return Ok(false);
        }

        if self.debug_overlay {
            clear_overlay(&mut state);
        }

        for region in regions {
            let tile = self.decode_tile(region)?;
            let canvas = state.canvas.as_mut().expect("checked above");
            blit(canvas, region, tile.as_slice());
            if self.debug_overlay {
                draw_overlay_border(&mut state, region);
            }
        }

        state.last_frame_number = Some(frame_number);
        Ok(true)
    }

    /// Decode a JPEG tile into a pooled scratch buffer.
    fn decode_tile(&self, region: &TileRegion) -> Result<SharedBuffer, CompositorError> {
        let (bgra, w, h) = decode_bgra(&region.jpeg)?;
        if (w, h) != (region.w, region.h) {
            return Err(CompositorError::TileSizeMismatch {
                header_w: region.w,
                header_h: region.h,
                actual_w: w,
                actual_h: h,
            });
        }
        let mut tile = self.pool.rent(bgra.len());
        tile.as_mut_slice()
            .expect("freshly rented buffer is unique")
            .copy_from_slice(&bgra);
        Ok(tile)
    }

    /// The applied keyframe's frame number, if any.
    #[must_use]
    pub fn base_frame_number(&self) -> Option<u64> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .base_frame_number
    }

    #[must_use]
    pub fn last_frame_number(&self) -> Option<u64> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .last_frame_number
    }

    /// Copy of the canvas as `(pixels, width, height)`.
    #[must_use]
    pub fn canvas_snapshot(&self) -> Option<(Vec<u8>, u32, u32)> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .canvas
            .as_ref()
            .map(|c| (c.pixels.clone(), c.width, c.height))
    }

    /// Copy of the debug overlay, when enabled and allocated.
    #[must_use]
    pub fn overlay_snapshot(&self) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .overlay
            .clone()
    }
}

/// Copy a decoded tile into the canvas, clamped to canvas bounds.
fn blit(canvas: &mut Canvas, region: &TileRegion, tile: &[u8]) {
    let x = region.x.min(canvas.width);
    let y = region.y.min(canvas.height);
    let w = region.w.min(canvas.width - x);
    let h = region.h.min(canvas.height - y);
    if w == 0 || h == 0 {
        return;
    }

    let tile_stride = region.w as usize * BYTES_PER_PIXEL;
    let canvas_stride = canvas.width as usize * BYTES_PER_PIXEL;
    let row_bytes = w as usize * BYTES_PER_PIXEL;

    for row in 0..h as usize {
        let src = row * tile_stride;
        let dst = (y as usize + row) * canvas_stride + x as usize * BYTES_PER_PIXEL;
        canvas.pixels[dst..dst + row_bytes].copy_from_slice(&tile[src..src + row_bytes]);
    }
}

fn clear_overlay(state: &mut State) {
    let Some(canvas) = state.canvas.as_ref() else { return };
    let len = (canvas.width * canvas.height) as usize * BYTES_PER_PIXEL;
    match state.overlay.as_mut() {
        Some(overlay) => overlay.fill(0),
        None => state.overlay = Some(vec![0; len]),
    }
}

/// 2-pixel red border around an applied rectangle.
fn draw_overlay_border(state: &mut State, region: &TileRegion) {
    let Some(canvas) = state.canvas.as_ref() else { return };
    let (cw, ch) = (canvas.width, canvas.height);
    let Some(overlay) = state.overlay.as_mut() else { return };

    let x0 = region.x.min(cw);
    let y0 = region.y.min(ch);
    let x1 = (region.x + region.w).min(cw);
    let y1 = (region.y + region.h).min(ch);

    let mut paint = |x: u32, y: u32| {
        let px = (y as usize * cw as usize + x as usize) * BYTES_PER_PIXEL;
        // BGRA red, opaque.
        overlay[px] = 0x00;
        overlay[px + 1] = 0x00;
        overlay[px + 2] = 0xFF;
        overlay[px + 3] = 0xFF;
    };

    for y in y0..y1 {
        let on_edge = y < y0 + OVERLAY_BORDER || y + OVERLAY_BORDER >= y1;
        for x in x0..x1 {
            if on_edge || x < x0 + OVERLAY_BORDER || x + OVERLAY_BORDER >= x1 {
                paint(x, y);
            }
        }
    }
}
