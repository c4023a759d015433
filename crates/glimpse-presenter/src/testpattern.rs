//! Synthetic frame source.
//!
//! Stands in for the OS capture primitive when none is wired up (CI,
//! headless smoke tests, unsupported platforms): a gradient with a
//! moving band, so diffs and keyframes both have something to chew on.

use std::sync::atomic::{AtomicU64, Ordering};

use glimpse_capture::cpu::{FrameSource, FrameSourceError};
use glimpse_capture::frame::{DisplayInfo, Rect, BYTES_PER_PIXEL};

/// Gradient frame source with a band that advances every capture.
#[derive(Default)]
pub struct TestPatternSource {
    tick: AtomicU64,
}

impl TestPatternSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The single display this source exposes.
    #[must_use]
    pub fn display() -> DisplayInfo {
        DisplayInfo {
            id: "pattern-0".to_string(),
            friendly_name: "Test Pattern".to_string(),
            is_primary: true,
            bounds: Rect::from_size(0, 0, 1280, 720),
        }
    }
}

impl FrameSource for TestPatternSource {
    fn capture_frame(
        &self,
        display: &DisplayInfo,
        dest: &mut [u8],
    ) -> Result<(), FrameSourceError> {
        let width = display.width() as usize;
        let height = display.height() as usize;
        if dest.len() != width * height * BYTES_PER_PIXEL {
            return Err(FrameSourceError::Backend(format!(
                "destination size {} does not match {}x{}",
                dest.len(),
                width,
                height
            )));
        }

        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let band = (tick as usize * 4) % height;

        for y in 0..height {
            let in_band = y >= band && y < band + 16;
            for x in 0..width {
                let px = (y * width + x) * BYTES_PER_PIXEL;
                if in_band {
                    dest[px] = 0x20;
                    dest[px + 1] = 0x20;
                    dest[px + 2] = 0xE0;
                } else {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        dest[px] = (x * 255 / width) as u8;
                        dest[px + 1] = (y * 255 / height) as u8;
                        dest[px + 2] = 0x30;
                    }
                }
                dest[px + 3] = 0xFF;
            }
        }
        Ok(())
    }
}
