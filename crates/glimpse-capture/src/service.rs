//! Priority fan-out over the registered grabbers, plus per-display
//! keyframe scheduling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::frame::{DisplayInfo, GrabContent, GrabResult};
use crate::grabber::ScreenGrabber;

/// A keyframe is due at least this often.
pub const KEYFRAME_INTERVAL: Duration = Duration::from_millis(1000);

struct DisplayState {
    keyframe_timer: Instant,
    force_next_keyframe: bool,
}

impl DisplayState {
    fn new() -> Self {
        Self {
            keyframe_timer: Instant::now(),
            // A display's very first frame must be a keyframe.
            force_next_keyframe: true,
        }
    }
}

/// Delegates capture to grabbers in descending priority order and
/// decides when a full keyframe is due.
pub struct ScreenshotService {
    grabbers: Vec<Arc<dyn ScreenGrabber>>,
    displays: Mutex<HashMap<String, DisplayState>>,
}

impl ScreenshotService {
    /// Build from an unordered grabber set; sorted by priority here.
    #[must_use]
    pub fn new(mut grabbers: Vec<Arc<dyn ScreenGrabber>>) -> Self {
        grabbers.sort_by_key(|g| std::cmp::Reverse(g.priority()));
        Self {
            grabbers,
            displays: Mutex::new(HashMap::new()),
        }
    }

    /// Request that the next emitted frame be a keyframe. Idempotent.
    pub fn force_keyframe(&self, display_id: &str) {
        let mut displays = self.displays.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        displays
            .entry(display_id.to_string())
            .or_insert_with(DisplayState::new)
            .force_next_keyframe = true;
    }

    fn keyframe_due(&self, display_id: &str) -> bool {
        let mut displays = self.displays.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = displays
            .entry(display_id.to_string())
            .or_insert_with(DisplayState::new);
        state.force_next_keyframe || state.keyframe_timer.elapsed() >= KEYFRAME_INTERVAL
    }

    fn note_keyframe_sent(&self, display_id: &str) {
        let mut displays = self.displays.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(state) = displays.get_mut(display_id) {
            state.keyframe_timer = Instant::now();
            state.force_next_keyframe = false;
        }
    }

    /// Capture one frame for `display`, trying grabbers best-first.
    pub async fn capture(&self, display: &DisplayInfo) -> GrabResult {
        let force = self.keyframe_due(&display.id);

        for grabber in &self.grabbers {
            if !grabber.is_available() {
                continue;
            }
            match grabber.capture(display, force).await {
                GrabResult::Success(GrabContent::FullFrame(frame)) => {
                    self.note_keyframe_sent(&display.id);
                    return GrabResult::Success(GrabContent::FullFrame(frame));
                }
                GrabResult::Success(GrabContent::Regions { dirty, moves })
                    if dirty.is_empty() && moves.is_empty() =>
                {
                    // The grabber saw changes but could not enumerate
                    // them (rect overflow): resend everything shortly.
                    self.force_keyframe(&display.id);
                    return GrabResult::NoChanges;
                }
                GrabResult::Success(content) => return GrabResult::Success(content),
                GrabResult::NoChanges => return GrabResult::NoChanges,
                GrabResult::Failed => {
                    let display_id = &display.id;
                    tracing::debug!(
                        display = %display_id,
                        priority = grabber.priority(),
                        "Grabber failed, trying next"
                    );
                }
            }
        }
        GrabResult::Failed
    }
}
