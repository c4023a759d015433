//! The grabber capability trait.

use async_trait::async_trait;

use crate::frame::{DisplayInfo, GrabResult};

/// A backend able to produce grab results for a display.
///
/// Grabbers never propagate errors: a failed attempt is reported as
/// [`GrabResult::Failed`] and logged locally, and the screenshot
/// service falls through to the next backend in priority order.
#[async_trait]
pub trait ScreenGrabber: Send + Sync {
    /// Higher priority backends are tried first.
    fn priority(&self) -> i32;

    /// Whether the backend can currently operate. Checked per capture;
    /// availability may change at runtime (e.g. a recorder service
    /// appearing or a GPU surface going away).
    fn is_available(&self) -> bool;

    /// Attempt one grab. `force_keyframe` requests the full frame even
    /// when the backend could report changed regions only.
    async fn capture(&self, display: &DisplayInfo, force_keyframe: bool) -> GrabResult;
}
