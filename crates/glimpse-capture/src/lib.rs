// Screen grabbing abstraction for glimpse-presenter.
//
// Provides the ScreenGrabber trait and implementations:
// - duplication.rs: GPU desktop-duplication grabber (dirty/move regions)
// - cpu.rs: CPU full-frame grabber with software block diff
// - diff.rs: 32x32 block comparison and region merging
// - service.rs: priority fan-out with keyframe scheduling
// - pool.rs / buffer.rs: tiered buffer pool and shared pixel buffers

pub mod buffer;
pub mod cpu;
pub mod diff;
pub mod duplication;
pub mod frame;
pub mod grabber;
pub mod pacing;
pub mod pool;
pub mod service;

pub use buffer::SharedBuffer;
pub use frame::{DirtyRegion, DisplayInfo, GrabContent, GrabResult, MoveRegion, Rect};
pub use grabber::ScreenGrabber;
pub use pool::BufferPool;
pub use service::ScreenshotService;
