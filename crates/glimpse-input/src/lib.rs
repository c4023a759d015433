// Input injection abstraction for glimpse-presenter.
//
// Provides the InputSink trait and the wire-message dispatcher:
// - keymap.rs: virtual-key to scancode mapping and extended-key flags
// - dispatch.rs: normalized viewer coordinates to display pixels

pub mod dispatch;
pub mod keymap;

pub use dispatch::{dispatch_input, InputSink};
