// JPEG tile encoding for glimpse-presenter.
//
// Turns grab results into independently decodable JPEG regions:
// - a full frame becomes one keyframe region covering the canvas
// - each dirty region becomes one delta region at its own rectangle

pub mod jpeg;

pub use jpeg::{EncodeError, EncodedRegion, FrameEncoder, DEFAULT_JPEG_QUALITY};
