//! Privileged recorder pipe protocol.
//!
//! When a system recorder service is present, the presenter delegates
//! capture and input injection to it over a local pipe. Frames use the
//! same length-delimited bincode framing as the relay transport. The
//! pipe is restricted to authenticated users by the OS layer.

use serde::{Deserialize, Serialize};

use crate::messages::{DisplayDescriptor, KeyModifiers, MouseButton};

/// Pipe name for a recorder session.
#[must_use]
pub fn session_pipe_name(session_id: &str) -> String {
    format!("Glimpse.Session.{session_id}")
}

/// Presenter -> recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecorderRequest {
    GetDisplays,
    /// Grab one frame; `force_keyframe` requests the full frame even
    /// when the recorder could report changed regions only.
    CaptureDisplay {
        display_id: String,
        force_keyframe: bool,
    },
    InjectMouseMove {
        display_id: String,
        x: f32,
        y: f32,
    },
    InjectMouseButton {
        display_id: String,
        button: MouseButton,
        pressed: bool,
        x: f32,
        y: f32,
    },
    InjectMouseWheel {
        display_id: String,
        dx: f32,
        dy: f32,
        x: f32,
        y: f32,
    },
    InjectKey {
        key_code: u16,
        modifiers: KeyModifiers,
        pressed: bool,
        scan_code: Option<u16>,
        is_extended: Option<bool>,
    },
    SendSecureAttentionSequence,
    /// Negotiate a shared-memory token for a display. The recorder
    /// answers [`RecorderResponse::SharedMemoryToken`]; captures may
    /// then deliver [`RecorderGrab::FullShared`] frames carrying it.
    GetSharedMemoryToken {
        display_id: String,
    },
}

/// One dirty rectangle with inline pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub pixels: Vec<u8>,
}

/// A move hint forwarded from the recorder's duplication source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderMove {
    pub src_x: i32,
    pub src_y: i32,
    pub dst_x: i32,
    pub dst_y: i32,
    pub w: u32,
    pub h: u32,
}

/// Capture payload. `FullShared` points into the shared-memory region
/// previously mapped via `GetSharedMemoryToken`, so pixels cross the
/// process boundary at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecorderGrab {
    Full {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    },
    FullShared {
        width: u32,
        height: u32,
        token: String,
    },
    Regions {
        dirty: Vec<RecorderRegion>,
        moves: Vec<RecorderMove>,
    },
    NoChanges,
    Failed,
}

/// Recorder -> presenter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecorderResponse {
    Displays(Vec<DisplayDescriptor>),
    Capture(RecorderGrab),
    /// Reply to injection and secure-attention requests.
    Ack,
    /// Reply to `GetSharedMemoryToken`; `None` when the recorder has
    /// no shared region for the display.
    SharedMemoryToken { token: Option<String> },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_name_embeds_session_id() {
        assert_eq!(session_pipe_name("7f3a"), "Glimpse.Session.7f3a");
    }

    #[test]
    fn capture_request_round_trips() {
        let req = RecorderRequest::CaptureDisplay {
            display_id: "d1".into(),
            force_keyframe: true,
        };
        let bytes = bincode::serialize(&req).unwrap();
        assert_eq!(req, bincode::deserialize::<RecorderRequest>(&bytes).unwrap());
    }

    #[test]
    fn shared_grab_round_trips() {
        let grab = RecorderGrab::FullShared {
            width: 1920,
            height: 1080,
            token: "shm-0".into(),
        };
        let bytes = bincode::serialize(&grab).unwrap();
        assert_eq!(grab, bincode::deserialize::<RecorderGrab>(&bytes).unwrap());
    }
}
