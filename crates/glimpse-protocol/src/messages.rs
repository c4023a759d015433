//! Typed message envelopes exchanged between presenter and viewers.
//!
//! Messages travel opaquely through the relay: the [`MessageKind`]
//! discriminant rides next to the encoded payload so the relay can
//! route frame traffic into the coalescing path without decoding it.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Short-lived per-session client handle issued by the relay.
pub type ClientId = String;

/// Identifier of a presenter-plus-viewers session.
pub type ConnectionId = String;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message codec: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),
}

/// Who a relayed message is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDestination {
    PresenterOnly,
    AllViewers,
    All,
    AllExceptSender,
    SpecificClients,
}

/// Result of a viewer's `ConnectTo` attempt; absent on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TryConnectError {
    InvalidCredentials,
    AlreadyConnected,
    NotFound,
    Internal,
}

/// Frame payload codec. JPEG tiles only, for now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameCodec {
    Jpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

bitflags! {
    /// Keyboard modifier state carried with key events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyModifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
        const WIN   = 0b1000;
    }
}

// On the wire, modifiers are their raw bits; unknown bits from newer
// peers are dropped on decode.
impl Serialize for KeyModifiers {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyModifiers {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_bits_truncate(u8::deserialize(deserializer)?))
    }
}

/// A display as advertised to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayDescriptor {
    pub id: String,
    pub friendly_name: String,
    pub is_primary: bool,
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// One JPEG tile inside a frame message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRegion {
    pub is_keyframe: bool,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub jpeg: Vec<u8>,
}

impl std::fmt::Debug for TileRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileRegion")
            .field("is_keyframe", &self.is_keyframe)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("w", &self.w)
            .field("h", &self.h)
            .field("jpeg_len", &self.jpeg.len())
            .finish()
    }
}

/// An encoded frame for one display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub display_id: String,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub codec: FrameCodec,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub regions: Vec<TileRegion>,
}

/// Discriminant of a [`ChannelMessage`], carried beside the opaque
/// payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    DisplayRequestList,
    DisplayList,
    DisplaySelect,
    ScreenFrame,
    MouseMove,
    MouseDown,
    MouseUp,
    MouseWheel,
    KeyDown,
    KeyUp,
}

impl MessageKind {
    /// Frame messages go through the latest-wins coalescer; everything
    /// else is FIFO and never dropped.
    #[must_use]
    pub fn is_frame(self) -> bool {
        matches!(self, MessageKind::ScreenFrame)
    }

    #[must_use]
    pub fn is_input(self) -> bool {
        matches!(
            self,
            MessageKind::MouseMove
                | MessageKind::MouseDown
                | MessageKind::MouseUp
                | MessageKind::MouseWheel
                | MessageKind::KeyDown
                | MessageKind::KeyUp
        )
    }
}

/// Typed envelopes inside `MessageReceived.data`.
///
/// Mouse coordinates are normalized to `0..1` relative to the selected
/// display so viewer and presenter resolutions stay independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelMessage {
    DisplayRequestList,
    DisplayList {
        displays: Vec<DisplayDescriptor>,
    },
    DisplaySelect {
        display_id: String,
    },
    ScreenFrame(FrameMessage),
    MouseMove {
        x: f32,
        y: f32,
    },
    MouseDown {
        button: MouseButton,
        x: f32,
        y: f32,
    },
    MouseUp {
        button: MouseButton,
        x: f32,
        y: f32,
    },
    MouseWheel {
        dx: f32,
        dy: f32,
        x: f32,
        y: f32,
    },
    KeyDown {
        key_code: u16,
        modifiers: KeyModifiers,
        scan_code: Option<u16>,
        is_extended: Option<bool>,
    },
    KeyUp {
        key_code: u16,
        modifiers: KeyModifiers,
        scan_code: Option<u16>,
        is_extended: Option<bool>,
    },
}

impl ChannelMessage {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            ChannelMessage::DisplayRequestList => MessageKind::DisplayRequestList,
            ChannelMessage::DisplayList { .. } => MessageKind::DisplayList,
            ChannelMessage::DisplaySelect { .. } => MessageKind::DisplaySelect,
            ChannelMessage::ScreenFrame(_) => MessageKind::ScreenFrame,
            ChannelMessage::MouseMove { .. } => MessageKind::MouseMove,
            ChannelMessage::MouseDown { .. } => MessageKind::MouseDown,
            ChannelMessage::MouseUp { .. } => MessageKind::MouseUp,
            ChannelMessage::MouseWheel { .. } => MessageKind::MouseWheel,
            ChannelMessage::KeyDown { .. } => MessageKind::KeyDown,
            ChannelMessage::KeyUp { .. } => MessageKind::KeyUp,
        }
    }
}

/// Serialize a typed message to its wire payload.
pub fn encode_message(message: &ChannelMessage) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(message)?)
}

/// Deserialize a wire payload back into a typed message.
pub fn decode_message(data: &[u8]) -> Result<ChannelMessage, CodecError> {
    Ok(bincode::deserialize(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &ChannelMessage) {
        let data = encode_message(msg).unwrap();
        let back = decode_message(&data).unwrap();
        assert_eq!(*msg, back);
    }

    #[test]
    fn every_envelope_round_trips() {
        round_trip(&ChannelMessage::DisplayRequestList);
        round_trip(&ChannelMessage::DisplayList {
            displays: vec![DisplayDescriptor {
                id: "d0".into(),
                friendly_name: "Primary".into(),
                is_primary: true,
                left: 0,
                top: 0,
                width: 1920,
                height: 1080,
            }],
        });
        round_trip(&ChannelMessage::DisplaySelect {
            display_id: "d0".into(),
        });
        round_trip(&ChannelMessage::ScreenFrame(FrameMessage {
            display_id: "d0".into(),
            frame_number: 42,
            timestamp_ms: 1_700_000_000_000,
            codec: FrameCodec::Jpeg,
            width: 1920,
            height: 1080,
            quality: 75,
            regions: vec![TileRegion {
                is_keyframe: true,
                x: 0,
                y: 0,
                w: 1920,
                h: 1080,
                jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
            }],
        }));
        round_trip(&ChannelMessage::MouseMove { x: 0.5, y: 0.25 });
        round_trip(&ChannelMessage::MouseDown {
            button: MouseButton::Left,
            x: 0.1,
            y: 0.9,
        });
        round_trip(&ChannelMessage::MouseWheel {
            dx: 0.0,
            dy: -1.0,
            x: 0.4,
            y: 0.6,
        });
        round_trip(&ChannelMessage::KeyDown {
            key_code: 0x41,
            modifiers: KeyModifiers::CTRL | KeyModifiers::SHIFT,
            scan_code: Some(0x1E),
            is_extended: Some(false),
        });
        round_trip(&ChannelMessage::KeyUp {
            key_code: 0x41,
            modifiers: KeyModifiers::empty(),
            scan_code: None,
            is_extended: None,
        });
    }

    #[test]
    fn kind_classification() {
        assert!(MessageKind::ScreenFrame.is_frame());
        assert!(!MessageKind::DisplayList.is_frame());
        assert!(MessageKind::MouseMove.is_input());
        assert!(MessageKind::KeyUp.is_input());
        assert!(!MessageKind::DisplaySelect.is_input());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_message(&[0xFF; 3]).is_err());
    }
}
