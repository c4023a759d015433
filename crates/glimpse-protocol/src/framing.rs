//! Length-delimited bincode frames over any byte stream.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::messages::CodecError;

/// Upper bound on a single frame. A 4K BGRA keyframe compresses well
/// below this; the bound exists to fail fast on a corrupt length word.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Wrap a duplex byte stream in the wire framing.
pub fn frame_duplex<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    Framed::new(io, codec())
}

/// Wrap a read half.
pub fn frame_reader<T: AsyncRead>(io: T) -> FramedRead<T, LengthDelimitedCodec> {
    FramedRead::new(io, codec())
}

/// Wrap a write half.
pub fn frame_writer<T: AsyncWrite>(io: T) -> FramedWrite<T, LengthDelimitedCodec> {
    FramedWrite::new(io, codec())
}

/// Send one typed value as a frame.
pub async fn send_value<S, M>(sink: &mut S, value: &M) -> Result<(), CodecError>
where
    S: Sink<bytes::Bytes, Error = std::io::Error> + Unpin,
    M: Serialize,
{
    let bytes = bincode::serialize(value)?;
    sink.send(bytes.into()).await?;
    Ok(())
}

/// Receive the next typed value; `None` on a cleanly closed stream.
pub async fn recv_value<S, M>(stream: &mut S) -> Result<Option<M>, CodecError>
where
    S: Stream<Item = Result<bytes::BytesMut, std::io::Error>> + Unpin,
    M: DeserializeOwned,
{
    match stream.next().await {
        Some(frame) => Ok(Some(bincode::deserialize(&frame?)?)),
        None => Ok(None),
    }
}
