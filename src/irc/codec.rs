/// Line codec for the relay connection.
///
/// Frames the TCP byte stream on `\r\n`, tolerates bare `\n` from sloppy
/// servers, and drops undecodable lines instead of killing the connection.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::message::Message;

/// Maximum line length including the terminator (IRCv3 tags allow 8191).
const MAX_LINE_LENGTH: usize = 8191;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(lf) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };
            if lf + 1 > MAX_LINE_LENGTH {
                return Err(CodecError::LineTooLong);
            }

            let line = src.split_to(lf);
            src.advance(1);

            // Non-UTF-8 and empty lines are skipped; one bad line must not stop the stream.
            let text = String::from_utf8_lossy(&line);
            match Message::parse(&text) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => trace!("dropping unparseable line: {e}"),
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        if wire.len() + 2 > MAX_LINE_LENGTH {
            return Err(CodecError::LineTooLong);
        }
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
