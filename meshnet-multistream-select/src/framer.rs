//! A length-prefixed framer sitting directly on a byte stream. Used both by
//! multistream-select's own message framing and, once negotiation is done,
//! handed to the upper layer via [`BufferedFramer::drain_remainder`] so no
//! application byte read during negotiation is ever lost.

use futures::{AsyncRead, AsyncReadExt};
use meshnet_varint::decode_usize;

use crate::error::FramerError;

const READ_CHUNK: usize = 4096;

pub struct BufferedFramer<S> {
    stream: S,
    buf: Vec<u8>,
    max_message_size: usize,
}

impl<S> BufferedFramer<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(stream: S, max_message_size: usize) -> Self {
        BufferedFramer {
            stream,
            buf: Vec::new(),
            max_message_size,
        }
    }

    /// Reads one complete length-prefixed message, buffering the length
    /// prefix of the *next* message (and any following bytes) that happened
    /// to arrive in the same underlying read.
    pub async fn read_message(&mut self) -> Result<Vec<u8>, FramerError> {
        loop {
            match decode_usize(&self.buf) {
                Ok((len, rest_after_prefix)) => {
                    if len > self.max_message_size {
                        return Err(FramerError::MessageTooLarge {
                            size: len,
                            max: self.max_message_size,
                        });
                    }
                    let prefix_len = self.buf.len() - rest_after_prefix.len();
                    if rest_after_prefix.len() >= len {
                        let message = rest_after_prefix[..len].to_vec();
                        let consumed = prefix_len + len;
                        self.buf.drain(0..consumed);
                        return Ok(message);
                    }
                    // Not enough body bytes buffered yet; fall through to
                    // read more from the stream.
                }
                Err(meshnet_varint::DecodeError::Overflow) => {
                    return Err(FramerError::InvalidVarint)
                }
                Err(meshnet_varint::DecodeError::Insufficient) => {
                    // Not enough bytes to even decode the length prefix yet.
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(FramerError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream closed before a message was available",
                    )));
                }
                return Err(FramerError::StreamClosed {
                    buffered: self.buf.len(),
                });
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Returns and clears any buffered bytes not yet consumed as a
    /// complete message — the pre-read remainder handed to the next layer.
    pub fn drain_remainder(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use meshnet_varint::encode_usize;

    fn framed_message(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_usize(payload.len(), &mut out);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn reads_one_message_and_preserves_trailing_bytes() {
        let mut wire = framed_message(b"hello");
        wire.extend_from_slice(b"trailing-app-bytes");
        let mut framer = BufferedFramer::new(Cursor::new(wire), 1024);

        let message = framer.read_message().await.unwrap();
        assert_eq!(message, b"hello");
        assert_eq!(framer.drain_remainder(), b"trailing-app-bytes");
    }

    #[tokio::test]
    async fn reads_multiple_messages_in_sequence() {
        let mut wire = framed_message(b"one");
        wire.extend_from_slice(&framed_message(b"two"));
        let mut framer = BufferedFramer::new(Cursor::new(wire), 1024);

        assert_eq!(framer.read_message().await.unwrap(), b"one");
        assert_eq!(framer.read_message().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn rejects_oversized_message_before_reading_body() {
        let mut out = Vec::new();
        encode_usize(10_485_760, &mut out);
        // Deliberately do not supply the 10 MiB body; the framer must
        // reject based on the length prefix alone.
        let mut framer = BufferedFramer::new(Cursor::new(out), 65_536);

        let err = framer.read_message().await.unwrap_err();
        assert!(matches!(
            err,
            FramerError::MessageTooLarge {
                size: 10_485_760,
                max: 65_536
            }
        ));
    }

    #[tokio::test]
    async fn eof_with_partial_message_is_stream_closed() {
        let mut wire = Vec::new();
        encode_usize(10, &mut wire);
        wire.extend_from_slice(b"short");
        let mut framer = BufferedFramer::new(Cursor::new(wire), 1024);

        let err = framer.read_message().await.unwrap_err();
        assert!(matches!(err, FramerError::StreamClosed { buffered: 6 }));
    }
}
