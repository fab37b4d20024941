//! Framed codec for worker communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).
//!
//! Decoding never fails on bad content: a line that is not a valid frame is
//! yielded as `Err(ProtocolError)` so the reader can log it and keep going.
//! Only I/O errors end the stream.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::ProtocolError;

/// Errors that end a framed stream or fail a single write.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to serialize frame: {0}")]
    Serialize(serde_json::Error),
}

/// Codec that frames messages as newline-terminated JSON.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    max_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(usize::MAX)
    }

    /// Lines longer than `max_length` bytes are discarded and reported as
    /// `ProtocolError::LineTooLong`.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
            _phantom: PhantomData,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl<T: DeserializeOwned> JsonLinesCodec<T> {
    /// Turn one LinesCodec result into a frame result.
    ///
    /// `Ok(None)` with `skip == true` means a blank line was consumed.
    fn lift(
        &self,
        line: Result<Option<String>, LinesCodecError>,
    ) -> Result<(Option<Result<T, ProtocolError>>, bool), CodecError> {
        match line {
            Ok(Some(line)) if line.trim().is_empty() => Ok((None, true)),
            Ok(Some(line)) => Ok((
                Some(serde_json::from_str(&line).map_err(ProtocolError::Malformed)),
                false,
            )),
            Ok(None) => Ok((None, false)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok((
                Some(Err(ProtocolError::LineTooLong {
                    max: self.max_length,
                })),
                false,
            )),
            // LinesCodec reports undecodable UTF-8 as InvalidData after consuming the line.
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok((Some(Err(ProtocolError::InvalidUtf8)), false))
            }
            Err(LinesCodecError::Io(e)) => Err(CodecError::Io(e)),
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Result<T, ProtocolError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self.inner.decode(src);
            match self.lift(line)? {
                (None, true) => continue,
                (item, _) => return Ok(item),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self.inner.decode_eof(src);
            match self.lift(line)? {
                (None, true) => continue,
                (item, _) => return Ok(item),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // serde_json escapes control characters, so the encoded object never contains '\n'.
        let json = serde_json::to_vec(&item).map_err(CodecError::Serialize)?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        if json.len() > 1_000_000 {
            tracing::debug!(
                json_size_bytes = json.len(),
                json_size_kb = json.len() / 1024,
                "Large frame being encoded"
            );
        }
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
