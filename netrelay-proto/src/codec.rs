//! Payload transforms applied between the host byte stream and tunnel messages
//!
//! Each connection owns one [`CodecWriter`] for data travelling toward the tunnel and one
//! [`CodecReader`] for data arriving from it. A [`CodecFactory`] builds them from the
//! [`Compression`] negotiated for the connection.

use std::fmt;

use bytes::BytesMut;
use thiserror::Error;

/// Compression selected for one direction of a connection
///
/// Opaque to the relay: the numbers are only interpreted by the [`CodecFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Compression {
    /// Codec identifier, 0 meaning "no compression"
    pub codec: u8,
    /// Codec-specific level
    pub level: u8,
}

impl Compression {
    /// Bytes pass through unchanged
    pub const NONE: Self = Self { codec: 0, level: 0 };
}

/// Transforms outbound host data before it is sent over the tunnel
pub trait CodecWriter: Send + fmt::Debug {
    /// Encode `data`, appending the result to `out`
    ///
    /// `flush` asks the codec not to hold anything back, typically because the host pushed
    /// or finished the stream.
    fn write(&mut self, data: &[u8], flush: bool, out: &mut BytesMut) -> Result<(), CodecError>;

    /// Emit anything still buffered
    fn flush(&mut self, out: &mut BytesMut) -> Result<(), CodecError>;
}

/// Transforms data received over the tunnel before it is queued for the host
pub trait CodecReader: Send + fmt::Debug {
    /// Decode `data`, appending the result to `out`
    fn read(&mut self, data: &[u8], out: &mut BytesMut) -> Result<(), CodecError>;
}

/// Builds codecs for newly opened connections
pub trait CodecFactory: Send + Sync {
    /// A writer producing `compression`
    fn writer(&self, compression: Compression) -> Result<Box<dyn CodecWriter>, CodecError>;
    /// A reader accepting `compression`
    fn reader(&self, compression: Compression) -> Result<Box<dyn CodecReader>, CodecError>;
}

/// Codec that copies bytes through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl CodecWriter for Identity {
    fn write(&mut self, data: &[u8], _flush: bool, out: &mut BytesMut) -> Result<(), CodecError> {
        out.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self, _out: &mut BytesMut) -> Result<(), CodecError> {
        Ok(())
    }
}

impl CodecReader for Identity {
    fn read(&mut self, data: &[u8], out: &mut BytesMut) -> Result<(), CodecError> {
        out.extend_from_slice(data);
        Ok(())
    }
}

/// Factory that only knows [`Compression::NONE`]
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityFactory;

impl CodecFactory for IdentityFactory {
    fn writer(&self, compression: Compression) -> Result<Box<dyn CodecWriter>, CodecError> {
        match compression {
            Compression::NONE => Ok(Box::new(Identity)),
            other => Err(CodecError::Unsupported(other)),
        }
    }

    fn reader(&self, compression: Compression) -> Result<Box<dyn CodecReader>, CodecError> {
        match compression {
            Compression::NONE => Ok(Box::new(Identity)),
            other => Err(CodecError::Unsupported(other)),
        }
    }
}

/// Failure of a payload transform
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No codec is available for the requested compression
    #[error("unsupported compression {0:?}")]
    Unsupported(Compression),
    /// The input could not be transformed
    #[error("malformed input: {0}")]
    Malformed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn identity_roundtrip() {
        let factory = IdentityFactory;
        let mut writer = factory.writer(Compression::NONE).unwrap();
        let mut reader = factory.reader(Compression::NONE).unwrap();
        let mut wire = BytesMut::new();
        writer.write(b"hello", true, &mut wire).unwrap();
        let mut plain = BytesMut::new();
        reader.read(&wire, &mut plain).unwrap();
        assert_eq!(&plain[..], b"hello");

        assert_matches!(
            factory.writer(Compression { codec: 3, level: 6 }),
            Err(CodecError::Unsupported(_))
        );
    }
}
