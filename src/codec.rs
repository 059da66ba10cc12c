use std::borrow::Cow;

use crate::constants::COMPRESSION_LEVEL;
use crate::error::{Error, ErrorKind, Result};

/// Compression boundary between callers and a database's stored values.
///
/// Writes are compressed when enabled. Reads are best effort: if the stored
/// bytes do not decompress they are returned as they are, which keeps
/// compressed and uncompressed databases read-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCodec {
    enabled: bool,
}

impl ValueCodec {
    pub fn new(enabled: bool) -> Self {
        ValueCodec { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bytes to hand to the engine for `value`.
    pub fn encode<'a>(&self, value: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if !self.enabled {
            return Ok(Cow::Borrowed(value));
        }
        zstd::bulk::compress(value, COMPRESSION_LEVEL)
            .map(Cow::Owned)
            .map_err(|e| Error::with_message(ErrorKind::Codec, e.to_string()))
    }

    /// Bytes to hand back to the caller for a stored value.
    pub fn decode(&self, stored: Vec<u8>) -> Vec<u8> {
        if !self.enabled || stored.is_empty() {
            return stored;
        }
        match zstd::stream::decode_all(stored.as_slice()) {
            Ok(decompressed) => decompressed,
            Err(_) => stored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_codec_is_passthrough() {
        let codec = ValueCodec::new(false);
        let encoded = codec.encode(b"plain").unwrap();
        assert!(matches!(encoded, Cow::Borrowed(_)));
        assert_eq!(codec.decode(b"plain".to_vec()), b"plain");
    }

    #[test]
    fn test_compresses_repetitive_values() {
        let codec = ValueCodec::new(true);
        let value = "A".repeat(4000);
        let encoded = codec.encode(value.as_bytes()).unwrap();
        assert!(encoded.len() < value.len());
        assert_eq!(codec.decode(encoded.into_owned()), value.as_bytes());
    }

    #[test]
    fn test_undecodable_values_are_returned_raw() {
        let codec = ValueCodec::new(true);
        let raw = b"never compressed".to_vec();
        assert_eq!(codec.decode(raw.clone()), raw);
    }

    #[test]
    fn test_empty_value() {
        let codec = ValueCodec::new(true);
        let encoded = codec.encode(b"").unwrap();
        assert!(codec.decode(encoded.into_owned()).is_empty());
    }
}
