use hex;
use crate::encoding::{DataCodec, EncodingError};

/// Hexadecimal encoding/decoding implementation
pub struct HexCodec;

impl HexCodec {
    /// Create a new Hex codec instance
    pub fn new() -> Self {
        Self
    }
}

impl Default for HexCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl DataCodec for HexCodec {
    fn encode(&self, data: &[u8]) -> Result<String, EncodingError> {
        Ok(hex::encode(data))
    }

    fn decode(&self, encoded: &str) -> Result<Vec<u8>, EncodingError> {
        let trimmed = encoded.trim();
        hex::decode(trimmed)
            .map_err(|e| EncodingError::DecodingFailed(format!("Hex decode error: {}", e)))
    }

    fn format_name(&self) -> &'static str {
        "hex"
    }
}
