//! Value display codecs for the CLI (§6 ambient): a `get` result is raw
//! bytes, and the CLI lets the operator pick how to render/enter them.
//! No auto-detection — the caller names the format it wants, the same way
//! it names GET/PUT on the command line.

use std::fmt;

use crate::error::Error;

pub mod base64_codec;
pub mod hex_codec;
pub mod json_codec;

pub use base64_codec::Base64Codec;
pub use hex_codec::HexCodec;
pub use json_codec::JsonCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingFormat {
    Base64,
    Hex,
    Json,
}

impl fmt::Display for EncodingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingFormat::Base64 => write!(f, "base64"),
            EncodingFormat::Hex => write!(f, "hex"),
            EncodingFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for EncodingFormat {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "base64" => Ok(EncodingFormat::Base64),
            "hex" => Ok(EncodingFormat::Hex),
            "json" => Ok(EncodingFormat::Json),
            _ => Err(EncodingError::UnsupportedFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncodingError {
    UnsupportedFormat(String),
    DecodingFailed(String),
    EncodingFailed(String),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::UnsupportedFormat(format) => write!(f, "unsupported encoding format: {format}"),
            EncodingError::DecodingFailed(msg) => write!(f, "decode failed: {msg}"),
            EncodingError::EncodingFailed(msg) => write!(f, "encode failed: {msg}"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for Error {
    fn from(err: EncodingError) -> Self {
        Error::Internal(err.to_string())
    }
}

/// One way to render a value's raw bytes as text, and to parse them back.
pub trait DataCodec: Send + Sync {
    fn encode(&self, data: &[u8]) -> Result<String, EncodingError>;
    fn decode(&self, encoded: &str) -> Result<Vec<u8>, EncodingError>;
    fn format_name(&self) -> &'static str;
}

pub fn codec_for(format: EncodingFormat) -> Box<dyn DataCodec> {
    match format {
        EncodingFormat::Base64 => Box::new(Base64Codec::new()),
        EncodingFormat::Hex => Box::new(HexCodec::new()),
        EncodingFormat::Json => Box::new(JsonCodec::new()),
    }
}
