//! Inbound frame decoding
//!
//! With `compress: true` in Identify the gateway sends every payload as its
//! own complete zlib stream in a binary frame.

use crate::error::GatewayError;
use crate::gateway::payload::GatewayPayload;
use flate2::read::ZlibDecoder;
use std::io::Read;

/// Inflate one zlib-compressed frame into its JSON text
pub fn inflate(frame: &[u8]) -> Result<String, GatewayError> {
    let mut text = String::new();
    ZlibDecoder::new(frame)
        .read_to_string(&mut text)
        .map_err(GatewayError::Decompress)?;
    Ok(text)
}

/// Decode a text frame
pub fn decode_text(frame: &str) -> Result<GatewayPayload, GatewayError> {
    Ok(serde_json::from_str(frame)?)
}

/// Decode a binary (compressed) frame
pub fn decode_binary(frame: &[u8]) -> Result<GatewayPayload, GatewayError> {
    decode_text(&inflate(frame)?)
}
