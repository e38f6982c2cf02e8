//! Encoding detection.
//!
//! Frames on the transport are bincode; group payloads are JSON.
//! Checking the first byte lets a receiver reject a payload that was never
//! JSON without running the parser, and log which kind of garbage it got.

/// Encoding of a byte buffer, judged by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// JSON object or array
    Json,
    /// Anything else
    Binary,
    /// No bytes at all
    Empty,
}

/// Detect the encoding from raw bytes.
///
/// JSON starts with `{` (object) or `[` (array).
/// Everything else is treated as binary.
pub fn detect_encoding(data: &[u8]) -> Encoding {
    match data.first() {
        Some(b'{') | Some(b'[') => Encoding::Json,
        Some(_) => Encoding::Binary,
        None => Encoding::Empty,
    }
}

/// Check if data is likely JSON.
pub fn is_likely_json(data: &[u8]) -> bool {
    matches!(detect_encoding(data), Encoding::Json)
}
