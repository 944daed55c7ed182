//! Decoder for BITalino notification frames.
//!
//! Pure functions, no I/O; safe to call from any async or sync context.
//!
//! # Frame layout
//!
//! ```text
//! byte 0      : SSSS DDDD   S = 4-bit sequence counter, D = digital inputs
//! bytes 1..2  : analog 0, u16 big-endian
//! bytes 3..4  : analog 1, u16 big-endian
//! …
//! ```
//!
//! A trailing odd byte is ignored. BLE notifications can be truncated on a
//! lossy link and a partial reading is worth less than the rest of the frame.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::DecodeError;
use crate::types::Sample;

/// Milliseconds since Unix epoch, used to stamp samples on arrival.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Decode consecutive big-endian `u16` pairs; an unpaired last byte is dropped.
pub fn decode_analog(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

/// Decode one frame, stamping it with `timestamp` (ms since epoch).
///
/// ```
/// # use bitalino_ble::parse::decode_frame_at;
/// let s = decode_frame_at(&[0x53, 0x01, 0x90], 0.0).unwrap();
/// assert_eq!((s.sequence, s.digital.as_slice(), s.analog.as_slice()), (5, &[3][..], &[400][..]));
/// ```
pub fn decode_frame_at(data: &[u8], timestamp: f64) -> Result<Sample, DecodeError> {
    if data.len() < 2 {
        return Err(DecodeError::FrameTooShort { len: data.len() });
    }
    Ok(Sample {
        sequence: data[0] >> 4,
        digital: vec![data[0] & 0x0F],
        analog: decode_analog(&data[1..]),
        timestamp,
    })
}

/// Decode one frame, stamped with the current wall clock.
pub fn decode_frame(data: &[u8]) -> Result<Sample, DecodeError> {
    decode_frame_at(data, now_ms())
}
