//! GATT UUIDs, stream defaults, and command encoders for BITalino BLE.
//!
//! BITalino exposes the Nordic UART Service (NUS): one service with a
//! write-only RX characteristic for host commands and a notify-only TX
//! characteristic for sample frames. UUIDs share the namespace
//! `6e40XXXX-b5a3-f393-e0a9-e50e24dcca9e`.

use uuid::Uuid;

use crate::error::BitalinoError;
use crate::types::StreamConfig;

// ── Service ──────────────────────────────────────────────────────────────────

/// Nordic UART primary service.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

// ── Characteristics ───────────────────────────────────────────────────────────

/// RX characteristic: host → device. Start/stop commands are written here.
pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// TX characteristic: device → host. Every notification is one frame;
/// see [`crate::parse::decode_frame`].
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

// ── Stream parameters ─────────────────────────────────────────────────────────

/// Highest analog channel index (A1..A6 map to 0..5).
pub const MAX_CHANNEL_INDEX: u8 = 5;

pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 1000;

pub const DEFAULT_CHANNELS: [u8; 2] = [0, 1];

// ── Control commands ──────────────────────────────────────────────────────────

/// Opcode of the start-acquisition command.
pub const OP_START: u8 = 0x01;

/// Opcode (and entire payload) of the stop-acquisition command.
pub const OP_STOP: u8 = 0x00;

/// Encode the start-acquisition command.
///
/// ```text
/// byte 0     : 0x01
/// bytes 1..2 : sample rate, u16 little-endian
/// byte 3     : channel count
/// bytes 4..  : channel indices, caller order
/// ```
///
/// Only the wire limits are checked here: the rate must be in `1..=65535`
/// and there may be at most 255 channels. Use [`StreamConfig::validate`]
/// for the device's channel range.
///
/// ```
/// # use bitalino_ble::protocol::encode_start_command;
/// # use bitalino_ble::types::StreamConfig;
/// let cmd = encode_start_command(&StreamConfig::new(1000, vec![0, 1])).unwrap();
/// assert_eq!(cmd, [0x01, 0xE8, 0x03, 0x02, 0x00, 0x01]);
/// ```
pub fn encode_start_command(config: &StreamConfig) -> Result<Vec<u8>, BitalinoError> {
    let rate = u16::try_from(config.sample_rate_hz)
        .ok()
        .filter(|&r| r > 0)
        .ok_or_else(|| {
            BitalinoError::InvalidConfig(format!(
                "sample rate {} Hz does not fit the 16-bit rate field",
                config.sample_rate_hz
            ))
        })?;
    let count = u8::try_from(config.channels.len()).map_err(|_| {
        BitalinoError::InvalidConfig(format!(
            "{} channels exceed the one-byte channel count",
            config.channels.len()
        ))
    })?;

    let mut bytes = Vec::with_capacity(4 + config.channels.len());
    bytes.push(OP_START);
    bytes.extend_from_slice(&rate.to_le_bytes());
    bytes.push(count);
    bytes.extend_from_slice(&config.channels);
    Ok(bytes)
}

/// Encode the stop-acquisition command: always `[0x00]`.
pub fn encode_stop_command() -> Vec<u8> {
    vec![OP_STOP]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command_layout() {
        let cmd = encode_start_command(&StreamConfig::new(1000, vec![0, 1])).unwrap();
        assert_eq!(cmd, vec![0x01, 0xE8, 0x03, 0x02, 0x00, 0x01]);

        let cmd = encode_start_command(&StreamConfig::new(10_000, vec![5, 2, 4])).unwrap();
        assert_eq!(cmd, vec![0x01, 0x10, 0x27, 0x03, 0x05, 0x02, 0x04]);
    }

    #[test]
    fn test_start_command_empty_channels() {
        let cmd = encode_start_command(&StreamConfig::new(100, vec![])).unwrap();
        assert_eq!(cmd, vec![0x01, 0x64, 0x00, 0x00]);
    }

    #[test]
    fn test_start_command_rejects_out_of_range_rate() {
        for rate in [0, 65_536, u32::MAX] {
            let err = encode_start_command(&StreamConfig::new(rate, vec![0])).unwrap_err();
            assert!(matches!(err, BitalinoError::InvalidConfig(_)), "rate {rate}");
        }
        let max = encode_start_command(&StreamConfig::new(65_535, vec![])).unwrap();
        assert_eq!(&max[1..3], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_start_command_rejects_too_many_channels() {
        let config = StreamConfig::new(100, vec![0u8; 256]);
        assert!(matches!(
            encode_start_command(&config),
            Err(BitalinoError::InvalidConfig(_))
        ));
        let config = StreamConfig::new(100, vec![0u8; 255]);
        let cmd = encode_start_command(&config).unwrap();
        assert_eq!(cmd[3], 255);
        assert_eq!(cmd.len(), 4 + 255);
    }

    #[test]
    fn test_stop_command() {
        assert_eq!(encode_stop_command(), vec![0x00]);
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            UART_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            WRITE_CHARACTERISTIC.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            NOTIFY_CHARACTERISTIC.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }
}
