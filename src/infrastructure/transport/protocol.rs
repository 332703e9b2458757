//! Remote payload formats
//!
//! Decodes transport payloads into raw command codes. Logical meaning of the
//! codes lives in [`crate::domain::keymap`].

use crate::domain::models::TransportKind;
use anyhow::Result;
use tracing::trace;

/// ANT+ generic command data page number.
pub const ANT_COMMAND_PAGE: u8 = 0x49;

/// ANT+ data pages are always 8 bytes.
pub const ANT_PAGE_LEN: usize = 8;

/// HID report characteristic carrying consumer-control usages.
pub const HID_REPORT_CHAR_UUID: &str = "00002a4d-0000-1000-8000-00805f9b34fb";

/// Battery level characteristic; notifies but carries no commands.
pub const BATTERY_LEVEL_CHAR_UUID: &str = "00002a19-0000-1000-8000-00805f9b34fb";

/// HID control point; write-only.
pub const HID_CONTROL_POINT_UUID: &str = "00002a4c-0000-1000-8000-00805f9b34fb";

pub const HID_SERVICE_UUID: &str = "00001812-0000-1000-8000-00805f9b34fb";
pub const BATTERY_SERVICE_UUID: &str = "0000180f-0000-1000-8000-00805f9b34fb";

/// One decoded button signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCommand {
    pub code: u16,
    /// ANT retransmission counter; `None` for BLE.
    pub sequence: Option<u8>,
}

/// Decode a payload from `transport`.
///
/// `Ok(None)` means the payload is valid but carries no button press
/// (key release, battery notification, other data page).
pub fn decode(
    transport: TransportKind,
    source: Option<&str>,
    bytes: &[u8],
) -> Result<Option<DecodedCommand>> {
    match transport {
        TransportKind::Ant => parse_ant_page(bytes),
        TransportKind::Ble => {
            if source.map_or(false, |uuid| !uuid.eq_ignore_ascii_case(HID_REPORT_CHAR_UUID)) {
                return Ok(None);
            }
            parse_hid_usage(bytes)
        }
    }
}

/// Parse an 8-byte ANT+ data page
///
/// # Generic Command Page (0x49)
///
/// ```text
/// [0]     : Page number (0x49)
/// [1-2]   : Remote serial number (u16 little-endian)
/// [3-4]   : Manufacturer id (u16 little-endian)
/// [5]     : Sequence number, bumped once per press
/// [6-7]   : Command number (u16 little-endian)
/// ```
pub fn parse_ant_page(bytes: &[u8]) -> Result<Option<DecodedCommand>> {
    if bytes.len() != ANT_PAGE_LEN {
        return Err(anyhow::anyhow!("Invalid ANT page size: {}", bytes.len()));
    }

    #[cfg(debug_assertions)]
    trace!("Raw ANT page: {:02X?}", bytes);

    if bytes[0] != ANT_COMMAND_PAGE {
        return Ok(None);
    }

    Ok(Some(DecodedCommand {
        code: u16::from_le_bytes([bytes[6], bytes[7]]),
        sequence: Some(bytes[5]),
    }))
}

/// Parse a HID consumer-control report (16-bit usage, little-endian).
/// Usage 0 is the key release that follows every press.
pub fn parse_hid_usage(bytes: &[u8]) -> Result<Option<DecodedCommand>> {
    if bytes.len() < 2 {
        return Err(anyhow::anyhow!("Invalid HID report size: {}", bytes.len()));
    }

    let usage = u16::from_le_bytes([bytes[0], bytes[1]]);
    if usage == 0 {
        return Ok(None);
    }
    Ok(Some(DecodedCommand {
        code: usage,
        sequence: None,
    }))
}

pub fn encode_ant_command(serial: u16, sequence: u8, command: u16) -> [u8; ANT_PAGE_LEN] {
    let serial = serial.to_le_bytes();
    let command = command.to_le_bytes();
    [
        ANT_COMMAND_PAGE,
        serial[0],
        serial[1],
        0xFF,
        0xFF,
        sequence,
        command[0],
        command[1],
    ]
}

pub fn encode_hid_usage(usage: u16) -> Vec<u8> {
    usage.to_le_bytes().to_vec()
}
