//! File-transfer framing
//!
//! Each of the three upload artifacts travels as a stop-and-wait exchange:
//! a 16-byte ASCII decimal size header, an 8-byte acknowledgment literal,
//! then exactly the declared number of raw bytes.

use crate::error::BridgeError;

/// Length of the size header in bytes
pub const SIZE_HEADER_LEN: usize = 16;

/// Acknowledgment literal sent after a parseable size header
pub const SIZE_ACK: &[u8; 8] = b"SIZE_OK\n";

/// The three artifacts of one upload, in the order they arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileRole {
    /// Second-stage bootloader, flashed at 0x0
    Bootloader,
    /// Partition table, flashed at 0x8000
    PartitionTable,
    /// Application image, flashed at 0x10000
    Image,
}

impl FileRole {
    /// Arrival order within an upload
    pub const UPLOAD_ORDER: [FileRole; 3] =
        [FileRole::Bootloader, FileRole::PartitionTable, FileRole::Image];

    /// Staging file name for this role
    pub fn file_name(&self) -> &'static str {
        match self {
            FileRole::Bootloader => "bootloader.bin",
            FileRole::PartitionTable => "partition_table.bin",
            FileRole::Image => "firmware.bin",
        }
    }

    /// Flash memory offset the artifact is written to
    pub fn flash_offset(&self) -> u32 {
        match self {
            FileRole::Bootloader => 0x0,
            FileRole::PartitionTable => 0x8000,
            FileRole::Image => 0x10000,
        }
    }
}

impl std::fmt::Display for FileRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileRole::Bootloader => "bootloader",
            FileRole::PartitionTable => "partition table",
            FileRole::Image => "firmware image",
        };
        write!(f, "{}", name)
    }
}

/// Encode a size header: the decimal digits padded with spaces to 16 bytes
pub fn encode_size_header(len: u64) -> [u8; SIZE_HEADER_LEN] {
    let mut header = [b' '; SIZE_HEADER_LEN];
    let digits = len.to_string();
    header[..digits.len()].copy_from_slice(digits.as_bytes());
    header
}

/// Parse a size header: ASCII digits, space padding on either side, no sign
pub fn parse_size_header(header: &[u8; SIZE_HEADER_LEN]) -> Result<u64, BridgeError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| BridgeError::Framing("header is not ASCII".to_string()))?;
    let trimmed = text.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BridgeError::Framing(format!(
            "not a non-negative decimal: {:?}",
            trimmed
        )));
    }
    // 16 ASCII digits always fit in a u64
    trimmed
        .parse::<u64>()
        .map_err(|e| BridgeError::Framing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        for len in [0u64, 1, 4096, 200_000, 9_999_999_999_999_999] {
            let header = encode_size_header(len);
            assert_eq!(header.len(), SIZE_HEADER_LEN);
            assert_eq!(parse_size_header(&header).unwrap(), len);
        }
    }

    #[test]
    fn accepts_padding_on_either_side() {
        assert_eq!(parse_size_header(b"            4096").unwrap(), 4096);
        assert_eq!(parse_size_header(b"4096            ").unwrap(), 4096);
    }

    #[test]
    fn rejects_non_decimal_headers() {
        assert!(parse_size_header(b"          0x1000").is_err());
        assert!(parse_size_header(b"           -4096").is_err());
        assert!(parse_size_header(b"           +4096").is_err());
        assert!(parse_size_header(b"                ").is_err());
        assert!(parse_size_header(b"        12 34   ").is_err());
    }

    #[test]
    fn upload_order_matches_flash_layout() {
        assert_eq!(FileRole::UPLOAD_ORDER[0].flash_offset(), 0x0);
        assert_eq!(FileRole::UPLOAD_ORDER[1].flash_offset(), 0x8000);
        assert_eq!(FileRole::UPLOAD_ORDER[2].flash_offset(), 0x10000);
    }

    #[test]
    fn ack_literal_is_eight_bytes() {
        assert_eq!(SIZE_ACK.len(), 8);
    }
}
