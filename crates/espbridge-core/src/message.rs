//! Outbound message vocabulary
//!
//! Everything the server writes to a control client is one of these frames.
//! All variants except [`ServerMessage::CamImage`] are newline-terminated
//! ASCII lines; the camera frame is a raw JPEG blob after its prefix.

use crate::framing::SIZE_ACK;

/// A server-to-client protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// `LOG:<device>:<text>` - a line relayed from a device's serial link
    Log {
        /// Logical device name the line came from
        device: String,
        /// The relayed line, already trimmed
        text: String,
    },
    /// `OK:<action>` - the named action completed
    Ok {
        /// Echo of the wire token that succeeded
        action: String,
    },
    /// `ERROR:<reason>` - the current command failed
    Error {
        /// Human-readable failure description
        reason: String,
    },
    /// `READY` - upload accepted, server is waiting for the first transfer
    Ready,
    /// `SIZE_OK` - size header accepted, server is waiting for the body
    SizeAck,
    /// `FLASHING:<target>` - transfers staged, flash tool starting
    Flashing {
        /// Device being flashed
        target: String,
    },
    /// `FLASH_LOG:<target>:<text>` - one segment of flash tool output
    FlashLog {
        /// Device being flashed
        target: String,
        /// Output segment (one progress redraw or log line)
        text: String,
    },
    /// `CAM_IMG:<bytes>` - a camera frame as a raw JPEG blob
    CamImage(Vec<u8>),
}

impl ServerMessage {
    /// Convenience constructor for `OK:` replies
    pub fn ok(action: impl Into<String>) -> ServerMessage {
        ServerMessage::Ok {
            action: action.into(),
        }
    }

    /// Convenience constructor for `ERROR:` replies
    pub fn error(reason: impl ToString) -> ServerMessage {
        ServerMessage::Error {
            reason: reason.to_string(),
        }
    }

    /// Encode the frame as the bytes written to the socket
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerMessage::Log { device, text } => {
                format!("LOG:{}:{}\n", device, text).into_bytes()
            }
            ServerMessage::Ok { action } => format!("OK:{}\n", action).into_bytes(),
            ServerMessage::Error { reason } => format!("ERROR:{}\n", reason).into_bytes(),
            ServerMessage::Ready => b"READY\n".to_vec(),
            ServerMessage::SizeAck => SIZE_ACK.to_vec(),
            ServerMessage::Flashing { target } => format!("FLASHING:{}\n", target).into_bytes(),
            ServerMessage::FlashLog { target, text } => {
                format!("FLASH_LOG:{}:{}\n", target, text).into_bytes()
            }
            ServerMessage::CamImage(jpeg) => {
                let mut frame = b"CAM_IMG:".to_vec();
                frame.extend_from_slice(jpeg);
                frame
            }
        }
    }

    /// Parse one newline-stripped line back into a frame
    ///
    /// Used by clients. Returns `None` for lines outside the protocol
    /// (including camera blobs, which are not line-framed).
    pub fn parse_line(line: &str) -> Option<ServerMessage> {
        if line == "READY" {
            return Some(ServerMessage::Ready);
        }
        if line == "SIZE_OK" {
            return Some(ServerMessage::SizeAck);
        }
        if let Some(rest) = line.strip_prefix("LOG:") {
            let (device, text) = rest.split_once(':')?;
            return Some(ServerMessage::Log {
                device: device.to_string(),
                text: text.to_string(),
            });
        }
        if let Some(action) = line.strip_prefix("OK:") {
            return Some(ServerMessage::Ok {
                action: action.to_string(),
            });
        }
        if let Some(reason) = line.strip_prefix("ERROR:") {
            return Some(ServerMessage::Error {
                reason: reason.to_string(),
            });
        }
        if let Some(target) = line.strip_prefix("FLASHING:") {
            return Some(ServerMessage::Flashing {
                target: target.to_string(),
            });
        }
        if let Some(rest) = line.strip_prefix("FLASH_LOG:") {
            let (target, text) = rest.split_once(':')?;
            return Some(ServerMessage::FlashLog {
                target: target.to_string(),
                text: text.to_string(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_line_frames() {
        let msg = ServerMessage::Log {
            device: "MainPCB".to_string(),
            text: "boot ok".to_string(),
        };
        assert_eq!(msg.encode(), b"LOG:MainPCB:boot ok\n");

        assert_eq!(ServerMessage::ok("RESET_MainPCB").encode(), b"OK:RESET_MainPCB\n");
        assert_eq!(ServerMessage::Ready.encode(), b"READY\n");
        assert_eq!(ServerMessage::SizeAck.encode(), b"SIZE_OK\n");
        assert_eq!(
            ServerMessage::Flashing {
                target: "SlavePCB".to_string()
            }
            .encode(),
            b"FLASHING:SlavePCB\n"
        );
    }

    #[test]
    fn cam_frame_is_prefix_plus_raw_bytes() {
        let msg = ServerMessage::CamImage(vec![0xFF, 0xD8, 0xFF]);
        assert_eq!(msg.encode(), [b"CAM_IMG:".as_slice(), &[0xFF, 0xD8, 0xFF]].concat());
    }

    #[test]
    fn parses_lines_back() {
        let msg = ServerMessage::parse_line("LOG:MainPCB:temp: 42C");
        // Payload may itself contain colons; only the first two delimit
        assert_eq!(
            msg,
            Some(ServerMessage::Log {
                device: "MainPCB".to_string(),
                text: "temp: 42C".to_string()
            })
        );

        assert_eq!(
            ServerMessage::parse_line("FLASH_LOG:MainPCB:Writing at 0x00010000... (12 %)"),
            Some(ServerMessage::FlashLog {
                target: "MainPCB".to_string(),
                text: "Writing at 0x00010000... (12 %)".to_string()
            })
        );
        assert_eq!(ServerMessage::parse_line("READY"), Some(ServerMessage::Ready));
        assert_eq!(ServerMessage::parse_line("something else"), None);
    }

    #[test]
    fn line_frames_round_trip() {
        let frames = [
            ServerMessage::ok("UPLOAD_MainPCB"),
            ServerMessage::error("Target Board9 not found"),
            ServerMessage::Ready,
            ServerMessage::SizeAck,
            ServerMessage::Flashing {
                target: "MainPCB".to_string(),
            },
        ];
        for frame in frames {
            let encoded = frame.encode();
            let line = std::str::from_utf8(&encoded).unwrap().trim_end_matches('\n');
            assert_eq!(ServerMessage::parse_line(line), Some(frame));
        }
    }
}
