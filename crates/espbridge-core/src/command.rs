//! Inbound command vocabulary
//!
//! Clients speak short ASCII tokens. The parser is total: anything that does
//! not match a known shape becomes [`Command::Unknown`], which sessions log
//! and ignore so that newer clients do not break older servers.

/// A parsed client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `UPLOAD_<target>`: three-file transfer followed by a flash
    Upload {
        /// Logical device name
        target: String,
    },
    /// `RESET_<target>`: pulse the device's reset lines
    Reset {
        /// Logical device name
        target: String,
    },
    /// `<BTN>_CLICK`: forward a simulated input event to the mapped device
    ButtonClick {
        /// Button token without the `_CLICK` suffix
        button: String,
    },
    /// `GET_CAM`: request one camera frame
    GetCam,
    /// Anything else (forward-compatible no-op)
    Unknown(String),
}

impl Command {
    /// Parse one whitespace-trimmed command token
    pub fn parse(raw: &str) -> Command {
        let token = raw.trim();
        if token == "GET_CAM" {
            return Command::GetCam;
        }
        if let Some(target) = token.strip_prefix("UPLOAD_") {
            return Command::Upload {
                target: target.to_string(),
            };
        }
        if let Some(target) = token.strip_prefix("RESET_") {
            return Command::Reset {
                target: target.to_string(),
            };
        }
        if let Some(button) = token.strip_suffix("_CLICK") {
            return Command::ButtonClick {
                button: button.to_string(),
            };
        }
        Command::Unknown(token.to_string())
    }

    /// The wire token this command arrived as, used to build `OK:` replies
    pub fn wire_token(&self) -> String {
        match self {
            Command::Upload { target } => format!("UPLOAD_{}", target),
            Command::Reset { target } => format!("RESET_{}", target),
            Command::ButtonClick { button } => format!("{}_CLICK", button),
            Command::GetCam => "GET_CAM".to_string(),
            Command::Unknown(raw) => raw.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upload_with_full_target() {
        assert_eq!(
            Command::parse("UPLOAD_MainPCB"),
            Command::Upload {
                target: "MainPCB".to_string()
            }
        );
        // Targets may themselves contain underscores
        assert_eq!(
            Command::parse("UPLOAD_Main_PCB"),
            Command::Upload {
                target: "Main_PCB".to_string()
            }
        );
    }

    #[test]
    fn parses_reset_and_trims_whitespace() {
        assert_eq!(
            Command::parse("  RESET_SlavePCB\n"),
            Command::Reset {
                target: "SlavePCB".to_string()
            }
        );
    }

    #[test]
    fn parses_button_clicks() {
        assert_eq!(
            Command::parse("SW_CLICK"),
            Command::ButtonClick {
                button: "SW".to_string()
            }
        );
        assert_eq!(
            Command::parse("BE1_CLICK"),
            Command::ButtonClick {
                button: "BE1".to_string()
            }
        );
    }

    #[test]
    fn upload_prefix_wins_over_click_suffix() {
        assert_eq!(
            Command::parse("UPLOAD_X_CLICK"),
            Command::Upload {
                target: "X_CLICK".to_string()
            }
        );
    }

    #[test]
    fn unrecognized_tokens_are_unknown() {
        assert_eq!(
            Command::parse("HELLO"),
            Command::Unknown("HELLO".to_string())
        );
        assert_eq!(Command::parse(""), Command::Unknown(String::new()));
    }

    #[test]
    fn wire_token_round_trips() {
        for raw in ["UPLOAD_MainPCB", "RESET_SlavePCB", "BE2_CLICK", "GET_CAM"] {
            assert_eq!(Command::parse(raw).wire_token(), raw);
        }
    }
}
