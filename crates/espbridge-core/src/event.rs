//! In-flight log events
//!
//! Events flow from the serial relay loops and the flash orchestrator to
//! connected clients. Nothing is persisted; an event that reaches no client
//! is simply gone.

use crate::message::ServerMessage;

/// Who produced an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    /// A line read from the named device's serial link
    Device(String),
    /// The bridge itself (flash tool output echo)
    System,
}

/// One log/status event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Origin of the payload
    pub source: EventSource,
    /// Device the event concerns, when any
    pub target: Option<String>,
    /// The event text, already trimmed
    pub payload: String,
}

impl LogEvent {
    /// A line relayed from a device's serial link
    pub fn device_line(device: impl Into<String>, payload: impl Into<String>) -> LogEvent {
        let device = device.into();
        LogEvent {
            source: EventSource::Device(device.clone()),
            target: Some(device),
            payload: payload.into(),
        }
    }

    /// A segment of flash tool output concerning `target`
    pub fn flash_output(target: impl Into<String>, payload: impl Into<String>) -> LogEvent {
        LogEvent {
            source: EventSource::System,
            target: Some(target.into()),
            payload: payload.into(),
        }
    }

    /// The wire frame this event renders as
    pub fn to_message(&self) -> ServerMessage {
        match &self.source {
            EventSource::Device(device) => ServerMessage::Log {
                device: device.clone(),
                text: self.payload.clone(),
            },
            EventSource::System => ServerMessage::FlashLog {
                target: self.target.clone().unwrap_or_else(|| "bridge".to_string()),
                text: self.payload.clone(),
            },
        }
    }
}
