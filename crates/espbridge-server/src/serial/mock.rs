//! Mock serial links for testing
//!
//! A [`MockSerial`] behaves like an open port: injected bytes come out of
//! `read`, writes and control line changes are recorded, and either side can
//! be broken on demand. The paired [`MockSerialHandle`] stays with the test.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{SerialError, SerialLink, SerialOpener};

/// Recorded control line change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    /// RTS driven to the given level
    Rts(bool),
    /// DTR driven to the given level
    Dtr(bool),
}

#[derive(Default)]
struct MockShared {
    written: Mutex<Vec<u8>>,
    control: Mutex<Vec<ControlLine>>,
    broken: AtomicBool,
}

/// Scripted serial link handed to the code under test
pub struct MockSerial {
    incoming_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: VecDeque<u8>,
    shared: Arc<MockShared>,
}

/// Test-side handle paired with one [`MockSerial`]
#[derive(Clone)]
pub struct MockSerialHandle {
    incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<MockShared>,
}

/// Create a linked mock port and its test handle
pub fn mock_link() -> (MockSerial, MockSerialHandle) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(MockShared::default());
    let link = MockSerial {
        incoming_rx,
        leftover: VecDeque::new(),
        shared: shared.clone(),
    };
    let handle = MockSerialHandle {
        incoming_tx,
        shared,
    };
    (link, handle)
}

impl MockSerialHandle {
    /// Inject one device log line (newline appended)
    pub fn inject_line(&self, line: &str) {
        self.inject_bytes(format!("{}\n", line).into_bytes());
    }

    /// Inject raw bytes as if the device had sent them
    pub fn inject_bytes(&self, bytes: Vec<u8>) {
        let _ = self.incoming_tx.send(bytes);
    }

    /// Everything written to the port so far
    pub fn written(&self) -> Vec<u8> {
        self.shared.written.lock().clone()
    }

    /// Control line changes in the order they were driven
    pub fn control_changes(&self) -> Vec<ControlLine> {
        self.shared.control.lock().clone()
    }

    /// Make subsequent reads and writes fail with an IO error
    pub fn set_broken(&self, broken: bool) {
        self.shared.broken.store(broken, Ordering::SeqCst);
    }
}

impl MockSerial {
    fn check_broken(&self) -> Result<(), SerialError> {
        if self.shared.broken.load(Ordering::SeqCst) {
            return Err(SerialError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock port broken",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SerialLink for MockSerial {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        self.check_broken()?;
        if self.leftover.is_empty() {
            match self.incoming_rx.recv().await {
                Some(bytes) => self.leftover.extend(bytes),
                None => return Err(SerialError::Closed),
            }
        }
        self.check_broken()?;
        let n = buf.len().min(self.leftover.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.leftover.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), SerialError> {
        self.check_broken()?;
        self.shared.written.lock().extend_from_slice(data);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), SerialError> {
        self.shared.control.lock().push(ControlLine::Rts(level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), SerialError> {
        self.shared.control.lock().push(ControlLine::Dtr(level));
        Ok(())
    }
}

/// Opener that hands out mock links and remembers their handles per path
#[derive(Default)]
pub struct MockSerialOpener {
    handles: Mutex<HashMap<String, MockSerialHandle>>,
    failing: Mutex<HashSet<String>>,
    open_counts: Mutex<HashMap<String, usize>>,
}

impl MockSerialOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the most recent link opened at `path`
    pub fn handle(&self, path: &str) -> Option<MockSerialHandle> {
        self.handles.lock().get(path).cloned()
    }

    /// Make opens of `path` fail (or succeed again)
    pub fn set_failing(&self, path: &str, failing: bool) {
        if failing {
            self.failing.lock().insert(path.to_string());
        } else {
            self.failing.lock().remove(path);
        }
    }

    /// How many times `path` has been opened
    pub fn open_count(&self, path: &str) -> usize {
        self.open_counts.lock().get(path).copied().unwrap_or(0)
    }
}

impl SerialOpener for MockSerialOpener {
    fn open(&self, path: &str, _baud: u32) -> Result<Box<dyn SerialLink>, SerialError> {
        *self.open_counts.lock().entry(path.to_string()).or_insert(0) += 1;
        if self.failing.lock().contains(path) {
            return Err(SerialError::Port(tokio_serial::Error::new(
                tokio_serial::ErrorKind::NoDevice,
                format!("mock refuses to open {}", path),
            )));
        }
        let (link, handle) = mock_link();
        self.handles.lock().insert(path.to_string(), handle);
        Ok(Box::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_bytes_come_out_of_read() {
        let (mut link, handle) = mock_link();
        handle.inject_line("hello");

        let mut buf = [0u8; 16];
        let n = link.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[tokio::test]
    async fn short_buffer_keeps_leftover_bytes() {
        let (mut link, handle) = mock_link();
        handle.inject_bytes(b"abcdef".to_vec());

        let mut buf = [0u8; 4];
        let n = link.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = link.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn records_writes_and_control_changes() {
        let (mut link, handle) = mock_link();
        link.write_all(b"SW_CLICK\n").await.unwrap();
        link.set_dtr(false).unwrap();
        link.set_rts(true).unwrap();
        link.set_rts(false).unwrap();

        assert_eq!(handle.written(), b"SW_CLICK\n");
        assert_eq!(
            handle.control_changes(),
            vec![
                ControlLine::Dtr(false),
                ControlLine::Rts(true),
                ControlLine::Rts(false)
            ]
        );
    }

    #[tokio::test]
    async fn broken_port_fails_io() {
        let (mut link, handle) = mock_link();
        handle.set_broken(true);
        assert!(link.write_all(b"x").await.is_err());
        let mut buf = [0u8; 4];
        assert!(link.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn opener_tracks_handles_and_failures() {
        let opener = MockSerialOpener::new();
        assert!(opener.open("/dev/mock0", 115_200).is_ok());
        assert_eq!(opener.open_count("/dev/mock0"), 1);
        assert!(opener.handle("/dev/mock0").is_some());

        opener.set_failing("/dev/mock0", true);
        assert!(opener.open("/dev/mock0", 115_200).is_err());
        assert_eq!(opener.open_count("/dev/mock0"), 2);
    }
}
