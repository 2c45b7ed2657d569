//! Serial link abstraction
//!
//! The rest of the bridge talks to devices through the [`SerialLink`] trait so
//! that relay loops, the registry, and the flash handoff can be exercised
//! against scripted ports. Production links are opened by
//! [`NativeSerialOpener`]; tests use [`mock::MockSerialOpener`].

mod error;
pub mod mock;
mod native;

pub use error::SerialError;
pub use native::NativeSerialOpener;

use async_trait::async_trait;

/// One end of a device's serial line
///
/// Owned by exactly one relay task at a time; the trait therefore takes
/// `&mut self` everywhere and implementations need no internal locking.
#[async_trait]
pub trait SerialLink: Send {
    /// Read available bytes into `buf`, waiting until at least one arrives
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError>;

    /// Write all of `data` to the device
    async fn write_all(&mut self, data: &[u8]) -> Result<(), SerialError>;

    /// Drive the RTS control line
    fn set_rts(&mut self, level: bool) -> Result<(), SerialError>;

    /// Drive the DTR control line
    fn set_dtr(&mut self, level: bool) -> Result<(), SerialError>;
}

/// Opens serial links for the registry
pub trait SerialOpener: Send + Sync {
    /// Open the port at `path` with the given baud rate
    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn SerialLink>, SerialError>;
}
