//! Native serial links over tokio-serial

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use super::{SerialError, SerialLink, SerialOpener};

/// A real serial port
pub struct NativeSerialLink {
    stream: SerialStream,
}

#[async_trait]
impl SerialLink for NativeSerialLink {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        Ok(self.stream.read(buf).await?)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), SerialError> {
        Ok(self.stream.write_all(data).await?)
    }

    fn set_rts(&mut self, level: bool) -> Result<(), SerialError> {
        Ok(self.stream.write_request_to_send(level)?)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), SerialError> {
        Ok(self.stream.write_data_terminal_ready(level)?)
    }
}

/// Opens real ports via the tokio-serial builder
#[derive(Debug, Default)]
pub struct NativeSerialOpener;

impl SerialOpener for NativeSerialOpener {
    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn SerialLink>, SerialError> {
        let stream = tokio_serial::new(path, baud).open_native_async()?;
        Ok(Box::new(NativeSerialLink { stream }))
    }
}
