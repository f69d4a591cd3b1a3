//! Serial-port request transport built on Tokio and the `tokio-serial`
//! crate, for hosts wired to the controller directly instead of through a
//! socket tunnel.

use crate::transport::{FrameCollector, Transport, TransportError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{SerialPort, SerialPortBuilderExt};

/// Minimum delay between commands; the controller needs a few milliseconds
/// of bus silence at 9600 baud before it accepts the next request.
pub const MINIMUM_DELAY: Duration = Duration::from_millis(4);

/// [`Transport`] over a serial line (9600 8N1 by default).
#[derive(Debug)]
pub struct SerialTransport {
    serial: tokio_serial::SerialStream,
    last_execution: Instant,
    io_timeout: Duration,
    delay: Duration,
}

impl SerialTransport {
    pub fn new(port: &str) -> Result<Self, TransportError> {
        Ok(Self {
            serial: tokio_serial::new(port, 9600)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()?,
            last_execution: Instant::now(),
            io_timeout: Duration::from_secs(5),
            delay: MINIMUM_DELAY,
        })
    }

    /// Timeout for individual read/write operations on the port.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set io timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    /// Minimum delay between commands, floored at [`MINIMUM_DELAY`].
    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} below minimum {MINIMUM_DELAY:?}, using minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
    }

    async fn await_delay(&self) {
        let since_last = Instant::now().duration_since(self.last_execution);
        if let Some(remaining) = self.delay.checked_sub(since_last) {
            tokio::time::sleep(remaining).await;
        }
    }

    /// Drops any lingering bytes in the receive buffer so a stale, timed-out
    /// response cannot be taken for the answer to the next request.
    async fn drain_pending(&mut self) -> Result<(), TransportError> {
        loop {
            let pending = self.serial.bytes_to_read()?;
            if pending == 0 {
                return Ok(());
            }
            log::trace!("draining {pending} stale bytes");
            let mut buf = vec![0u8; 64];
            let received = tokio::time::timeout(self.io_timeout, self.serial.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout(self.io_timeout))??;
            log::trace!("{received} stale bytes consumed");
        }
    }
}

impl Transport for SerialTransport {
    async fn request(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.drain_pending().await?;
        self.await_delay().await;

        log::trace!("write frame: {frame:02X?}");
        tokio::time::timeout(self.io_timeout, self.serial.write_all(frame))
            .await
            .map_err(|_| TransportError::Timeout(self.io_timeout))??;

        let mut collector = FrameCollector::default();
        let mut buf = [0u8; 256];
        loop {
            if let Some(response) = collector.try_next_frame() {
                self.last_execution = Instant::now();
                log::trace!("received frame: {response:02X?}");
                return Ok(response);
            }
            let received = tokio::time::timeout(self.io_timeout, self.serial.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout(self.io_timeout))??;
            if received == 0 {
                return Err(TransportError::Closed);
            }
            collector.push(&buf[..received]);
        }
    }
}
