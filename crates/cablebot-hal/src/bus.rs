//! Field-bus transport.
//!
//! [`FieldBus`] is the seam between the driver layer and the wire: one
//! register write, acknowledged or failed within a bounded time.  [`RtuBus`]
//! implements it over any async byte stream, which covers both a TCP RS-485
//! gateway and a serial device node that has already been configured for
//! the line speed.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use cablebot_types::DriverError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::modbus::{
    EXCEPTION_FLAG, EXCEPTION_FRAME_LEN, FN_WRITE_SINGLE_REGISTER, WRITE_FRAME_LEN, crc_ok,
    write_single_register,
};

/// A motor field bus.
///
/// Implementations must return within their configured timeout; a silent
/// device is reported as [`DriverError::BusTimeout`], never waited on.
#[async_trait]
pub trait FieldBus: Send {
    /// Write one holding register on `slave` and wait for the acknowledgement.
    async fn write_register(
        &mut self,
        slave: u8,
        register: u16,
        value: u16,
    ) -> Result<(), DriverError>;
}

/// Modbus RTU over an async byte stream.
pub struct RtuBus<S> {
    stream: S,
    timeout: Duration,
    /// Set after a failed exchange: the line may still carry a late reply
    /// that must be discarded before the next request.
    dirty: bool,
}

impl RtuBus<TcpStream> {
    /// Connect to an RS-485 gateway at `addr` (`host:port`).
    pub async fn connect_tcp(addr: &str, timeout: Duration) -> Result<Self, DriverError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DriverError::Io(format!("connect to {addr} timed out")))?
            .map_err(|e| DriverError::Io(format!("connect to {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DriverError::Io(e.to_string()))?;
        debug!(addr, "field bus gateway connected");
        Ok(Self::new(stream, timeout))
    }
}

impl RtuBus<tokio::fs::File> {
    /// Open a serial device node.  Line settings (baud rate, parity) are
    /// expected to be configured outside the process.
    pub async fn open_device(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| DriverError::Io(format!("open {}: {e}", path.display())))?;
        debug!(path = %path.display(), "field bus device opened");
        Ok(Self::new(file, timeout))
    }
}

impl<S> RtuBus<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            timeout,
            dirty: false,
        }
    }

    async fn discard_stale_input(&mut self) {
        let mut scratch = [0u8; 64];
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(2), self.stream.read(&mut scratch)).await
        {
            if n == 0 {
                break;
            }
            debug!(bytes = n, "discarded stale field bus input");
        }
    }

    async fn exchange(&mut self, request: &[u8; WRITE_FRAME_LEN]) -> Result<(), DriverError> {
        let slave = request[0];
        let io = |e: std::io::Error| DriverError::Io(e.to_string());

        self.stream.write_all(request).await.map_err(io)?;
        self.stream.flush().await.map_err(io)?;

        let mut head = [0u8; 2];
        self.stream.read_exact(&mut head).await.map_err(io)?;
        if head[0] != slave {
            return Err(DriverError::Io(format!(
                "reply from slave {} while waiting for slave {slave}",
                head[0]
            )));
        }

        if head[1] == FN_WRITE_SINGLE_REGISTER | EXCEPTION_FLAG {
            let mut reply = [0u8; EXCEPTION_FRAME_LEN];
            reply[..2].copy_from_slice(&head);
            self.stream.read_exact(&mut reply[2..]).await.map_err(io)?;
            if !crc_ok(&reply) {
                return Err(DriverError::Io(format!("corrupt exception reply from slave {slave}")));
            }
            return Err(DriverError::DeviceNack {
                slave,
                code: reply[2],
            });
        }

        let mut reply = [0u8; WRITE_FRAME_LEN];
        reply[..2].copy_from_slice(&head);
        self.stream.read_exact(&mut reply[2..]).await.map_err(io)?;
        if &reply != request {
            return Err(DriverError::Io(format!("slave {slave} echo does not match request")));
        }
        Ok(())
    }
}

#[async_trait]
impl<S> FieldBus for RtuBus<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_register(
        &mut self,
        slave: u8,
        register: u16,
        value: u16,
    ) -> Result<(), DriverError> {
        if self.dirty {
            self.discard_stale_input().await;
            self.dirty = false;
        }

        let request = write_single_register(slave, register, value);
        let result = match tokio::time::timeout(self.timeout, self.exchange(&request)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::BusTimeout { slave }),
        };
        if let Err(ref e) = result {
            warn!(slave, register, error = %e, "field bus write failed");
            self.dirty = true;
        }
        result
    }
}
