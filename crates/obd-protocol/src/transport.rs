//! Byte-stream Transports to the Interpreter
//!
//! ELM327 clones are reached either over WiFi (a raw TCP socket, usually
//! `192.168.0.10:35000`) or over a USB/Bluetooth serial port. Both are
//! exposed through the [`Transport`] trait; framing and timeouts live in
//! [`crate::framer::Framer`].

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::SerialStream;
use tracing::{debug, info};

/// Default WiFi adapter address
pub const DEFAULT_TCP_HOST: &str = "192.168.0.10";
/// Default WiFi adapter port
pub const DEFAULT_TCP_PORT: u16 = 35000;
/// Default serial baud rate for ELM327 adapters
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Raw half-duplex byte channel
#[async_trait]
pub trait Transport: Send {
    /// Open the underlying socket or device
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Write all bytes
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read whatever is available into `buf`; `Ok(0)` means the peer closed
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Close the channel; closing twice is not an error
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human-readable endpoint, for logs
    fn describe(&self) -> String;
}

/// Transport selection, as found in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Tcp {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

fn default_host() -> String {
    DEFAULT_TCP_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Tcp {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl TransportConfig {
    /// Build an unconnected transport, `timeout` bounding the connect step
    pub fn build(&self, timeout: Duration) -> Box<dyn Transport> {
        match self {
            TransportConfig::Tcp { host, port } => {
                Box::new(TcpTransport::new(host.clone(), *port, timeout))
            }
            TransportConfig::Serial { path, baud_rate } => {
                Box::new(SerialTransport::new(path.clone(), *baud_rate, timeout))
            }
        }
    }
}

async fn write_stream<S>(stream: Option<&mut S>, bytes: &[u8]) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin + Send,
{
    let stream = stream.ok_or(TransportError::NotConnected)?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_stream<S>(stream: Option<&mut S>, buf: &mut [u8]) -> Result<usize, TransportError>
where
    S: AsyncRead + Unpin + Send,
{
    let stream = stream.ok_or(TransportError::NotConnected)?;
    Ok(stream.read(buf).await?)
}

/// TCP transport for WiFi adapters
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let target = self.describe();
        info!("Connecting to OBD adapter at {}", target);

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::Connect {
                target: target.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        write_stream(self.stream.as_mut(), bytes).await
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        read_stream(self.stream.as_mut(), buf).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Closing TCP transport {}", self.describe());
            // peer may already be gone
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Serial transport for USB/Bluetooth adapters
pub struct SerialTransport {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    path: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout,
            port: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        info!(
            "Opening serial OBD adapter {} at {} baud",
            self.path, self.baud_rate
        );

        let builder = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .timeout(self.timeout);

        let port = SerialStream::open(&builder).map_err(|e| TransportError::Connect {
            target: self.describe(),
            reason: e.to_string(),
        })?;

        self.port = Some(port);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        write_stream(self.port.as_mut(), bytes).await
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        read_stream(self.port.as_mut(), buf).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!("Closed serial transport {}", self.path);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.path, self.baud_rate)
    }
}
