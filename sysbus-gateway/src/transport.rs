//! Byte channels the bus scheduler talks through.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::info;

use crate::config::ConnectionConfig;
use crate::sim::SimulatedController;

/// A duplex byte stream carrying SysBus frames.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Owned, type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Error type for opening a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Connection timeout")]
    Timeout,
}

/// Open the transport described by `connection`.
pub async fn open(
    connection: &ConnectionConfig,
    timeout: Duration,
) -> Result<BoxedTransport, TransportError> {
    match connection {
        ConnectionConfig::Tcp { host, port } => {
            let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?
                .next()
                .ok_or_else(|| {
                    TransportError::Connection(format!("{}:{} did not resolve", host, port))
                })?;

            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            stream
                .set_nodelay(true)
                .map_err(|e| TransportError::Connection(e.to_string()))?;

            info!(%addr, "Connected to SysBus over TCP");
            Ok(Box::new(stream))
        }
        ConnectionConfig::Rtu {
            port,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        } => {
            let parity = match parity.to_lowercase().as_str() {
                "even" => tokio_serial::Parity::Even,
                "odd" => tokio_serial::Parity::Odd,
                _ => tokio_serial::Parity::None,
            };

            let stop_bits = match stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };

            let data_bits = match data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };

            let builder = tokio_serial::new(port, *baud_rate)
                .parity(parity)
                .stop_bits(stop_bits)
                .data_bits(data_bits);

            let serial = tokio_serial::SerialStream::open(&builder)
                .map_err(|e| TransportError::Connection(format!("Serial open failed: {}", e)))?;

            info!(port = %port, baud_rate, "Opened SysBus serial line");
            Ok(Box::new(serial))
        }
        ConnectionConfig::Simulated => {
            let (bus, device) = tokio::io::duplex(1024);
            SimulatedController::heating_controller().serve(device);
            info!("Attached simulated controller");
            Ok(Box::new(bus))
        }
    }
}
