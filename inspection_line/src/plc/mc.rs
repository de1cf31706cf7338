/*!
Narrow MC protocol (3E binary frame) client over TCP.

Only batch word read (0x0401) and batch word write (0x1401) are used. The
connection is opened lazily and dropped on any I/O failure so the next
request reconnects.
*/

use super::{DeviceType, PlcTransport};
use crate::error::{LineError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const SUBHEADER_REQUEST: [u8; 2] = [0x50, 0x00];
const SUBHEADER_RESPONSE: [u8; 2] = [0xD0, 0x00];
/// Network 0, PC 0xFF, request I/O 0x03FF, station 0
const ROUTE: [u8; 5] = [0x00, 0xFF, 0xFF, 0x03, 0x00];
const RESPONSE_HEADER: usize = 9;
const CMD_BATCH_READ: u16 = 0x0401;
const CMD_BATCH_WRITE: u16 = 0x1401;
/// Monitoring timer in 250 ms units
const MONITOR_TIMER: u16 = 0x0010;

/// Build a 3E binary request for a word batch command
pub(crate) fn encode_request(command: u16, device: DeviceType, address: u32, count: u16, data: &[u16]) -> Vec<u8> {
    let mut body = Vec::with_capacity(12 + data.len() * 2);
    body.extend_from_slice(&MONITOR_TIMER.to_le_bytes());
    body.extend_from_slice(&command.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&address.to_le_bytes()[..3]);
    body.push(device.code());
    body.extend_from_slice(&count.to_le_bytes());
    for word in data {
        body.extend_from_slice(&word.to_le_bytes());
    }

    let mut frame = Vec::with_capacity(RESPONSE_HEADER + body.len());
    frame.extend_from_slice(&SUBHEADER_REQUEST);
    frame.extend_from_slice(&ROUTE);
    frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Validate a response header and return the length of what follows
pub(crate) fn response_length(header: &[u8; RESPONSE_HEADER]) -> Result<usize> {
    if header[..2] != SUBHEADER_RESPONSE {
        return Err(LineError::InvalidResponse(format!(
            "unexpected subheader {}",
            hex::encode(&header[..2])
        )));
    }
    let len = u16::from_le_bytes([header[7], header[8]]) as usize;
    if len < 2 {
        return Err(LineError::InvalidResponse(format!("response length {} too short", len)));
    }
    Ok(len)
}

/// Split a response body into end code and little-endian words
pub(crate) fn decode_words(body: &[u8]) -> Result<Vec<u16>> {
    let end_code = u16::from_le_bytes([body[0], body[1]]);
    if end_code != 0 {
        return Err(LineError::PlcEndCode(end_code));
    }
    Ok(body[2..]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// MC 3E client for a single PLC
pub struct McProtocolClient {
    addr: String,
    io_timeout: Duration,
    stream: Option<TcpStream>,
}

impl McProtocolClient {
    /// Create a client; the connection is opened on first use
    pub fn new(host: &str, port: u16, io_timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            io_timeout,
            stream: None,
        }
    }

    /// Open the TCP connection if it is not already up
    pub async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.io_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| LineError::timeout(format!("PLC connect to {}", self.addr)))?
            .map_err(|e| LineError::connection("plc", format!("{}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        info!("🔌 Connected to PLC at {}", self.addr);
        self.stream = Some(stream);
        Ok(())
    }

    async fn request(&mut self, frame: &[u8]) -> Result<Vec<u16>> {
        self.connect().await?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(LineError::connection("plc", "not connected"));
        };
        debug!("MC tx {}", hex::encode(frame));

        let exchange = async {
            stream.write_all(frame).await?;
            let mut header = [0u8; RESPONSE_HEADER];
            stream.read_exact(&mut header).await?;
            let len = response_length(&header)?;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            debug!("MC rx {}{}", hex::encode(header), hex::encode(&body));
            Ok::<_, LineError>(body)
        };

        let body = match tokio::time::timeout(self.io_timeout, exchange).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                warn!("PLC exchange failed, dropping connection: {}", e);
                self.stream = None;
                return Err(e);
            }
            Err(_) => {
                self.stream = None;
                return Err(LineError::timeout("PLC response"));
            }
        };
        decode_words(&body)
    }
}

#[async_trait]
impl PlcTransport for McProtocolClient {
    async fn get_device(&mut self, device: DeviceType, address: u32) -> Result<u16> {
        let words = self.read_block(device, address, 1).await?;
        words
            .first()
            .copied()
            .ok_or_else(|| LineError::InvalidResponse("empty read response".to_string()))
    }

    async fn set_device(&mut self, device: DeviceType, address: u32, value: u16) -> Result<()> {
        self.write_block(device, address, &[value]).await
    }

    async fn read_block(&mut self, device: DeviceType, address: u32, count: u16) -> Result<Vec<u16>> {
        let frame = encode_request(CMD_BATCH_READ, device, address, count, &[]);
        let words = self.request(&frame).await?;
        if words.len() != count as usize {
            return Err(LineError::InvalidResponse(format!(
                "expected {} words, got {}",
                count,
                words.len()
            )));
        }
        Ok(words)
    }

    async fn write_block(&mut self, device: DeviceType, address: u32, data: &[u16]) -> Result<()> {
        let frame = encode_request(CMD_BATCH_WRITE, device, address, data.len() as u16, data);
        self.request(&frame).await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
