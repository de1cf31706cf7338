/*!
Vehicle height from the light curtain.

The curtain streams 2-byte frames: the lowest and highest interrupted beam
index. Heights are `index * mm_per_step + offset`. While started, the
client keeps the largest high-beam height seen and hands it back on stop.
*/

use crate::config::LightCurtainConfig;
use crate::error::{LineError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One decoded beam pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurtainReading {
    pub low_idx: u8,
    pub high_idx: u8,
    pub low_mm: u32,
    pub high_mm: u32,
}

impl CurtainReading {
    pub fn span_mm(&self, mm_per_step: u32) -> u32 {
        self.high_idx.saturating_sub(self.low_idx) as u32 * mm_per_step
    }
}

/// Turns the byte stream into beam pairs and tracks the maximum height
#[derive(Debug, Clone)]
pub struct CurtainDecoder {
    mm_per_step: u32,
    offset_mm: u32,
    pending: Option<u8>,
    max_height: u32,
}

impl CurtainDecoder {
    pub fn new(mm_per_step: u32, offset_mm: u32) -> Self {
        Self {
            mm_per_step,
            offset_mm,
            pending: None,
            max_height: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<CurtainReading> {
        let mut readings = Vec::with_capacity(data.len() / 2 + 1);
        for &byte in data {
            let Some(low_idx) = self.pending.take() else {
                self.pending = Some(byte);
                continue;
            };
            let reading = CurtainReading {
                low_idx,
                high_idx: byte,
                low_mm: low_idx as u32 * self.mm_per_step + self.offset_mm,
                high_mm: byte as u32 * self.mm_per_step + self.offset_mm,
            };
            self.max_height = self.max_height.max(reading.high_mm);
            readings.push(reading);
        }
        readings
    }

    /// Largest high-beam height since creation, 0 when nothing was seen
    pub fn max_height(&self) -> u32 {
        self.max_height
    }
}

/// Height sensor started at car entry and stopped at inspection start
#[async_trait]
pub trait LightCurtain: Send + Sync {
    async fn start(&self, height_offset_mm: u32) -> Result<()>;

    /// Stop and return the maximum height (mm)
    async fn stop(&self) -> u32;
}

/// Stand-in when no curtain is installed
#[derive(Debug, Default)]
pub struct NullLightCurtain;

#[async_trait]
impl LightCurtain for NullLightCurtain {
    async fn start(&self, height_offset_mm: u32) -> Result<()> {
        debug!(height_offset_mm, "no light curtain configured");
        Ok(())
    }

    async fn stop(&self) -> u32 {
        0
    }
}

/// Curtain reached through a serial-to-TCP device server
pub struct TcpLightCurtain {
    addr: String,
    mm_per_step: u32,
    connect_timeout: Duration,
    receiver: Mutex<Option<(CancellationToken, JoinHandle<u32>)>>,
}

impl TcpLightCurtain {
    pub fn new(addr: &str, config: &LightCurtainConfig) -> Self {
        Self {
            addr: addr.to_string(),
            mm_per_step: config.mm_per_step,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            receiver: Mutex::new(None),
        }
    }
}

/// Curtain for the given configuration
pub fn from_config(config: &LightCurtainConfig) -> Box<dyn LightCurtain> {
    match &config.endpoint {
        Some(addr) => Box::new(TcpLightCurtain::new(addr, config)),
        None => Box::new(NullLightCurtain),
    }
}

#[async_trait]
impl LightCurtain for TcpLightCurtain {
    async fn start(&self, height_offset_mm: u32) -> Result<()> {
        let mut receiver = self.receiver.lock().await;
        if receiver.is_some() {
            return Ok(());
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| LineError::timeout("light curtain connect"))?
            .map_err(|e| LineError::connection("light curtain", format!("{}: {}", self.addr, e)))?;

        let cancel = CancellationToken::new();
        let decoder = CurtainDecoder::new(self.mm_per_step, height_offset_mm);
        let handle = tokio::spawn(receive_loop(stream, decoder, cancel.clone()));
        *receiver = Some((cancel, handle));
        info!("Light curtain started (offset {} mm)", height_offset_mm);
        Ok(())
    }

    async fn stop(&self) -> u32 {
        let Some((cancel, handle)) = self.receiver.lock().await.take() else {
            return 0;
        };
        cancel.cancel();
        let max_height = match handle.await {
            Ok(height) => height,
            Err(e) => {
                error!("light curtain task failed: {}", e);
                0
            }
        };
        info!("Light curtain stopped, max height {} mm", max_height);
        max_height
    }
}

async fn receive_loop(mut stream: TcpStream, mut decoder: CurtainDecoder, cancel: CancellationToken) -> u32 {
    let mut buf = [0u8; 256];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    warn!("light curtain closed the connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    error!("light curtain receive error: {}", e);
                    break;
                }
            },
        };
        for r in decoder.push(&buf[..n]) {
            debug!(
                "LOW idx={} h={} mm | HIGH idx={} h={} mm | SPAN {} mm",
                r.low_idx,
                r.low_mm,
                r.high_idx,
                r.high_mm,
                r.span_mm(decoder.mm_per_step)
            );
        }
    }
    decoder.max_height()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_decoder_pairs_and_max_height() {
        let mut decoder = CurtainDecoder::new(30, 440);
        let first = decoder.push(&[2, 10, 3]);
        assert_eq!(
            first,
            vec![CurtainReading {
                low_idx: 2,
                high_idx: 10,
                low_mm: 500,
                high_mm: 740,
            }]
        );
        assert_eq!(first[0].span_mm(30), 240);

        // Pair split across reads
        let second = decoder.push(&[12, 0, 4]);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].high_mm, 12 * 30 + 440);
        assert_eq!(decoder.max_height(), 800);
    }

    #[tokio::test]
    async fn test_null_curtain_reports_zero() {
        let curtain = NullLightCurtain;
        curtain.start(440).await.unwrap();
        assert_eq!(curtain.stop().await, 0);
    }

    #[tokio::test]
    async fn test_tcp_curtain_returns_max_height_on_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let device = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&[2, 10, 3, 12, 1, 5]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let curtain = TcpLightCurtain::new(&addr, &LightCurtainConfig::default());
        curtain.start(440).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(curtain.stop().await, 800);
        // Second stop has nothing to report
        assert_eq!(curtain.stop().await, 0);
        device.abort();
    }
}
