/*!
One robot TCP connection: a read loop feeding an inbound line queue and a
write loop draining an outbound line queue.

Either loop ending (remote close, socket error, oversized line, dispose)
cancels the other and drops the socket.
*/

use crate::error::{LineError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest line accepted before the session is dropped
pub const MAX_LINE_BYTES: usize = 8192;

const READ_CHUNK: usize = 4096;

/// Strip a byte-order mark, NUL characters and surrounding whitespace
pub fn normalize_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(text.as_ref());
    text.replace('\0', "").trim().to_string()
}

/// Live connection to one robot controller
pub struct RobotSession {
    index: u8,
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    cancel: CancellationToken,
}

impl RobotSession {
    /// Spawn the read/write loops over the given stream halves.
    ///
    /// The returned handle completes once both loops have stopped.
    pub fn start<R, W>(index: u8, reader: R, writer: W, parent: &CancellationToken) -> (Arc<Self>, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let cancel = parent.child_token();

        let session = Arc::new(Self {
            index,
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            cancel: cancel.clone(),
        });

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = read_loop(index, reader, in_tx, cancel.clone()) => {}
                _ = write_loop(index, writer, out_rx, cancel.clone()) => {}
            }
            cancel.cancel();
            info!(robot = index, "robot session closed");
        });

        (session, handle)
    }

    /// 1-based robot index
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Whether the loops have stopped or been told to stop
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop both loops and drop the socket
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Queue a line for sending; the terminator is added by the write loop
    pub fn send_line(&self, line: &str, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LineError::Cancelled);
        }
        if self.is_closed() {
            return Err(LineError::SessionClosed(self.index));
        }
        self.outbound
            .send(line.to_string())
            .map_err(|_| LineError::SessionClosed(self.index))
    }

    /// Wait for the first inbound line accepted by `matches`.
    ///
    /// Non-matching lines are consumed and skipped. Expiry of `timeout`
    /// yields [`LineError::Timeout`]; `cancel` yields [`LineError::Cancelled`];
    /// loss of the session yields [`LineError::SessionClosed`].
    pub async fn wait_for_message<F>(&self, matches: F, timeout: Duration, cancel: &CancellationToken) -> Result<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut inbound = self.inbound.lock().await;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LineError::Cancelled),
                line = inbound.recv() => match line {
                    Some(line) if matches(&line) => return Ok(line),
                    Some(line) => debug!(robot = self.index, "skipping line '{}'", line),
                    None => return Err(LineError::SessionClosed(self.index)),
                },
                _ = &mut deadline => {
                    return Err(LineError::timeout(format!("robot {} reply", self.index)));
                }
                _ = self.cancel.cancelled() => return Err(LineError::SessionClosed(self.index)),
            }
        }
    }
}

async fn read_loop<R>(index: u8, mut reader: R, inbound: mpsc::UnboundedSender<String>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let mut line: Vec<u8> = Vec::with_capacity(256);

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                warn!(robot = index, "read loop stop: remote closed");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(robot = index, "read loop stop: {}", e);
                return;
            }
        };

        for &byte in &buf[..n] {
            if byte == b'\n' {
                let text = normalize_line(&line);
                line.clear();
                if inbound.send(text).is_err() {
                    return;
                }
            } else {
                line.push(byte);
                if line.len() > MAX_LINE_BYTES {
                    warn!(robot = index, "read loop stop: line longer than {} bytes", MAX_LINE_BYTES);
                    return;
                }
            }
        }
    }
}

async fn write_loop<W>(index: u8, mut writer: W, mut outbound: mpsc::UnboundedReceiver<String>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = outbound.recv() => match line {
                Some(line) => line,
                None => return,
            },
        };

        let mut data = line.into_bytes();
        data.push(b'\n');
        if let Err(e) = writer.write_all(&data).await {
            warn!(robot = index, "write loop stop: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!(robot = index, "write loop stop: {}", e);
            return;
        }
    }
}
