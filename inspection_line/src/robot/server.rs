use super::session::RobotSession;
use crate::config::RobotConfig;
use crate::error::{LineError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type SessionMap = Arc<Mutex<HashMap<u8, Arc<RobotSession>>>>;

/// Time allowed for session tasks to finish on stop
const STOP_GRACE: Duration = Duration::from_secs(2);

/// TCP listener that keeps at most one live session per robot
pub struct RobotServer {
    local_addr: SocketAddr,
    sessions: SessionMap,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    cancel: CancellationToken,
}

impl RobotServer {
    /// Bind the listener and start accepting.
    ///
    /// Robot `n` is the peer whose address matches `robots[n - 1].ip`.
    pub async fn bind(bind_addr: &str, port: u16, robots: &[RobotConfig], parent: &CancellationToken) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((bind_addr, port))
            .await
            .map_err(|e| LineError::connection("robot server", format!("bind {}:{}: {}", bind_addr, port, e)))?;
        let local_addr = listener.local_addr()?;
        info!("🤖 Robot server listening on {}", local_addr);

        let peers: HashMap<IpAddr, u8> = robots
            .iter()
            .enumerate()
            .map(|(i, robot)| (robot.ip.to_canonical(), (i + 1) as u8))
            .collect();

        let server = Arc::new(Self {
            local_addr,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(Vec::new())),
            cancel: parent.child_token(),
        });

        let accept = tokio::spawn(accept_loop(
            listener,
            peers,
            Arc::clone(&server.sessions),
            Arc::clone(&server.tasks),
            server.cancel.clone(),
        ));
        server.tasks.lock().push(accept);

        Ok(server)
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live session for a robot, if connected
    pub fn get_session(&self, index: u8) -> Option<Arc<RobotSession>> {
        self.sessions
            .lock()
            .get(&index)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Poll for a session until `timeout` elapses.
    ///
    /// `Ok(None)` means no robot connected in time.
    pub async fn wait_for_session(
        &self,
        index: u8,
        timeout: Duration,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<RobotSession>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(LineError::Cancelled);
            }
            if let Some(session) = self.get_session(index) {
                return Ok(Some(session));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LineError::Cancelled),
                _ = tokio::time::sleep(poll.min(deadline - now)) => {}
            }
        }
    }

    /// Indices of robots with a live session
    pub fn connected(&self) -> Vec<u8> {
        let mut indices: Vec<u8> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|(&i, _)| i)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Stop accepting, dispose every session and wait briefly for their tasks
    pub async fn stop(&self) {
        self.cancel.cancel();
        for session in self.sessions.lock().drain().map(|(_, s)| s) {
            session.dispose();
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let deadline = Instant::now() + STOP_GRACE;
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("robot server task did not stop within {:?}", STOP_GRACE);
                break;
            }
        }
        info!("🤖 Robot server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: HashMap<IpAddr, u8>,
    sessions: SessionMap,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("robot accept error: {}", e);
                continue;
            }
        };

        let Some(&index) = peers.get(&peer.ip().to_canonical()) else {
            warn!("rejecting connection from unknown robot address {}", peer);
            continue;
        };

        let supervisor = attach(index, stream, &sessions, &cancel);
        let mut tasks = tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(supervisor);
    }
}

/// Register a new session for `index`, replacing and disposing any previous one
fn attach(index: u8, stream: TcpStream, sessions: &SessionMap, cancel: &CancellationToken) -> JoinHandle<()> {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(robot = index, "failed to set TCP_NODELAY: {}", e);
    }
    let (reader, writer) = stream.into_split();
    let (session, handle) = RobotSession::start(index, reader, writer, cancel);

    if let Some(old) = sessions.lock().insert(index, Arc::clone(&session)) {
        info!(robot = index, "replacing previous robot session");
        old.dispose();
    }
    info!(robot = index, "🤖 Robot {} connected", index);

    let sessions = Arc::clone(sessions);
    tokio::spawn(async move {
        let _ = handle.await;
        let mut map = sessions.lock();
        // Only the owner of the slot may clear it
        if map.get(&index).is_some_and(|current| Arc::ptr_eq(current, &session)) {
            map.remove(&index);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    fn robots(ip: &str) -> Vec<RobotConfig> {
        vec![RobotConfig {
            ip: ip.parse().unwrap(),
            status_address: 0,
            move_address: 0,
        }]
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_session_keyed_by_peer_ip() {
        let cancel = CancellationToken::new();
        let server = RobotServer::bind("127.0.0.1", 0, &robots("127.0.0.1"), &cancel).await.unwrap();

        let client = TcpStream::connect(server.local_addr()).await.unwrap();
        let session = server
            .wait_for_session(1, Duration::from_secs(2), Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.index(), 1);
        assert_eq!(server.connected(), vec![1]);

        let (read, mut write) = client.into_split();
        session.send_line("0", &cancel).unwrap();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("0"));

        write.write_all(b"1,1,1\n").await.unwrap();
        let got = session
            .wait_for_message(|l| l == "1,1,1", Duration::from_secs(2), &cancel)
            .await
            .unwrap();
        assert_eq!(got, "1,1,1");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_session() {
        let cancel = CancellationToken::new();
        let server = RobotServer::bind("127.0.0.1", 0, &robots("127.0.0.1"), &cancel).await.unwrap();

        let mut first_client = TcpStream::connect(server.local_addr()).await.unwrap();
        let first = server
            .wait_for_session(1, Duration::from_secs(2), Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();

        let second_client = TcpStream::connect(server.local_addr()).await.unwrap();
        eventually(|| server.get_session(1).is_some_and(|s| !Arc::ptr_eq(&s, &first))).await;
        assert!(first.is_closed());

        // The replaced socket is closed from the server side
        let mut buf = [0u8; 8];
        assert_eq!(first_client.read(&mut buf).await.unwrap(), 0);

        // Old session exit must not evict the new one
        let second = server.get_session(1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(Arc::ptr_eq(&server.get_session(1).unwrap(), &second));

        drop(second_client);
        eventually(|| server.get_session(1).is_none()).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_peer_is_rejected() {
        let cancel = CancellationToken::new();
        let server = RobotServer::bind("127.0.0.1", 0, &robots("10.1.2.3"), &cancel).await.unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(server.get_session(1).is_none());
        server.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_session_times_out() {
        let cancel = CancellationToken::new();
        let server = RobotServer::bind("127.0.0.1", 0, &robots("127.0.0.1"), &cancel).await.unwrap();

        let start = Instant::now();
        let found = server
            .wait_for_session(1, Duration::from_secs(1), Duration::from_millis(100), &cancel)
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(start.elapsed() >= Duration::from_secs(1));
        server.stop().await;
    }
}
