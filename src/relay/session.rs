//! Per-client relay sessions.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tracing::debug;

/// Largest UDP datagram the relay will carry.
pub(crate) const MAX_DATAGRAM: usize = 65_535;

/// One client's path to the upstream server.
struct Session {
    /// Socket connected to the upstream server, owned by this client.
    upstream: UdpSocket,
    /// Unix second of the last datagram in either direction.
    last_active: AtomicI64,
}

impl Session {
    fn touch(&self, now: i64) {
        self.last_active.store(now, Ordering::Relaxed);
    }

    fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }
}

struct MapInner {
    sessions: DashMap<SocketAddr, Arc<Session>>,
    reply_socket: Arc<UdpSocket>,
    upstream_addr: SocketAddr,
    idle_secs: u64,
    max_sessions: usize,
}

/// All live client sessions.
///
/// Each client gets its own socket connected to the upstream server, so
/// upstream replies demultiplex by local port. A per-session pump task
/// carries replies back to the client and retires the session once it has
/// sat idle for the configured timeout.
pub(crate) struct SessionMap {
    inner: Arc<MapInner>,
}

impl SessionMap {
    pub fn new(
        reply_socket: Arc<UdpSocket>,
        upstream_addr: SocketAddr,
        idle_secs: u64,
        max_sessions: usize,
    ) -> Self {
        Self {
            inner: Arc::new(MapInner {
                sessions: DashMap::new(),
                reply_socket,
                upstream_addr,
                idle_secs,
                max_sessions,
            }),
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Forward one datagram from `client` to the upstream server, opening
    /// a session on first contact. Datagrams from unknown clients are
    /// dropped while the session table is full.
    pub async fn forward(&self, client: SocketAddr, payload: &[u8]) -> io::Result<()> {
        let session = match self
            .inner
            .sessions
            .get(&client)
            .map(|entry| Arc::clone(entry.value()))
        {
            Some(session) => session,
            None => {
                if self.inner.sessions.len() >= self.inner.max_sessions {
                    debug!(%client, "session table full, dropping datagram");
                    return Ok(());
                }
                self.open(client).await?
            }
        };
        session.touch(Utc::now().timestamp());
        session.upstream.send(payload).await?;
        Ok(())
    }

    async fn open(&self, client: SocketAddr) -> io::Result<Arc<Session>> {
        let local: SocketAddr = match self.inner.upstream_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let upstream = UdpSocket::bind(local).await?;
        upstream.connect(self.inner.upstream_addr).await?;

        let session = Arc::new(Session {
            upstream,
            last_active: AtomicI64::new(Utc::now().timestamp()),
        });
        self.inner.sessions.insert(client, Arc::clone(&session));
        spawn_reply_pump(Arc::clone(&self.inner), client, Arc::clone(&session));
        debug!(%client, upstream = %self.inner.upstream_addr, "opened relay session");
        Ok(session)
    }
}

/// Carry upstream replies back to the client until the session idles out
/// or the upstream socket fails. A datagram racing the idle close is lost
/// like any other dropped datagram; query clients retry.
fn spawn_reply_pump(inner: Arc<MapInner>, client: SocketAddr, session: Arc<Session>) {
    tokio::spawn(async move {
        let tick = Duration::from_secs(inner.idle_secs.max(1));
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match tokio::time::timeout(tick, session.upstream.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    session.touch(Utc::now().timestamp());
                    if let Err(e) = inner.reply_socket.send_to(&buf[..len], client).await {
                        debug!(%client, error = %e, "reply delivery failed");
                    }
                }
                Ok(Err(e)) => {
                    debug!(%client, error = %e, "upstream receive failed");
                    break;
                }
                Err(_) => {
                    let now = Utc::now().timestamp();
                    if now.saturating_sub(session.last_active()) >= inner.idle_secs as i64 {
                        break;
                    }
                }
            }
        }
        // A concurrent reopen may already have replaced the entry.
        inner
            .sessions
            .remove_if(&client, |_, live| Arc::ptr_eq(live, &session));
        debug!(%client, "relay session closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    async fn spawn_echo_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..len], peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_opens_a_session_and_relays_replies() {
        let upstream = spawn_echo_upstream().await;
        let reply_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let sessions = SessionMap::new(Arc::clone(&reply_socket), upstream, 30, 16);
        sessions.forward(client_addr, b"ping").await.unwrap();
        assert_eq!(sessions.len(), 1);

        let mut buf = [0u8; 64];
        let (len, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, reply_socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_repeat_traffic_reuses_the_session() {
        let upstream = spawn_echo_upstream().await;
        let reply_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client_addr: SocketAddr = "127.0.0.1:39998".parse().unwrap();

        let sessions = SessionMap::new(Arc::clone(&reply_socket), upstream, 30, 16);
        for _ in 0..5 {
            sessions.forward(client_addr, b"query").await.unwrap();
        }
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_sessions_are_retired() {
        let upstream = spawn_echo_upstream().await;
        let reply_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sessions = SessionMap::new(Arc::clone(&reply_socket), upstream, 1, 16);

        let client_addr: SocketAddr = "127.0.0.1:39999".parse().unwrap();
        sessions.forward(client_addr, b"query").await.unwrap();
        assert_eq!(sessions.len(), 1);

        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_session_table_is_capped() {
        let upstream = spawn_echo_upstream().await;
        let reply_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sessions = SessionMap::new(Arc::clone(&reply_socket), upstream, 30, 2);

        for port in 40_000..40_003u16 {
            let client: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            sessions.forward(client, b"hello").await.unwrap();
        }
        assert_eq!(sessions.len(), 2);
    }
}
