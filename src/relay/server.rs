//! UDP relay fronting the protected game server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::ratelimit::{QueryGate, SourceKey};

use super::session::{SessionMap, MAX_DATAGRAM};

/// Four 0xFF bytes open every out-of-band packet in the Quake-derived wire
/// families; anything else belongs to an established connection.
pub const CONNECTIONLESS_HEADER: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Seconds between relay status lines.
const STATUS_INTERVAL_SECS: u64 = 60;

/// True when a datagram is an out-of-band query rather than connection
/// traffic.
pub fn is_connectionless(payload: &[u8]) -> bool {
    payload.len() >= CONNECTIONLESS_HEADER.len() && payload[..4] == CONNECTIONLESS_HEADER
}

/// The UDP relay: receives client traffic on the public port, rate limits
/// out-of-band queries and forwards everything else to the protected
/// server untouched. Denied queries are dropped silently; the flooder
/// learns nothing and no reply bandwidth is spent.
pub struct RelayServer {
    config: ServerConfig,
    gate: Arc<QueryGate>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, gate: Arc<QueryGate>) -> Self {
        Self { config, gate }
    }

    /// Run the relay until the process is killed.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Run the relay until `shutdown` completes.
    pub async fn serve_with_shutdown(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.config.listen_addr).await?);
        info!(
            listen = %socket.local_addr()?,
            upstream = %self.config.upstream_addr,
            "relay listening"
        );

        let sessions = SessionMap::new(
            Arc::clone(&socket),
            self.config.upstream_addr,
            self.config.session_idle_secs,
            self.config.max_sessions,
        );

        let mut status = interval(Duration::from_secs(STATUS_INTERVAL_SECS));
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                _ = status.tick() => self.log_status(&sessions),
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => self.handle_datagram(&sessions, &buf[..len], peer).await,
                    Err(e) => warn!(error = %e, "receive failed"),
                },
            }
        }
        Ok(())
    }

    async fn handle_datagram(&self, sessions: &SessionMap, payload: &[u8], peer: SocketAddr) {
        if self.needs_check(payload, peer) && !self.gate.check(SourceKey::from(peer)) {
            trace!(%peer, "dropped rate limited query");
            return;
        }
        if let Err(e) = sessions.forward(peer, payload).await {
            debug!(%peer, error = %e, "forward failed");
        }
    }

    /// Only out-of-band queries are rate limited. Connection traffic has
    /// its own handshake-level protection upstream, and loopback sources
    /// (rcon tools, local monitoring) can be exempted outright.
    fn needs_check(&self, payload: &[u8], peer: SocketAddr) -> bool {
        if !is_connectionless(payload) {
            return false;
        }
        if self.config.exempt_loopback && peer.ip().is_loopback() {
            return false;
        }
        true
    }

    fn log_status(&self, sessions: &SessionMap) {
        let stats = self.gate.stats();
        info!(
            checked = stats.checked,
            blocked_source = stats.blocked_by_source,
            blocked_global = stats.blocked_by_global,
            flood_resets = stats.flood_resets,
            tracked_sources = self.gate.tracked_sources(),
            sessions = sessions.len(),
            "relay status"
        );
    }
}
