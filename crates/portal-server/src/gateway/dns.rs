//! DNS interception: redirect blocked clients, relay for allowed ones.
//!
//! The receive loop owns the UDP socket. Every datagram is handled on its
//! own task so a slow upstream never stalls replies to other clients; the
//! tasks hand their replies back to the loop over an `mpsc` channel, so the
//! socket is dropped as soon as the loop returns.

use super::limit::TaskLimiter;
use super::client_ip;
use portal_core::dns::{self, DnsQuery, MAX_DATAGRAM};
use portal_core::{AuthorizationTable, PortalResult};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Receive buffer for upstream answers, which may use EDNS and exceed 512 bytes.
const UPSTREAM_BUFFER: usize = 4096;

/// Per-query decision logic plus the upstream relay.
pub struct DnsInterceptor {
    /// Shared authorization state.
    table: Arc<AuthorizationTable>,
    /// Address handed to blocked clients.
    portal_ip: Ipv4Addr,
    /// Real resolver used for allowed clients.
    upstream: SocketAddr,
    /// How long to wait for the upstream answer.
    relay_timeout: Duration,
}

impl DnsInterceptor {
    pub fn new(
        table: Arc<AuthorizationTable>,
        portal_ip: Ipv4Addr,
        upstream: SocketAddr,
        relay_timeout: Duration,
    ) -> Self {
        Self {
            table,
            portal_ip,
            upstream,
            relay_timeout,
        }
    }

    /// Decide how to answer one datagram from `client`.
    ///
    /// Returns the bytes to send back, or `None` to stay silent (malformed
    /// query, upstream failure or timeout).
    pub async fn handle_query(&self, datagram: &[u8], client: SocketAddr) -> Option<Vec<u8>> {
        let query = match DnsQuery::parse(datagram) {
            Ok(q) => q,
            Err(e) => {
                debug!(client = %client, error = %e, "dropping DNS datagram");
                return None;
            }
        };

        let ip = client_ip(client);
        if self.table.is_allowed(&ip) {
            return self.relay(datagram, client).await;
        }

        if self.table.observe(ip) {
            info!(client = %ip, "new client, redirecting to portal");
        }
        debug!(client = %ip, id = query.transaction_id, "answering with portal address");
        Some(query.redirect(self.portal_ip).encode())
    }

    /// Forward the raw datagram upstream and return the raw answer.
    async fn relay(&self, datagram: &[u8], client: SocketAddr) -> Option<Vec<u8>> {
        match tokio::time::timeout(self.relay_timeout, self.forward(datagram)).await {
            Ok(Ok(answer)) => {
                debug!(client = %client, upstream = %self.upstream, "relayed upstream answer");
                Some(answer)
            }
            Ok(Err(e)) => {
                warn!(client = %client, upstream = %self.upstream, error = %e, "DNS relay failed");
                None
            }
            Err(_) => {
                debug!(client = %client, upstream = %self.upstream, "DNS relay timed out");
                None
            }
        }
    }

    async fn forward(&self, datagram: &[u8]) -> PortalResult<Vec<u8>> {
        let local: SocketAddr = if self.upstream.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.upstream).await?;
        socket.send(datagram).await?;

        let expected = dns::transaction_id(datagram);
        let mut buf = vec![0u8; UPSTREAM_BUFFER];
        loop {
            let n = socket.recv(&mut buf).await?;
            if dns::transaction_id(&buf[..n]) == expected {
                return Ok(buf[..n].to_vec());
            }
            debug!(upstream = %self.upstream, "ignoring upstream reply with foreign ID");
        }
    }

    /// Receive loop. Returns once `shutdown` flips to `true` or its sender
    /// is dropped; the socket is closed on return.
    pub async fn serve(
        self: Arc<Self>,
        socket: UdpSocket,
        limiter: TaskLimiter,
        mut shutdown: watch::Receiver<bool>,
    ) -> PortalResult<()> {
        let (reply_tx, mut reply_rx) =
            mpsc::channel::<(Vec<u8>, SocketAddr)>(limiter.max_tasks().max(1));
        let mut buf = [0u8; MAX_DATAGRAM];

        if *shutdown.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some((reply, client)) = reply_rx.recv() => {
                    if let Err(e) = socket.send_to(&reply, client).await {
                        warn!(client = %client, error = %e, "DNS send failed");
                    }
                }
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, client)) => {
                            let Some(guard) = limiter.try_acquire() else {
                                debug!(client = %client, active = limiter.active(), "DNS task limit reached, dropping query");
                                continue;
                            };
                            let datagram = buf[..n].to_vec();
                            let interceptor = self.clone();
                            let reply_tx = reply_tx.clone();
                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Some(reply) = interceptor.handle_query(&datagram, client).await {
                                    // The loop may already be gone during shutdown.
                                    let _ = reply_tx.send((reply, client)).await;
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "DNS receive failed");
                        }
                    }
                }
            }
        }

        info!("DNS listener stopped");
        Ok(())
    }
}
