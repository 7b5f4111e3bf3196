//! Gateway coordinator: binds both listeners and owns their lifecycle.
//!
//! Owns the authorization table shared by the DNS and HTTP gateways and the
//! shutdown channel observed by both accept/receive loops.
//! [`RunningPortal::stop`] only returns after both loops have returned and
//! dropped their sockets, so the ports can be re-bound immediately.

use crate::config::PortalConfig;
use crate::firewall::Firewall;
use crate::gateway::{DnsInterceptor, HttpGateway, TaskLimiter};
use crate::auth::LoginRateLimiter;
use portal_core::{AuthorizationTable, CredentialStore, PortalError, PortalResult};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Longest pause between two expiry / garbage-collection sweeps.
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// A configured portal that has not started listening yet.
pub struct PortalServer {
    config: PortalConfig,
    /// Address returned in redirect answers.
    portal_ip: Ipv4Addr,
    /// Shared authorization state.
    table: Arc<AuthorizationTable>,
    credentials: Arc<dyn CredentialStore>,
    firewall: Arc<dyn Firewall>,
}

impl PortalServer {
    /// Create a new portal with a fresh authorization table.
    pub fn new(
        config: PortalConfig,
        portal_ip: Ipv4Addr,
        credentials: Arc<dyn CredentialStore>,
        firewall: Arc<dyn Firewall>,
    ) -> Self {
        let table = Arc::new(AuthorizationTable::with_session_ttl(config.session_ttl));
        Self {
            config,
            portal_ip,
            table,
            credentials,
            firewall,
        }
    }

    /// Bind both sockets and spawn the DNS loop, the HTTP loop and the sweeper.
    ///
    /// Bind failures are returned before anything is spawned.
    pub async fn start(self) -> PortalResult<RunningPortal> {
        let dns_addr = self.config.dns_addr();
        let http_addr = self.config.http_addr();

        let udp_socket = UdpSocket::bind(dns_addr)
            .await
            .map_err(|e| PortalError::bind(dns_addr, e))?;
        let tcp_listener = TcpListener::bind(http_addr)
            .await
            .map_err(|e| PortalError::bind(http_addr, e))?;
        let dns_local = udp_socket.local_addr()?;
        let http_local = tcp_listener.local_addr()?;

        self.firewall.prepare();

        let dns = Arc::new(DnsInterceptor::new(
            self.table.clone(),
            self.portal_ip,
            self.config.upstream,
            self.config.relay_timeout,
        ));
        let http = Arc::new(HttpGateway::new(
            self.table.clone(),
            self.credentials.clone(),
            self.firewall.clone(),
            self.config.web_root.clone(),
            LoginRateLimiter::new(self.config.login_attempts, self.config.login_window),
            self.config.read_timeout,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dns_task = tokio::spawn(dns.serve(
            udp_socket,
            TaskLimiter::new(self.config.max_tasks),
            shutdown_rx.clone(),
        ));
        let http_task = tokio::spawn(http.clone().serve(
            tcp_listener,
            TaskLimiter::new(self.config.max_tasks),
            shutdown_rx.clone(),
        ));

        let period = self
            .config
            .session_ttl
            .map(|ttl| ttl.clamp(Duration::from_secs(1), MAX_SWEEP_PERIOD))
            .unwrap_or(MAX_SWEEP_PERIOD);
        let sweep_task = tokio::spawn(sweep(
            self.table.clone(),
            http,
            self.firewall.clone(),
            period,
            shutdown_rx,
        ));

        info!(
            dns = %dns_local,
            http = %http_local,
            portal = %self.portal_ip,
            upstream = %self.config.upstream,
            "portal ready"
        );

        Ok(RunningPortal {
            shutdown_tx,
            dns_task: Some(dns_task),
            http_task: Some(http_task),
            sweep_task: Some(sweep_task),
            dns_addr: dns_local,
            http_addr: http_local,
            table: self.table,
        })
    }
}

/// Handle to a started portal.
pub struct RunningPortal {
    /// Flipped to `true` to stop every loop.
    shutdown_tx: watch::Sender<bool>,
    dns_task: Option<JoinHandle<PortalResult<()>>>,
    http_task: Option<JoinHandle<PortalResult<()>>>,
    sweep_task: Option<JoinHandle<()>>,
    dns_addr: SocketAddr,
    http_addr: SocketAddr,
    table: Arc<AuthorizationTable>,
}

impl RunningPortal {
    /// Address the DNS listener is bound to.
    pub fn dns_addr(&self) -> SocketAddr {
        self.dns_addr
    }

    /// Address the HTTP listener is bound to.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn table(&self) -> &Arc<AuthorizationTable> {
        &self.table
    }

    /// Resolve when either listener loop ends on its own, which only happens
    /// on an unrecoverable error.
    pub async fn wait(&mut self) -> PortalResult<()> {
        let (Some(dns), Some(http)) = (self.dns_task.as_mut(), self.http_task.as_mut()) else {
            return Ok(());
        };

        let (dns_done, result) = tokio::select! {
            result = dns => (true, join_result("DNS", result)),
            result = http => (false, join_result("HTTP", result)),
        };
        // A finished handle must not be awaited again by stop().
        if dns_done {
            self.dns_task = None;
        } else {
            self.http_task = None;
        }
        result
    }

    /// Signal shutdown and wait until both listeners have closed their sockets.
    pub async fn stop(mut self) -> PortalResult<()> {
        info!("stopping portal");
        self.shutdown_tx.send_replace(true);

        let mut outcome = Ok(());
        if let Some(task) = self.dns_task.take() {
            outcome = outcome.and(join_result("DNS", task.await));
        }
        if let Some(task) = self.http_task.take() {
            outcome = outcome.and(join_result("HTTP", task.await));
        }
        if let Some(task) = self.sweep_task.take() {
            let _ = task.await;
        }

        info!("portal stopped");
        outcome
    }
}

fn join_result(
    name: &str,
    result: Result<PortalResult<()>, tokio::task::JoinError>,
) -> PortalResult<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(PortalError::Other(format!("{name} listener task failed: {e}"))),
    }
}

/// Periodic housekeeping: expire stale logins and trim the login limiter.
async fn sweep(
    table: Arc<AuthorizationTable>,
    http: Arc<HttpGateway>,
    firewall: Arc<dyn Firewall>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                for ip in table.expire_allowed() {
                    info!(client = %ip, "session expired");
                    firewall.block_client(ip);
                }
                http.login_limiter().gc();
                debug!(
                    clients = table.len(),
                    limited = http.login_limiter().tracked(),
                    "sweep complete"
                );
            }
        }
    }
}
