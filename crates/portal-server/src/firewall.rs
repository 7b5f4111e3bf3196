//! Packet-filter hooks for releasing and blocking clients.
//!
//! Rule changes are fire-and-forget: commands run on a background worker in
//! the order they were requested, and a failing command is logged, never
//! reported to the caller. Nothing is verified or rolled back.

use std::net::IpAddr;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Firewall collaborator used by the HTTP gateway and the session sweeper.
pub trait Firewall: Send + Sync {
    /// One-time setup before the gateway starts serving.
    fn prepare(&self) {}

    /// Let all traffic from and to `ip` through.
    fn release_client(&self, ip: IpAddr);

    /// Drop all traffic from and to `ip`.
    fn block_client(&self, ip: IpAddr);
}

/// Firewall that only logs. Used when rule management is disabled.
#[derive(Debug, Default)]
pub struct NoopFirewall;

impl Firewall for NoopFirewall {
    fn release_client(&self, ip: IpAddr) {
        debug!(client = %ip, "firewall disabled, skipping release");
    }

    fn block_client(&self, ip: IpAddr) {
        debug!(client = %ip, "firewall disabled, skipping block");
    }
}

/// Inserts rules at the head of a chain by invoking `iptables`.
///
/// Every call queues its rules on one background worker, so rules are
/// applied in call order even though callers never wait for them.
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    chain: String,
    /// Queue of rule batches; `None` when created outside a runtime.
    queue: Option<mpsc::UnboundedSender<Vec<Vec<String>>>>,
}

impl IptablesFirewall {
    /// Create the firewall and spawn its worker on the current runtime.
    pub fn new(program: impl Into<String>, chain: impl Into<String>) -> Self {
        let program = program.into();
        let queue = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::unbounded_channel();
                handle.spawn(apply_rules(program, rx));
                Some(tx)
            }
            Err(_) => {
                warn!("no async runtime, firewall rules will not be applied");
                None
            }
        };
        Self {
            chain: chain.into(),
            queue,
        }
    }

    /// Flush the chain and default it to DROP.
    pub fn prepare_rules(&self) -> Vec<Vec<String>> {
        vec![
            args(&["-F", &self.chain]),
            args(&["-P", &self.chain, "DROP"]),
        ]
    }

    pub fn release_rules(&self, ip: IpAddr) -> Vec<Vec<String>> {
        let ip = ip.to_string();
        vec![
            args(&["-I", &self.chain, "1", "-s", &ip, "-j", "ACCEPT"]),
            args(&["-I", &self.chain, "1", "-d", &ip, "-j", "ACCEPT"]),
        ]
    }

    pub fn block_rules(&self, ip: IpAddr) -> Vec<Vec<String>> {
        let ip = ip.to_string();
        vec![
            args(&["-I", &self.chain, "1", "-d", &ip, "-j", "DROP"]),
            args(&["-I", &self.chain, "1", "-s", &ip, "-j", "DROP"]),
        ]
    }

    fn enqueue(&self, rules: Vec<Vec<String>>) {
        let Some(queue) = &self.queue else {
            warn!(rules = ?rules, "firewall worker not running, rules dropped");
            return;
        };
        if queue.send(rules).is_err() {
            warn!("firewall worker stopped, rules dropped");
        }
    }
}

/// Worker loop: run every queued rule, one command at a time.
async fn apply_rules(program: String, mut queue: mpsc::UnboundedReceiver<Vec<Vec<String>>>) {
    while let Some(rules) = queue.recv().await {
        for rule in rules {
            // -w waits for the xtables lock instead of failing.
            match Command::new(&program).arg("-w").args(&rule).status().await {
                Ok(status) if status.success() => {
                    debug!(program = %program, rule = ?rule, "firewall rule applied");
                }
                Ok(status) => {
                    warn!(program = %program, rule = ?rule, %status, "firewall rule failed");
                }
                Err(e) => {
                    warn!(program = %program, rule = ?rule, error = %e, "cannot run firewall command");
                }
            }
        }
    }
    debug!(program = %program, "firewall worker stopped");
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl Firewall for IptablesFirewall {
    fn prepare(&self) {
        info!(chain = %self.chain, "resetting firewall chain to default DROP");
        self.enqueue(self.prepare_rules());
    }

    fn release_client(&self, ip: IpAddr) {
        info!(client = %ip, "releasing client in firewall");
        self.enqueue(self.release_rules(ip));
    }

    fn block_client(&self, ip: IpAddr) {
        info!(client = %ip, "blocking client in firewall");
        self.enqueue(self.block_rules(ip));
    }
}
