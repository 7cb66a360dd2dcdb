use crate::errors::ElectError;
use async_trait::async_trait;
use kiln_protocol::{CmdResponse, Command, PORT_KEY, Role};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ElectConfig {
    pub ack_timeout: Duration,
    pub ack_buffer: usize,
}

impl Default for ElectConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_buffer: 64,
        }
    }
}

/// How the election reaches workers.
#[async_trait]
pub trait ElectTransport: Send + Sync {
    async fn send_command(&self, ident: &str, command: &Command) -> Result<(), ElectError>;
    /// The host part of the worker's current address, as seen by the master.
    fn host_of(&self, ident: &str) -> Option<String>;
    /// Whether the worker currently has a live connection.
    fn is_online(&self, ident: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub ident: String,
    pub port: u16,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Listener,
    Provider,
    Candidate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElectGroup {
    listener: Option<ListenerInfo>,
    providers: BTreeSet<String>,
    candidates: Vec<String>,
}

impl ElectGroup {
    fn membership(&self, ident: &str) -> Option<Membership> {
        if self.listener.as_ref().is_some_and(|l| l.ident == ident) {
            Some(Membership::Listener)
        } else if self.providers.contains(ident) {
            Some(Membership::Provider)
        } else if self.candidates.iter().any(|c| c == ident) {
            Some(Membership::Candidate)
        } else {
            None
        }
    }
}

/// Owns the election group and runs listener/provider assignment.
pub struct PostManager {
    config: ElectConfig,
    group: Mutex<ElectGroup>,
    acks_tx: mpsc::Sender<CmdResponse>,
    acks_rx: tokio::sync::Mutex<mpsc::Receiver<CmdResponse>>,
}

impl PostManager {
    pub fn new(config: ElectConfig) -> Self {
        let (acks_tx, acks_rx) = mpsc::channel(config.ack_buffer.max(1));
        Self {
            config,
            group: Mutex::new(ElectGroup::default()),
            acks_tx,
            acks_rx: tokio::sync::Mutex::new(acks_rx),
        }
    }

    /// Where `Config` acknowledgements from workers should be delivered.
    pub fn ack_sender(&self) -> mpsc::Sender<CmdResponse> {
        self.acks_tx.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ElectGroup> {
        self.group.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> ElectGroup {
        self.lock().clone()
    }

    pub fn add_candidate(&self, ident: &str) -> bool {
        let mut group = self.lock();
        if group.membership(ident).is_some() {
            return false;
        }
        group.candidates.push(ident.to_string());
        true
    }

    pub fn remove(&self, ident: &str) -> Option<Membership> {
        let mut group = self.lock();
        let membership = group.membership(ident)?;
        match membership {
            Membership::Listener => group.listener = None,
            Membership::Provider => {
                group.providers.remove(ident);
            }
            Membership::Candidate => group.candidates.retain(|c| c != ident),
        }
        Some(membership)
    }

    pub fn membership(&self, ident: &str) -> Option<Membership> {
        self.lock().membership(ident)
    }

    pub fn role_of(&self, ident: &str) -> Option<Role> {
        match self.membership(ident)? {
            Membership::Listener => Some(Role::Listener),
            Membership::Provider => Some(Role::Provider),
            Membership::Candidate => None,
        }
    }

    pub fn listener(&self) -> Option<ListenerInfo> {
        self.lock().listener.clone()
    }

    pub fn providers(&self) -> Vec<String> {
        self.lock().providers.iter().cloned().collect()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.lock().candidates.clone()
    }

    /// Re-homes the listener after it reconnected from `host`.
    ///
    /// Returns the new address when it changed.
    pub fn relocate_listener(&self, ident: &str, host: &str) -> Option<String> {
        let mut group = self.lock();
        let listener = group.listener.as_mut().filter(|l| l.ident == ident)?;
        let address = format!("{host}:{}", listener.port);
        if listener.address == address {
            return None;
        }
        listener.address = address.clone();
        Some(address)
    }

    /// Elects a listener from the candidates, then turns the rest into providers.
    pub async fn init(&self, transport: &dyn ElectTransport) -> Result<String, ElectError> {
        let mut acks = self.acks_rx.lock().await;
        self.init_locked(transport, &mut acks).await
    }

    /// Periodic re-check: promote new candidates, or re-elect after listener loss.
    ///
    /// Returns the newly elected listener, if an election took place.
    pub async fn step(&self, transport: &dyn ElectTransport) -> Result<Option<String>, ElectError> {
        let mut acks = self.acks_rx.lock().await;

        let listener = self.listener();
        if let Some(listener) = listener {
            if self.candidates().is_empty() {
                return Ok(None);
            }
            if !transport.is_online(&listener.ident) {
                debug!(ident = %listener.ident, "listener unreachable, newcomers stay candidates");
                return Ok(None);
            }
            self.promote_candidates(transport, &mut acks, &listener).await;
            return Ok(None);
        }

        {
            let mut group = self.lock();
            let demoted: Vec<String> = std::mem::take(&mut group.providers).into_iter().collect();
            if !demoted.is_empty() {
                info!(count = demoted.len(), "listener gone, demoting providers");
            }
            let mut candidates = demoted;
            candidates.extend(std::mem::take(&mut group.candidates));
            group.candidates = candidates;
            if group.candidates.is_empty() {
                return Ok(None);
            }
        }

        self.init_locked(transport, &mut acks).await.map(Some)
    }

    async fn init_locked(
        &self,
        transport: &dyn ElectTransport,
        acks: &mut mpsc::Receiver<CmdResponse>,
    ) -> Result<String, ElectError> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(ElectError::NoCandidates);
        }

        let mut elected = None;
        for ident in &candidates {
            if self.membership(ident) != Some(Membership::Candidate) {
                continue;
            }
            let command = Command::Config {
                role: Role::Listener,
                listener: None,
            };
            let ack = match self.configure(transport, acks, ident, &command).await {
                Ok(ack) => ack,
                Err(error) => {
                    warn!(ident = %ident, error = %error, "listener candidate skipped");
                    continue;
                }
            };
            let Some(port) = ack
                .content
                .extra
                .get(PORT_KEY)
                .and_then(|p| p.parse::<u16>().ok())
            else {
                warn!(ident = %ident, "listener ack carries no port");
                continue;
            };
            let Some(host) = transport.host_of(ident) else {
                continue;
            };

            let info = ListenerInfo {
                ident: ident.clone(),
                port,
                address: format!("{host}:{port}"),
            };
            let mut group = self.lock();
            if group.membership(ident) != Some(Membership::Candidate) {
                continue;
            }
            group.candidates.retain(|c| c != ident);
            group.listener = Some(info.clone());
            elected = Some(info);
            break;
        }

        let Some(listener) = elected else {
            return Err(ElectError::NoListener);
        };
        info!(ident = %listener.ident, address = %listener.address, "listener elected");

        self.promote_candidates(transport, acks, &listener).await;
        Ok(listener.ident)
    }

    async fn promote_candidates(
        &self,
        transport: &dyn ElectTransport,
        acks: &mut mpsc::Receiver<CmdResponse>,
        listener: &ListenerInfo,
    ) {
        let command = Command::Config {
            role: Role::Provider,
            listener: Some(listener.address.clone()),
        };

        for ident in self.candidates() {
            match self.configure(transport, acks, &ident, &command).await {
                Ok(_) => {
                    let mut group = self.lock();
                    if group.membership(&ident) == Some(Membership::Candidate) {
                        group.candidates.retain(|c| *c != ident);
                        group.providers.insert(ident.clone());
                        debug!(ident = %ident, "provider configured");
                    }
                }
                Err(error) => {
                    warn!(ident = %ident, error = %error, "provider configuration failed");
                }
            }
        }
    }

    async fn configure(
        &self,
        transport: &dyn ElectTransport,
        acks: &mut mpsc::Receiver<CmdResponse>,
        ident: &str,
        command: &Command,
    ) -> Result<CmdResponse, ElectError> {
        while let Ok(stale) = acks.try_recv() {
            debug!(ident = %stale.header.ident, "discarding stale acknowledgement");
        }

        transport.send_command(ident, command).await?;

        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            let ack = match tokio::time::timeout_at(deadline, acks.recv()).await {
                Err(_) => return Err(ElectError::AckTimeout(ident.to_string())),
                Ok(None) => return Err(ElectError::ChannelClosed),
                Ok(Some(ack)) => ack,
            };

            if ack.header.ident != ident || ack.header.kind != command.kind() {
                debug!(
                    from = %ack.header.ident,
                    awaiting = %ident,
                    "discarding unmatched acknowledgement"
                );
                continue;
            }
            if !ack.is_success() {
                return Err(ElectError::Rejected {
                    ident: ident.to_string(),
                    reason: ack.content.reason.clone(),
                });
            }
            return Ok(ack);
        }
    }
}
