use crate::election::{ElectTransport, Membership, PostManager};
use crate::errors::{DispatchError, ElectError, MasterError};
use crate::worker::{Assignment, Worker, WorkerState};
use async_trait::async_trait;
use kiln_link::{Link, LinkContext, LinkEvent, LinkState, recv_letter, split};
use kiln_protocol::{Command, Letter};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use socket2::{SockRef, TcpKeepalive};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub waiting_interval: Duration,
    pub stable_threshold: Duration,
    pub handshake_timeout: Duration,
    pub sweep_interval: Duration,
    /// Idle time before the OS starts probing an accepted socket.
    pub keepalive_time: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            waiting_interval: Duration::from_secs(300),
            stable_threshold: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            keepalive_time: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Online {
        ident: String,
    },
    /// The worker is gone for good; its assignments need a new home.
    Evicted {
        ident: String,
        assignments: Vec<Assignment>,
        was_listener: bool,
    },
}

/// Registry of connected workers.
pub struct WorkerRoom {
    config: RoomConfig,
    ctx: LinkContext,
    workers: Mutex<HashMap<String, Worker>>,
    last_change: Mutex<Instant>,
    post: PostManager,
    events: broadcast::Sender<RoomEvent>,
}

impl WorkerRoom {
    pub fn new(config: RoomConfig, ctx: LinkContext, post: PostManager) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            ctx,
            workers: Mutex::new(HashMap::new()),
            last_change: Mutex::new(Instant::now()),
            post,
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Worker>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn changed(&self) {
        if let Ok(mut last_change) = self.last_change.lock() {
            *last_change = Instant::now();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn post(&self) -> &PostManager {
        &self.post
    }

    /// No membership change for the stability threshold.
    pub fn is_stable(&self) -> bool {
        self.last_change
            .lock()
            .map(|last_change| last_change.elapsed() >= self.config.stable_threshold)
            .unwrap_or(false)
    }

    /// Runs the activation handshake on a fresh connection.
    pub async fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Result<String, MasterError> {
        tune_socket(&stream, addr, self.config.keepalive_time);
        let (mut reader, writer) = split(stream);

        let first = recv_letter(&mut reader, self.config.handshake_timeout)
            .await
            .map_err(|e| MasterError::Handshake(format!("{addr}: {e}")))?;
        let valid = first.validity();
        let notify = match first {
            Letter::PropertyNotify(notify) if valid => notify,
            Letter::PropertyNotify(_) => {
                return Err(MasterError::Handshake(format!("{addr}: invalid notify")));
            }
            other => {
                return Err(MasterError::Handshake(format!(
                    "{addr}: expected notify, got {}",
                    other.kind()
                )));
            }
        };

        let ident = notify.header.ident.clone();
        let max = notify.content.max;
        let link = Link::passive(&self.ctx, ident.clone(), addr.to_string(), reader, writer);

        enum Outcome {
            Fresh,
            Returned { old: Link, moved_host: bool },
            Duplicate,
        }

        let outcome = {
            let mut workers = self.lock();
            match workers.get_mut(&ident) {
                Some(worker)
                    if worker.is_online() && worker.link().state() == LinkState::Connected =>
                {
                    Outcome::Duplicate
                }
                Some(worker) => {
                    let moved_host = worker.address().ip() != addr.ip();
                    let old = worker.reconnect(addr, max, link.clone());
                    Outcome::Returned { old, moved_host }
                }
                None => {
                    let mut worker = Worker::new(ident.clone(), addr, max, link.clone());
                    worker.to_online();
                    workers.insert(ident.clone(), worker);
                    Outcome::Fresh
                }
            }
        };
        if let Outcome::Duplicate = outcome {
            link.close();
            warn!(ident = %ident, addr = %addr, "duplicate worker rejected");
            return Err(MasterError::Duplicate(ident));
        }
        self.changed();

        match outcome {
            Outcome::Duplicate => {}
            Outcome::Fresh => {
                self.post.add_candidate(&ident);
                info!(ident = %ident, addr = %addr, max, "worker online");
                self.send_command(&ident, &Command::AcceptReset).await;
            }
            Outcome::Returned { old, moved_host } => {
                old.close();
                info!(ident = %ident, addr = %addr, "worker reconnected");
                self.send_command(&ident, &Command::Accept).await;
                if moved_host {
                    self.announce_listener_move(&ident, &addr.ip().to_string())
                        .await;
                }
            }
        }

        let _ = self.events.send(RoomEvent::Online {
            ident: ident.clone(),
        });
        Ok(ident)
    }

    async fn announce_listener_move(&self, ident: &str, host: &str) {
        let Some(address) = self.post.relocate_listener(ident, host) else {
            return;
        };
        info!(ident = %ident, address = %address, "listener moved");
        let update = Command::ListenerAddrUpdate { address };
        for provider in self.post.providers() {
            self.send_command(&provider, &update).await;
        }
    }

    async fn send_command(&self, ident: &str, command: &Command) {
        if let Err(error) = self.send_to(ident, command.to_letter()).await {
            warn!(ident = %ident, command = command.kind(), error = %error, "command not delivered");
        }
    }

    pub async fn send_to(&self, ident: &str, letter: impl Into<Letter>) -> Result<(), DispatchError> {
        let link = self
            .lock()
            .get(ident)
            .filter(|w| w.is_online())
            .map(|w| w.link().clone())
            .ok_or_else(|| DispatchError::Offline(ident.to_string()))?;
        link.send(letter).await.map_err(|e| DispatchError::Send {
            ident: ident.to_string(),
            reason: e.to_string(),
        })
    }

    /// An online worker whose link dropped starts waiting for a reconnect.
    pub fn on_link_event(&self, event: LinkEvent) {
        let LinkEvent::Lost { peer, link_id } = event else {
            return;
        };
        let mut workers = self.lock();
        let Some(worker) = workers.get_mut(&peer) else {
            return;
        };
        if worker.link().id() != link_id || !worker.is_online() {
            return;
        }
        worker.to_waiting();
        drop(workers);
        self.changed();
        info!(ident = %peer, "worker waiting for reconnect");
    }

    /// Evicts workers that waited longer than the waiting interval.
    pub async fn sweep(&self) -> Vec<String> {
        let expired: Vec<(String, Vec<Assignment>)> = {
            let mut workers = self.lock();
            let idents: Vec<String> = workers
                .values()
                .filter(|w| {
                    w.state() == WorkerState::Waiting
                        && w.waiting_since()
                            .is_some_and(|since| since.elapsed() >= self.config.waiting_interval)
                })
                .map(|w| w.ident().to_string())
                .collect();
            idents
                .into_iter()
                .filter_map(|ident| workers.remove(&ident))
                .map(|mut worker| {
                    let assignments = worker.to_offline();
                    (worker.ident().to_string(), assignments)
                })
                .collect()
        };

        let mut evicted = Vec::with_capacity(expired.len());
        for (ident, assignments) in expired {
            self.changed();
            let was_listener = self.post.remove(&ident) == Some(Membership::Listener);
            warn!(ident = %ident, tasks = assignments.len(), was_listener, "worker evicted");
            if was_listener {
                for provider in self.post.providers() {
                    self.send_command(&provider, &Command::ListenerLost).await;
                }
            }
            let _ = self.events.send(RoomEvent::Evicted {
                ident: ident.clone(),
                assignments,
                was_listener,
            });
            evicted.push(ident);
        }
        evicted
    }

    /// Sweeps, then runs an election step once membership has settled.
    pub async fn maintain(&self) {
        self.sweep().await;
        if !self.is_stable() {
            return;
        }
        let group = self.post.snapshot();
        if group == Default::default() {
            return;
        }
        if self.post.listener().is_some() && self.post.candidates().is_empty() {
            return;
        }
        match self.post.step(self).await {
            Ok(Some(listener)) => info!(ident = %listener, "post election finished"),
            Ok(None) => {}
            Err(error) => warn!(error = %error, "post election failed"),
        }
        self.sync_roles();
    }

    pub(crate) fn sync_roles(&self) {
        let mut workers = self.lock();
        for worker in workers.values_mut() {
            worker.set_role(self.post.role_of(worker.ident()));
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(self.config.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = link_events.recv() => match event {
                    Some(event) => self.on_link_event(event),
                    None => break,
                },
                _ = tick.tick() => self.maintain().await,
            }
        }
        debug!("worker room loop stopped");
    }

    /// Picks the eligible worker with the smallest `rank`.
    pub fn select(
        &self,
        eligible: impl Fn(&Worker) -> bool,
        rank: impl Fn(&Worker) -> usize,
    ) -> Option<String> {
        let workers = self.lock();
        let mut candidates: Vec<&Worker> = workers.values().filter(|w| eligible(w)).collect();
        candidates.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.ident().cmp(b.ident())));
        candidates.first().map(|w| w.ident().to_string())
    }

    /// Records the assignment and sends the letter; the record is undone if the send fails.
    pub async fn assign(
        &self,
        ident: &str,
        assignment: Assignment,
        letter: Letter,
    ) -> Result<(), DispatchError> {
        let tid = assignment.tid.clone();
        let link = {
            let mut workers = self.lock();
            let worker = workers
                .get_mut(ident)
                .filter(|w| w.is_online())
                .ok_or_else(|| DispatchError::Offline(ident.to_string()))?;
            if assignment.task_type == kiln_core::TaskType::Single && !worker.has_capacity() {
                return Err(DispatchError::Busy(ident.to_string()));
            }
            if !worker.add_assignment(assignment) {
                return Err(DispatchError::Task(kiln_core::TaskError::Duplicate(tid)));
            }
            worker.link().clone()
        };

        if let Err(error) = link.send(letter).await {
            self.release(ident, &tid);
            return Err(DispatchError::Send {
                ident: ident.to_string(),
                reason: error.to_string(),
            });
        }
        debug!(ident = %ident, tid = %tid, "task assigned");
        Ok(())
    }

    pub fn release(&self, ident: &str, tid: &str) -> Option<Assignment> {
        self.lock().get_mut(ident)?.remove_assignment(tid)
    }

    /// Drops matching assignments from every worker.
    pub fn release_where(&self, pred: impl Fn(&Assignment) -> bool) -> Vec<(String, Assignment)> {
        let mut released = Vec::new();
        for worker in self.lock().values_mut() {
            let ident = worker.ident().to_string();
            for assignment in worker.remove_assignments_where(&pred) {
                released.push((ident.clone(), assignment));
            }
        }
        released
    }

    pub fn holder_of(&self, tid: &str) -> Option<String> {
        self.lock()
            .values()
            .find(|w| w.holds(tid))
            .map(|w| w.ident().to_string())
    }

    pub fn update_capacity(&self, ident: &str, max: usize) {
        if let Some(worker) = self.lock().get_mut(ident) {
            worker.set_max(max);
        }
    }

    pub fn state_of(&self, ident: &str) -> Option<WorkerState> {
        self.lock().get(ident).map(Worker::state)
    }

    pub fn in_proc_of(&self, ident: &str) -> Vec<String> {
        let workers = self.lock();
        let Some(worker) = workers.get(ident) else {
            return Vec::new();
        };
        let mut tids: Vec<String> = worker.in_proc().map(|a| a.tid.clone()).collect();
        tids.sort();
        tids
    }

    pub fn idents(&self) -> Vec<String> {
        let mut idents: Vec<String> = self.lock().keys().cloned().collect();
        idents.sort();
        idents
    }

    pub fn online_count(&self) -> usize {
        self.lock().values().filter(|w| w.is_online()).count()
    }

    /// Closes every worker link.
    pub fn close_all(&self) {
        for worker in self.lock().values() {
            worker.link().close();
        }
    }
}

fn tune_socket(stream: &TcpStream, addr: SocketAddr, keepalive_time: Duration) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(addr = %addr, error = %error, "could not set nodelay");
    }
    let keepalive = TcpKeepalive::new().with_time(keepalive_time);
    if let Err(error) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(addr = %addr, error = %error, "could not set keepalive");
    }
}

#[async_trait]
impl ElectTransport for WorkerRoom {
    async fn send_command(&self, ident: &str, command: &Command) -> Result<(), ElectError> {
        self.send_to(ident, command.to_letter())
            .await
            .map_err(|e| ElectError::Send {
                ident: ident.to_string(),
                reason: e.to_string(),
            })
    }

    fn host_of(&self, ident: &str) -> Option<String> {
        self.lock()
            .get(ident)
            .map(|w| w.address().ip().to_string())
    }

    fn is_online(&self, ident: &str) -> bool {
        self.lock().get(ident).is_some_and(Worker::is_online)
    }
}
