mod config;
mod errors;
mod exec;
mod listener;
mod net;
mod post;

pub use config::{REQUIRED_KEYS, WorkerConfig};
pub use errors::{ConfigError, ExecError, WorkerError};
pub use exec::{ExecOutcome, Executor};
pub use listener::{Listener, Satisfied};
pub use net::{CHUNK_SIZE, Outlet, file_label, stream_file};
pub use post::{MenuOrder, PostBoard, PostOrder, Stuff, UNPAIRED_RETENTION};

use bytes::Bytes;
use kiln_link::{Inbound, Link, LinkConfig, LinkContext, LinkEvent};
use kiln_protocol::{
    BinaryFile, Cancel, CmdResponse, CmdState, Command, CommandLetter, Letter, LogLetter,
    LogRegister, NewTask, PORT_KEY, PostLetter, PropertyNotify, Response, ResponseState, Role,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Peer names this worker gives its active links.
const MASTER_PEER: &str = "master";
const LISTENER_PEER: &str = "listener";

const CONNECT_ATTEMPTS: u32 = 5;
const INBOUND_BUFFER: usize = 256;
const MERGE_BUFFER: usize = 16;

enum RoleState {
    Unassigned,
    Listener(Listener),
    Provider(Link),
}

impl RoleState {
    fn role(&self) -> Option<Role> {
        match self {
            Self::Unassigned => None,
            Self::Listener(_) => Some(Role::Listener),
            Self::Provider(_) => Some(Role::Provider),
        }
    }

    fn reset(&mut self) {
        match std::mem::replace(self, Self::Unassigned) {
            Self::Listener(listener) => listener.stop(),
            Self::Provider(link) => link.close(),
            Self::Unassigned => {}
        }
    }
}

/// An artifact already streamed once, kept for `ReworkTask`.
#[derive(Clone)]
struct Delivered {
    path: PathBuf,
    template: BinaryFile,
}

pub struct Agent {
    config: WorkerConfig,
    link: LinkConfig,
}

impl Agent {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            link: LinkConfig::default(),
        }
    }

    pub fn with_link_config(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Connects to the master and starts serving it.
    pub async fn start(self) -> Result<AgentHandle, WorkerError> {
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .map_err(|e| WorkerError::Io(format!("{}: {e}", self.config.work_dir.display())))?;

        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = LinkContext::new(self.config.name.clone(), inbound_tx, events_tx)
            .with_config(self.link)
            .with_cancel(cancel.child_token());

        let hello = Letter::from(PropertyNotify::new(
            self.config.name.clone(),
            self.config.max_tasks,
            0,
        ));
        let master = net::connect_with_retry(
            &ctx,
            MASTER_PEER,
            &self.config.master_address,
            hello,
            CONNECT_ATTEMPTS,
        )
        .await?;

        let (merges_tx, merges_rx) = mpsc::channel(MERGE_BUFFER);
        let agent = Arc::new(AgentState {
            ident: self.config.name.clone(),
            executor: Executor::new(self.config.stuck_interval()),
            slots: Arc::new(Semaphore::new(self.config.max_tasks)),
            config: self.config,
            ctx,
            master,
            running: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            role: tokio::sync::Mutex::new(RoleState::Unassigned),
            merges: merges_tx,
            cancel: cancel.clone(),
        });

        let tasks = vec![
            tokio::spawn(Arc::clone(&agent).run(inbound_rx, cancel.clone())),
            tokio::spawn(Arc::clone(&agent).run_merges(merges_rx, cancel.clone())),
            tokio::spawn(watch_links(events_rx, cancel.clone())),
        ];
        info!(
            ident = %agent.ident,
            master = %agent.config.master_address,
            max = agent.config.max_tasks,
            "worker connected"
        );
        Ok(AgentHandle {
            agent,
            cancel,
            tasks,
        })
    }
}

/// A running worker.
pub struct AgentHandle {
    agent: Arc<AgentState>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn ident(&self) -> &str {
        &self.agent.ident
    }

    /// Post-processing role currently held, if any.
    pub async fn role(&self) -> Option<Role> {
        self.agent.role.lock().await.role()
    }

    /// Ids of tasks and merges currently executing, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self.agent.running().keys().cloned().collect();
        running.sort();
        running
    }

    /// Stops every loop, running command and link.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.agent.master.close();
        self.agent.role.lock().await.reset();
        for task in self.tasks {
            let _ = task.await;
        }
        info!(ident = %self.agent.ident, "worker stopped");
    }
}

/// Runs a worker until `shutdown` fires.
pub async fn run(config: WorkerConfig, shutdown: CancellationToken) -> Result<(), WorkerError> {
    let handle = Agent::new(config).start().await?;
    shutdown.cancelled().await;
    handle.shutdown().await;
    Ok(())
}

struct AgentState {
    ident: String,
    config: WorkerConfig,
    executor: Executor,
    ctx: LinkContext,
    master: Link,
    slots: Arc<Semaphore>,
    /// Stop tokens of running tasks and merges, by task id.
    running: Mutex<HashMap<String, CancellationToken>>,
    results: Mutex<HashMap<String, Delivered>>,
    role: tokio::sync::Mutex<RoleState>,
    merges: mpsc::Sender<Satisfied>,
    cancel: CancellationToken,
}

impl AgentState {
    fn running(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn results(&self) -> MutexGuard<'_, HashMap<String, Delivered>> {
        self.results.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(inbound) => self.handle(inbound).await,
                    None => break,
                },
            }
        }
        debug!(ident = %self.ident, "agent loop stopped");
    }

    async fn handle(self: &Arc<Self>, inbound: Inbound) {
        let Inbound { peer, letter, .. } = inbound;
        if !letter.validity() {
            warn!(peer = %peer, kind = letter.kind(), "dropping invalid letter");
            return;
        }
        match letter {
            Letter::NewTask(task) => self.on_new_task(task).await,
            Letter::Command(command) => self.on_command(command).await,
            Letter::Post(post) => self.on_post(post).await,
            Letter::Cancel(cancel) => self.on_cancel(cancel).await,
            other => debug!(peer = %peer, kind = other.kind(), "ignored letter"),
        }
    }

    async fn send_master(&self, letter: impl Into<Letter>) {
        let letter = letter.into();
        let kind = letter.kind();
        if let Err(error) = self.master.send(letter).await {
            warn!(kind, error = %error, "letter to master not sent");
        }
    }

    async fn respond(&self, tid: &str, parent: Option<&str>, state: ResponseState) {
        self.send_master(Response::new(self.ident.clone(), tid, parent, state))
            .await;
    }

    /// Working directory of a task, refusing ids that would leave `WorkDir`.
    fn task_dir(&self, tid: &str) -> Option<PathBuf> {
        let own_name = Path::new(tid).file_name().and_then(|name| name.to_str()) == Some(tid);
        own_name.then(|| self.config.work_dir.join(tid))
    }

    async fn on_new_task(self: &Arc<Self>, task: NewTask) {
        let tid = task.tid().to_string();
        if self.running().contains_key(&tid) {
            debug!(tid = %tid, "task already running");
            return;
        }
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            info!(tid = %tid, "no free slot, task bounced");
            self.respond(&tid, task.parent(), ResponseState::Prepare)
                .await;
            return;
        };

        let stop = self.cancel.child_token();
        self.running().insert(tid.clone(), stop.clone());
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent.run_task(task, stop).await;
            agent.running().remove(&tid);
            drop(permit);
        });
    }

    async fn run_task(&self, task: NewTask, stop: CancellationToken) {
        let tid = task.tid().to_string();
        let parent = task.parent().map(str::to_string);
        let Some(dir) = self.task_dir(&tid) else {
            warn!(tid = %tid, "task id is not a valid directory name");
            self.respond(&tid, parent.as_deref(), ResponseState::Failure)
                .await;
            return;
        };
        if let Err(error) = tokio::fs::create_dir_all(&dir).await {
            warn!(tid = %tid, error = %error, "task directory not created");
            self.respond(&tid, parent.as_deref(), ResponseState::Failure)
                .await;
            return;
        }

        self.send_master(LogRegister::new(self.ident.clone(), tid.clone()))
            .await;
        self.respond(&tid, parent.as_deref(), ResponseState::InProc)
            .await;
        info!(tid = %tid, parent = ?parent, "task started");

        let outcome = self
            .execute(&tid, &task.content.extra.cmds, &dir, &stop)
            .await;
        let state = match outcome {
            Ok(ExecOutcome::Success) => match self.deliver(&task, &dir).await {
                Ok(bytes) => {
                    info!(tid = %tid, bytes, "task finished");
                    ResponseState::Finished
                }
                Err(error) => {
                    warn!(tid = %tid, error = %error, "result not delivered");
                    ResponseState::Failure
                }
            },
            Ok(ExecOutcome::Stopped) => {
                info!(tid = %tid, "task stopped");
                return;
            }
            Ok(failed) => {
                warn!(tid = %tid, outcome = ?failed, "build failed");
                ResponseState::Failure
            }
            Err(error) => {
                warn!(tid = %tid, error = %error, "build could not run");
                ResponseState::Failure
            }
        };
        self.respond(&tid, parent.as_deref(), state).await;
    }

    /// Runs `cmds`, forwarding each output line to the master as a `Log` letter.
    async fn execute(
        &self,
        log_id: &str,
        cmds: &[String],
        dir: &Path,
        stop: &CancellationToken,
    ) -> Result<ExecOutcome, ExecError> {
        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
        let master = self.master.clone();
        let ident = self.ident.clone();
        let log_id = log_id.to_string();
        let forward = tokio::spawn(async move {
            while let Some(line) = lines_rx.recv().await {
                if line.is_empty() {
                    continue;
                }
                if let Err(error) = master.send(LogLetter::new(ident.clone(), log_id.clone(), line)).await {
                    debug!(log_id = %log_id, error = %error, "log line dropped");
                }
            }
        });

        let outcome = self
            .executor
            .run(cmds, dir, stop, move |line| {
                let _ = lines_tx.send(line);
            })
            .await;
        let _ = forward.await;
        outcome
    }

    /// Streams the task's declared output to the master, or to the listener
    /// when the task is part of a build set.
    async fn deliver(&self, task: &NewTask, dir: &Path) -> Result<u64, WorkerError> {
        let result_path = &task.content.extra.result_path;
        let mut template = BinaryFile::chunk(task.tid(), file_label(result_path), Bytes::new());
        let outlet = if task.need_post() {
            template = template.with_post(
                task.parent().unwrap_or_default(),
                task.header.menu.clone(),
            );
            self.post_outlet().await?
        } else {
            Outlet::Link(self.master.clone())
        };

        let path = dir.join(result_path);
        let sent = stream_file(&outlet, &path, &template).await?;
        self.results()
            .insert(task.tid().to_string(), Delivered { path, template });
        Ok(sent)
    }

    async fn post_outlet(&self) -> Result<Outlet, WorkerError> {
        match &*self.role.lock().await {
            RoleState::Listener(listener) => Ok(Outlet::Local {
                ident: self.ident.clone(),
                intake: listener.intake(),
            }),
            RoleState::Provider(link) => Ok(Outlet::Link(link.clone())),
            RoleState::Unassigned => Err(WorkerError::NoListener),
        }
    }

    async fn on_post(&self, post: PostLetter) {
        let ident = post.header.ident.clone();
        let version = post.header.version.clone();
        let delivered = match &*self.role.lock().await {
            RoleState::Listener(listener) => listener.deliver(MASTER_PEER, post).await.is_ok(),
            _ => false,
        };
        if !delivered {
            warn!(post = %ident, "post received while not listening");
            self.respond(&ident, Some(&version), ResponseState::Failure)
                .await;
        }
    }

    async fn on_cancel(&self, cancel: Cancel) {
        let tid = cancel.header.tid.clone();
        if let Some(stop) = self.running().get(&tid) {
            stop.cancel();
            info!(tid = %tid, "task cancelled");
        }
        if let RoleState::Listener(listener) = &*self.role.lock().await {
            if listener.deliver(MASTER_PEER, cancel).await.is_err() {
                debug!(tid = %tid, "listener intake closed");
            }
        }
    }

    async fn on_command(&self, letter: CommandLetter) {
        let command = match Command::from_letter(&letter) {
            Ok(command) => command,
            Err(error) => {
                warn!(error = %error, "unreadable command");
                return;
            }
        };
        debug!(command = command.kind(), "command received");
        match command {
            Command::Config {
                role: Role::Listener,
                ..
            } => self.become_listener().await,
            Command::Config {
                role: Role::Provider,
                listener,
            } => self.become_provider(listener).await,
            Command::Accept => info!(ident = %self.ident, "master resumed this worker"),
            Command::AcceptReset => self.reset().await,
            Command::ListenerAddrUpdate { address } => self.follow_listener(&address).await,
            Command::ListenerLost => {
                let mut role = self.role.lock().await;
                if matches!(&*role, RoleState::Provider(_)) {
                    role.reset();
                    info!("listener lost, provider link dropped");
                }
            }
            Command::ReworkTask { tids } => self.rework(&tids).await,
            Command::Clean { tid } => self.clean(&tid).await,
        }
    }

    fn ack(&self, state: CmdState) -> CmdResponse {
        CmdResponse::new(self.ident.clone(), Command::CONFIG, state)
    }

    async fn become_listener(&self) {
        let mut role = self.role.lock().await;
        let ack = if let RoleState::Listener(listener) = &*role {
            self.ack(CmdState::Success)
                .with_extra(PORT_KEY, listener.port().to_string())
        } else {
            role.reset();
            match Listener::start(
                &self.ident,
                &self.config.post_address,
                &self.config.work_dir,
                self.ctx.config.clone(),
                self.merges.clone(),
                &self.cancel,
            )
            .await
            {
                Ok(listener) => {
                    let port = listener.port();
                    *role = RoleState::Listener(listener);
                    info!(port, "serving as listener");
                    self.ack(CmdState::Success).with_extra(PORT_KEY, port.to_string())
                }
                Err(error) => {
                    warn!(error = %error, "cannot become listener");
                    self.ack(CmdState::Failure).with_reason(error.to_string())
                }
            }
        };
        drop(role);
        self.send_master(ack).await;
    }

    async fn become_provider(&self, listener: Option<String>) {
        let ack = match listener {
            None => self
                .ack(CmdState::Failure)
                .with_reason("provider configuration without listener address"),
            Some(address) => {
                let mut role = self.role.lock().await;
                role.reset();
                match self.connect_listener(&address).await {
                    Ok(link) => {
                        *role = RoleState::Provider(link);
                        info!(listener = %address, "serving as provider");
                        self.ack(CmdState::Success)
                    }
                    Err(error) => {
                        warn!(listener = %address, error = %error, "cannot reach listener");
                        self.ack(CmdState::Failure).with_reason(error.to_string())
                    }
                }
            }
        };
        self.send_master(ack).await;
    }

    async fn connect_listener(&self, address: &str) -> Result<Link, WorkerError> {
        let hello = Letter::from(PropertyNotify::new(
            self.ident.clone(),
            self.config.max_tasks,
            self.running().len(),
        ));
        let connect = Link::connect(&self.ctx, LISTENER_PEER, address, Some(hello));
        match tokio::time::timeout(self.ctx.config.read_window, connect).await {
            Ok(link) => Ok(link?),
            Err(_) => Err(WorkerError::Link(kiln_link::LinkError::Timeout)),
        }
    }

    async fn follow_listener(&self, address: &str) {
        let mut role = self.role.lock().await;
        if !matches!(&*role, RoleState::Provider(_)) {
            debug!(address = %address, "listener moved but this worker is no provider");
            return;
        }
        role.reset();
        match self.connect_listener(address).await {
            Ok(link) => {
                *role = RoleState::Provider(link);
                info!(listener = %address, "following moved listener");
            }
            Err(error) => warn!(listener = %address, error = %error, "moved listener unreachable"),
        }
    }

    async fn reset(&self) {
        let stopped: Vec<String> = {
            let running = self.running();
            for stop in running.values() {
                stop.cancel();
            }
            running.keys().cloned().collect()
        };
        self.role.lock().await.reset();
        info!(ident = %self.ident, stopped = stopped.len(), "reset by master");
    }

    async fn rework(&self, tids: &[String]) {
        for tid in tids {
            let Some(delivered) = self.results().get(tid).cloned() else {
                warn!(tid = %tid, "nothing to rework");
                continue;
            };
            let outlet = if delivered.template.parent.is_empty() {
                Outlet::Link(self.master.clone())
            } else {
                match self.post_outlet().await {
                    Ok(outlet) => outlet,
                    Err(error) => {
                        warn!(tid = %tid, error = %error, "rework has nowhere to go");
                        continue;
                    }
                }
            };
            match stream_file(&outlet, &delivered.path, &delivered.template).await {
                Ok(bytes) => info!(tid = %tid, bytes, "result re-sent"),
                Err(error) => warn!(tid = %tid, error = %error, "rework failed"),
            }
        }
    }

    async fn clean(&self, tid: &str) {
        self.results().remove(tid);
        let Some(dir) = self.task_dir(tid) else {
            warn!(tid = %tid, "refusing to clean outside the work directory");
            return;
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(tid = %tid, "work files removed"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(tid = %tid, error = %error, "work files not removed"),
        }
    }

    async fn run_merges(self: Arc<Self>, mut merges: mpsc::Receiver<Satisfied>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = merges.recv() => match next {
                    Some(satisfied) => {
                        let agent = Arc::clone(&self);
                        tokio::spawn(async move { agent.merge(satisfied).await });
                    }
                    None => break,
                },
            }
        }
    }

    /// Runs menu commands, then the post commands, and ships the merged output.
    async fn merge(&self, satisfied: Satisfied) {
        let Satisfied { order, dir } = satisfied;
        let tid = order.ident.clone();
        let parent = Some(order.version.as_str());
        let stop = self.cancel.child_token();
        self.running().insert(tid.clone(), stop.clone());

        self.send_master(LogRegister::new(self.ident.clone(), tid.clone()))
            .await;
        self.respond(&tid, parent, ResponseState::InProc).await;
        info!(post = %tid, menus = order.menus.len(), "merge started");

        let mut cmds: Vec<String> = order
            .menus
            .values()
            .flat_map(|menu| menu.cmds.iter().cloned())
            .collect();
        cmds.extend(order.cmds.iter().cloned());

        let state = match self.execute(&tid, &cmds, &dir, &stop).await {
            Ok(ExecOutcome::Success) => {
                let template = BinaryFile::chunk(tid.clone(), file_label(&order.output), Bytes::new());
                let path = dir.join(&order.output);
                match stream_file(&Outlet::Link(self.master.clone()), &path, &template).await {
                    Ok(bytes) => {
                        info!(post = %tid, bytes, "merge finished");
                        self.results().insert(tid.clone(), Delivered { path, template });
                        Some(ResponseState::Finished)
                    }
                    Err(error) => {
                        warn!(post = %tid, error = %error, "merged output not delivered");
                        Some(ResponseState::Failure)
                    }
                }
            }
            Ok(ExecOutcome::Stopped) => None,
            Ok(failed) => {
                warn!(post = %tid, outcome = ?failed, "merge failed");
                Some(ResponseState::Failure)
            }
            Err(error) => {
                warn!(post = %tid, error = %error, "merge could not run");
                Some(ResponseState::Failure)
            }
        };
        self.running().remove(&tid);
        if let Some(state) = state {
            self.respond(&tid, parent, state).await;
        }
    }
}

async fn watch_links(mut events: mpsc::UnboundedReceiver<LinkEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(LinkEvent::Lost { peer, link_id }) => warn!(peer = %peer, link_id, "link lost"),
                Some(LinkEvent::Reconnected { peer, link_id }) => {
                    info!(peer = %peer, link_id, "link re-established");
                }
                None => return,
            },
        }
    }
}
