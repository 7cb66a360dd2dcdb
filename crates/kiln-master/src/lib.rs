mod config;
mod dispatcher;
mod election;
mod errors;
mod events;
mod net;
mod room;
mod worker;

#[cfg(test)]
mod testing;

pub use config::{CMD_ID_KEY, JOB_COMMAND_PREFIX, JobCatalog, MasterConfig, REQUIRED_KEYS};
pub use dispatcher::{Dispatcher, DispatcherConfig, TaskEvent};
pub use election::{
    ElectConfig, ElectGroup, ElectTransport, ListenerInfo, Membership, PostManager,
};
pub use errors::{ConfigError, DispatchError, ElectError, MasterError};
pub use events::Router;
pub use room::{RoomConfig, RoomEvent, WorkerRoom};
pub use worker::{Assignment, Worker, WorkerState};

use kiln_link::{LinkConfig, LinkContext};
use kiln_store::{LocalFsStore, Storage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Identity the master uses on its links.
pub const MASTER_IDENT: &str = "master";

pub struct Master {
    config: MasterConfig,
    storage: Option<Arc<dyn Storage>>,
    link: LinkConfig,
    room: RoomConfig,
    dispatcher: DispatcherConfig,
    elect: ElectConfig,
    inbound_buffer: usize,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        let room = RoomConfig {
            waiting_interval: config.waiting_interval(),
            stable_threshold: config.stable_threshold(),
            ..RoomConfig::default()
        };
        let dispatcher = DispatcherConfig {
            aging_threshold: config.aging_threshold(),
            ..DispatcherConfig::default()
        };
        Self {
            config,
            storage: None,
            link: LinkConfig::default(),
            room,
            dispatcher,
            elect: ElectConfig::default(),
            inbound_buffer: 1024,
        }
    }

    /// Replaces the filesystem store under `Storage`/`ResultDir`.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_link_config(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_room_config(mut self, room: RoomConfig) -> Self {
        self.room = room;
        self
    }

    pub fn with_dispatcher_config(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_elect_config(mut self, elect: ElectConfig) -> Self {
        self.elect = elect;
        self
    }

    /// Binds the listener and spawns the room, dispatcher, router and accept loops.
    pub async fn start(self) -> Result<MasterHandle, MasterError> {
        let listener = net::bind_listener(self.config.listen_addr()?).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MasterError::Bind(e.to_string()))?;

        for dir in [&self.config.result_dir, &self.config.log_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| MasterError::Io(format!("{}: {e}", dir.display())))?;
        }
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(LocalFsStore::new(self.config.storage_root())));

        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_buffer);
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let ctx = LinkContext::new(MASTER_IDENT, inbound_tx, link_events_tx)
            .with_config(self.link)
            .with_cancel(cancel.child_token());

        let room = WorkerRoom::new(self.room, ctx, PostManager::new(self.elect));
        let dispatcher = Dispatcher::new(
            self.dispatcher,
            self.config.catalog.clone(),
            Arc::clone(&room),
        );
        let router = Router::new(
            Arc::clone(&room),
            Arc::clone(&dispatcher),
            storage,
            self.config.result_dir.clone(),
            self.config.log_dir.clone(),
        );
        let room_events = room.subscribe();

        let accept_room = Arc::clone(&room);
        let accept_cancel = cancel.clone();
        let tasks = vec![
            tokio::spawn(Arc::clone(&room).run(link_events_rx, cancel.clone())),
            tokio::spawn(Arc::clone(&dispatcher).run(room_events, cancel.clone())),
            tokio::spawn(router.run(inbound_rx, cancel.clone())),
            tokio::spawn(async move {
                if let Err(error) = net::run_accept_loop(listener, accept_room, accept_cancel).await
                {
                    error!(error = %error, "accept loop stopped");
                }
            }),
        ];

        info!(addr = %local_addr, "master listening");
        Ok(MasterHandle {
            dispatcher,
            room,
            local_addr,
            cancel,
            tasks,
        })
    }
}

/// A running master.
pub struct MasterHandle {
    dispatcher: Arc<Dispatcher>,
    room: Arc<WorkerRoom>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MasterHandle {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn room(&self) -> &Arc<WorkerRoom> {
        &self.room
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops every loop and closes all worker links.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.room.close_all();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("master stopped");
    }
}

/// Runs a master until `shutdown` fires.
pub async fn run(config: MasterConfig, shutdown: CancellationToken) -> Result<(), MasterError> {
    let handle = Master::new(config).start().await?;
    shutdown.cancelled().await;
    handle.shutdown().await;
    Ok(())
}
