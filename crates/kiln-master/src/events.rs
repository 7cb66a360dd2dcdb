use crate::dispatcher::Dispatcher;
use crate::room::WorkerRoom;
use kiln_core::TaskState;
use kiln_link::Inbound;
use kiln_protocol::{BinaryFile, Letter, LogLetter, LogRegister, Response};
use kiln_store::{ArtifactHandle, Storage, StoreError, key};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Sink {
    name: String,
    handle: Box<dyn ArtifactHandle>,
}

/// Routes letters arriving from workers to the part of the master that owns them.
pub struct Router {
    room: Arc<WorkerRoom>,
    dispatcher: Arc<Dispatcher>,
    storage: Arc<dyn Storage>,
    result_dir: PathBuf,
    log_dir: PathBuf,
    sinks: HashMap<String, Sink>,
    /// Registered log id to the worker that registered it.
    logs: HashMap<String, String>,
}

impl Router {
    pub fn new(
        room: Arc<WorkerRoom>,
        dispatcher: Arc<Dispatcher>,
        storage: Arc<dyn Storage>,
        result_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            room,
            dispatcher,
            storage,
            result_dir: result_dir.into(),
            log_dir: log_dir.into(),
            sinks: HashMap::new(),
            logs: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(inbound) => self.route(inbound).await,
                    None => break,
                },
            }
        }
        debug!(open_sinks = self.sinks.len(), "router stopped");
    }

    pub async fn route(&mut self, inbound: Inbound) {
        let Inbound { peer, letter, .. } = inbound;
        if !letter.validity() {
            warn!(peer = %peer, kind = letter.kind(), "dropping invalid letter");
            return;
        }

        match letter {
            Letter::Response(response) => self.on_response(&peer, response).await,
            Letter::BinaryFile(file) => self.on_binary(&peer, file).await,
            Letter::LogRegister(register) => self.on_log_register(register),
            Letter::Log(log) => self.on_log(log).await,
            Letter::CmdResponse(ack) => {
                if self.room.post().ack_sender().send(ack).await.is_err() {
                    debug!(peer = %peer, "election no longer listening for acks");
                }
            }
            Letter::PropertyNotify(notify) => {
                self.room
                    .update_capacity(&notify.header.ident, notify.content.max);
            }
            other => warn!(peer = %peer, kind = other.kind(), "unexpected letter from worker"),
        }
    }

    async fn on_response(&mut self, peer: &str, response: Response) {
        let state = TaskState::from(response.state());
        let tid = response.header.tid;
        debug!(peer = %peer, tid = %tid, state = ?state, "task response");
        if !self.dispatcher.is_known(&tid) {
            warn!(peer = %peer, tid = %tid, "response for untracked task");
            return;
        }
        if matches!(state, TaskState::Failure) {
            // Partial output of a failed task is worthless.
            self.sinks.remove(&tid);
        }
        self.dispatcher.on_response(peer, &tid, state).await;
    }

    async fn on_binary(&mut self, peer: &str, file: BinaryFile) {
        let tid = file.tid.clone();
        if !self.dispatcher.is_known(&tid) {
            warn!(peer = %peer, tid = %tid, "artifact for untracked task dropped");
            self.sinks.remove(&tid);
            return;
        }

        if file.is_last() {
            let Some(mut sink) = self.sinks.remove(&tid) else {
                warn!(peer = %peer, tid = %tid, "artifact terminator without data");
                return;
            };
            if let Err(error) = self.commit(&tid, &mut sink).await {
                warn!(tid = %tid, file = %sink.name, error = %error, "artifact not stored");
            }
            return;
        }

        if !self.sinks.contains_key(&tid) {
            let name = base_name(&file.file_name);
            match self.storage.create(&tid, &name).await {
                Ok(handle) => {
                    self.sinks.insert(tid.clone(), Sink { name, handle });
                }
                Err(error) => {
                    warn!(tid = %tid, file = %name, error = %error, "cannot open artifact");
                    return;
                }
            }
        }
        let Some(sink) = self.sinks.get_mut(&tid) else {
            return;
        };
        if let Err(error) = sink.handle.store(&file.payload).await {
            warn!(tid = %tid, error = %error, "artifact write failed");
            self.sinks.remove(&tid);
        }
    }

    async fn commit(&self, tid: &str, sink: &mut Sink) -> Result<(), StoreError> {
        sink.handle.close().await?;
        let stored = key(tid, &sink.name);
        self.dispatcher.record_artifact(tid, &stored);
        let copied = self
            .storage
            .copy_to(tid, &sink.name, &self.result_dir.join(tid))
            .await?;
        info!(tid = %tid, artifact = %stored, copy = %copied.display(), "artifact stored");
        Ok(())
    }

    fn on_log_register(&mut self, register: LogRegister) {
        debug!(ident = %register.header.ident, log_id = %register.header.log_id, "log registered");
        self.logs
            .insert(register.header.log_id, register.header.ident);
    }

    async fn on_log(&self, log: LogLetter) {
        let log_id = &log.header.log_id;
        let Some(owner) = self.logs.get(log_id) else {
            warn!(log_id = %log_id, ident = %log.header.ident, "log for unregistered id dropped");
            return;
        };
        info!(
            target: "kiln::worker_log",
            ident = %owner,
            log_id = %log_id,
            "{}",
            log.content.log_msg
        );
        if let Err(error) = append_log(&self.log_dir, log_id, &log.content.log_msg).await {
            warn!(log_id = %log_id, error = %error, "log file not written");
        }
    }
}

fn base_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(file_name)
        .to_string()
}

async fn append_log(dir: &Path, log_id: &str, msg: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}.log", base_name(log_id))))
        .await?;
    let mut line = msg.to_string();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobCatalog;
    use crate::dispatcher::DispatcherConfig;
    use crate::room::RoomConfig;
    use crate::testing::TestRoom;
    use bytes::Bytes;
    use kiln_core::{Build, Task};
    use kiln_protocol::{CmdResponse, CmdState, Command, ResponseState};
    use kiln_store::MemoryStore;

    struct Fixture {
        room: TestRoom,
        dispatcher: Arc<Dispatcher>,
        store: MemoryStore,
        router: Router,
        dirs: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let room = TestRoom::new(RoomConfig::default()).await;
        let catalog = JobCatalog {
            build: Some(Build::new(vec!["make".to_string()], "./out/fw.bin")),
            ..JobCatalog::default()
        };
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), catalog, Arc::clone(&room.room));
        let store = MemoryStore::new();
        let dirs = tempfile::tempdir().expect("tempdir");
        let router = Router::new(
            Arc::clone(&room.room),
            Arc::clone(&dispatcher),
            Arc::new(store.clone()),
            dirs.path().join("results"),
            dirs.path().join("logs"),
        );
        Fixture {
            room,
            dispatcher,
            store,
            router,
            dirs,
        }
    }

    fn from(peer: &str, letter: impl Into<Letter>) -> Inbound {
        Inbound {
            peer: peer.to_string(),
            link_id: 1,
            letter: letter.into(),
        }
    }

    fn chunk(tid: &str, data: &'static [u8]) -> BinaryFile {
        BinaryFile::chunk(tid, "./out/fw.bin", Bytes::from_static(data))
    }

    #[tokio::test]
    async fn streamed_artifact_is_stored_once_and_copied() {
        let mut f = fixture().await;
        let _worker = f.room.join("w1", 2).await;
        f.dispatcher
            .dispatch(Task::new("t1", "sn", "v1").expect("task"))
            .await
            .expect("dispatch");

        let first = chunk("t1", b"abc");
        let last = first.terminator();
        f.router.route(from("w1", first)).await;
        f.router.route(from("w1", chunk("t1", b"def"))).await;
        f.router.route(from("w1", last)).await;
        f.router
            .route(from("w1", Response::new("w1", "t1", None, ResponseState::Finished)))
            .await;

        assert_eq!(
            f.store.read("t1", "fw.bin").await.expect("stored"),
            Bytes::from_static(b"abcdef")
        );
        assert_eq!(f.store.close_count("t1", "fw.bin"), 1);
        let copied = f.dirs.path().join("results").join("t1").join("fw.bin");
        assert_eq!(std::fs::read(copied).expect("copy"), b"abcdef");
        assert_eq!(f.dispatcher.state_of("t1"), Some(TaskState::Finished));
        assert_eq!(f.dispatcher.retrieve("t1").await, Some("t1/fw.bin".to_string()));
    }

    #[tokio::test]
    async fn artifact_for_unknown_task_is_dropped() {
        let mut f = fixture().await;
        let first = chunk("ghost", b"abc");
        let last = first.terminator();
        f.router.route(from("w1", first)).await;
        f.router.route(from("w1", last)).await;
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn logs_need_registration() {
        let mut f = fixture().await;
        f.router
            .route(from("w1", LogLetter::new("w1", "build-7", "too early")))
            .await;
        f.router.route(from("w1", LogRegister::new("w1", "build-7"))).await;
        f.router
            .route(from("w1", LogLetter::new("w1", "build-7", "compiling")))
            .await;

        let written = std::fs::read_to_string(f.dirs.path().join("logs").join("build-7.log"))
            .expect("log file");
        assert_eq!(written, "compiling\n");
    }

    #[tokio::test]
    async fn log_lines_are_appended_whole() {
        let mut f = fixture().await;
        f.router.route(from("w1", LogRegister::new("w1", "build-8"))).await;
        for line in ["one", "two\n", "three"] {
            f.router
                .route(from("w1", LogLetter::new("w1", "build-8", line)))
                .await;
        }
        let written = std::fs::read_to_string(f.dirs.path().join("logs").join("build-8.log"))
            .expect("log file");
        assert_eq!(written, "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn router_can_run_on_the_runtime() {
        let f = fixture().await;
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::spawn(f.router.run(rx, cancel))
            .await
            .expect("router task");
    }

    #[tokio::test]
    async fn notify_updates_capacity_and_acks_reach_election() {
        let mut f = fixture().await;
        let _worker = f.room.join("w1", 1).await;
        f.router
            .route(from("w1", kiln_protocol::PropertyNotify::new("w1", 3, 0)))
            .await;
        let picked = f
            .room
            .room
            .select(|w| w.max() == 3, |_| 0);
        assert_eq!(picked.as_deref(), Some("w1"));

        // An ack nobody asked for is simply buffered for the next election round.
        f.router
            .route(from(
                "w1",
                CmdResponse::new("w1", Command::CONFIG, CmdState::Success),
            ))
            .await;
    }
}
