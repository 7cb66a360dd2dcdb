//! The Listener role: providers stream their artifacts here and satisfied
//! posts are handed to the merge path.

use crate::errors::WorkerError;
use crate::net::file_label;
use crate::post::{PostBoard, PostOrder, Stuff};
use kiln_link::{Inbound, Link, LinkConfig, LinkContext, LinkEvent, recv_letter, split};
use kiln_protocol::{BinaryFile, Letter};
use kiln_store::{ArtifactHandle, LocalFsStore, Storage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const INTAKE_BUFFER: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A post whose inputs have all arrived, unpacked into `dir`.
#[derive(Debug)]
pub struct Satisfied {
    pub order: PostOrder,
    pub dir: PathBuf,
}

pub struct Listener {
    port: u16,
    intake: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
}

impl Listener {
    /// Binds `address` and starts accepting providers.
    pub async fn start(
        ident: &str,
        address: &str,
        work_dir: &Path,
        link: LinkConfig,
        merges: mpsc::Sender<Satisfied>,
        parent: &CancellationToken,
    ) -> Result<Self, WorkerError> {
        let socket = TcpListener::bind(address)
            .await
            .map_err(|e| WorkerError::Bind(format!("{address}: {e}")))?;
        let port = socket
            .local_addr()
            .map_err(|e| WorkerError::Bind(e.to_string()))?
            .port();

        let cancel = parent.child_token();
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = LinkContext::new(ident, intake_tx.clone(), events_tx)
            .with_config(link)
            .with_cancel(cancel.clone());

        let intake = Intake {
            board: PostBoard::new(),
            sinks: HashMap::new(),
            store: LocalFsStore::new(work_dir.join(".post-storage")),
            work_dir: work_dir.to_path_buf(),
            merges,
        };
        tokio::spawn(intake.run(intake_rx, cancel.clone()));
        tokio::spawn(accept_providers(socket, ctx, cancel.clone()));
        tokio::spawn(watch_providers(events_rx, cancel.clone()));

        info!(port, "post listener bound");
        Ok(Self {
            port,
            intake: intake_tx,
            cancel,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sender for letters produced on this worker itself.
    pub fn intake(&self) -> mpsc::Sender<Inbound> {
        self.intake.clone()
    }

    pub async fn deliver(&self, peer: &str, letter: impl Into<Letter>) -> Result<(), WorkerError> {
        self.intake
            .send(Inbound {
                peer: peer.to_string(),
                link_id: 0,
                letter: letter.into(),
            })
            .await
            .map_err(|_| WorkerError::NoListener)
    }

    /// Closes the socket and every provider link.
    pub fn stop(&self) {
        self.cancel.cancel();
        info!(port = self.port, "post listener stopped");
    }
}

async fn accept_providers(socket: TcpListener, ctx: LinkContext, cancel: CancellationToken) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = socket.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(error = %error, "provider accept failed");
                    continue;
                }
            },
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let (mut reader, writer) = split(stream);
            match recv_letter(&mut reader, HANDSHAKE_TIMEOUT).await {
                Ok(Letter::PropertyNotify(hello)) => {
                    let link = Link::passive(&ctx, hello.header.ident, addr.to_string(), reader, writer);
                    info!(provider = %link.peer(), link_id = link.id(), "provider connected");
                }
                Ok(other) => {
                    warn!(addr = %addr, kind = other.kind(), "provider did not introduce itself");
                }
                Err(error) => warn!(addr = %addr, error = %error, "provider handshake failed"),
            }
        });
    }
}

async fn watch_providers(
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(LinkEvent::Lost { peer, link_id }) => {
                    info!(provider = %peer, link_id, "provider gone");
                }
                Some(LinkEvent::Reconnected { .. }) => {}
                None => return,
            },
        }
    }
}

struct Sink {
    name: String,
    parent: String,
    menu: String,
    handle: Box<dyn ArtifactHandle>,
}

/// Single owner of the post board and the partially received artifacts.
struct Intake {
    board: PostBoard,
    sinks: HashMap<String, Sink>,
    store: LocalFsStore,
    work_dir: PathBuf,
    merges: mpsc::Sender<Satisfied>,
}

impl Intake {
    async fn run(mut self, mut intake: mpsc::Receiver<Inbound>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => self.sweep().await,
                next = intake.recv() => match next {
                    Some(inbound) => self.handle(inbound).await,
                    None => break,
                },
            }
        }
        debug!(pending = self.board.pending(), "listener intake stopped");
    }

    async fn handle(&mut self, inbound: Inbound) {
        let Inbound { peer, letter, .. } = inbound;
        if !letter.validity() {
            warn!(peer = %peer, kind = letter.kind(), "dropping invalid letter");
            return;
        }
        match letter {
            Letter::BinaryFile(file) => self.on_binary(&peer, file).await,
            Letter::Post(post) => {
                let order = PostOrder::from(post);
                debug!(post = %order.ident, version = %order.version, "post registered");
                let ready = self.board.add_post(order);
                self.hand_out(ready).await;
            }
            Letter::Cancel(cancel) => {
                if self.board.cancel(&cancel.header.tid) {
                    info!(post = %cancel.header.tid, "post withdrawn");
                }
            }
            other => debug!(peer = %peer, kind = other.kind(), "ignored by listener"),
        }
    }

    async fn on_binary(&mut self, peer: &str, file: BinaryFile) {
        let tid = file.tid.clone();
        if file.parent.is_empty() {
            warn!(peer = %peer, tid = %tid, "artifact without a post version dropped");
            return;
        }

        if file.is_last() {
            let Some(mut sink) = self.sinks.remove(&tid) else {
                warn!(peer = %peer, tid = %tid, "artifact terminator without data");
                return;
            };
            if let Err(error) = sink.handle.close().await {
                warn!(tid = %tid, error = %error, "artifact not stored");
                return;
            }
            debug!(peer = %peer, tid = %tid, version = %sink.parent, "stuff arrived");
            let ready = self
                .board
                .add_stuff(Stuff::new(sink.parent, sink.menu, tid, sink.name));
            self.hand_out(ready).await;
            return;
        }

        if !self.sinks.contains_key(&tid) {
            let name = file_label(&file.file_name);
            match self.store.create(&tid, &name).await {
                Ok(handle) => {
                    self.sinks.insert(
                        tid.clone(),
                        Sink {
                            name,
                            parent: file.parent.clone(),
                            menu: file.menu.clone(),
                            handle,
                        },
                    );
                }
                Err(error) => {
                    warn!(tid = %tid, error = %error, "cannot open artifact");
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

    async fn sweep(&mut self) {
        for stale in self.board.expire(Instant::now()) {
            warn!(name = %stale.name, version = %stale.version, "unpaired artifact discarded");
            if let Err(error) = self.store.delete(&stale.name, &stale.file).await {
                debug!(name = %stale.name, error = %error, "stale artifact not removed");
            }
        }
    }

    async fn hand_out(&mut self, ready: Vec<PostOrder>) {
        for order in ready {
            let dir = self.work_dir.join(&order.ident);
            if let Err(error) = tokio::fs::create_dir_all(&dir).await {
                warn!(post = %order.ident, error = %error, "merge directory not created");
            }
            for stuff in order.stuffs() {
                if let Err(error) = self.store.copy_to(&stuff.name, &stuff.file, &dir).await {
                    warn!(post = %order.ident, name = %stuff.name, error = %error, "stuff not unpacked");
                }
            }
            info!(post = %order.ident, dir = %dir.display(), "post satisfied");
            if self.merges.send(Satisfied { order, dir }).await.is_err() {
                debug!("merge path closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::SinkExt;
    use kiln_protocol::{PostContent, PostHeader, PostLetter, PropertyNotify};
    use tokio::net::TcpStream;

    fn post() -> PostLetter {
        PostLetter {
            header: PostHeader {
                ident: "s1__Post".to_string(),
                version: "s1".to_string(),
                output: "./all.txt".to_string(),
            },
            content: PostContent {
                cmds: vec!["cat A.txt B.txt > all.txt".to_string()],
                menus: Default::default(),
                frags: vec!["s1__A".to_string(), "s1__B".to_string()],
            },
        }
    }

    fn artifact(tid: &str, name: &str, data: &'static [u8]) -> (BinaryFile, BinaryFile) {
        let chunk = BinaryFile::chunk(tid, name, Bytes::from_static(data)).with_post("s1", "");
        let last = chunk.terminator();
        (chunk, last)
    }

    async fn start(dir: &Path) -> (Listener, mpsc::Receiver<Satisfied>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (merges_tx, merges_rx) = mpsc::channel(4);
        let listener = Listener::start(
            "w1",
            "127.0.0.1:0",
            dir,
            LinkConfig::default(),
            merges_tx,
            &cancel,
        )
        .await
        .expect("listener binds");
        (listener, merges_rx, cancel)
    }

    #[tokio::test]
    async fn local_and_remote_artifacts_satisfy_a_post() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (listener, mut merges, cancel) = start(dir.path()).await;
        assert_ne!(listener.port(), 0);

        listener.deliver("master", post()).await.expect("post");
        let (a, a_end) = artifact("s1__A", "./out/A.txt", b"alpha\n");
        listener.deliver("w1", a).await.expect("chunk");
        listener.deliver("w1", a_end).await.expect("terminator");

        let stream = TcpStream::connect(("127.0.0.1", listener.port()))
            .await
            .expect("provider connects");
        let (_reader, mut writer) = split(stream);
        let (b, b_end) = artifact("s1__B", "./out/B.txt", b"beta\n");
        writer
            .send(Letter::from(PropertyNotify::new("w2", 1, 0)))
            .await
            .expect("hello");
        writer.send(Letter::from(b)).await.expect("chunk");
        writer.send(Letter::from(b_end)).await.expect("terminator");

        let satisfied = tokio::time::timeout(Duration::from_secs(5), merges.recv())
            .await
            .expect("post satisfied in time")
            .expect("merge channel open");
        assert_eq!(satisfied.order.ident, "s1__Post");
        assert_eq!(satisfied.dir, dir.path().join("s1__Post"));
        assert_eq!(
            std::fs::read_to_string(satisfied.dir.join("A.txt")).expect("A unpacked"),
            "alpha\n"
        );
        assert_eq!(
            std::fs::read_to_string(satisfied.dir.join("B.txt")).expect("B unpacked"),
            "beta\n"
        );

        listener.stop();
        cancel.cancel();
    }

    #[tokio::test]
    async fn withdrawn_post_is_never_handed_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (listener, mut merges, cancel) = start(dir.path()).await;

        listener.deliver("master", post()).await.expect("post");
        listener
            .deliver("master", kiln_protocol::Cancel::new("s1__Post", Some("s1")))
            .await
            .expect("cancel");
        for (tid, name) in [("s1__A", "A.txt"), ("s1__B", "B.txt")] {
            let (chunk, last) = artifact(tid, name, b"x");
            listener.deliver("w1", chunk).await.expect("chunk");
            listener.deliver("w1", last).await.expect("terminator");
        }

        let outcome = tokio::time::timeout(Duration::from_millis(300), merges.recv()).await;
        assert!(outcome.is_err(), "withdrawn post was merged");
        cancel.cancel();
    }
}
