//! Socket-level fixtures for room and dispatcher tests.

use crate::election::{ElectConfig, PostManager};
use crate::errors::MasterError;
use crate::room::{RoomConfig, WorkerRoom};
use futures::{SinkExt, StreamExt};
use kiln_link::{Inbound, LetterReader, LetterWriter, LinkConfig, LinkContext, LinkEvent, split};
use kiln_protocol::{
    Cancel, CmdResponse, CmdState, Command, Letter, NewTask, PORT_KEY, PostLetter, PropertyNotify,
    Role,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const PATIENCE: Duration = Duration::from_secs(2);

pub(crate) struct TestRoom {
    pub room: Arc<WorkerRoom>,
    listener: TcpListener,
    _inbound: mpsc::Receiver<Inbound>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl TestRoom {
    pub async fn new(config: RoomConfig) -> Self {
        let (inbound_tx, inbound) = mpsc::channel(64);
        let (events_tx, link_events) = mpsc::unbounded_channel();
        let ctx = LinkContext::new("master", inbound_tx, events_tx).with_config(LinkConfig {
            read_window: Duration::from_millis(50),
            heartbeat_delay: Duration::from_millis(50),
            liveness: Duration::from_secs(5),
            reconnect_backoff: Duration::from_millis(50),
        });
        let post = PostManager::new(ElectConfig {
            ack_timeout: Duration::from_millis(200),
            ack_buffer: 16,
        });
        Self {
            room: WorkerRoom::new(config, ctx, post),
            listener: TcpListener::bind("127.0.0.1:0").await.expect("bind"),
            _inbound: inbound,
            link_events,
        }
    }

    /// Connects a fake worker and runs the handshake, whatever its outcome.
    pub async fn connect(&self, ident: &str, max: usize) -> (Result<String, MasterError>, FakeWorker) {
        let addr = self.listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, peer) = self.listener.accept().await.expect("accept");
        let (reader, mut writer) = split(client);
        writer
            .send(Letter::from(PropertyNotify::new(ident, max, 0)))
            .await
            .expect("send notify");
        let result = self.room.accept(server, peer).await;
        let worker = FakeWorker {
            ident: ident.to_string(),
            reader,
            writer,
        };
        (result, worker)
    }

    /// Connects a worker that must be admitted, swallowing its accept command.
    pub async fn join(&self, ident: &str, max: usize) -> FakeWorker {
        let (result, mut worker) = self.connect(ident, max).await;
        result.expect("worker admitted");
        let accepted = worker.next_command().await;
        assert!(matches!(accepted, Command::Accept | Command::AcceptReset));
        worker
    }

    /// Drops the worker's socket and hands the resulting loss to the room.
    pub async fn disconnect(&mut self, worker: FakeWorker) {
        let ident = worker.ident.clone();
        drop(worker);
        loop {
            let event = tokio::time::timeout(PATIENCE, self.link_events.recv())
                .await
                .expect("link loss before timeout")
                .expect("link events open");
            let lost = matches!(&event, LinkEvent::Lost { peer, .. } if *peer == ident);
            self.room.on_link_event(event);
            if lost {
                return;
            }
        }
    }

    /// Elects `worker` as the post listener, acknowledging its config command.
    pub async fn make_listener(&self, worker: &mut FakeWorker) {
        let ident = worker.ident.clone();
        let room = Arc::clone(&self.room);
        let election = tokio::spawn(async move {
            let elected = room.post().init(room.as_ref()).await;
            room.sync_roles();
            elected
        });

        let config = worker.next_command().await;
        assert!(matches!(
            config,
            Command::Config {
                role: Role::Listener,
                ..
            }
        ));
        self.room
            .post()
            .ack_sender()
            .send(
                CmdResponse::new(ident.as_str(), Command::CONFIG, CmdState::Success)
                    .with_extra(PORT_KEY, "9000"),
            )
            .await
            .expect("ack delivered");

        let elected = election.await.expect("election task").expect("elected");
        assert_eq!(elected, ident);
    }
}

/// The far end of a worker connection, driven by hand.
pub(crate) struct FakeWorker {
    pub ident: String,
    pub reader: LetterReader,
    pub writer: LetterWriter,
}

impl FakeWorker {
    async fn next_matching<T>(&mut self, pick: impl Fn(Letter) -> Option<T>) -> T {
        loop {
            let frame = tokio::time::timeout(PATIENCE, self.reader.next())
                .await
                .expect("letter before timeout")
                .expect("stream open")
                .expect("frame");
            if let Some(found) = pick(Letter::parse(&frame).expect("parse")) {
                return found;
            }
        }
    }

    pub async fn next_command(&mut self) -> Command {
        self.next_matching(|letter| match letter {
            Letter::Command(letter) => Some(Command::from_letter(&letter).expect("typed command")),
            _ => None,
        })
        .await
    }

    pub async fn next_new_task(&mut self) -> NewTask {
        self.next_matching(|letter| match letter {
            Letter::NewTask(task) => Some(task),
            _ => None,
        })
        .await
    }

    pub async fn next_post(&mut self) -> PostLetter {
        self.next_matching(|letter| match letter {
            Letter::Post(post) => Some(post),
            _ => None,
        })
        .await
    }

    pub async fn next_cancel(&mut self) -> Cancel {
        self.next_matching(|letter| match letter {
            Letter::Cancel(cancel) => Some(cancel),
            _ => None,
        })
        .await
    }

    /// Everything except heartbeats that arrives within `wait`.
    pub async fn drain(&mut self, wait: Duration) -> Vec<Letter> {
        let mut letters = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(Some(Ok(frame))) = tokio::time::timeout_at(deadline, self.reader.next()).await {
            match Letter::parse(&frame).expect("parse") {
                Letter::Heartbeat(_) => {}
                letter => letters.push(letter),
            }
        }
        letters
    }

    pub async fn expect_no_new_task(&mut self, wait: Duration) {
        let stray = self
            .drain(wait)
            .await
            .into_iter()
            .any(|letter| matches!(letter, Letter::NewTask(_)));
        assert!(!stray, "unexpected task for {}", self.ident);
    }
}
