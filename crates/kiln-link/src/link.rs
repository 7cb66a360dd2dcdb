use crate::LinkError;
use futures::{SinkExt, StreamExt};
use kiln_protocol::{Heartbeat, Letter, LetterCodec, ProtocolError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type LetterReader = FramedRead<OwnedReadHalf, LetterCodec>;
pub type LetterWriter = FramedWrite<OwnedWriteHalf, LetterCodec>;

/// Consecutive unparseable letters tolerated before the link is dropped.
const MAX_PROTOCOL_ERRORS: u32 = 8;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

pub fn split(stream: TcpStream) -> (LetterReader, LetterWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, LetterCodec::new()),
        FramedWrite::new(write_half, LetterCodec::new()),
    )
}

/// Reads one letter, giving up after `within`.
pub async fn recv_letter(reader: &mut LetterReader, within: Duration) -> Result<Letter, LinkError> {
    match tokio::time::timeout(within, reader.next()).await {
        Err(_) => Err(LinkError::Timeout),
        Ok(None) => Err(LinkError::Closed),
        Ok(Some(Err(error))) => Err(LinkError::Protocol(error)),
        Ok(Some(Ok(frame))) => Ok(Letter::parse(&frame)?),
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub read_window: Duration,
    pub heartbeat_delay: Duration,
    pub liveness: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_window: Duration::from_secs(3),
            heartbeat_delay: Duration::from_secs(2),
            liveness: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Active,
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting,
    Disconnected,
    Removed,
}

/// A letter received on a link, tagged with the peer it came from.
#[derive(Debug)]
pub struct Inbound {
    pub peer: String,
    pub link_id: u64,
    pub letter: Letter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Lost { peer: String, link_id: u64 },
    Reconnected { peer: String, link_id: u64 },
}

/// Everything links created by one component share.
#[derive(Clone)]
pub struct LinkContext {
    pub ident: String,
    pub config: LinkConfig,
    pub inbound: mpsc::Sender<Inbound>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub cancel: CancellationToken,
}

impl LinkContext {
    pub fn new(
        ident: impl Into<String>,
        inbound: mpsc::Sender<Inbound>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            ident: ident.into(),
            config: LinkConfig::default(),
            inbound,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Clone)]
pub struct Link {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    ident: String,
    peer: String,
    role: LinkRole,
    remote: String,
    hello: Option<Letter>,
    config: LinkConfig,
    writer: tokio::sync::Mutex<Option<LetterWriter>>,
    state: Mutex<LinkState>,
    seq: AtomicU64,
    last_seen: Mutex<Instant>,
    connection: Mutex<CancellationToken>,
    cancel: CancellationToken,
    inbound: mpsc::Sender<Inbound>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

enum Exit {
    Stopped,
    Lost(String),
}

impl Link {
    /// Opens a connection, announces `hello`, and starts heartbeating.
    ///
    /// The link reconnects on its own until closed; `hello` is resent after
    /// every reconnect.
    pub async fn connect(
        ctx: &LinkContext,
        peer: impl Into<String>,
        remote: impl Into<String>,
        hello: Option<Letter>,
    ) -> Result<Link, LinkError> {
        let remote = remote.into();
        let stream = TcpStream::connect(&remote)
            .await
            .map_err(|e| LinkError::Connect {
                addr: remote.clone(),
                reason: e.to_string(),
            })?;

        let inner = Arc::new(Inner::new(
            ctx,
            peer.into(),
            LinkRole::Active,
            remote,
            hello,
            None,
        ));
        let reader = inner.install(stream).await?;
        tokio::spawn(supervise(Arc::clone(&inner), reader));
        Ok(Link { inner })
    }

    /// Wraps an accepted connection whose handshake has already been read.
    pub fn passive(
        ctx: &LinkContext,
        peer: impl Into<String>,
        remote: impl Into<String>,
        reader: LetterReader,
        writer: LetterWriter,
    ) -> Link {
        let inner = Arc::new(Inner::new(
            ctx,
            peer.into(),
            LinkRole::Passive,
            remote.into(),
            None,
            Some(writer),
        ));
        tokio::spawn(supervise(Arc::clone(&inner), reader));
        Link { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn role(&self) -> LinkRole {
        self.inner.role
    }

    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    pub async fn send(&self, letter: impl Into<Letter>) -> Result<(), LinkError> {
        self.inner.send(letter.into()).await
    }

    /// Stops the link for good. A removed link never reconnects.
    pub fn close(&self) {
        self.inner.set_state(LinkState::Removed);
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("remote", &self.inner.remote)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Inner {
    fn new(
        ctx: &LinkContext,
        peer: String,
        role: LinkRole,
        remote: String,
        hello: Option<Letter>,
        writer: Option<LetterWriter>,
    ) -> Self {
        Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            ident: ctx.ident.clone(),
            peer,
            role,
            remote,
            hello,
            config: ctx.config.clone(),
            writer: tokio::sync::Mutex::new(writer),
            state: Mutex::new(LinkState::Connected),
            seq: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
            connection: Mutex::new(CancellationToken::new()),
            cancel: ctx.cancel.child_token(),
            inbound: ctx.inbound.clone(),
            events: ctx.events.clone(),
        }
    }

    fn state(&self) -> LinkState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(LinkState::Disconnected)
    }

    fn set_state(&self, next: LinkState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != LinkState::Removed {
                *state = next;
            }
        }
    }

    fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
    }

    fn silent_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|last_seen| last_seen.elapsed())
            .unwrap_or_default()
    }

    fn connection_token(&self) -> CancellationToken {
        self.connection
            .lock()
            .map(|token| token.clone())
            .unwrap_or_default()
    }

    async fn send(&self, letter: Letter) -> Result<(), LinkError> {
        if self.state() == LinkState::Removed {
            return Err(LinkError::Removed(self.peer.clone()));
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(LinkError::NotConnected(self.peer.clone()));
        };

        match writer.send(letter).await {
            Ok(()) => Ok(()),
            Err(ProtocolError::Io(error)) => {
                *guard = None;
                drop(guard);
                warn!(peer = %self.peer, error = %error, "send failed, dropping connection");
                self.set_state(match self.role {
                    LinkRole::Active => LinkState::Reconnecting,
                    LinkRole::Passive => LinkState::Disconnected,
                });
                self.connection_token().cancel();
                Err(LinkError::Send(error.to_string()))
            }
            Err(error) => Err(LinkError::Protocol(error)),
        }
    }

    /// Puts a fresh stream in place and replays the opening letters.
    async fn install(&self, stream: TcpStream) -> Result<LetterReader, LinkError> {
        let (reader, mut writer) = split(stream);
        self.seq.store(0, Ordering::SeqCst);
        self.touch();

        if let Some(hello) = &self.hello {
            writer.send(hello.clone()).await?;
        }
        writer
            .send(Letter::from(Heartbeat::new(self.ident.clone(), 0)))
            .await?;

        *self.writer.lock().await = Some(writer);
        if let Ok(mut token) = self.connection.lock() {
            *token = CancellationToken::new();
        }
        self.set_state(LinkState::Connected);
        Ok(reader)
    }

    async fn on_heartbeat(self: &Arc<Self>, heartbeat: Heartbeat) {
        self.touch();
        let seq = heartbeat.seq();

        match self.role {
            LinkRole::Passive => {
                self.seq.store(seq + 1, Ordering::SeqCst);
                let echo = Letter::from(Heartbeat::new(self.ident.clone(), seq));
                if let Err(error) = self.send(echo).await {
                    debug!(peer = %self.peer, error = %error, "heartbeat echo failed");
                }
            }
            LinkRole::Active => {
                if self.seq.load(Ordering::SeqCst) != seq {
                    debug!(peer = %self.peer, seq, "ignoring stale heartbeat echo");
                    return;
                }
                let next = seq + 1;
                self.seq.store(next, Ordering::SeqCst);

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => return,
                        _ = tokio::time::sleep(inner.config.heartbeat_delay) => {}
                    }
                    if inner.seq.load(Ordering::SeqCst) != next {
                        return;
                    }
                    let beat = Letter::from(Heartbeat::new(inner.ident.clone(), next));
                    if let Err(error) = inner.send(beat).await {
                        debug!(peer = %inner.peer, error = %error, "heartbeat send failed");
                    }
                });
            }
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!(peer = %self.peer, "link event receiver dropped");
        }
    }
}

async fn supervise(inner: Arc<Inner>, mut reader: LetterReader) {
    loop {
        let exit = receive_loop(&inner, &mut reader).await;
        inner.writer.lock().await.take();

        let reason = match exit {
            Exit::Stopped => {
                inner.set_state(LinkState::Removed);
                debug!(peer = %inner.peer, "link stopped");
                return;
            }
            Exit::Lost(reason) => reason,
        };

        info!(peer = %inner.peer, reason = %reason, "link lost");
        let passive = inner.role == LinkRole::Passive;
        inner.set_state(if passive {
            LinkState::Disconnected
        } else {
            LinkState::Reconnecting
        });
        inner.emit(LinkEvent::Lost {
            peer: inner.peer.clone(),
            link_id: inner.id,
        });
        if passive {
            return;
        }

        match reconnect(&inner).await {
            Some(next) => {
                reader = next;
                info!(peer = %inner.peer, remote = %inner.remote, "link reconnected");
                inner.emit(LinkEvent::Reconnected {
                    peer: inner.peer.clone(),
                    link_id: inner.id,
                });
            }
            None => {
                inner.set_state(LinkState::Removed);
                return;
            }
        }
    }
}

async fn receive_loop(inner: &Arc<Inner>, reader: &mut LetterReader) -> Exit {
    let connection = inner.connection_token();
    let mut protocol_errors = 0u32;

    loop {
        if inner.cancel.is_cancelled() {
            return Exit::Stopped;
        }
        if inner.silent_for() > inner.config.liveness {
            return Exit::Lost("no heartbeat within liveness window".to_string());
        }

        let next = tokio::select! {
            _ = inner.cancel.cancelled() => return Exit::Stopped,
            _ = connection.cancelled() => return Exit::Lost("send failure".to_string()),
            next = tokio::time::timeout(inner.config.read_window, reader.next()) => next,
        };

        let frame = match next {
            Err(_) => continue,
            Ok(None) => return Exit::Lost("connection closed".to_string()),
            Ok(Some(Err(error))) => return Exit::Lost(error.to_string()),
            Ok(Some(Ok(frame))) => frame,
        };

        let letter = match Letter::parse(&frame) {
            Ok(letter) => {
                protocol_errors = 0;
                letter
            }
            Err(error) => {
                protocol_errors += 1;
                warn!(peer = %inner.peer, error = %error, "dropping unparseable letter");
                if protocol_errors >= MAX_PROTOCOL_ERRORS {
                    return Exit::Lost("too many protocol errors".to_string());
                }
                continue;
            }
        };

        if let Letter::Heartbeat(heartbeat) = letter {
            inner.on_heartbeat(heartbeat).await;
            continue;
        }

        let inbound = Inbound {
            peer: inner.peer.clone(),
            link_id: inner.id,
            letter,
        };
        if inner.inbound.send(inbound).await.is_err() {
            return Exit::Stopped;
        }
    }
}

async fn reconnect(inner: &Arc<Inner>) -> Option<LetterReader> {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return None,
            _ = tokio::time::sleep(inner.config.reconnect_backoff) => {}
        }

        let stream = match TcpStream::connect(&inner.remote).await {
            Ok(stream) => stream,
            Err(error) => {
                debug!(remote = %inner.remote, error = %error, "reconnect attempt failed");
                continue;
            }
        };
        match inner.install(stream).await {
            Ok(reader) => return Some(reader),
            Err(error) => debug!(remote = %inner.remote, error = %error, "reconnect handshake failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_protocol::{Cancel, PropertyNotify};
    use tokio::net::TcpListener;

    fn fast_config() -> LinkConfig {
        LinkConfig {
            read_window: Duration::from_millis(50),
            heartbeat_delay: Duration::from_millis(50),
            liveness: Duration::from_millis(400),
            reconnect_backoff: Duration::from_millis(50),
        }
    }

    fn context(
        ident: &str,
    ) -> (
        LinkContext,
        mpsc::Receiver<Inbound>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = LinkContext::new(ident, inbound_tx, events_tx).with_config(fast_config());
        (ctx, inbound_rx, events_rx)
    }

    async fn next_heartbeat(reader: &mut LetterReader) -> Heartbeat {
        loop {
            match recv_letter(reader, Duration::from_secs(2))
                .await
                .expect("letter from peer")
            {
                Letter::Heartbeat(heartbeat) => return heartbeat,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn active_link_sends_hello_then_advances_heartbeat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        let (ctx, _inbound, _events) = context("w1");

        let hello = Letter::from(PropertyNotify::new("w1", 2, 0));
        let link = Link::connect(&ctx, "master", addr, Some(hello.clone()))
            .await
            .expect("connect");
        let (stream, _) = listener.accept().await.expect("accept");
        let (mut reader, mut writer) = split(stream);

        let first = recv_letter(&mut reader, Duration::from_secs(1))
            .await
            .expect("hello");
        assert_eq!(first, hello);
        assert_eq!(next_heartbeat(&mut reader).await.seq(), 0);

        writer
            .send(Letter::from(Heartbeat::new("master", 0)))
            .await
            .expect("echo");
        assert_eq!(next_heartbeat(&mut reader).await.seq(), 1);
        assert_eq!(link.state(), LinkState::Connected);
        link.close();
    }

    #[tokio::test]
    async fn passive_link_echoes_and_forwards_letters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, peer_addr) = listener.accept().await.expect("accept");

        let (ctx, mut inbound, _events) = context("master");
        let (reader, writer) = split(server);
        let link = Link::passive(&ctx, "w1", peer_addr.to_string(), reader, writer);

        let (mut client_reader, mut client_writer) = split(client);
        client_writer
            .send(Letter::from(Heartbeat::new("w1", 3)))
            .await
            .expect("heartbeat");
        let echo = next_heartbeat(&mut client_reader).await;
        assert_eq!(echo.seq(), 3);
        assert_eq!(echo.header.ident, "master");

        client_writer
            .send(Letter::from(Cancel::new("t1", None)))
            .await
            .expect("cancel");
        let received = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .expect("inbound in time")
            .expect("inbound letter");
        assert_eq!(received.peer, "w1");
        assert_eq!(received.link_id, link.id());
        assert!(matches!(received.letter, Letter::Cancel(_)));
        link.close();
    }

    #[tokio::test]
    async fn garbage_frame_does_not_kill_passive_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let mut client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");

        let (ctx, mut inbound, _events) = context("master");
        let (reader, writer) = split(server);
        let link = Link::passive(&ctx, "w1", "peer", reader, writer);

        let garbage = b"{oops}";
        let mut raw = (garbage.len() as u16).to_be_bytes().to_vec();
        raw.extend_from_slice(garbage);
        raw.extend_from_slice(
            &Letter::from(Cancel::new("t9", None))
                .to_bytes_with_length()
                .expect("encode"),
        );
        tokio::io::AsyncWriteExt::write_all(&mut client, &raw)
            .await
            .expect("write raw");

        let received = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .expect("inbound in time")
            .expect("inbound letter");
        match received.letter {
            Letter::Cancel(cancel) => assert_eq!(cancel.header.tid, "t9"),
            other => panic!("unexpected letter: {other:?}"),
        }
        assert_eq!(link.state(), LinkState::Connected);
        link.close();
    }

    #[tokio::test]
    async fn silent_passive_link_reports_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let _client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");

        let (ctx, _inbound, mut events) = context("master");
        let (reader, writer) = split(server);
        let link = Link::passive(&ctx, "w1", "peer", reader, writer);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert_eq!(
            event,
            LinkEvent::Lost {
                peer: "w1".to_string(),
                link_id: link.id(),
            }
        );
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn active_link_reconnects_and_replays_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        let (ctx, _inbound, mut events) = context("w1");

        let hello = Letter::from(PropertyNotify::new("w1", 1, 0));
        let link = Link::connect(&ctx, "master", addr, Some(hello.clone()))
            .await
            .expect("connect");

        let (first, _) = listener.accept().await.expect("first accept");
        drop(first);

        let (second, _) = listener.accept().await.expect("second accept");
        let (mut reader, _writer) = split(second);
        let replayed = recv_letter(&mut reader, Duration::from_secs(2))
            .await
            .expect("hello again");
        assert_eq!(replayed, hello);
        assert_eq!(next_heartbeat(&mut reader).await.seq(), 0);

        let mut saw_reconnect = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(1), events.recv()).await
        {
            if matches!(event, LinkEvent::Reconnected { .. }) {
                saw_reconnect = true;
                break;
            }
        }
        assert!(saw_reconnect);
        link.close();
    }

    #[tokio::test]
    async fn closed_link_refuses_to_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        let (ctx, _inbound, _events) = context("w1");
        let link = Link::connect(&ctx, "master", addr, None)
            .await
            .expect("connect");

        link.close();
        let error = link
            .send(Cancel::new("t1", None))
            .await
            .expect_err("removed link");
        assert!(matches!(error, LinkError::Removed(_)));
        assert_eq!(link.state(), LinkState::Removed);
    }
}
