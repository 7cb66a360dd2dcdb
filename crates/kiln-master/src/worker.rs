use kiln_core::{TaskGroup, TaskType, Tracked};
use kiln_link::Link;
use kiln_protocol::Role;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Online,
    Waiting,
    Offline,
}

/// A task, or a child of a super task, handed to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub tid: String,
    pub task_type: TaskType,
    pub parent: Option<String>,
}

impl Assignment {
    pub fn new(tid: impl Into<String>, task_type: TaskType, parent: Option<&str>) -> Self {
        Self {
            tid: tid.into(),
            task_type,
            parent: parent.map(str::to_string),
        }
    }
}

impl Tracked for Assignment {
    fn id(&self) -> &str {
        &self.tid
    }

    fn task_type(&self) -> TaskType {
        self.task_type
    }
}

/// One connected build agent as the room sees it.
#[derive(Debug)]
pub struct Worker {
    ident: String,
    address: SocketAddr,
    state: WorkerState,
    role: Option<Role>,
    max: usize,
    in_proc: TaskGroup<Assignment>,
    link: Link,
    waiting_since: Option<Instant>,
}

impl Worker {
    pub(crate) fn new(ident: String, address: SocketAddr, max: usize, link: Link) -> Self {
        Self {
            ident,
            address,
            state: WorkerState::Offline,
            role: None,
            max,
            in_proc: TaskGroup::new(),
            link,
            waiting_since: None,
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == WorkerState::Online
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Build slots in use. Post tasks ride along without taking one.
    pub fn load(&self) -> usize {
        self.in_proc.count_of(TaskType::Single)
    }

    pub fn has_capacity(&self) -> bool {
        self.load() < self.max
    }

    pub fn holds(&self, tid: &str) -> bool {
        self.in_proc.contains(tid)
    }

    pub fn in_proc(&self) -> impl Iterator<Item = &Assignment> {
        self.in_proc.iter()
    }

    pub(crate) fn link(&self) -> &Link {
        &self.link
    }

    pub(crate) fn waiting_since(&self) -> Option<Instant> {
        self.waiting_since
    }

    pub(crate) fn set_role(&mut self, role: Option<Role>) {
        self.role = role;
    }

    pub(crate) fn set_max(&mut self, max: usize) {
        self.max = max;
    }

    /// Marks a handshaken worker as live.
    pub(crate) fn to_online(&mut self) {
        self.state = WorkerState::Online;
        self.waiting_since = None;
    }

    pub(crate) fn to_waiting(&mut self) {
        self.state = WorkerState::Waiting;
        self.waiting_since = Some(Instant::now());
    }

    /// Swaps in a fresh connection, keeping assignments. Returns the old link.
    pub(crate) fn reconnect(&mut self, address: SocketAddr, max: usize, link: Link) -> Link {
        self.state = WorkerState::Online;
        self.waiting_since = None;
        self.address = address;
        self.max = max;
        std::mem::replace(&mut self.link, link)
    }

    pub(crate) fn to_offline(&mut self) -> Vec<Assignment> {
        self.state = WorkerState::Offline;
        self.link.close();
        self.in_proc.remove_where(|_| true)
    }

    pub(crate) fn add_assignment(&mut self, assignment: Assignment) -> bool {
        self.in_proc.add(assignment).is_ok()
    }

    pub(crate) fn remove_assignment(&mut self, tid: &str) -> Option<Assignment> {
        self.in_proc.remove(tid)
    }

    pub(crate) fn remove_assignments_where(
        &mut self,
        pred: impl FnMut(&Assignment) -> bool,
    ) -> Vec<Assignment> {
        self.in_proc.remove_where(pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_link::{LinkContext, split};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    async fn passive_link(ctx: &LinkContext) -> (Link, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr"))
            .await
            .expect("connect");
        let (server, peer) = listener.accept().await.expect("accept");
        let (reader, writer) = split(server);
        let link = Link::passive(ctx, "w1", peer.to_string(), reader, writer);
        (link, peer, client)
    }

    #[tokio::test]
    async fn worker_starts_offline_until_handshake_completes() {
        let (inbound, _inbound_rx) = mpsc::channel(8);
        let (events, _events_rx) = mpsc::unbounded_channel();
        let ctx = LinkContext::new("master", inbound, events);
        let (link, peer, _client) = passive_link(&ctx).await;

        let mut worker = Worker::new("w1".to_string(), peer, 2, link);
        assert_eq!(worker.state(), WorkerState::Offline);
        assert!(!worker.is_online());

        worker.to_online();
        assert!(worker.is_online());
        worker.to_waiting();
        assert!(worker.waiting_since().is_some());
        worker.to_online();
        assert_eq!(worker.waiting_since(), None);

        assert!(worker.add_assignment(Assignment::new("t1", TaskType::Single, None)));
        assert!(worker.add_assignment(Assignment::new("s1__Post", TaskType::Post, Some("s1"))));
        assert_eq!(worker.load(), 1);
        assert_eq!(worker.to_offline().len(), 2);
        assert_eq!(worker.state(), WorkerState::Offline);
        ctx.cancel.cancel();
    }
}
