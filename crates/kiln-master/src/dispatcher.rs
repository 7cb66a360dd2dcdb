use crate::config::{CMD_ID_KEY, JobCatalog};
use crate::errors::DispatchError;
use crate::room::{RoomEvent, WorkerRoom};
use crate::worker::{Assignment, Worker};
use chrono::{DateTime, Utc};
use kiln_core::{Task, TaskError, TaskGroup, TaskKind, TaskState, TaskType};
use kiln_protocol::{Cancel, Command, Letter, Role};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub aging_threshold: Duration,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            aging_threshold: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// A state change of a tracked task or one of its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub tid: String,
    pub state: TaskState,
}

#[derive(Debug, Default)]
struct Tracker {
    tasks: TaskGroup<Task>,
    /// Child id to owning super task id.
    parents: HashMap<String, String>,
    /// Task or child id to the worker that last ran it.
    runners: HashMap<String, String>,
}

impl Tracker {
    fn insert(&mut self, task: Task) -> Result<(), TaskError> {
        let id = task.id().to_string();
        let children: Vec<String> = task.children().iter().map(|c| c.id().to_string()).collect();
        self.tasks.add(task)?;
        for child in children {
            self.parents.insert(child, id.clone());
        }
        Ok(())
    }

    fn root_of(&self, tid: &str) -> Option<String> {
        if self.tasks.contains(tid) {
            return Some(tid.to_string());
        }
        self.parents.get(tid).cloned()
    }

    fn task(&self, tid: &str) -> Option<&Task> {
        match self.parents.get(tid) {
            Some(root) => self.tasks.get(root)?.child(tid),
            None => self.tasks.get(tid),
        }
    }

    fn task_mut(&mut self, tid: &str) -> Option<&mut Task> {
        match self.parents.get(tid) {
            Some(root) => self.tasks.get_mut(root)?.child_mut(tid),
            None => self.tasks.get_mut(tid),
        }
    }

    /// Drops a root task and its index entries, returning who ran what.
    fn forget(&mut self, task: &Task) -> Vec<(String, String)> {
        let mut ran = Vec::new();
        let ids = std::iter::once(task.id()).chain(task.children().iter().map(Task::id));
        for id in ids {
            self.parents.remove(id);
            if let Some(worker) = self.runners.remove(id) {
                ran.push((worker, id.to_string()));
            }
        }
        ran
    }
}

struct Unit {
    tid: String,
    parent: Option<String>,
    task_type: TaskType,
    letter: Letter,
}

/// Assigns tasks to workers and follows them to completion.
pub struct Dispatcher {
    config: DispatcherConfig,
    catalog: JobCatalog,
    room: Arc<WorkerRoom>,
    tracker: Mutex<Tracker>,
    waiting: Mutex<VecDeque<String>>,
    schedule: tokio::sync::Mutex<()>,
    work: Notify,
    events: broadcast::Sender<TaskEvent>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, catalog: JobCatalog, room: Arc<WorkerRoom>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            catalog,
            room,
            tracker: Mutex::new(Tracker::default()),
            waiting: Mutex::new(VecDeque::new()),
            schedule: tokio::sync::Mutex::new(()),
            work: Notify::new(),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.waiting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn publish(&self, tid: &str, state: TaskState) {
        let _ = self.events.send(TaskEvent {
            tid: tid.to_string(),
            state,
        });
    }

    /// Tracks and assigns a task, or adds a reference if it is already tracked.
    pub async fn dispatch(&self, mut task: Task) -> Result<(), DispatchError> {
        let tid = task.id().to_string();
        {
            let mut tracker = self.lock();
            if let Some(existing) = tracker.tasks.get_mut(&tid) {
                let refs = existing.ref_inc();
                debug!(tid = %tid, refs, "task already tracked");
                return Ok(());
            }
            if !task.is_bound() {
                let command = self.catalog.resolve(task.extra(CMD_ID_KEY))?;
                task.bind(command);
            }
            tracker.insert(task.transform()?)?;
        }
        info!(tid = %tid, "task accepted");
        self.publish(&tid, TaskState::Prepare);

        if !self.try_assign(&tid).await {
            debug!(tid = %tid, "no eligible worker, queued");
            self.enqueue(&tid);
        }
        Ok(())
    }

    fn enqueue(&self, tid: &str) {
        {
            let mut waiting = self.queue();
            if !waiting.iter().any(|queued| queued == tid) {
                waiting.push_back(tid.to_string());
            }
        }
        self.work.notify_one();
    }

    fn pending_units(&self, tid: &str) -> Option<Vec<Unit>> {
        let tracker = self.lock();
        let task = tracker.tasks.get(tid)?;
        if !task.state().is_active() {
            return None;
        }

        let candidates: Vec<&Task> = match task.kind() {
            TaskKind::Super(_) => task.children().iter().collect(),
            _ => vec![task],
        };
        let units = candidates
            .into_iter()
            .filter(|t| t.state() == TaskState::Prepare)
            .filter_map(|t| match t.to_letter() {
                Ok(letter) => Some(Unit {
                    tid: t.id().to_string(),
                    parent: t.parent().map(str::to_string),
                    task_type: t.task_type(),
                    letter,
                }),
                Err(error) => {
                    warn!(tid = %t.id(), error = %error, "task has no letter");
                    None
                }
            })
            .collect();
        Some(units)
    }

    fn pick_worker(&self, task_type: TaskType) -> Option<String> {
        match task_type {
            TaskType::Post => self.room.select(
                |w| w.is_online() && w.role() == Some(Role::Listener),
                |_| 0,
            ),
            _ => self
                .room
                .select(|w| w.is_online() && w.has_capacity(), Worker::load),
        }
    }

    /// Tries to place every unassigned part of a task. True once nothing is left to place.
    async fn try_assign(&self, tid: &str) -> bool {
        let _pass = self.schedule.lock().await;
        let Some(units) = self.pending_units(tid) else {
            return true;
        };

        let mut complete = true;
        for unit in units {
            let Some(ident) = self.pick_worker(unit.task_type) else {
                complete = false;
                continue;
            };
            let assignment = Assignment::new(&unit.tid, unit.task_type, unit.parent.as_deref());
            match self.room.assign(&ident, assignment, unit.letter).await {
                Ok(()) => self.mark_assigned(&unit.tid, &ident),
                Err(error) => {
                    debug!(tid = %unit.tid, ident = %ident, error = %error, "assignment failed");
                    complete = false;
                }
            }
        }

        if complete {
            let promoted = {
                let mut tracker = self.lock();
                match tracker.tasks.get_mut(tid) {
                    Some(task) if task.state() == TaskState::Prepare => match task.to_proc_state() {
                        Ok(()) => true,
                        Err(error) => {
                            warn!(tid = %tid, error = %error, "promotion rejected");
                            false
                        }
                    },
                    _ => false,
                }
            };
            if promoted {
                self.publish(tid, TaskState::InProc);
            }
        }
        complete
    }

    fn mark_assigned(&self, tid: &str, ident: &str) {
        let moved = {
            let mut tracker = self.lock();
            tracker.runners.insert(tid.to_string(), ident.to_string());
            match tracker.task_mut(tid) {
                Some(task) => match task.to_proc_state() {
                    Ok(()) => true,
                    Err(error) => {
                        warn!(tid = %tid, error = %error, "assigned task rejected in-proc state");
                        false
                    }
                },
                None => false,
            }
        };
        if moved {
            info!(tid = %tid, ident = %ident, "task dispatched");
            self.publish(tid, TaskState::InProc);
        }
    }

    /// One scheduling pass: age, then retry every queued task once.
    pub async fn schedule(&self) {
        self.age(Utc::now()).await;

        let pending = self.queue().len();
        for _ in 0..pending {
            let Some(tid) = self.queue().pop_front() else {
                break;
            };
            if !self.try_assign(&tid).await {
                self.queue().push_back(tid);
            }
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut room_events: broadcast::Receiver<RoomEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.work.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                event = room_events.recv() => match event {
                    Ok(RoomEvent::Evicted { ident, assignments, was_listener }) => {
                        self.on_worker_lost(&ident, assignments, was_listener).await;
                    }
                    Ok(RoomEvent::Online { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dispatcher lagged behind room events");
                        self.reconcile().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
            self.schedule().await;
        }
        debug!("dispatcher loop stopped");
    }

    /// Applies a worker's `Response` for a task or child.
    pub async fn on_response(&self, ident: &str, tid: &str, state: TaskState) {
        match state {
            TaskState::InProc => {
                let moved = self
                    .lock()
                    .task_mut(tid)
                    .filter(|task| task.state() == TaskState::Prepare)
                    .map(|task| task.to_proc_state().is_ok())
                    .unwrap_or(false);
                if moved {
                    self.publish(tid, TaskState::InProc);
                }
            }
            TaskState::Prepare => {
                self.room.release(ident, tid);
                let mut demoted = None;
                let root = {
                    let mut tracker = self.lock();
                    let root = tracker.root_of(tid);
                    if let Some(task) = tracker.task_mut(tid) {
                        if let Err(error) = task.to_prep_state() {
                            warn!(tid = %tid, error = %error, "bounce rejected");
                        }
                    }
                    if let Some(parent) = root
                        .as_deref()
                        .filter(|root| *root != tid)
                        .and_then(|root| tracker.tasks.get_mut(root))
                    {
                        if parent.state() == TaskState::InProc && parent.to_prep_state().is_ok() {
                            demoted = Some(parent.id().to_string());
                        }
                    }
                    root
                };
                debug!(tid = %tid, ident = %ident, "task bounced back to waiting");
                if let Some(parent) = demoted {
                    self.publish(&parent, TaskState::Prepare);
                }
                if let Some(root) = root {
                    self.enqueue(&root);
                }
            }
            TaskState::Finished => self.finish(ident, tid),
            TaskState::Failure => self.fail(ident, tid).await,
        }
    }

    fn finish(&self, ident: &str, tid: &str) {
        self.room.release(ident, tid);
        let mut published = Vec::new();
        {
            let mut tracker = self.lock();
            let Some(root) = tracker.root_of(tid) else {
                warn!(tid = %tid, ident = %ident, "finish for unknown task");
                return;
            };
            let Some(task) = tracker.task_mut(tid) else {
                return;
            };
            if let Err(error) = task.to_fin_state() {
                warn!(tid = %tid, error = %error, "finish rejected");
                return;
            }
            published.push(tid.to_string());

            if root != tid {
                if let Some(parent) = tracker.tasks.get_mut(&root) {
                    if parent.to_fin_state().is_ok() {
                        published.push(root);
                    }
                }
            }
        }
        for id in published {
            info!(tid = %id, "task finished");
            self.publish(&id, TaskState::Finished);
        }
        self.work.notify_one();
    }

    async fn fail(&self, ident: &str, tid: &str) {
        self.room.release(ident, tid);
        let mut published = Vec::new();
        let mut siblings = Vec::new();
        let root = {
            let mut tracker = self.lock();
            let Some(root) = tracker.root_of(tid) else {
                warn!(tid = %tid, ident = %ident, "failure for unknown task");
                return;
            };
            let Some(task) = tracker.task_mut(tid) else {
                return;
            };
            if let Err(error) = task.to_fail_state() {
                warn!(tid = %tid, error = %error, "failure rejected");
                return;
            }
            published.push(tid.to_string());

            if root != tid {
                if let Some(parent) = tracker.tasks.get_mut(&root) {
                    if parent.to_fail_state().is_ok() {
                        siblings = parent
                            .children()
                            .iter()
                            .filter(|c| c.state().is_active())
                            .map(|c| c.id().to_string())
                            .collect();
                        parent.force_fail();
                        published.push(root.clone());
                    }
                }
            }
            root
        };

        for id in &published {
            warn!(tid = %id, "task failed");
            self.publish(id, TaskState::Failure);
        }
        for sibling in siblings {
            self.withdraw(&sibling, Some(&root)).await;
        }
        self.work.notify_one();
    }

    /// Takes a task back from whichever worker holds it.
    async fn withdraw(&self, tid: &str, parent: Option<&str>) {
        let Some(holder) = self.room.holder_of(tid) else {
            return;
        };
        self.room.release(&holder, tid);
        if let Err(error) = self.room.send_to(&holder, Cancel::new(tid, parent)).await {
            debug!(tid = %tid, ident = %holder, error = %error, "cancel not delivered");
        }
    }

    /// Resubmits what an evicted worker held, failing super tasks that lost their listener.
    pub async fn on_worker_lost(&self, ident: &str, assignments: Vec<Assignment>, was_listener: bool) {
        let mut requeue = BTreeSet::new();
        let mut failed: Vec<(String, Vec<String>)> = Vec::new();
        {
            let mut tracker = self.lock();
            for assignment in &assignments {
                tracker.runners.remove(&assignment.tid);
                let Some(root) = tracker.root_of(&assignment.tid) else {
                    continue;
                };

                if assignment.parent.is_some() && was_listener {
                    let Some(parent) = tracker.tasks.get_mut(&root) else {
                        continue;
                    };
                    if parent.state().is_active() {
                        let active = parent
                            .children()
                            .iter()
                            .filter(|c| c.state().is_active())
                            .map(|c| c.id().to_string())
                            .collect();
                        parent.force_fail();
                        failed.push((root, active));
                    }
                    continue;
                }

                let Some(task) = tracker.task_mut(&assignment.tid) else {
                    continue;
                };
                match task.state() {
                    TaskState::InProc => match task.to_prep_state() {
                        Ok(()) => {
                            requeue.insert(root);
                        }
                        Err(error) => warn!(tid = %assignment.tid, error = %error, "redispatch rejected"),
                    },
                    TaskState::Prepare => {
                        requeue.insert(root);
                    }
                    TaskState::Finished | TaskState::Failure => {}
                }
            }

            // A super task that went back to work is no longer in progress as a whole.
            for root in &requeue {
                if let Some(task) = tracker.tasks.get_mut(root) {
                    if task.task_type() == TaskType::Super && task.state() == TaskState::InProc {
                        if let Err(error) = task.to_prep_state() {
                            warn!(tid = %root, error = %error, "super task demotion rejected");
                        }
                    }
                }
            }
        }

        if !assignments.is_empty() {
            info!(
                ident = %ident,
                redispatch = requeue.len(),
                failed = failed.len(),
                "recovering tasks of lost worker"
            );
        }

        for (root, active) in &failed {
            warn!(tid = %root, "post processing lost with listener, failing task");
            self.publish(root, TaskState::Failure);
            for child in active {
                self.withdraw(child, Some(root)).await;
            }
        }

        // Nothing that has failed stays on any worker's books.
        let failed_ids: Vec<String> = {
            let tracker = self.lock();
            self.room
                .idents()
                .iter()
                .flat_map(|ident| self.room.in_proc_of(ident))
                .filter(|tid| {
                    tracker
                        .task(tid)
                        .is_some_and(|t| t.state() == TaskState::Failure)
                })
                .collect()
        };
        self.room
            .release_where(|assignment| failed_ids.contains(&assignment.tid));

        for root in requeue {
            self.enqueue(&root);
        }
    }

    /// Recovers tasks still booked on workers that have left the room.
    ///
    /// Covers evictions whose room event was never seen.
    pub async fn reconcile(&self) {
        let mut orphaned: HashMap<String, Vec<Assignment>> = HashMap::new();
        {
            let tracker = self.lock();
            for (tid, ident) in &tracker.runners {
                if self.room.state_of(ident).is_some() {
                    continue;
                }
                let Some(task) = tracker.task(tid) else {
                    continue;
                };
                if !task.state().is_active() {
                    continue;
                }
                let parent = tracker.parents.get(tid).map(String::as_str);
                orphaned
                    .entry(ident.clone())
                    .or_default()
                    .push(Assignment::new(tid.as_str(), task.task_type(), parent));
            }
        }
        for (ident, assignments) in orphaned {
            // Only the listener is ever handed post tasks.
            let was_listener = assignments.iter().any(|a| a.task_type == TaskType::Post);
            warn!(ident = %ident, tasks = assignments.len(), "recovering tasks of vanished worker");
            self.on_worker_lost(&ident, assignments, was_listener).await;
        }
    }

    /// Notes where a finished task's artifact was stored.
    pub fn record_artifact(&self, tid: &str, key: &str) {
        let mut tracker = self.lock();
        let root = tracker.root_of(tid);
        let Some(task) = tracker.task_mut(tid) else {
            return;
        };
        task.set_data(key);
        let is_post = task.task_type() == TaskType::Post;
        if let (Some(root), true) = (root, is_post) {
            if let Some(parent) = tracker.tasks.get_mut(&root) {
                parent.set_data(key);
            }
        }
    }

    /// The result of a finished task. Each call releases one reference.
    pub async fn retrieve(&self, tid: &str) -> Option<String> {
        let (data, clean) = {
            let mut tracker = self.lock();
            let task = tracker.tasks.get_mut(tid)?;
            if task.state() != TaskState::Finished {
                return None;
            }
            let refs = task.ref_dec();
            let data = task.data().map(str::to_string);
            let clean = if refs == 0 {
                let ids: Vec<String> = std::iter::once(task.id())
                    .chain(task.children().iter().map(Task::id))
                    .map(str::to_string)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| tracker.runners.remove(&id).map(|w| (w, id)))
                    .collect()
            } else {
                Vec::new()
            };
            (data, clean)
        };
        self.clean(clean).await;
        data
    }

    async fn clean(&self, ran: Vec<(String, String)>) {
        for (ident, tid) in ran {
            let command = Command::Clean { tid: tid.clone() };
            if let Err(error) = self.room.send_to(&ident, command.to_letter()).await {
                debug!(tid = %tid, ident = %ident, error = %error, "clean not delivered");
            }
        }
    }

    /// Evicts settled tasks nobody wants any more. Active tasks always stay.
    pub async fn age(&self, now: DateTime<Utc>) -> Vec<String> {
        let threshold = chrono::Duration::from_std(self.config.aging_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let (evicted, ran) = {
            let mut tracker = self.lock();
            let stale = tracker.tasks.remove_where(|task| {
                !task.state().is_active()
                    && (task.refs() == 0 || now - task.last_access() > threshold)
            });
            let mut ran = Vec::new();
            for task in &stale {
                ran.extend(tracker.forget(task));
            }
            let ids: Vec<String> = stale.iter().map(|t| t.id().to_string()).collect();
            (ids, ran)
        };
        for tid in &evicted {
            debug!(tid = %tid, "task aged out");
        }
        self.clean(ran).await;
        evicted
    }

    /// Stops tracking a task and pulls it back from workers.
    pub async fn cancel(&self, tid: &str) -> Result<(), DispatchError> {
        let ids = {
            let mut tracker = self.lock();
            let task = tracker
                .tasks
                .remove(tid)
                .ok_or_else(|| DispatchError::NotFound(tid.to_string()))?;
            tracker.forget(&task);
            let children: Vec<String> = task.children().iter().map(|c| c.id().to_string()).collect();
            children
        };
        self.queue().retain(|queued| queued != tid);

        self.withdraw(tid, None).await;
        for child in &ids {
            self.withdraw(child, Some(tid)).await;
        }
        info!(tid = %tid, "task cancelled");
        self.publish(tid, TaskState::Failure);
        self.work.notify_one();
        Ok(())
    }

    pub fn state_of(&self, tid: &str) -> Option<TaskState> {
        self.lock().task(tid).map(Task::state)
    }

    pub fn refs_of(&self, tid: &str) -> Option<u32> {
        self.lock().tasks.get(tid).map(Task::refs)
    }

    pub fn data_of(&self, tid: &str) -> Option<String> {
        self.lock().task(tid).and_then(|t| t.data().map(str::to_string))
    }

    /// Whether a letter about `tid` refers to something we track.
    pub fn is_known(&self, tid: &str) -> bool {
        self.lock().root_of(tid).is_some()
    }

    pub fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().tasks.iter().map(|t| t.id().to_string()).collect();
        ids.sort();
        ids
    }

    pub fn waiting(&self) -> Vec<String> {
        self.queue().iter().cloned().collect()
    }

    /// Makes a task look last touched at `at`.
    pub fn backdate(&self, tid: &str, at: DateTime<Utc>) {
        if let Some(task) = self.lock().tasks.get_mut(tid) {
            task.set_last_access(at);
        }
    }
}
