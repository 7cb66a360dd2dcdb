use crate::errors::TaskError;
use crate::model::{Build, BuildSet, JobCommand, Placeholders, TaskState};
use chrono::{DateTime, Utc};
use kiln_protocol::{BuildOrder, Letter, MenuLetter, NewTask, PostLetter};
use std::collections::BTreeMap;

/// Widest id the binary artifact header can carry.
pub const MAX_TASK_ID_LEN: usize = 64;

pub const DATETIME_KEY: &str = "datetime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskType {
    Bare,
    Single,
    Super,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleTask {
    pub build: Build,
    pub parent: Option<String>,
    pub post_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuperTask {
    /// Single children in build order, then the post task.
    pub children: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Menu {
    pub mid: String,
    pub cmd: Vec<String>,
    pub output: String,
    pub depends: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostTask {
    pub parent: String,
    pub merge: Build,
    pub menus: Vec<Menu>,
    pub frags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Bare(Option<JobCommand>),
    Single(SingleTask),
    Super(SuperTask),
    Post(PostTask),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    id: String,
    sn: String,
    vsn: String,
    extra: BTreeMap<String, String>,
    state: TaskState,
    refs: u32,
    last_access: DateTime<Utc>,
    data: Option<String>,
    kind: TaskKind,
}

pub fn validate_task_id(id: &str) -> Result<(), TaskError> {
    if id.is_empty() || id.len() > MAX_TASK_ID_LEN || id.contains(char::is_whitespace) {
        return Err(TaskError::Format(id.to_string()));
    }
    Ok(())
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        sn: impl Into<String>,
        vsn: impl Into<String>,
    ) -> Result<Self, TaskError> {
        let id = id.into();
        validate_task_id(&id)?;
        Ok(Self {
            id,
            sn: sn.into(),
            vsn: vsn.into(),
            extra: BTreeMap::new(),
            state: TaskState::Prepare,
            refs: 1,
            last_access: Utc::now(),
            data: None,
            kind: TaskKind::Bare(None),
        })
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sn(&self) -> &str {
        &self.sn
    }

    pub fn vsn(&self) -> &str {
        &self.vsn
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        self.last_access
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn task_type(&self) -> TaskType {
        match self.kind {
            TaskKind::Bare(_) => TaskType::Bare,
            TaskKind::Single(_) => TaskType::Single,
            TaskKind::Super(_) => TaskType::Super,
            TaskKind::Post(_) => TaskType::Post,
        }
    }

    /// The owning super task for split children.
    pub fn parent(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Single(single) => single.parent.as_deref(),
            TaskKind::Post(post) => Some(&post.parent),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        !matches!(self.kind, TaskKind::Bare(None))
    }

    pub fn bind(&mut self, command: JobCommand) {
        if let TaskKind::Bare(slot) = &mut self.kind {
            *slot = Some(command);
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Utc::now();
    }

    pub fn set_last_access(&mut self, at: DateTime<Utc>) {
        self.last_access = at;
    }

    pub fn ref_inc(&mut self) -> u32 {
        self.refs = self.refs.saturating_add(1);
        self.touch();
        self.refs
    }

    pub fn ref_dec(&mut self) -> u32 {
        self.refs = self.refs.saturating_sub(1);
        self.touch();
        self.refs
    }

    pub fn set_data(&mut self, data: impl Into<String>) {
        self.data = Some(data.into());
    }

    /// Moves to `next` if the topology allows it; otherwise leaves state alone.
    pub fn state_change(&mut self, next: TaskState) -> Result<(), TaskError> {
        if !self.state.can_become(next) {
            return Err(TaskError::IllegalTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    pub fn to_proc_state(&mut self) -> Result<(), TaskError> {
        self.state_change(TaskState::InProc)
    }

    pub fn to_prep_state(&mut self) -> Result<(), TaskError> {
        self.state_change(TaskState::Prepare)
    }

    /// A super task finishes only once every child has.
    pub fn to_fin_state(&mut self) -> Result<(), TaskError> {
        if let TaskKind::Super(sup) = &self.kind {
            if !sup.children.iter().all(|c| c.state == TaskState::Finished) {
                return Err(TaskError::ChildrenPending(self.id.clone()));
            }
        }
        self.state_change(TaskState::Finished)
    }

    /// A super task fails as soon as any child has.
    pub fn to_fail_state(&mut self) -> Result<(), TaskError> {
        if let TaskKind::Super(sup) = &self.kind {
            if !sup.children.iter().any(|c| c.state == TaskState::Failure) {
                return Err(TaskError::NoFailedChild(self.id.clone()));
            }
        }
        self.state_change(TaskState::Failure)
    }

    /// Fails the task and, for a super task, every child with it.
    pub fn force_fail(&mut self) {
        if let TaskKind::Super(sup) = &mut self.kind {
            for child in &mut sup.children {
                child.state = TaskState::Failure;
            }
        }
        self.state = TaskState::Failure;
        self.touch();
    }

    pub fn children(&self) -> &[Task] {
        match &self.kind {
            TaskKind::Super(sup) => &sup.children,
            _ => &[],
        }
    }

    pub fn child(&self, id: &str) -> Option<&Task> {
        self.children().iter().find(|child| child.id == id)
    }

    pub fn child_mut(&mut self, id: &str) -> Option<&mut Task> {
        match &mut self.kind {
            TaskKind::Super(sup) => sup.children.iter_mut().find(|child| child.id == id),
            _ => None,
        }
    }

    /// Turns a bound bare task into its concrete variant.
    ///
    /// Concrete tasks come back unchanged.
    pub fn transform(mut self) -> Result<Task, TaskError> {
        let command = match &mut self.kind {
            TaskKind::Bare(binding) => binding.take(),
            _ => return Ok(self),
        };
        let Some(command) = command else {
            return Err(TaskError::NotBound(self.id.clone()));
        };

        let vars = self.placeholders();
        self.extra
            .entry(DATETIME_KEY.to_string())
            .or_insert_with(|| vars.datetime.clone());

        self.kind = match command {
            JobCommand::Single(mut build) => {
                build.assign(&vars);
                TaskKind::Single(SingleTask {
                    build,
                    parent: None,
                    post_group: None,
                })
            }
            JobCommand::Set(set) => {
                set.validate()?;
                TaskKind::Super(SuperTask {
                    children: self.split(&set, &vars)?,
                })
            }
        };
        Ok(self)
    }

    fn placeholders(&self) -> Placeholders {
        let datetime = self
            .extra(DATETIME_KEY)
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().format("%Y%m%d%H%M%S").to_string());
        Placeholders {
            version: self.vsn.clone(),
            datetime,
        }
    }

    fn child_id(&self, name: &str) -> String {
        format!("{}__{}", self.id, name)
    }

    fn spawn_child(&self, id: String, kind: TaskKind) -> Result<Task, TaskError> {
        let mut child = Task::new(id, self.sn.clone(), self.vsn.clone())?;
        child.extra = self.extra.clone();
        child.kind = kind;
        Ok(child)
    }

    fn split(&self, set: &BuildSet, vars: &Placeholders) -> Result<Vec<Task>, TaskError> {
        let mut children = Vec::with_capacity(set.builds.len() + 1);
        let mut frags = Vec::new();

        for (bid, build) in &set.builds {
            let mut build = build.clone();
            build.assign(vars);

            let post_group = set.belong_to(bid).map(str::to_string);
            let child_id = self.child_id(bid);
            if post_group.is_none() {
                frags.push(child_id.clone());
            }

            children.push(self.spawn_child(
                child_id,
                TaskKind::Single(SingleTask {
                    build,
                    parent: Some(self.id.clone()),
                    post_group,
                }),
            )?);
        }

        let menus = set
            .posts
            .iter()
            .map(|(pid, post)| Menu {
                mid: pid.clone(),
                cmd: post.cmd.iter().map(|cmd| vars.apply(cmd)).collect(),
                output: vars.apply(&post.output),
                depends: post.group.iter().map(|bid| self.child_id(bid)).collect(),
            })
            .collect();

        let mut merge = set.merge.clone();
        merge.assign(vars);

        children.push(self.spawn_child(
            self.child_id("Post"),
            TaskKind::Post(PostTask {
                parent: self.id.clone(),
                merge,
                menus,
                frags,
            }),
        )?);

        Ok(children)
    }

    /// The letter a worker receives to run this task.
    pub fn to_letter(&self) -> Result<Letter, TaskError> {
        match &self.kind {
            TaskKind::Single(single) => {
                let mut letter = NewTask::new(self.id.clone(), self.sn.clone(), self.vsn.clone());
                if let Some(parent) = &single.parent {
                    letter.header.parent = parent.clone();
                    letter.header.need_post = "true".to_string();
                }
                letter.header.menu = single.post_group.clone().unwrap_or_default();
                letter.content.datetime = self.extra(DATETIME_KEY).unwrap_or_default().to_string();
                letter.content.extra = BuildOrder {
                    result_path: single.build.output.clone(),
                    cmds: single.build.cmd.clone(),
                };
                Ok(Letter::from(letter))
            }
            TaskKind::Post(post) => {
                let mut letter = PostLetter::default();
                letter.header.ident = self.id.clone();
                letter.header.version = post.parent.clone();
                letter.header.output = post.merge.output.clone();
                letter.content.cmds = post.merge.cmd.clone();
                letter.content.frags = post.frags.clone();
                letter.content.menus = post
                    .menus
                    .iter()
                    .map(|menu| {
                        let menu_letter = MenuLetter::new(
                            menu.mid.clone(),
                            post.parent.clone(),
                            menu.cmd.clone(),
                            menu.depends.clone(),
                            menu.output.clone(),
                        );
                        (menu.mid.clone(), menu_letter)
                    })
                    .collect();
                Ok(Letter::from(letter))
            }
            TaskKind::Bare(_) | TaskKind::Super(_) => {
                Err(TaskError::NotDispatchable(self.id.clone()))
            }
        }
    }
}
