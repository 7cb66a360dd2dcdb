//! Listener-side bookkeeping that pairs arriving artifacts with merge orders.

use kiln_protocol::PostLetter;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// How long an artifact that fits no registered post is kept around.
pub const UNPAIRED_RETENTION: Duration = Duration::from_secs(5);

/// One artifact received from a builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stuff {
    /// Super task id the artifact was built for.
    pub version: String,
    pub menu: String,
    /// Child task id that produced it.
    pub name: String,
    /// File name it was stored under; the storage box is `name`.
    pub file: String,
    pub arrived: Instant,
}

impl Stuff {
    pub fn new(
        version: impl Into<String>,
        menu: impl Into<String>,
        name: impl Into<String>,
        file: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            menu: menu.into(),
            name: name.into(),
            file: file.into(),
            arrived: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuOrder {
    pub mid: String,
    pub version: String,
    pub cmds: Vec<String>,
    pub output: String,
    depends: BTreeSet<String>,
    stuffs: BTreeMap<String, Stuff>,
}

impl MenuOrder {
    /// Takes `stuff` if it is one of our missing dependencies of the same version.
    fn pair(&mut self, stuff: &Stuff) -> bool {
        if stuff.version != self.version
            || !self.depends.contains(&stuff.name)
            || self.stuffs.contains_key(&stuff.name)
        {
            return false;
        }
        self.stuffs.insert(stuff.name.clone(), stuff.clone());
        true
    }

    pub fn is_satisfied(&self) -> bool {
        self.depends.len() == self.stuffs.len()
    }
}

/// A merge order from the master together with whatever has arrived for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostOrder {
    pub ident: String,
    pub version: String,
    pub output: String,
    pub cmds: Vec<String>,
    pub menus: BTreeMap<String, MenuOrder>,
    frags: BTreeSet<String>,
    arrived: BTreeMap<String, Stuff>,
}

impl From<PostLetter> for PostOrder {
    fn from(letter: PostLetter) -> Self {
        let menus = letter
            .content
            .menus
            .into_iter()
            .map(|(mid, menu)| {
                let order = MenuOrder {
                    mid: mid.clone(),
                    version: menu.header.version,
                    cmds: menu.content.cmds,
                    output: menu.content.output,
                    depends: menu.content.depends.into_iter().collect(),
                    stuffs: BTreeMap::new(),
                };
                (mid, order)
            })
            .collect();
        Self {
            ident: letter.header.ident,
            version: letter.header.version,
            output: letter.header.output,
            cmds: letter.content.cmds,
            menus,
            frags: letter.content.frags.into_iter().collect(),
            arrived: BTreeMap::new(),
        }
    }
}

impl PostOrder {
    /// Direct fragments first, then menu dependencies.
    pub fn pair(&mut self, stuff: &Stuff) -> bool {
        if stuff.version != self.version {
            return false;
        }
        if self.frags.contains(&stuff.name) {
            if self.arrived.contains_key(&stuff.name) {
                return false;
            }
            self.arrived.insert(stuff.name.clone(), stuff.clone());
            return true;
        }
        self.menus.values_mut().any(|menu| menu.pair(stuff))
    }

    pub fn is_satisfied(&self) -> bool {
        self.frags.len() == self.arrived.len() && self.menus.values().all(MenuOrder::is_satisfied)
    }

    /// Every artifact the merge needs, fragments and menu inputs alike.
    pub fn stuffs(&self) -> impl Iterator<Item = &Stuff> {
        self.arrived
            .values()
            .chain(self.menus.values().flat_map(|menu| menu.stuffs.values()))
    }
}

#[derive(Debug, Default)]
pub struct PostBoard {
    posts: Vec<PostOrder>,
    unpaired: Vec<Stuff>,
    handed_out: BTreeSet<String>,
}

impl PostBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an order and retries recent unpaired stuff against it.
    pub fn add_post(&mut self, order: PostOrder) -> Vec<PostOrder> {
        let known = self.posts.iter().any(|post| post.ident == order.ident);
        if known || self.handed_out.contains(&order.ident) {
            return Vec::new();
        }
        self.posts.push(order);

        let now = Instant::now();
        let waiting = std::mem::take(&mut self.unpaired);
        for stuff in waiting {
            if now.duration_since(stuff.arrived) > UNPAIRED_RETENTION {
                continue;
            }
            if !self.place(&stuff) {
                self.unpaired.push(stuff);
            }
        }
        self.take_satisfied()
    }

    pub fn add_stuff(&mut self, stuff: Stuff) -> Vec<PostOrder> {
        if !self.place(&stuff) {
            self.unpaired.push(stuff);
            return Vec::new();
        }
        self.take_satisfied()
    }

    fn place(&mut self, stuff: &Stuff) -> bool {
        self.posts.iter_mut().any(|post| post.pair(stuff))
    }

    fn take_satisfied(&mut self) -> Vec<PostOrder> {
        let (ready, pending): (Vec<PostOrder>, Vec<PostOrder>) =
            std::mem::take(&mut self.posts)
                .into_iter()
                .partition(PostOrder::is_satisfied);
        self.posts = pending;
        for post in &ready {
            self.handed_out.insert(post.ident.clone());
        }
        ready
    }

    /// Drops unpaired stuff older than the retention window.
    pub fn expire(&mut self, now: Instant) -> Vec<Stuff> {
        let (stale, fresh): (Vec<Stuff>, Vec<Stuff>) = std::mem::take(&mut self.unpaired)
            .into_iter()
            .partition(|stuff| now.duration_since(stuff.arrived) > UNPAIRED_RETENTION);
        self.unpaired = fresh;
        stale
    }

    /// Forgets an order, for instance when its super task was cancelled.
    pub fn cancel(&mut self, ident: &str) -> bool {
        let before = self.posts.len();
        self.posts.retain(|post| post.ident != ident);
        before != self.posts.len()
    }

    pub fn pending(&self) -> usize {
        self.posts.len()
    }

    pub fn unpaired(&self) -> usize {
        self.unpaired.len()
    }
}
