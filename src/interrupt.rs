//! Interrupt fan-out: a driver registers one source per interface of a port
//! and walks the source's users whenever it has new data for them.
//!
//! A walk works on a snapshot of the user list. Users added or removed while
//! any walk is in progress are queued and applied when the last walk ends, so
//! callbacks may add or remove users (their own included) freely.

use crate::interface::InterfaceKind;
use crate::request::{HandleInner, RequestHandle};
use log::{debug, trace};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Called for each user of a walk with the handle that registered it and the
/// driver's payload.
pub type InterruptCallback = Arc<dyn Fn(&RequestHandle, &dyn Any) + Send + Sync>;

/// Identifies a user added with [`RequestHandle::add_interrupt_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterruptUserId(u64);

impl InterruptUserId {
    pub(crate) fn value(self) -> u64 {
        self.0
    }
}

/// One registered listener of an interrupt source.
#[derive(Clone)]
pub struct InterruptUser {
    id: u64,
    addr: i32,
    handle: Weak<HandleInner>,
    callback: InterruptCallback,
}

impl InterruptUser {
    pub fn id(&self) -> InterruptUserId {
        InterruptUserId(self.id)
    }

    /// Address the registering handle was bound to. Drivers use it to pick
    /// the users a reading belongs to.
    pub fn addr(&self) -> i32 {
        self.addr
    }

    /// Runs the user's callback. Returns false if its handle no longer exists.
    pub fn call(&self, payload: &dyn Any) -> bool {
        match self.handle.upgrade() {
            Some(inner) => {
                (self.callback)(&RequestHandle::from_inner(inner), payload);
                true
            }
            None => false,
        }
    }

    fn is_alive(&self) -> bool {
        self.handle.strong_count() > 0
    }
}

impl fmt::Debug for InterruptUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptUser")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

enum Change {
    Add(InterruptUser),
    Remove(u64),
}

#[derive(Default)]
struct SourceState {
    users: Vec<InterruptUser>,
    walkers: usize,
    deferred: Vec<Change>,
}

impl SourceState {
    fn apply(&mut self, change: Change) {
        match change {
            Change::Add(user) => self.users.push(user),
            Change::Remove(id) => self.users.retain(|u| u.id != id),
        }
    }
}

struct SourceShared {
    port: String,
    kind: InterfaceKind,
    state: Mutex<SourceState>,
    next_id: AtomicU64,
}

/// The user list of one interface of a port.
///
/// Created by [`PortRegistry::register_interrupt_source`](crate::PortRegistry::register_interrupt_source);
/// clients find it again with [`RequestHandle::interrupt_source`]. Cloning
/// yields another reference to the same list.
#[derive(Clone)]
pub struct InterruptSource {
    shared: Arc<SourceShared>,
}

impl fmt::Debug for InterruptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterruptSource({} {})", self.shared.port, self.shared.kind)
    }
}

impl InterruptSource {
    pub(crate) fn new(port: &str, kind: InterfaceKind) -> Self {
        Self {
            shared: Arc::new(SourceShared {
                port: port.to_string(),
                kind,
                state: Mutex::new(SourceState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.shared.port
    }

    pub fn kind(&self) -> &InterfaceKind {
        &self.shared.kind
    }

    /// Number of users on the list. Changes deferred by a running walk are
    /// not counted until it ends.
    pub fn user_count(&self) -> usize {
        self.shared.state.lock().users.len()
    }

    /// True while at least one walk is in progress.
    pub fn is_walking(&self) -> bool {
        self.shared.state.lock().walkers > 0
    }

    pub(crate) fn same_source(&self, other: &InterruptSource) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn insert(
        &self,
        addr: i32,
        handle: Weak<HandleInner>,
        callback: InterruptCallback,
    ) -> InterruptUserId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let user = InterruptUser {
            id,
            addr,
            handle,
            callback,
        };
        let mut state = self.shared.state.lock();
        if state.walkers > 0 {
            state.deferred.push(Change::Add(user));
            trace!("{}: interrupt user {} add deferred", self, id);
        } else {
            state.users.push(user);
        }
        InterruptUserId(id)
    }

    /// Removes user `id`, or queues its removal while a walk is running.
    /// False if the user is unknown or its removal is already queued.
    pub(crate) fn remove(&self, id: InterruptUserId) -> bool {
        let id = id.value();
        let mut state = self.shared.state.lock();
        if state.walkers == 0 {
            let before = state.users.len();
            state.users.retain(|u| u.id != id);
            return state.users.len() != before;
        }
        if let Some(pos) = state
            .deferred
            .iter()
            .position(|c| matches!(c, Change::Add(u) if u.id == id))
        {
            state.deferred.remove(pos);
            return true;
        }
        let listed = state.users.iter().any(|u| u.id == id);
        let pending = state
            .deferred
            .iter()
            .any(|c| matches!(c, Change::Remove(r) if *r == id));
        if !listed || pending {
            return false;
        }
        state.deferred.push(Change::Remove(id));
        trace!("{}: interrupt user {} removal deferred", self, id);
        true
    }

    /// Starts a walk over the current users.
    ///
    /// The walk ends when the returned value is dropped or
    /// [`end`](InterruptWalk::end)ed; queued list changes are applied then.
    pub fn interrupt_start(&self) -> InterruptWalk {
        let users = {
            let mut state = self.shared.state.lock();
            state.walkers += 1;
            state.users.clone()
        };
        trace!("{}: walk started over {} user(s)", self, users.len());
        InterruptWalk {
            source: self.clone(),
            users,
        }
    }

    fn end_walk(&self) {
        let mut state = self.shared.state.lock();
        state.walkers = state.walkers.saturating_sub(1);
        if state.walkers > 0 {
            return;
        }
        let deferred = std::mem::take(&mut state.deferred);
        let applied = deferred.len();
        for change in deferred {
            state.apply(change);
        }
        state.users.retain(InterruptUser::is_alive);
        if applied > 0 {
            debug!(
                "{}: applied {} deferred change(s), {} user(s) now",
                self,
                applied,
                state.users.len()
            );
        }
    }
}

impl fmt::Display for InterruptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.shared.port, self.shared.kind)
    }
}

/// An in-progress walk over an interrupt source.
pub struct InterruptWalk {
    source: InterruptSource,
    users: Vec<InterruptUser>,
}

impl InterruptWalk {
    /// Users as they were when the walk started.
    pub fn users(&self) -> &[InterruptUser] {
        &self.users
    }

    /// Calls every user with `payload`; returns how many were reached.
    pub fn notify(&self, payload: &dyn Any) -> usize {
        self.users.iter().filter(|u| u.call(payload)).count()
    }

    /// Calls the users registered for `addr`.
    pub fn notify_addr(&self, addr: i32, payload: &dyn Any) -> usize {
        self.users
            .iter()
            .filter(|u| u.addr == addr)
            .filter(|u| u.call(payload))
            .count()
    }

    pub fn end(self) {}
}

impl Drop for InterruptWalk {
    fn drop(&mut self) {
        self.source.end_walk();
    }
}
