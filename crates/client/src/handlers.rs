//! Caller-registered observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use notiflow_shared::{ConnectionError, Notification, UpdateKind};

pub type NotificationHandler = dyn Fn(&Notification) + Send + Sync;
pub type UpdateHandler = dyn Fn(&str, UpdateKind) + Send + Sync;
pub type StatusHandler = dyn Fn(bool) + Send + Sync;
pub type ErrorHandler = dyn Fn(&ConnectionError) + Send + Sync;

struct Slot<F: ?Sized> {
    entries: Mutex<Vec<(u64, Arc<F>)>>,
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> Slot<F> {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Arc<F>)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, id: u64, handler: Arc<F>) {
        self.lock().push((id, handler));
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Handlers are called outside the lock, so they may register or
    /// unsubscribe others.
    fn snapshot(&self) -> Vec<Arc<F>> {
        self.lock().iter().map(|(_, h)| h.clone()).collect()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Notification,
    Update,
    Status,
    Error,
}

#[derive(Default)]
pub(crate) struct Handlers {
    next_id: AtomicU64,
    notification: Slot<NotificationHandler>,
    update: Slot<UpdateHandler>,
    status: Slot<StatusHandler>,
    error: Slot<ErrorHandler>,
}

impl Handlers {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add_notification(self: &Arc<Self>, f: Arc<NotificationHandler>) -> Subscription {
        let id = self.next_id();
        self.notification.insert(id, f);
        Subscription::new(id, SlotKind::Notification, self)
    }

    pub(crate) fn add_update(self: &Arc<Self>, f: Arc<UpdateHandler>) -> Subscription {
        let id = self.next_id();
        self.update.insert(id, f);
        Subscription::new(id, SlotKind::Update, self)
    }

    pub(crate) fn add_status(self: &Arc<Self>, f: Arc<StatusHandler>) -> Subscription {
        let id = self.next_id();
        self.status.insert(id, f);
        Subscription::new(id, SlotKind::Status, self)
    }

    pub(crate) fn add_error(self: &Arc<Self>, f: Arc<ErrorHandler>) -> Subscription {
        let id = self.next_id();
        self.error.insert(id, f);
        Subscription::new(id, SlotKind::Error, self)
    }

    fn remove(&self, slot: SlotKind, id: u64) -> bool {
        match slot {
            SlotKind::Notification => self.notification.remove(id),
            SlotKind::Update => self.update.remove(id),
            SlotKind::Status => self.status.remove(id),
            SlotKind::Error => self.error.remove(id),
        }
    }

    pub(crate) fn notification(&self, notification: &Notification) {
        for handler in self.notification.snapshot() {
            handler(notification);
        }
    }

    pub(crate) fn update(&self, id: &str, kind: UpdateKind) {
        for handler in self.update.snapshot() {
            handler(id, kind);
        }
    }

    pub(crate) fn status(&self, connected: bool) {
        for handler in self.status.snapshot() {
            handler(connected);
        }
    }

    pub(crate) fn error(&self, error: &ConnectionError) {
        for handler in self.error.snapshot() {
            handler(error);
        }
    }

    pub(crate) fn clear(&self) {
        self.notification.clear();
        self.update.clear();
        self.status.clear();
        self.error.clear();
    }
}

/// Registration handle returned by the `set_*_handler` methods.
///
/// Dropping it keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    slot: SlotKind,
    handlers: Weak<Handlers>,
}

impl Subscription {
    fn new(id: u64, slot: SlotKind, handlers: &Arc<Handlers>) -> Self {
        Self {
            id,
            slot,
            handlers: Arc::downgrade(handlers),
        }
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        self.handlers
            .upgrade()
            .is_some_and(|handlers| handlers.remove(self.slot, self.id))
    }
}
