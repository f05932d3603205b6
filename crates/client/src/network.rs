//! Process-wide connectivity signal.
//!
//! The manager subscribes exactly once when it is built and releases the
//! subscription exactly once when it is destroyed.

use std::sync::{Arc, Mutex, MutexGuard};

/// Connectivity and lifecycle events from the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Connectivity restored.
    Online,
    /// Connectivity lost; connections close without reconnecting.
    Offline,
    /// The process is about to go away; tear down immediately.
    PageHide,
}

pub type NetworkListener = Arc<dyn Fn(NetworkEvent) + Send + Sync>;

pub trait NetworkSignal: Send + Sync {
    fn subscribe(&self, listener: NetworkListener) -> NetworkSubscription;
}

/// Handle returned by [`NetworkSignal::subscribe`].
///
/// The release callback runs once, on [`NetworkSubscription::unsubscribe`]
/// or on drop, whichever comes first.
pub struct NetworkSubscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl NetworkSubscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for NetworkSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for NetworkSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSubscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Default)]
struct MonitorInner {
    next_id: u64,
    online: bool,
    listeners: Vec<(u64, NetworkListener)>,
}

/// In-process [`NetworkSignal`] driven by explicit calls.
///
/// The binary forwards Ctrl-C to [`NetworkMonitor::page_hide`]; tests use
/// it to simulate connectivity changes.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Mutex<MonitorInner>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MonitorInner {
                online: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Report connectivity restored. Repeated calls while online are ignored.
    pub fn set_online(&self) {
        if self.transition(true) {
            self.notify(NetworkEvent::Online);
        }
    }

    /// Report connectivity lost. Repeated calls while offline are ignored.
    pub fn set_offline(&self) {
        if self.transition(false) {
            self.notify(NetworkEvent::Offline);
        }
    }

    pub fn page_hide(&self) {
        self.notify(NetworkEvent::PageHide);
    }

    fn transition(&self, online: bool) -> bool {
        let mut inner = self.lock();
        let changed = inner.online != online;
        inner.online = online;
        changed
    }

    fn notify(&self, event: NetworkEvent) {
        // Listeners run outside the lock so they may unsubscribe.
        let listeners: Vec<NetworkListener> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        crate::log_debug!("network event {:?} -> {} listener(s)", event, listeners.len());
        for listener in listeners {
            listener(event);
        }
    }
}

impl NetworkSignal for NetworkMonitor {
    fn subscribe(&self, listener: NetworkListener) -> NetworkSubscription {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, listener));
            id
        };

        let inner = Arc::downgrade(&self.inner);
        NetworkSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
                state.listeners.retain(|(existing, _)| *existing != id);
            }
        })
    }
}
