use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use super::Channel;

/// Outcome of asking to start a channel's connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPermit {
    /// The client identity is known; connect freely.
    Proceed,
    /// No identity yet and nobody else is fetching one: this channel connects
    /// first and must call [`ClientIdentity::release`] when done.
    Owner,
    /// Another channel is fetching the identity; this one is resumed later.
    Deferred,
}

/// Process-wide client identity handed out by the server, plus the start-up
/// barrier that lets only one channel connect while it is unknown.
#[derive(Debug, Default)]
pub struct ClientIdentity {
    state: Mutex<IdentityState>,
}

#[derive(Debug, Default)]
struct IdentityState {
    id: Option<String>,
    guard_held: bool,
    waiting: Vec<Weak<Channel>>,
}

impl ClientIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Option<String> {
        self.state().id.clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        let id = id.into();
        let mut state = self.state();
        if state.id.as_deref() != Some(id.as_str()) {
            debug!(client_id = %id, "client identity assigned");
            state.id = Some(id);
        }
    }

    pub fn acquire(&self, channel: &Arc<Channel>) -> ConnectPermit {
        let mut state = self.state();
        if state.id.is_some() {
            ConnectPermit::Proceed
        } else if !state.guard_held {
            state.guard_held = true;
            ConnectPermit::Owner
        } else {
            state.waiting.push(Arc::downgrade(channel));
            ConnectPermit::Deferred
        }
    }

    /// Lowers the barrier and resumes every deferred channel.
    pub fn release(&self) {
        let waiting = {
            let mut state = self.state();
            state.guard_held = false;
            std::mem::take(&mut state.waiting)
        };
        for channel in waiting.iter().filter_map(Weak::upgrade) {
            channel.resume_connect();
        }
    }

    pub fn is_guarded(&self) -> bool {
        self.state().guard_held
    }
}
