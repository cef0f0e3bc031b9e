use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::agent::Agent;
use crate::message::{CHANNEL_CALL_FAULT, Message, REQUEST_TIMEOUT_FAULT};

/// Callback a transport completes for one invoked message.
///
/// `result` carries the server's reply, which may itself be an error message.
/// `status` reports that the call failed below the protocol (I/O, closed
/// connection).
pub trait ResponseHandler: Send + Sync {
    fn result(&self, response: Message);
    fn status(&self, fault: Message);

    /// Whether the call is already answered, so later replies are ignored
    /// and the transport may forget the handler.
    fn settled(&self) -> bool {
        false
    }
}

/// Receiver of a correlated response, handed the original request alongside.
pub trait ResponseTarget: Send + Sync {
    fn on_result(&self, response: Message, request: Message);
    fn on_status(&self, fault: Message, request: Message);
}

/// Correlates one outbound message with its eventual response and enforces
/// the optional request timeout. The target sees at most one callback.
pub struct MessageResponder {
    request: Message,
    target: Arc<dyn ResponseTarget>,
    state: Mutex<ResponderState>,
}

#[derive(Default)]
struct ResponderState {
    handled: bool,
    timed_out: bool,
    timer: Option<JoinHandle<()>>,
}

impl MessageResponder {
    pub fn new(request: Message, target: Arc<dyn ResponseTarget>) -> Arc<Self> {
        Arc::new(Self {
            request,
            target,
            state: Mutex::new(ResponderState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, ResponderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn timed_out(&self) -> bool {
        self.state().timed_out
    }

    pub fn start_request_timeout(self: &Arc<Self>, timeout: Duration) {
        let responder = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            responder.request_timed_out();
        });
        let mut state = self.state();
        if state.handled {
            handle.abort();
        } else if let Some(previous) = state.timer.replace(handle) {
            previous.abort();
        }
    }

    fn request_timed_out(&self) {
        {
            let mut state = self.state();
            if state.handled {
                return;
            }
            state.handled = true;
            state.timed_out = true;
            state.timer = None;
        }
        debug!(message_id = %self.request.message_id(), "request timed out");
        let fault = Message::error_for(
            &self.request,
            REQUEST_TIMEOUT_FAULT,
            "Request timed out",
            "The request timeout for the sent message was reached without receiving a response from the server.",
        );
        self.target.on_status(fault, self.request.clone());
    }

    /// Marks the responder handled; false when a response or the timeout
    /// already got there first.
    fn claim(&self) -> bool {
        let mut state = self.state();
        if state.handled {
            if state.timed_out {
                debug!(message_id = %self.request.message_id(), "late response ignored");
            }
            return false;
        }
        state.handled = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        true
    }
}

impl ResponseHandler for MessageResponder {
    fn result(&self, response: Message) {
        if self.claim() {
            self.target.on_result(response, self.request.clone());
        }
    }

    fn status(&self, fault: Message) {
        if self.claim() {
            self.target.on_status(fault, self.request.clone());
        }
    }

    fn settled(&self) -> bool {
        self.state().handled
    }
}

/// Routes responses to an agent's acknowledge or fault handler.
pub struct AgentTarget {
    agent: Weak<dyn Agent>,
}

impl AgentTarget {
    pub fn new(agent: Weak<dyn Agent>) -> Arc<Self> {
        Arc::new(Self { agent })
    }
}

impl ResponseTarget for AgentTarget {
    fn on_result(&self, response: Message, request: Message) {
        let Some(agent) = self.agent.upgrade() else {
            return;
        };
        if response.is_error() {
            agent.fault(response, request);
        } else {
            agent.acknowledge(response, request);
        }
    }

    fn on_status(&self, fault: Message, request: Message) {
        let Some(agent) = self.agent.upgrade() else {
            return;
        };
        agent.fault(status_fault(fault, &request), request);
    }
}

/// Normalises a transport status into an error message correlated to
/// `request`.
pub(crate) fn status_fault(fault: Message, request: &Message) -> Message {
    let mut fault = if fault.is_error() {
        fault
    } else {
        let detail = fault.body.as_str().unwrap_or_default().to_string();
        Message::error(CHANNEL_CALL_FAULT, "Channel call failed", detail)
    };
    if fault.correlation_id.is_none() {
        fault.correlation_id = Some(request.message_id().to_string());
    }
    fault
}
