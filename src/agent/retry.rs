use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Delay of the first attempt after the timer starts.
const FIRST_ATTEMPT_DELAY: Duration = Duration::from_millis(1);

/// How often and how many times a retry timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of attempts; -1 is unbounded and 0 disables the timer.
    pub attempts: i32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: i32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    pub fn enabled(&self) -> bool {
        self.attempts != 0 && !self.interval.is_zero()
    }

    fn exceeded(&self, attempt: u32) -> bool {
        self.attempts >= 0 && i64::from(attempt) > i64::from(self.attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Idle,
    Armed,
    Firing,
}

/// What a timer tick asks the owner to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Try again; the first attempt is 1.
    Attempt(u32),
    /// The budget is spent; the timer has stopped.
    Exhausted,
}

/// Cancellable retry loop.
///
/// Every start and stop bumps a token. A tick that wakes up under a stale
/// token does nothing, so stopping is idempotent and never races a tick that
/// is already due.
#[derive(Debug, Default)]
pub struct RetryTimer {
    state: Arc<Mutex<RetryState>>,
}

#[derive(Debug)]
struct RetryState {
    phase: RetryPhase,
    token: u64,
    attempt: u32,
    handle: Option<JoinHandle<()>>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            phase: RetryPhase::Idle,
            token: 0,
            attempt: 0,
            handle: None,
        }
    }
}

fn lock(state: &Mutex<RetryState>) -> MutexGuard<'_, RetryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RetryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RetryPhase {
        lock(&self.state).phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() != RetryPhase::Idle
    }

    /// Attempts fired since the last start.
    pub fn attempts(&self) -> u32 {
        lock(&self.state).attempt
    }

    /// Starts the loop. Returns false when it is already running or the
    /// policy disables retries.
    pub fn start<F>(&self, policy: RetryPolicy, on_tick: F) -> bool
    where
        F: Fn(Tick) + Send + Sync + 'static,
    {
        let mut state = lock(&self.state);
        if state.phase != RetryPhase::Idle || !policy.enabled() {
            return false;
        }
        state.token += 1;
        state.attempt = 0;
        state.phase = RetryPhase::Armed;
        let token = state.token;
        let shared = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let mut delay = FIRST_ATTEMPT_DELAY;
            loop {
                tokio::time::sleep(delay).await;
                delay = policy.interval;
                let tick = {
                    let mut state = lock(&shared);
                    if state.token != token {
                        return;
                    }
                    state.attempt += 1;
                    if policy.exceeded(state.attempt) {
                        state.phase = RetryPhase::Idle;
                        state.token += 1;
                        state.handle = None;
                        Tick::Exhausted
                    } else {
                        state.phase = RetryPhase::Firing;
                        Tick::Attempt(state.attempt)
                    }
                };
                on_tick(tick);
                if tick == Tick::Exhausted {
                    return;
                }
                let mut state = lock(&shared);
                if state.token != token {
                    return;
                }
                state.phase = RetryPhase::Armed;
            }
        });
        state.handle = Some(handle);
        true
    }

    pub fn stop(&self) {
        let mut state = lock(&self.state);
        state.token += 1;
        state.phase = RetryPhase::Idle;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }
}
