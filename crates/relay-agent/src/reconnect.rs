//! Reconnection state machine with jittered exponential backoff
//!
//! [`transition`] is pure: it maps a state and an event to the next state
//! plus the effects the runner has to carry out. Randomness only enters
//! through the jitter function held by [`Backoff`], so tests can pin it.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not running, or given up for good
    Disconnected,
    Connecting { attempt: u32 },
    Registered { resumed: bool },
    /// Lost the relay (or failed to reach it) and waiting to retry
    Reconnecting { attempt: u32 },
    /// Shut down on request
    Stopped,
}

impl ConnectionState {
    pub fn is_registered(&self) -> bool {
        matches!(self, ConnectionState::Registered { .. })
    }

    /// No further transitions will happen
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Stopped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    Connected { resumed: bool },
    /// A connect or registration attempt failed. Fatal failures cannot be
    /// fixed by retrying with the same credentials.
    AttemptFailed { fatal: bool },
    ConnectionLost,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Connect,
    Wait(Duration),
    ResetBackoff,
    ReportReconnecting,
    Stop,
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Relay refused the backend: {0}")]
    Refused(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    GaveUp { attempts: u32, last_error: String },
}

type Jitter = Box<dyn FnMut(Duration) -> Duration + Send>;

/// Uniform in `[d/2, d]`
fn random_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    rand::thread_rng().gen_range(delay / 2..=delay)
}

/// Exponential backoff: 1s, 2s, 4s, ... capped, each delay jittered
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    max_attempts: Option<u32>,
    current: Duration,
    attempt: u32,
    jitter: Jitter,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("current", &self.current)
            .field("attempt", &self.attempt)
            .field("max", &self.max)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Backoff {
    pub const INITIAL: Duration = Duration::from_secs(1);

    pub fn new(max: Duration, max_attempts: Option<u32>) -> Self {
        Self::with_initial(Self::INITIAL, max, max_attempts)
    }

    pub fn with_initial(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2,
            max_attempts,
            current: initial,
            attempt: 0,
            jitter: Box::new(random_jitter),
        }
    }

    /// Replace the jitter source
    pub fn with_jitter(mut self, jitter: impl FnMut(Duration) -> Duration + Send + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
        {
            return None;
        }
        self.attempt += 1;

        let base = self.current;
        self.current = (base * self.multiplier).min(self.max);
        let delay = (self.jitter)(base);
        debug!(attempt = self.attempt, ?base, ?delay, "Next reconnect delay");
        Some(delay)
    }

    /// Un-jittered delay the next retry will be based on
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Count the first, undelayed attempt of a series against the limit
    pub fn first_attempt(&mut self) {
        self.attempt = 1;
    }

    /// Attempts counted since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }
}

/// Next state and the effects to run, in order
pub fn transition(
    state: &ConnectionState,
    event: Event,
    backoff: &mut Backoff,
) -> (ConnectionState, Vec<Effect>) {
    use ConnectionState::*;

    match (state, event) {
        (Stopped, _) => (Stopped, Vec::new()),
        (_, Event::Shutdown) => (Stopped, vec![Effect::Stop]),

        (Disconnected, Event::Start) => {
            backoff.first_attempt();
            (Connecting { attempt: 1 }, vec![Effect::Connect])
        }

        (Connecting { .. } | Reconnecting { .. }, Event::Connected { resumed }) => {
            (Registered { resumed }, vec![Effect::ResetBackoff])
        }

        (Connecting { .. } | Reconnecting { .. } | Registered { .. }, Event::AttemptFailed { fatal: true }) => {
            (Disconnected, vec![Effect::Stop])
        }

        (Connecting { .. } | Reconnecting { .. }, Event::AttemptFailed { fatal: false })
        | (Registered { .. }, Event::ConnectionLost) => match backoff.next_delay() {
            Some(delay) => (
                Reconnecting {
                    attempt: backoff.attempt(),
                },
                vec![Effect::ReportReconnecting, Effect::Wait(delay), Effect::Connect],
            ),
            None => (Disconnected, vec![Effect::Stop]),
        },

        (state, _) => (state.clone(), Vec::new()),
    }
}
