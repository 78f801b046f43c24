//! Circuit breaker state machine internals
//!
//! The machine lives behind one `RwLock<StateInner>`; every variant owns
//! the data only it needs, and transitions replace the whole value, so a
//! fresh state never inherits buffered outcomes (a new epoch starts with a
//! new window). An epoch counter lets decorated calls that acquired in an
//! earlier state drop their outcome instead of polluting the new window,
//! and lets the open-state timer detect that its epoch already ended.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::core::clock::Clock;
use crate::core::error::{ResilienceError, ResilienceResult};
use crate::core::event::EventPublisher;
use crate::metrics::{Outcome, Snapshot, ThresholdCheck, Window, WindowSettings};

use super::config::{CircuitBreakerConfig, SlidingWindowType};
use super::event::{CircuitBreakerEvent, CircuitBreakerEventKind};

/// The observable state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Calls pass and outcomes are recorded
    Closed,
    /// Calls are refused until the open wait elapses
    Open,
    /// A bounded number of trial calls probe for recovery
    HalfOpen,
    /// Calls pass; nothing is recorded or gated
    Disabled,
    /// Calls are refused until an administrative transition
    ForcedOpen,
    /// Calls pass and outcomes are recorded, but nothing is gated
    MetricsOnly,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
            Self::Disabled => write!(f, "disabled"),
            Self::ForcedOpen => write!(f, "forced-open"),
            Self::MetricsOnly => write!(f, "metrics-only"),
        }
    }
}

enum StateInner {
    Closed {
        window: Window,
    },
    Open {
        since: Instant,
        window: Window,
        not_permitted: AtomicU64,
    },
    HalfOpen {
        window: Window,
        trial_permits: AtomicI64,
        not_permitted: AtomicU64,
    },
    Disabled,
    ForcedOpen {
        not_permitted: AtomicU64,
    },
    MetricsOnly {
        window: Window,
    },
}

impl StateInner {
    fn tag(&self) -> State {
        match self {
            Self::Closed { .. } => State::Closed,
            Self::Open { .. } => State::Open,
            Self::HalfOpen { .. } => State::HalfOpen,
            Self::Disabled => State::Disabled,
            Self::ForcedOpen { .. } => State::ForcedOpen,
            Self::MetricsOnly { .. } => State::MetricsOnly,
        }
    }
}

/// Point-in-time metrics of one breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// State the metrics were taken in
    pub state: State,
    /// Aggregated outcomes of the current state's window
    pub calls: Snapshot,
    /// Calls refused since this state was entered
    pub number_of_not_permitted_calls: u64,
}

/// Follow-up work decided while holding the state lock, executed after it
/// is released (subscribers may call back into the breaker).
enum PostRecord {
    None,
    Transition {
        to: State,
        expected: (State, u64),
        snapshot: Snapshot,
    },
    RatesOnly {
        snapshot: Snapshot,
    },
}

pub(super) struct StateMachine {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<StateInner>,
    /// Bumped on every transition, only while holding the write lock.
    epoch: AtomicU64,
    publisher: EventPublisher<CircuitBreakerEvent>,
    weak_self: Weak<StateMachine>,
}

impl StateMachine {
    pub(super) fn new(
        name: String,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| {
            let closed = StateInner::Closed {
                window: main_window(&config, &clock),
            };
            Self {
                name,
                config,
                clock,
                state: RwLock::new(closed),
                epoch: AtomicU64::new(0),
                publisher: EventPublisher::new(),
                weak_self: weak_self.clone(),
            }
        })
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub(super) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(super) fn publisher(&self) -> &EventPublisher<CircuitBreakerEvent> {
        &self.publisher
    }

    pub(super) fn state(&self) -> State {
        self.state.read().tag()
    }

    pub(super) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn publish(&self, kind: CircuitBreakerEventKind) {
        if self.publisher.has_subscribers() {
            self.publisher
                .publish(&CircuitBreakerEvent::now(&self.name, kind));
        }
    }

    /// Non-blocking permission check. Returns the epoch the permission was
    /// granted in, or `None` with the not-permitted counter bumped.
    pub(super) fn try_acquire_permission(&self) -> Option<u64> {
        enum Decision {
            Granted(u64),
            Denied,
            OpenWaitElapsed(u64),
        }

        loop {
            let decision = {
                let guard = self.state.read();
                let epoch = self.epoch.load(Ordering::Acquire);
                match &*guard {
                    StateInner::Closed { .. }
                    | StateInner::Disabled
                    | StateInner::MetricsOnly { .. } => Decision::Granted(epoch),
                    StateInner::HalfOpen {
                        trial_permits,
                        not_permitted,
                        ..
                    } => {
                        let granted = trial_permits
                            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |permits| {
                                (permits > 0).then_some(permits - 1)
                            })
                            .is_ok();
                        if granted {
                            Decision::Granted(epoch)
                        } else {
                            not_permitted.fetch_add(1, Ordering::Relaxed);
                            Decision::Denied
                        }
                    }
                    StateInner::ForcedOpen { not_permitted } => {
                        not_permitted.fetch_add(1, Ordering::Relaxed);
                        Decision::Denied
                    }
                    StateInner::Open {
                        since,
                        not_permitted,
                        ..
                    } => {
                        let elapsed = self.clock.now().duration_since(*since);
                        if elapsed < self.config.wait_duration_in_open_state {
                            not_permitted.fetch_add(1, Ordering::Relaxed);
                            Decision::Denied
                        } else {
                            Decision::OpenWaitElapsed(epoch)
                        }
                    }
                }
            };
            match decision {
                Decision::Granted(epoch) => return Some(epoch),
                Decision::Denied => {
                    debug!(name = %self.name, state = %self.state(), "call not permitted");
                    self.publish(CircuitBreakerEventKind::CallNotPermitted);
                    return None;
                }
                // The open wait elapsed: move to half-open, then compete
                // for a trial permit like everyone else.
                Decision::OpenWaitElapsed(epoch) => {
                    let _ = self.transition(State::HalfOpen, Some((State::Open, epoch)));
                }
            }
        }
    }

    /// Return an unconsumed trial permit (ignored-error path).
    pub(super) fn release_permission(&self) {
        let guard = self.state.read();
        if let StateInner::HalfOpen { trial_permits, .. } = &*guard {
            trial_permits.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Record one outcome observed under `permission_epoch`. Outcomes from
    /// an ended epoch are dropped rather than fed to a newer window.
    pub(super) fn record(&self, duration: Duration, outcome: Outcome, permission_epoch: u64) {
        let post = {
            let guard = self.state.read();
            if self.epoch.load(Ordering::Acquire) != permission_epoch {
                return;
            }
            match &*guard {
                StateInner::Closed { window } => match window.record(duration, outcome) {
                    ThresholdCheck::AboveThresholds => PostRecord::Transition {
                        to: State::Open,
                        expected: (State::Closed, permission_epoch),
                        snapshot: window.snapshot(),
                    },
                    _ => PostRecord::None,
                },
                StateInner::HalfOpen { window, .. } => match window.record(duration, outcome) {
                    ThresholdCheck::AboveThresholds => PostRecord::Transition {
                        to: State::Open,
                        expected: (State::HalfOpen, permission_epoch),
                        snapshot: window.snapshot(),
                    },
                    ThresholdCheck::BelowThresholds => PostRecord::Transition {
                        to: State::Closed,
                        expected: (State::HalfOpen, permission_epoch),
                        snapshot: window.snapshot(),
                    },
                    ThresholdCheck::BelowMinimumCalls => PostRecord::None,
                },
                StateInner::MetricsOnly { window } => match window.record(duration, outcome) {
                    ThresholdCheck::AboveThresholds => PostRecord::RatesOnly {
                        snapshot: window.snapshot(),
                    },
                    _ => PostRecord::None,
                },
                // Stragglers from calls admitted before the breaker opened
                // land in the open state's own buffer; they gate nothing.
                StateInner::Open { window, .. } => {
                    window.record(duration, outcome);
                    PostRecord::None
                }
                StateInner::Disabled | StateInner::ForcedOpen { .. } => PostRecord::None,
            }
        };

        match post {
            PostRecord::None => {}
            PostRecord::RatesOnly { snapshot } => self.publish_rate_crossings(&snapshot),
            PostRecord::Transition {
                to,
                expected,
                snapshot,
            } => {
                if to == State::Open {
                    self.publish_rate_crossings(&snapshot);
                }
                let _ = self.transition(to, Some(expected));
            }
        }
    }

    fn publish_rate_crossings(&self, snapshot: &Snapshot) {
        if snapshot.failure_rate >= self.config.failure_rate_threshold {
            self.publish(CircuitBreakerEventKind::FailureRateExceeded {
                failure_rate: snapshot.failure_rate,
            });
        }
        if snapshot.slow_call_rate >= self.config.slow_call_rate_threshold {
            self.publish(CircuitBreakerEventKind::SlowCallRateExceeded {
                slow_call_rate: snapshot.slow_call_rate,
            });
        }
    }

    /// Move to `to`. Internal transitions pass the `(state, epoch)` they
    /// decided in and silently stand down if they lost the race;
    /// administrative transitions (`expected == None`) fail on forbidden
    /// moves instead.
    pub(super) fn transition(
        &self,
        to: State,
        expected: Option<(State, u64)>,
    ) -> ResilienceResult<()> {
        let from = {
            let mut guard = self.state.write();
            let from = guard.tag();
            if let Some((expected_state, expected_epoch)) = expected {
                if from != expected_state || self.epoch.load(Ordering::Acquire) != expected_epoch {
                    return Ok(());
                }
            } else if from == to || (from == State::Closed && to == State::HalfOpen) {
                return Err(ResilienceError::IllegalStateTransition {
                    name: self.name.clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            let previous = std::mem::replace(&mut *guard, StateInner::Disabled);
            *guard = self.next_state(to, previous);
            self.epoch.fetch_add(1, Ordering::AcqRel);
            from
        };

        info!(name = %self.name, %from, %to, "circuit breaker state transition");
        self.publish(CircuitBreakerEventKind::StateTransition { from, to });
        if to == State::Open && self.config.automatic_transition_from_open_to_half_open {
            self.schedule_half_open_transition();
        }
        Ok(())
    }

    /// Clear metrics and return to closed, from any state.
    pub(super) fn reset(&self) {
        let from = {
            let mut guard = self.state.write();
            let from = guard.tag();
            *guard = StateInner::Closed {
                window: main_window(&self.config, &self.clock),
            };
            self.epoch.fetch_add(1, Ordering::AcqRel);
            from
        };
        info!(name = %self.name, %from, "circuit breaker reset");
        self.publish(CircuitBreakerEventKind::Reset);
    }

    pub(super) fn metrics(&self) -> CircuitBreakerMetrics {
        let guard = self.state.read();
        let (calls, not_permitted) = match &*guard {
            StateInner::Closed { window } | StateInner::MetricsOnly { window } => {
                (window.snapshot(), 0)
            }
            StateInner::Open {
                window,
                not_permitted,
                ..
            } => (window.snapshot(), not_permitted.load(Ordering::Relaxed)),
            StateInner::HalfOpen {
                window,
                not_permitted,
                ..
            } => (window.snapshot(), not_permitted.load(Ordering::Relaxed)),
            StateInner::Disabled => (Snapshot::empty(), 0),
            StateInner::ForcedOpen { not_permitted } => {
                (Snapshot::empty(), not_permitted.load(Ordering::Relaxed))
            }
        };
        CircuitBreakerMetrics {
            state: guard.tag(),
            calls,
            number_of_not_permitted_calls: not_permitted,
        }
    }

    /// Build the incoming state. Closed and HalfOpen start with fresh
    /// windows (a probe set or a clean slate decides the next move); Open
    /// inherits the window that tripped it, so its metrics keep showing
    /// the rates that opened the breaker.
    fn next_state(&self, state: State, previous: StateInner) -> StateInner {
        match state {
            State::Closed => StateInner::Closed {
                window: main_window(&self.config, &self.clock),
            },
            State::Open => {
                let window = match previous {
                    StateInner::Closed { window }
                    | StateInner::Open { window, .. }
                    | StateInner::HalfOpen { window, .. }
                    | StateInner::MetricsOnly { window } => window,
                    StateInner::Disabled | StateInner::ForcedOpen { .. } => {
                        main_window(&self.config, &self.clock)
                    }
                };
                StateInner::Open {
                    since: self.clock.now(),
                    window,
                    not_permitted: AtomicU64::new(0),
                }
            }
            State::HalfOpen => StateInner::HalfOpen {
                window: half_open_window(&self.config, &self.clock),
                trial_permits: AtomicI64::new(i64::from(
                    self.config.permitted_number_of_calls_in_half_open_state,
                )),
                not_permitted: AtomicU64::new(0),
            },
            State::Disabled => StateInner::Disabled,
            State::ForcedOpen => StateInner::ForcedOpen {
                not_permitted: AtomicU64::new(0),
            },
            State::MetricsOnly => StateInner::MetricsOnly {
                window: main_window(&self.config, &self.clock),
            },
        }
    }

    /// Timer half of `automatic_transition_from_open_to_half_open`. Holds
    /// only a weak reference; a dropped breaker or an already-ended open
    /// epoch makes the timer a no-op. Without a tokio runtime the breaker
    /// falls back to transition-on-next-acquire.
    fn schedule_half_open_transition(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = self.weak_self.clone();
        let wait = self.config.wait_duration_in_open_state;
        let open_epoch = self.epoch.load(Ordering::Acquire);
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(machine) = weak.upgrade() {
                let _ = machine.transition(State::HalfOpen, Some((State::Open, open_epoch)));
            }
        });
    }
}

fn window_settings(config: &CircuitBreakerConfig, minimum_number_of_calls: u64) -> WindowSettings {
    WindowSettings {
        minimum_number_of_calls,
        slow_call_duration_threshold: config.slow_call_duration_threshold,
        failure_rate_threshold: config.failure_rate_threshold,
        slow_call_rate_threshold: config.slow_call_rate_threshold,
    }
}

fn main_window(config: &CircuitBreakerConfig, clock: &Arc<dyn Clock>) -> Window {
    let settings = window_settings(config, config.minimum_number_of_calls);
    match config.sliding_window_type {
        SlidingWindowType::CountBased => {
            Window::count_based(config.sliding_window_size, settings, Arc::clone(clock))
        }
        SlidingWindowType::TimeBased => {
            Window::time_based(config.sliding_window_size, settings, Arc::clone(clock))
        }
    }
}

/// The half-open probe set is its own count window: exactly the trial
/// calls decide recovery, regardless of the main window shape.
fn half_open_window(config: &CircuitBreakerConfig, clock: &Arc<dyn Clock>) -> Window {
    let permitted = config.permitted_number_of_calls_in_half_open_state;
    let settings = window_settings(config, u64::from(permitted));
    Window::count_based(permitted as usize, settings, Arc::clone(clock))
}
