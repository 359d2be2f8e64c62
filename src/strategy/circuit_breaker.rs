//! Window-based circuit breaker with manual isolation.
//!
//! Outcomes are counted over a rolling sample window. Once throughput
//! reaches the configured minimum and the failed fraction reaches the
//! threshold, the circuit opens for the break duration, then admits a single
//! half-open probe: success closes, failure re-opens. An isolated circuit
//! rejects everything until the registry clears it.
//!
//! One breaker exists per `(endpoint, resource)` pipeline, so a noisy
//! resource cannot poison an unrelated one on the same endpoint.

use crate::telemetry::{PolicyEvent, TelemetryHub};
use crate::Fault;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WINDOW_SLICES: u32 = 10;

/// Public view of a breaker's position in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    Isolated,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Failed fraction of windowed throughput that trips the circuit, 0..1.
    pub failure_threshold: f64,
    /// Length of the rolling sample window.
    pub sampling_duration: Duration,
    /// Minimum windowed throughput before the threshold applies.
    pub minimum_throughput: u32,
    /// How long an opened circuit rejects before probing.
    pub break_duration: Duration,
}

/// Observability snapshot, taken under the breaker's lock.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub windowed_throughput: u32,
    pub windowed_failures: u32,
    /// Remaining open time, if currently open.
    pub open_remaining: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slice {
    successes: u32,
    failures: u32,
}

#[derive(Debug, Clone, Copy)]
enum Circuit {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
    Isolated,
}

#[derive(Debug)]
struct BreakerState {
    circuit: Circuit,
    slices: VecDeque<Slice>,
    slice_started: Instant,
}

pub struct CircuitBreaker {
    settings: BreakerSettings,
    slice_length: Duration,
    state: Mutex<BreakerState>,
    telemetry: Arc<TelemetryHub>,
    pipeline_key: String,
}

impl CircuitBreaker {
    pub fn new(
        settings: BreakerSettings,
        isolated: bool,
        telemetry: Arc<TelemetryHub>,
        pipeline_key: String,
    ) -> Self {
        let slice_length = settings.sampling_duration / WINDOW_SLICES;
        let circuit = if isolated {
            Circuit::Isolated
        } else {
            Circuit::Closed
        };
        let mut slices = VecDeque::with_capacity(WINDOW_SLICES as usize);
        slices.push_back(Slice::default());
        Self {
            settings,
            slice_length,
            state: Mutex::new(BreakerState {
                circuit,
                slices,
                slice_started: Instant::now(),
            }),
            telemetry,
            pipeline_key,
        }
    }

    /// Rotate the slice ring forward to `now`, discarding slices that have
    /// left the sample window.
    fn advance(&self, state: &mut BreakerState, now: Instant) {
        if self.slice_length.is_zero() {
            return;
        }
        while now.duration_since(state.slice_started) >= self.slice_length {
            state.slice_started += self.slice_length;
            state.slices.push_back(Slice::default());
            if state.slices.len() > WINDOW_SLICES as usize {
                state.slices.pop_front();
            }
            // A long quiet gap empties the window in bounded steps.
            if now.duration_since(state.slice_started) >= self.settings.sampling_duration {
                state.slices.clear();
                state.slices.push_back(Slice::default());
                state.slice_started = now;
                break;
            }
        }
    }

    fn totals(state: &BreakerState) -> (u32, u32) {
        let failures = state.slices.iter().map(|s| s.failures).sum();
        let successes: u32 = state.slices.iter().map(|s| s.successes).sum();
        (successes + failures, failures)
    }

    fn reset_window(state: &mut BreakerState, now: Instant) {
        state.slices.clear();
        state.slices.push_back(Slice::default());
        state.slice_started = now;
    }

    /// Gate an execution on the current circuit state.
    pub fn admit(&self, operation_key: &str) -> Result<(), Fault> {
        let Ok(mut state) = self.state.lock() else {
            return Err(Fault::Other("circuit breaker lock poisoned".to_string()));
        };
        let now = Instant::now();
        self.advance(&mut state, now);
        match state.circuit {
            Circuit::Closed => Ok(()),
            Circuit::Isolated => Err(Fault::IsolatedCircuit),
            Circuit::Open { until } if now < until => Err(Fault::BrokenCircuit {
                retry_after: until.duration_since(now),
            }),
            Circuit::Open { .. } => {
                // Break duration elapsed: this execution is the probe.
                tracing::debug!(
                    pipeline_key = self.pipeline_key.as_str(),
                    operation_key,
                    "circuit half-open; admitting probe"
                );
                state.circuit = Circuit::HalfOpen {
                    probe_in_flight: true,
                };
                Ok(())
            }
            Circuit::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    Err(Fault::BrokenCircuit {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    state.circuit = Circuit::HalfOpen {
                        probe_in_flight: true,
                    };
                    Ok(())
                }
            }
        }
    }

    /// Record a successful (or non-breaking) outcome.
    pub fn record_success(&self, operation_key: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let now = Instant::now();
        self.advance(&mut state, now);
        match state.circuit {
            Circuit::HalfOpen { .. } => {
                state.circuit = Circuit::Closed;
                Self::reset_window(&mut state, now);
                drop(state);
                self.telemetry
                    .emit(&self.pipeline_key, operation_key, &PolicyEvent::CircuitClosed);
            }
            Circuit::Isolated => {}
            _ => {
                if let Some(slice) = state.slices.back_mut() {
                    slice.successes += 1;
                }
            }
        }
    }

    /// Record an outcome classified as a breaker failure.
    pub fn record_failure(&self, operation_key: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let now = Instant::now();
        self.advance(&mut state, now);
        match state.circuit {
            Circuit::HalfOpen { .. } => {
                state.circuit = Circuit::Open {
                    until: now + self.settings.break_duration,
                };
                Self::reset_window(&mut state, now);
                drop(state);
                self.telemetry.emit(
                    &self.pipeline_key,
                    operation_key,
                    &PolicyEvent::CircuitOpened {
                        break_duration: self.settings.break_duration,
                    },
                );
            }
            Circuit::Closed => {
                if let Some(slice) = state.slices.back_mut() {
                    slice.failures += 1;
                }
                let (throughput, failures) = Self::totals(&state);
                let tripped = throughput >= self.settings.minimum_throughput
                    && f64::from(failures) / f64::from(throughput)
                        >= self.settings.failure_threshold;
                if tripped {
                    state.circuit = Circuit::Open {
                        until: now + self.settings.break_duration,
                    };
                    Self::reset_window(&mut state, now);
                    drop(state);
                    self.telemetry.emit(
                        &self.pipeline_key,
                        operation_key,
                        &PolicyEvent::CircuitOpened {
                            break_duration: self.settings.break_duration,
                        },
                    );
                }
            }
            // Outcomes landing after a trip or isolation do not move the
            // state machine.
            Circuit::Open { .. } | Circuit::Isolated => {}
        }
    }

    /// Force the circuit into the isolated state until the registry clears.
    pub fn isolate(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.circuit = Circuit::Isolated;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let Ok(mut state) = self.state.lock() else {
            return CircuitSnapshot {
                state: CircuitState::Closed,
                windowed_throughput: 0,
                windowed_failures: 0,
                open_remaining: None,
            };
        };
        let now = Instant::now();
        self.advance(&mut state, now);
        let (throughput, failures) = Self::totals(&state);
        let (public, open_remaining) = match state.circuit {
            Circuit::Closed => (CircuitState::Closed, None),
            Circuit::Open { until } if now < until => {
                (CircuitState::Open, Some(until.duration_since(now)))
            }
            Circuit::Open { .. } => (CircuitState::Open, None),
            Circuit::HalfOpen { .. } => (CircuitState::HalfOpen, None),
            Circuit::Isolated => (CircuitState::Isolated, None),
        };
        CircuitSnapshot {
            state: public,
            windowed_throughput: throughput,
            windowed_failures: failures,
            open_remaining,
        }
    }
}
