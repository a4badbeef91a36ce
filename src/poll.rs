//! Blocking wait on remote state, split into a `poll()` step and a policy
//! that decides how often and how long to call it.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{PerftestError, Result};

/// Outcome of a single observation of a remote resource.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    Pending { status: String },
    Terminal(T),
}

pub trait Pollable {
    type Output;

    /// Identifier used in logs and timeout errors.
    fn resource(&self) -> String;

    fn poll(&mut self) -> Result<PollState<Self::Output>>;
}

/// Monotonic time source. `now()` is measured from an arbitrary origin.
pub trait Clock {
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Call `target.poll()` until it reports a terminal state or the policy's
/// timeout elapses. Transient remote errors count as a pending observation.
pub fn poll_until_terminal<P: Pollable>(
    target: &mut P,
    policy: PollPolicy,
    clock: &dyn Clock,
) -> Result<P::Output> {
    let resource = target.resource();
    let started = clock.now();
    let elapsed = || clock.now().saturating_sub(started);
    let mut last_status = String::from("UNKNOWN");

    loop {
        match target.poll() {
            Ok(PollState::Terminal(output)) => return Ok(output),
            Ok(PollState::Pending { status }) => {
                if status != last_status {
                    info!(
                        resource = %resource,
                        status = %status,
                        elapsed_secs = elapsed().as_secs(),
                        "Status changed"
                    );
                    last_status = status;
                }
            }
            Err(err) if err.is_transient() => {
                warn!(resource = %resource, error = %err, "Poll failed; retrying");
            }
            Err(err) => return Err(err),
        }

        let waited = elapsed();
        if waited >= policy.timeout {
            return Err(PerftestError::Timeout {
                resource,
                waited,
                last_status,
            });
        }
        clock.sleep(policy.interval.min(policy.timeout - waited));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeClock {
        now: Cell<Duration>,
    }

    impl Clock for FakeClock {
        fn now(&self) -> Duration {
            self.now.get()
        }

        fn sleep(&self, duration: Duration) {
            self.now.set(self.now.get() + duration);
        }
    }

    struct Script {
        steps: Vec<Result<PollState<&'static str>>>,
        calls: usize,
    }

    impl Pollable for Script {
        type Output = &'static str;

        fn resource(&self) -> String {
            "run/1".into()
        }

        fn poll(&mut self) -> Result<PollState<&'static str>> {
            self.calls += 1;
            if self.steps.is_empty() {
                return Ok(PollState::Pending {
                    status: "RUNNING".into(),
                });
            }
            self.steps.remove(0)
        }
    }

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(10), Duration::from_secs(35))
    }

    #[test]
    fn returns_terminal_output() {
        let clock = FakeClock {
            now: Cell::new(Duration::ZERO),
        };
        let mut script = Script {
            steps: vec![
                Ok(PollState::Pending {
                    status: "SCHEDULING".into(),
                }),
                Err(PerftestError::remote("GetRun", "connection reset")),
                Ok(PollState::Terminal("COMPLETED")),
            ],
            calls: 0,
        };
        assert_eq!(
            poll_until_terminal(&mut script, policy(), &clock).unwrap(),
            "COMPLETED"
        );
        assert_eq!(script.calls, 3);
        assert_eq!(clock.now(), Duration::from_secs(20));
    }

    #[test]
    fn times_out_with_last_status() {
        let clock = FakeClock {
            now: Cell::new(Duration::ZERO),
        };
        let mut script = Script {
            steps: Vec::new(),
            calls: 0,
        };
        let err = poll_until_terminal(&mut script, policy(), &clock).unwrap_err();
        match err {
            PerftestError::Timeout {
                resource,
                waited,
                last_status,
            } => {
                assert_eq!(resource, "run/1");
                assert_eq!(waited, Duration::from_secs(35));
                assert_eq!(last_status, "RUNNING");
            }
            other => panic!("unexpected error: {other}"),
        }
        // 0, 10, 20, 30, 35
        assert_eq!(script.calls, 5);
    }

    #[test]
    fn client_errors_abort_immediately() {
        let clock = FakeClock {
            now: Cell::new(Duration::ZERO),
        };
        let mut script = Script {
            steps: vec![Err(PerftestError::Remote {
                operation: "GetRun".into(),
                status: Some(400),
                code: Some("NotFoundException".into()),
                message: "no such run".into(),
            })],
            calls: 0,
        };
        let err = poll_until_terminal(&mut script, policy(), &clock).unwrap_err();
        assert!(matches!(err, PerftestError::Remote { .. }));
        assert_eq!(clock.now(), Duration::ZERO);
    }
}
