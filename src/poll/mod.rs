use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::process::types::{ProcessState, ProcessStatus};

/// One convergence-polling invocation: interval, total timeout and an
/// optional cancellation signal. Lives only for the duration of the call.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub interval: Duration,
    pub timeout: Duration,
    pub cancel: Option<CancellationToken>,
}

impl PollRequest {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Classified status-fetch failure.
///
/// The first three variants mean "resource not ready yet" and keep the poll
/// alive; `Fatal` terminates it on the spot. The split is structural so a
/// retryable condition can never be confused with a broken request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("not found")]
    NotFound,

    #[error("service unavailable")]
    Unavailable,

    #[error("bad gateway")]
    BadGateway,

    #[error("{0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Fatal(_))
    }
}

impl From<FleetError> for FetchError {
    fn from(e: FleetError) -> Self {
        match e {
            FleetError::NotFound(_) => FetchError::NotFound,
            FleetError::TransientUnavailable(_) => FetchError::Unavailable,
            other => FetchError::Fatal(other.to_string()),
        }
    }
}

/// Terminal outcome of one poll invocation; exactly one is produced.
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// The predicate held
    Succeeded(T),
    /// The timeout elapsed before the predicate held
    TimedOut { waited: Duration },
    /// A fatal fetch error terminated the poll
    Aborted(FetchError),
    /// The caller's cancellation token fired
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Succeeded(_))
    }

    /// Collapse into a `Result` using the crate error taxonomy
    pub fn into_result(self) -> Result<T> {
        match self {
            PollOutcome::Succeeded(value) => Ok(value),
            PollOutcome::TimedOut { waited } => Err(FleetError::PollTimeout(waited)),
            PollOutcome::Aborted(FetchError::Fatal(msg)) => Err(FleetError::FatalRequest(msg)),
            PollOutcome::Aborted(transient) => {
                Err(FleetError::TransientUnavailable(transient.to_string()))
            }
            PollOutcome::Cancelled => Err(FleetError::Cancelled),
        }
    }
}

/// Repeatedly fetch a snapshot until `predicate` holds, the timeout elapses,
/// a fatal fetch error occurs or the request is cancelled.
///
/// Transient fetch errors (not-found, unavailable, bad-gateway) are swallowed
/// and the poll stays alive; a fatal error aborts on its first occurrence.
/// The first fetch happens immediately, one final fetch lands at the
/// deadline, and a timeout is never reported early.
pub async fn poll_until<T, F, Fut, P>(req: &PollRequest, mut fetch: F, mut predicate: P) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, FetchError>>,
    P: FnMut(&T) -> bool,
{
    let cancel = req.cancel.clone().unwrap_or_default();
    let start = Instant::now();
    let deadline = start + req.timeout;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            result = fetch() => result,
        };

        match attempt {
            Ok(snapshot) if predicate(&snapshot) => return PollOutcome::Succeeded(snapshot),
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                debug!("Ignoring transient fetch error: {}", e);
            }
            Err(e) => return PollOutcome::Aborted(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut {
                waited: now - start,
            };
        }

        let wait = req.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Predicate description for waiting on a tool server: the state it should
/// reach and, optionally, that it advertises at least one capability.
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    pub desired: ProcessState,
    pub require_capabilities: bool,
}

impl ReadinessCheck {
    pub fn state(desired: ProcessState) -> Self {
        Self {
            desired,
            require_capabilities: false,
        }
    }

    pub fn with_capabilities(mut self) -> Self {
        self.require_capabilities = true;
        self
    }

    pub fn holds(&self, snapshot: &ToolReadiness) -> bool {
        snapshot.status.state == self.desired
            && (!self.require_capabilities || !snapshot.capabilities.is_empty())
    }
}

/// Snapshot the caller's fetch assembles from the supervisor status surface
/// plus whatever capability list the tool transport reports.
#[derive(Debug, Clone, Serialize)]
pub struct ToolReadiness {
    pub status: ProcessStatus,
    pub capabilities: Vec<String>,
}

/// Poll until the tool reaches the desired state (and, if requested, reports
/// a non-empty capability list).
pub async fn wait_for_state<F, Fut>(
    req: &PollRequest,
    check: &ReadinessCheck,
    fetch: F,
) -> PollOutcome<ToolReadiness>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<ToolReadiness, FetchError>>,
{
    poll_until(req, fetch, |snapshot| check.holds(snapshot)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::SystemTime;

    use crate::registry::ProcessId;

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn status(state: ProcessState) -> ProcessStatus {
        ProcessStatus {
            id: ProcessId::from("tool"),
            state,
            pid: Some(1234),
            uptime: None,
            restart_count: 0,
            exit_code: None,
        }
    }

    #[tokio::test]
    async fn test_immediate_success() {
        let req = PollRequest::new(millis(50), millis(1000));
        let outcome = poll_until(&req, || async { Ok::<u32, FetchError>(7) }, |v| *v == 7).await;
        assert!(matches!(outcome, PollOutcome::Succeeded(7)));
    }

    #[tokio::test]
    async fn test_success_within_one_interval_of_convergence() {
        // The predicate starts holding at the third fetch
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let req = PollRequest::new(millis(20), millis(2000));

        let started = SystemTime::now();
        let outcome = poll_until(
            &req,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<u32, FetchError>(n) }
            },
            |n| *n >= 3,
        )
        .await;

        assert!(matches!(outcome, PollOutcome::Succeeded(3)));
        let elapsed = started.elapsed().unwrap();
        assert!(elapsed < millis(500), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_timeout_never_early() {
        let req = PollRequest::new(millis(10), millis(100));
        let started = tokio::time::Instant::now();
        let outcome =
            poll_until(&req, || async { Ok::<u32, FetchError>(0) }, |_| false).await;

        match outcome {
            PollOutcome::TimedOut { waited } => assert!(waited >= millis(100)),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() >= millis(100));
    }

    // A fatal error is never retried: the poll aborts on the very first
    // occurrence, long before the timeout.
    #[tokio::test]
    async fn test_fatal_error_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let req = PollRequest::new(millis(50), millis(30_000));

        let started = tokio::time::Instant::now();
        let outcome = poll_until(
            &req,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, FetchError>(FetchError::Fatal("401 unauthorized".to_string())) }
            },
            |_| true,
        )
        .await;

        match outcome {
            PollOutcome::Aborted(FetchError::Fatal(msg)) => assert!(msg.contains("401")),
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < millis(1000));
    }

    // Not-found while the target is still coming up is swallowed; the poll
    // survives and eventually succeeds.
    #[tokio::test]
    async fn test_transient_not_found_is_tolerated() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let req = PollRequest::new(millis(10), millis(5000));

        let outcome = poll_until(
            &req,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 5 {
                        Err(FetchError::NotFound)
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert!(matches!(outcome, PollOutcome::Succeeded(6)));
    }

    #[tokio::test]
    async fn test_other_transient_kinds_are_tolerated() {
        for transient in [FetchError::Unavailable, FetchError::BadGateway] {
            assert!(transient.is_transient());

            let calls = Arc::new(AtomicU32::new(0));
            let counter = Arc::clone(&calls);
            let kind = transient.clone();
            let req = PollRequest::new(millis(5), millis(1000));

            let outcome = poll_until(
                &req,
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let kind = kind.clone();
                    async move { if n == 1 { Err(kind) } else { Ok(n) } }
                },
                |_| true,
            )
            .await;
            assert!(outcome.is_success());
        }
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let token = CancellationToken::new();
        let req = PollRequest::new(millis(20), millis(10_000)).with_cancel(token.clone());

        let cancel_after = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(millis(50)).await;
            cancel_after.cancel();
        });

        let started = tokio::time::Instant::now();
        let outcome =
            poll_until(&req, || async { Ok::<u32, FetchError>(0) }, |_| false).await;

        assert!(matches!(outcome, PollOutcome::Cancelled));
        assert!(started.elapsed() < millis(5000));
    }

    #[tokio::test]
    async fn test_into_result_mapping() {
        assert!(PollOutcome::Succeeded(1).into_result().is_ok());
        assert!(matches!(
            PollOutcome::<u32>::TimedOut { waited: millis(10) }.into_result(),
            Err(FleetError::PollTimeout(_))
        ));
        assert!(matches!(
            PollOutcome::<u32>::Aborted(FetchError::Fatal("boom".to_string())).into_result(),
            Err(FleetError::FatalRequest(_))
        ));
        assert!(matches!(
            PollOutcome::<u32>::Cancelled.into_result(),
            Err(FleetError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_state_desired_state() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let req = PollRequest::new(millis(10), millis(2000));
        let check = ReadinessCheck::state(ProcessState::Running);

        let outcome = wait_for_state(&req, &check, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                let state = if n < 3 {
                    ProcessState::Starting
                } else {
                    ProcessState::Running
                };
                Ok(ToolReadiness {
                    status: status(state),
                    capabilities: vec![],
                })
            }
        })
        .await;

        match outcome {
            PollOutcome::Succeeded(snapshot) => {
                assert_eq!(snapshot.status.state, ProcessState::Running)
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_for_state_requires_capabilities() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let req = PollRequest::new(millis(10), millis(2000));
        let check = ReadinessCheck::state(ProcessState::Running).with_capabilities();

        let outcome = wait_for_state(&req, &check, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                // Running from the start, but capabilities appear later
                let capabilities = if n < 4 {
                    vec![]
                } else {
                    vec!["convert_document".to_string()]
                };
                Ok(ToolReadiness {
                    status: status(ProcessState::Running),
                    capabilities,
                })
            }
        })
        .await;

        match outcome {
            PollOutcome::Succeeded(snapshot) => {
                assert_eq!(snapshot.capabilities.len(), 1)
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_fetch_error_from_fleet_error() {
        assert_eq!(
            FetchError::from(FleetError::NotFound("x".to_string())),
            FetchError::NotFound
        );
        assert_eq!(
            FetchError::from(FleetError::TransientUnavailable("busy".to_string())),
            FetchError::Unavailable
        );
        assert!(matches!(
            FetchError::from(FleetError::Cancelled),
            FetchError::Fatal(_)
        ));
    }
}
