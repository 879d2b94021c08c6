//! Single-flight lazy construction of the request handler.
//!
//! A warm serverless process receives its first requests before the
//! application exists. [`LazyHandler`] makes sure exactly one build of the
//! handler is in flight at a time, that every caller arriving during the
//! build awaits that same build, and that no caller ever sees a partially
//! built handler.
//!
//! # States
//!
//! ```text
//!   Empty ──get()──▶ Pending ──ok──▶ Ready
//!     ▲                 │
//!     │               error / timeout / panic
//!   reset()             ▼
//!     └──────────── Failed ──(cooldown elapsed, Retry policy)──▶ Pending
//! ```
//!
//! The check of the current state and the installation of the `Pending`
//! marker happen under one [`parking_lot::Mutex`] acquisition, and the lock
//! is never held across an `.await`.
//!
//! The build runs on its own tokio task. Callers only hold a clone of a
//! [`Shared`] future over that task's result, so a caller that goes away
//! (client disconnect, invocation deadline) cannot cancel the build that
//! other callers are waiting on. The task writes the terminal state itself;
//! if the task is cancelled (runtime shutdown), the first waiter to observe
//! that records an `Aborted` failure, which then follows the failure policy.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Produces the handler guarded by a [`LazyHandler`].
///
/// `build` may be slow and may fail. It is called at most once per
/// initialization attempt.
#[async_trait]
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Send + Sync + 'static;

    async fn build(&self) -> anyhow::Result<Self::Handler>;
}

/// Adapts an async closure into a [`HandlerFactory`].
pub struct FnFactory<F>(F);

/// Wraps `f` so it can be used as a [`HandlerFactory`].
///
/// ```rust
/// use saathi_server::lazy::{factory_fn, LazyHandler};
///
/// let lazy = LazyHandler::new(factory_fn(|| async { Ok::<_, anyhow::Error>(42u32) }));
/// assert_eq!(lazy.attempts(), 0);
/// ```
pub fn factory_fn<F, Fut, H>(f: F) -> FnFactory<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<H>> + Send + 'static,
    H: Send + Sync + 'static,
{
    FnFactory(f)
}

#[async_trait]
impl<F, Fut, H> HandlerFactory for FnFactory<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<H>> + Send + 'static,
    H: Send + Sync + 'static,
{
    type Handler = H;

    async fn build(&self) -> anyhow::Result<H> {
        (self.0)().await
    }
}

/// Why the handler could not be built.
///
/// Cloneable so that every caller waiting on one build receives the same value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InitError {
    #[error("{0:#}")]
    Build(Arc<anyhow::Error>),
    #[error("handler initialization timed out after {0:?}")]
    TimedOut(Duration),
    #[error("handler initialization panicked: {0}")]
    Panicked(String),
    #[error("handler initialization was aborted: {0}")]
    Aborted(String),
}

/// What happens to callers after a build fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Callers within `cooldown` of the failure get the cached error; the
    /// first caller after it starts a fresh build.
    Retry { cooldown: Duration },
    /// The failure is kept until [`LazyHandler::reset`].
    Sticky,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Retry {
            cooldown: Duration::from_secs(1),
        }
    }
}

impl FailurePolicy {
    fn retry_at(&self, failed_at: Instant) -> Option<Instant> {
        match self {
            FailurePolicy::Retry { cooldown } => Some(failed_at + *cooldown),
            FailurePolicy::Sticky => None,
        }
    }
}

/// Observable initialization phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Uninitialized,
    InProgress,
    Ready,
    Failed,
}

type BuildOutcome<H> = Result<Arc<H>, InitError>;
type SharedBuild<H> = Shared<BoxFuture<'static, BuildOutcome<H>>>;

enum Slot<H> {
    Empty,
    Pending(SharedBuild<H>),
    Ready(Arc<H>),
    Failed {
        error: InitError,
        retry_at: Option<Instant>,
    },
}

struct State<H> {
    slot: Slot<H>,
    /// Bumped by `reset`; a build only settles the generation it started in.
    generation: u64,
}

struct Inner<H> {
    state: Mutex<State<H>>,
    attempts: AtomicU64,
}

impl<H> Inner<H> {
    fn settle(&self, generation: u64, outcome: &BuildOutcome<H>, policy: FailurePolicy) {
        let mut state = self.state.lock();
        if state.generation != generation {
            tracing::debug!(generation, "discarding build result superseded by reset");
            return;
        }
        state.slot = match outcome {
            Ok(handler) => Slot::Ready(Arc::clone(handler)),
            Err(error) => Slot::Failed {
                error: error.clone(),
                retry_at: policy.retry_at(Instant::now()),
            },
        };
    }
}

/// Memoized, single-flight asynchronous constructor for a request handler.
///
/// Cloning is cheap and clones share the same state.
pub struct LazyHandler<F: HandlerFactory> {
    factory: Arc<F>,
    inner: Arc<Inner<F::Handler>>,
    timeout: Option<Duration>,
    policy: FailurePolicy,
}

impl<F: HandlerFactory> Clone for LazyHandler<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            inner: Arc::clone(&self.inner),
            timeout: self.timeout,
            policy: self.policy,
        }
    }
}

impl<F: HandlerFactory> fmt::Debug for LazyHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyHandler")
            .field("phase", &self.phase())
            .field("attempts", &self.attempts())
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<F: HandlerFactory> LazyHandler<F> {
    /// Creates an uninitialized holder. Nothing is built until [`get`](Self::get).
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    slot: Slot::Empty,
                    generation: 0,
                }),
                attempts: AtomicU64::new(0),
            }),
            timeout: None,
            policy: FailurePolicy::default(),
        }
    }

    /// Bounds each build. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the built handler, building it first if needed.
    ///
    /// Concurrent callers share one build. Must be called from within a
    /// tokio runtime, since the build is spawned as a task.
    pub async fn get(&self) -> Result<Arc<F::Handler>, InitError> {
        let build = {
            let mut state = self.inner.state.lock();
            let pending = match &state.slot {
                Slot::Ready(handler) => return Ok(Arc::clone(handler)),
                Slot::Pending(build) => Some(build.clone()),
                Slot::Failed { error, retry_at } if !retry_due(*retry_at) => {
                    return Err(error.clone())
                }
                Slot::Failed { .. } | Slot::Empty => None,
            };
            match pending {
                Some(build) => build,
                None => self.start_build(&mut state),
            }
        };
        build.await
    }

    /// The handler if it is already built. Never starts a build.
    pub fn ready(&self) -> Option<Arc<F::Handler>> {
        match &self.inner.state.lock().slot {
            Slot::Ready(handler) => Some(Arc::clone(handler)),
            _ => None,
        }
    }

    pub fn phase(&self) -> InitPhase {
        match &self.inner.state.lock().slot {
            Slot::Empty => InitPhase::Uninitialized,
            Slot::Pending(_) => InitPhase::InProgress,
            Slot::Ready(_) => InitPhase::Ready,
            Slot::Failed { .. } => InitPhase::Failed,
        }
    }

    /// Number of builds started so far.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Returns to the uninitialized state. A build still in flight keeps
    /// serving the callers already waiting on it but does not store its result.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.slot = Slot::Empty;
    }

    fn start_build(&self, state: &mut State<F::Handler>) -> SharedBuild<F::Handler> {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = state.generation;
        tracing::info!(attempt, "building request handler");

        let factory = Arc::clone(&self.factory);
        let inner = Arc::clone(&self.inner);
        let watcher = Arc::clone(&self.inner);
        let timeout = self.timeout;
        let policy = self.policy;

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = run_build(factory.as_ref(), timeout).await;
            match &outcome {
                Ok(_) => tracing::info!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request handler ready"
                ),
                Err(error) => tracing::error!(
                    attempt,
                    error = %error,
                    "request handler initialization failed"
                ),
            }
            inner.settle(generation, &outcome, policy);
            outcome
        });

        // A cancelled task never reaches `settle`, so the abort is recorded here.
        let build = async move {
            task.await.unwrap_or_else(|join_err| {
                tracing::error!(attempt, error = %join_err, "request handler build task aborted");
                let outcome = Err(InitError::Aborted(join_err.to_string()));
                watcher.settle(generation, &outcome, policy);
                outcome
            })
        }
        .boxed()
        .shared();

        state.slot = Slot::Pending(build.clone());
        build
    }
}

fn retry_due(retry_at: Option<Instant>) -> bool {
    retry_at.is_some_and(|at| Instant::now() >= at)
}

async fn run_build<F: HandlerFactory>(
    factory: &F,
    timeout: Option<Duration>,
) -> BuildOutcome<F::Handler> {
    let build = AssertUnwindSafe(factory.build()).catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, build).await {
            Ok(result) => result,
            Err(_) => return Err(InitError::TimedOut(limit)),
        },
        None => build.await,
    };

    match result {
        Ok(Ok(handler)) => Ok(Arc::new(handler)),
        Ok(Err(err)) => Err(InitError::Build(Arc::new(err))),
        Err(payload) => Err(InitError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Built {
        build_no: usize,
    }

    /// Factory that counts builds, waits `delay`, then succeeds.
    fn counting(
        delay: Duration,
    ) -> (
        Arc<AtomicUsize>,
        LazyHandler<impl HandlerFactory<Handler = Built>>,
    ) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let lazy = LazyHandler::new(factory_fn(move || {
            let counter = counter.clone();
            async move {
                let build_no = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                anyhow::Ok(Built { build_no })
            }
        }));
        (builds, lazy)
    }

    /// Factory whose first `failures` builds fail, later ones succeed.
    fn flaky(
        failures: usize,
    ) -> (
        Arc<AtomicUsize>,
        LazyHandler<impl HandlerFactory<Handler = Built>>,
    ) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let lazy = LazyHandler::new(factory_fn(move || {
            let counter = counter.clone();
            async move {
                let build_no = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                if build_no <= failures {
                    anyhow::bail!("database unreachable (attempt {})", build_no);
                }
                Ok(Built { build_no })
            }
        }));
        (builds, lazy)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_build() {
        let (builds, lazy) = counting(Duration::from_millis(50));

        let waiters: Vec<_> = (0..16)
            .map(|_| {
                let lazy = lazy.clone();
                tokio::spawn(async move { lazy.get().await })
            })
            .collect();

        let mut handlers = Vec::new();
        for waiter in waiters {
            handlers.push(waiter.await.unwrap().unwrap());
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.attempts(), 1);
        assert_eq!(lazy.phase(), InitPhase::Ready);
        let first = &handlers[0];
        assert!(handlers.iter().all(|h| Arc::ptr_eq(h, first)));
        assert_eq!(first.build_no, 1);
    }

    #[tokio::test]
    async fn two_callers_in_same_tick_await_identical_build() {
        let (builds, lazy) = counting(Duration::from_millis(50));

        let (a, b) = tokio::join!(lazy.get(), lazy.get());

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ready_handler_is_not_rebuilt() {
        let (builds, lazy) = counting(Duration::from_millis(1));

        assert_eq!(lazy.phase(), InitPhase::Uninitialized);
        assert!(lazy.ready().is_none());

        let first = lazy.get().await.unwrap();
        for _ in 0..5 {
            let again = lazy.get().await.unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.attempts(), 1);
        assert!(lazy.ready().is_some());
    }

    #[tokio::test]
    async fn phase_is_in_progress_while_building() {
        let (_builds, lazy) = counting(Duration::from_millis(100));

        let pending = {
            let lazy = lazy.clone();
            tokio::spawn(async move { lazy.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lazy.phase(), InitPhase::InProgress);
        assert!(lazy.ready().is_none());

        pending.await.unwrap().unwrap();
        assert_eq!(lazy.phase(), InitPhase::Ready);
    }

    #[tokio::test]
    async fn failed_build_reaches_every_waiter() {
        let (builds, lazy) = flaky(usize::MAX);
        let lazy = lazy.with_failure_policy(FailurePolicy::Sticky);

        let (a, b, c) = tokio::join!(lazy.get(), lazy.get(), lazy.get());

        for result in [a, b, c] {
            let err = result.unwrap_err();
            assert!(matches!(err, InitError::Build(_)));
            assert_eq!(err.to_string(), "database unreachable (attempt 1)");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.phase(), InitPhase::Failed);
    }

    #[tokio::test]
    async fn sticky_failure_never_rebuilds_until_reset() {
        let (builds, lazy) = flaky(1);
        let lazy = lazy.with_failure_policy(FailurePolicy::Sticky);

        for _ in 0..4 {
            assert!(lazy.get().await.is_err());
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        lazy.reset();
        assert_eq!(lazy.phase(), InitPhase::Uninitialized);

        let handler = lazy.get().await.unwrap();
        assert_eq!(handler.build_no, 2);
        assert_eq!(lazy.attempts(), 2);
    }

    #[tokio::test]
    async fn retry_waits_for_cooldown() {
        let (builds, lazy) = flaky(1);
        let lazy = lazy.with_failure_policy(FailurePolicy::Retry {
            cooldown: Duration::from_millis(80),
        });

        assert!(lazy.get().await.is_err());
        // Within the cooldown the cached failure is returned without building.
        assert!(lazy.get().await.is_err());
        assert!(lazy.get().await.is_err());
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let handler = lazy.get().await.unwrap();
        assert_eq!(handler.build_no, 2);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(lazy.phase(), InitPhase::Ready);
    }

    #[tokio::test]
    async fn retry_with_zero_cooldown_rebuilds_on_next_call() {
        let (builds, lazy) = flaky(2);
        let lazy = lazy.with_failure_policy(FailurePolicy::Retry {
            cooldown: Duration::ZERO,
        });

        assert!(lazy.get().await.is_err());
        assert!(lazy.get().await.is_err());
        assert!(lazy.get().await.is_ok());
        assert_eq!(builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn build_exceeding_timeout_fails_all_waiters() {
        let lazy = LazyHandler::new(factory_fn(|| async {
            futures::future::pending::<()>().await;
            anyhow::Ok(Built { build_no: 0 })
        }))
        .with_timeout(Some(Duration::from_millis(50)))
        .with_failure_policy(FailurePolicy::Sticky);

        let (a, b) = tokio::join!(lazy.get(), lazy.get());

        for result in [a, b] {
            assert!(matches!(result, Err(InitError::TimedOut(d)) if d == Duration::from_millis(50)));
        }
        assert_eq!(lazy.phase(), InitPhase::Failed);
        assert_eq!(lazy.attempts(), 1);
    }

    #[tokio::test]
    async fn panicking_build_is_reported_not_propagated() {
        let lazy = LazyHandler::new(factory_fn(|| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if true {
                panic!("config blew up");
            }
            anyhow::Ok(Built { build_no: 0 })
        }))
        .with_failure_policy(FailurePolicy::Sticky);

        let (a, b) = tokio::join!(lazy.get(), lazy.get());

        for result in [a, b] {
            match result {
                Err(InitError::Panicked(msg)) => assert_eq!(msg, "config blew up"),
                other => panic!("expected panic error, got {:?}", other.map(|_| ())),
            }
        }
        assert_eq!(lazy.phase(), InitPhase::Failed);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_cancel_build() {
        let (builds, lazy) = counting(Duration::from_millis(60));

        let impatient = {
            let lazy = lazy.clone();
            tokio::spawn(async move { lazy.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        impatient.abort();

        let handler = lazy.get().await.unwrap();
        assert_eq!(handler.build_no, 1);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_discards_in_flight_result() {
        let (builds, lazy) = counting(Duration::from_millis(60));

        let in_flight = {
            let lazy = lazy.clone();
            tokio::spawn(async move { lazy.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        lazy.reset();

        // The caller already waiting still gets its handler...
        let stale = in_flight.await.unwrap().unwrap();
        assert_eq!(stale.build_no, 1);
        // ...but it was not stored.
        assert_eq!(lazy.phase(), InitPhase::Uninitialized);

        let fresh = lazy.get().await.unwrap();
        assert_eq!(fresh.build_no, 2);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn build_aborted_by_runtime_shutdown_follows_failure_policy() {
        let (builds, lazy) = counting(Duration::from_millis(200));
        let lazy = lazy.with_failure_policy(FailurePolicy::Retry {
            cooldown: Duration::ZERO,
        });

        let first = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        first.block_on(async {
            let lazy = lazy.clone();
            tokio::spawn(async move { lazy.get().await });
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert_eq!(lazy.phase(), InitPhase::InProgress);
        drop(first);

        let second = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        second.block_on(async {
            let err = lazy.get().await.unwrap_err();
            assert!(matches!(err, InitError::Aborted(_)), "{:?}", err);
            assert_eq!(lazy.phase(), InitPhase::Failed);

            let handler = lazy.get().await.unwrap();
            assert_eq!(handler.build_no, 2);
            assert_eq!(lazy.phase(), InitPhase::Ready);
            assert_eq!(lazy.attempts(), 2);
            assert_eq!(builds.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn error_messages_are_descriptive() {
        let err = InitError::Build(Arc::new(
            anyhow::anyhow!("connection refused").context("connecting to database"),
        ));
        assert_eq!(
            err.to_string(),
            "connecting to database: connection refused"
        );
        assert_eq!(
            InitError::TimedOut(Duration::from_secs(30)).to_string(),
            "handler initialization timed out after 30s"
        );
    }
}
