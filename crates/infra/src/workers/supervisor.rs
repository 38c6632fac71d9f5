use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::duration_ms;

/// What the supervisor does when its task ends abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Log the failure and stop.
    Never,
    /// Restart after `backoff`, at most `max_restarts` times.
    OnFailure {
        max_restarts: u32,
        #[serde(with = "duration_ms")]
        backoff: Duration,
    },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::OnFailure {
            max_restarts: 10,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Stands in for the stack trace of a panic the hook did not see.
pub const NO_BACKTRACE: &str = "<no backtrace captured>";

/// How one run of a supervised task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    Completed,
    Failed(String),
    Panicked { message: String, backtrace: String },
}

impl TaskExit {
    fn from_join<E: core::fmt::Display>(
        res: Result<Result<Result<(), E>, TaskPanic>, JoinError>,
    ) -> Self {
        match res {
            Ok(Ok(Ok(()))) => Self::Completed,
            Ok(Ok(Err(err))) => Self::Failed(err.to_string()),
            Ok(Err(panic)) => Self::Panicked {
                message: panic.message,
                backtrace: panic.backtrace,
            },
            // panicked outside of a poll, e.g. while dropping
            Err(err) if err.is_panic() => Self::Panicked {
                message: panic_message(err.into_panic().as_ref()),
                backtrace: NO_BACKTRACE.to_string(),
            },
            // aborted from outside
            Err(_) => Self::Completed,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

thread_local! {
    /// Set while a supervised task is being polled on this thread.
    static SUPERVISED: Cell<bool> = const { Cell::new(false) };
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// Chain a panic hook that records the stack trace of panics raised inside
/// supervised tasks. Other panics go straight to the previous hook.
fn install_backtrace_hook() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if SUPERVISED.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

struct TaskPanic {
    message: String,
    backtrace: String,
}

/// Polls the task inside `catch_unwind`, so a panic is turned into a value on
/// the thread that raised it, next to the backtrace the hook recorded.
struct CatchPanic<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for CatchPanic<F> {
    type Output = Result<F::Output, TaskPanic>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        let outer = SUPERVISED.with(|flag| flag.replace(true));
        let res = panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx)));
        SUPERVISED.with(|flag| flag.set(outer));

        match res {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => {
                let backtrace = LAST_BACKTRACE
                    .with(|slot| slot.borrow_mut().take())
                    .unwrap_or_else(|| NO_BACKTRACE.to_string());
                Poll::Ready(Err(TaskPanic {
                    message: panic_message(payload.as_ref()),
                    backtrace,
                }))
            }
        }
    }
}

/// Final state of a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    pub restarts: u32,
    pub last_exit: TaskExit,
}

/// Handle to control and join a supervised task.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: Option<JoinHandle<SupervisorReport>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(mut self) -> Option<SupervisorReport> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the supervisor to stop on its own.
    pub async fn join(&mut self) -> Option<SupervisorReport> {
        match self.join.take() {
            Some(j) => j.await.ok(),
            None => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }
}

/// Owns a task's lifecycle: spawns it, observes how it ended and restarts it
/// according to a [`RestartPolicy`].
///
/// The task receives the shutdown token and is expected to return `Ok(())`
/// once it is cancelled. Errors and panics both count as failures.
#[derive(Debug)]
pub struct Supervisor;

impl Supervisor {
    pub fn spawn<F, Fut, E>(
        name: impl Into<String>,
        policy: RestartPolicy,
        shutdown: CancellationToken,
        mut factory: F,
    ) -> WorkerHandle
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let token = shutdown.clone();
        install_backtrace_hook();

        let join = tokio::spawn(async move {
            let mut restarts = 0u32;
            loop {
                let run = CatchPanic {
                    inner: Box::pin(factory(token.clone())),
                };
                let exit = TaskExit::from_join(tokio::spawn(run).await);

                match &exit {
                    TaskExit::Completed => {
                        info!(task = %name, restarts, "supervised task stopped");
                    }
                    TaskExit::Failed(err) => {
                        error!(task = %name, restarts, error = %err, "supervised task failed");
                    }
                    TaskExit::Panicked { message, backtrace } => {
                        error!(
                            task = %name,
                            restarts,
                            panic = %message,
                            backtrace = %backtrace,
                            "supervised task panicked"
                        );
                    }
                }

                if !exit.is_failure() || token.is_cancelled() {
                    return SupervisorReport { restarts, last_exit: exit };
                }

                let backoff = match &policy {
                    RestartPolicy::Never => {
                        return SupervisorReport { restarts, last_exit: exit };
                    }
                    RestartPolicy::OnFailure { max_restarts, backoff } => {
                        if restarts >= *max_restarts {
                            warn!(task = %name, restarts, "restart limit reached, giving up");
                            return SupervisorReport { restarts, last_exit: exit };
                        }
                        *backoff
                    }
                };

                tokio::select! {
                    _ = token.cancelled() => {
                        return SupervisorReport { restarts, last_exit: exit };
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                restarts += 1;
            }
        });

        WorkerHandle {
            shutdown,
            join: Some(join),
        }
    }
}
