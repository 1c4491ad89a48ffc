//! Running work under a query's tracking context.
//!
//! The active tracker is thread-local, so whoever moves work onto a thread must
//! move the context with it. [`run_tracked`] fans closures out over scoped
//! worker threads, [`spawn_tracked`] hands one closure to a new thread, and
//! [`Tracked`] re-enters the context on every poll of a future (a task can be
//! polled by a different runtime worker each time).
//!
//! All of them drain the violation parked by the allocation hook after each
//! piece of work and report it as an error.
//!
//! Only the work itself runs with the context entered. The runners' own
//! bookkeeping (result vectors, the boxed future) is either untracked or
//! allocated and released under the same context, so a finished run leaves
//! nothing charged to the query.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread;

use memtrack_core::budget::BudgetExceeded;
use memtrack_mem::context::{check_budget, clear_pending};
use memtrack_mem::TaskContext;

use crate::error::ExecError;

type TaskResult<T> = Result<T, ExecError>;

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_one<T>(task: impl FnOnce() -> TaskResult<T>) -> TaskResult<T> {
    let out = task()?;
    check_budget()?;
    Ok(out)
}

/// Run `tasks` on at most `workers` scoped threads, each with `ctx` entered.
///
/// Results come back in task order. The first error (in task order) is
/// returned; a worker stops taking new tasks after its own task failed.
pub fn run_tracked<T, F>(ctx: &TaskContext, workers: usize, tasks: Vec<F>) -> TaskResult<Vec<T>>
where
    T: Send,
    F: FnOnce() -> TaskResult<T> + Send,
{
    let total = tasks.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let workers = workers.clamp(1, total);
    let queue = Mutex::new(tasks.into_iter().enumerate());

    let per_worker: Vec<thread::Result<Vec<(usize, TaskResult<T>)>>> = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let queue = &queue;
                s.spawn(move || {
                    clear_pending();
                    let mut done = Vec::new();
                    loop {
                        let next = queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .next();
                        let Some((idx, task)) = next else { break };
                        let result = ctx.scope(|| run_one(task));
                        let failed = result.is_err();
                        done.push((idx, result));
                        if failed {
                            break;
                        }
                    }
                    done
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });

    let mut slots: Vec<Option<TaskResult<T>>> = (0..total).map(|_| None).collect();
    for worker in per_worker {
        let done = worker.map_err(|p| ExecError::WorkerPanicked(panic_message(p)))?;
        for (idx, result) in done {
            slots[idx] = Some(result);
        }
    }

    let mut out = Vec::with_capacity(total);
    for slot in slots {
        match slot {
            Some(Ok(v)) => out.push(v),
            Some(Err(e)) => return Err(e),
            // Skipped because an earlier task on that worker failed; that
            // failure is reported instead, since it has a lower index.
            None => continue,
        }
    }
    Ok(out)
}

/// Run `f` on a new thread with `ctx` entered.
pub fn spawn_tracked<T, F>(ctx: TaskContext, f: F) -> thread::JoinHandle<TaskResult<T>>
where
    T: Send + 'static,
    F: FnOnce() -> TaskResult<T> + Send + 'static,
{
    thread::spawn(move || {
        clear_pending();
        ctx.scope(|| run_one(f))
    })
}

/// A future that runs with a tracking context entered during every poll.
///
/// Resolves to `Err` as soon as a budget violation is observed after a poll.
/// The inner future is boxed, polled and dropped with the context entered, so
/// whatever it frees on the way out is credited to the same tracker.
pub struct Tracked<F> {
    inner: Option<Pin<Box<F>>>,
    ctx: TaskContext,
}

impl<F: Future> Tracked<F> {
    pub fn new(ctx: TaskContext, fut: F) -> Self {
        let inner = ctx.scope(|| Box::pin(fut));
        Self {
            inner: Some(inner),
            ctx,
        }
    }
}

impl<F: Future> Future for Tracked<F> {
    type Output = Result<F::Output, BudgetExceeded>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let _guard = this.ctx.enter();
        // Whatever is parked here was left by other work on this thread.
        clear_pending();

        let polled = match this.inner.as_mut() {
            Some(inner) => inner.as_mut().poll(cx),
            None => panic!("`Tracked` polled after completion"),
        };
        if let Err(err) = check_budget() {
            this.inner = None;
            return Poll::Ready(Err(err));
        }
        if polled.is_ready() {
            this.inner = None;
        }
        polled.map(Ok)
    }
}

impl<F> Drop for Tracked<F> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _guard = self.ctx.enter();
            drop(inner);
        }
    }
}

/// Spawn `fut` on the current tokio runtime with `ctx` entered on every poll.
#[cfg(feature = "async-scheduler")]
pub fn spawn_tracked_async<F>(
    ctx: TaskContext,
    fut: F,
) -> tokio::task::JoinHandle<Result<F::Output, BudgetExceeded>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(Tracked::new(ctx, fut))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use memtrack_mem::context::current;
    use memtrack_mem::Tracker;

    fn tracked(limit: i64) -> (Arc<Tracker>, TaskContext) {
        let mut t = Tracker::with_limit(limit);
        t.set_metric(None);
        t.set_log_peak_on_drop(false);
        let t = Arc::new(t);
        (Arc::clone(&t), TaskContext::new(t))
    }

    #[test]
    fn workers_see_the_context() {
        let (tracker, ctx) = tracked(0);
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                move || -> TaskResult<i64> {
                    let t = current().expect("context entered");
                    t.alloc(i)?;
                    Ok(i)
                }
            })
            .collect();

        let out = run_tracked(&ctx, 4, tasks).unwrap();
        assert_eq!(out, (0..16).collect::<Vec<i64>>());
        assert_eq!(tracker.get(), (0..16).sum::<i64>());
        // The calling thread's context is untouched.
        assert!(current().is_none());
    }

    #[test]
    fn first_budget_error_is_reported() {
        let (tracker, ctx) = tracked(100);
        let tasks: Vec<Box<dyn FnOnce() -> TaskResult<()> + Send>> = vec![
            Box::new(|| -> TaskResult<()> { Ok(()) }),
            Box::new(|| -> TaskResult<()> {
                current().unwrap().alloc(500)?;
                Ok(())
            }),
        ];

        let err = run_tracked(&ctx, 2, tasks).unwrap_err();
        let budget = err.as_budget().expect("budget error");
        assert_eq!(budget.amount, 500);
        tracker.free(500);
    }

    #[test]
    fn worker_panic_is_an_error() {
        let (_tracker, ctx) = tracked(0);
        let tasks: Vec<Box<dyn FnOnce() -> TaskResult<()> + Send>> =
            vec![Box::new(|| -> TaskResult<()> { panic!("worker blew up") })];
        match run_tracked(&ctx, 1, tasks) {
            Err(ExecError::WorkerPanicked(msg)) => assert!(msg.contains("blew up")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_task_list() {
        let ctx = TaskContext::untracked();
        let tasks: Vec<fn() -> TaskResult<()>> = Vec::new();
        assert!(run_tracked(&ctx, 8, tasks).unwrap().is_empty());
    }

    #[test]
    fn spawned_thread_carries_context() {
        let (tracker, ctx) = tracked(0);
        let handle = spawn_tracked(ctx, || -> TaskResult<()> {
            current().unwrap().alloc(42)?;
            Ok(())
        });
        handle.join().unwrap().unwrap();
        assert_eq!(tracker.get(), 42);
    }

    #[test]
    fn tracked_future_enters_context_on_poll() {
        let (tracker, ctx) = tracked(0);
        let fut = Tracked::new(ctx, async {
            current().unwrap().alloc(7).unwrap();
            current().is_some()
        });
        assert_eq!(futures::executor::block_on(fut), Ok(true));
        assert_eq!(tracker.get(), 7);
        assert!(current().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tracked_future_on_tokio() {
        let (tracker, ctx) = tracked(0);
        let handle = tokio::spawn(Tracked::new(ctx, async {
            for _ in 0..4 {
                current().unwrap().alloc(10).unwrap();
                tokio::task::yield_now().await;
            }
        }));
        handle.await.unwrap().unwrap();
        assert_eq!(tracker.get(), 40);
    }
}
