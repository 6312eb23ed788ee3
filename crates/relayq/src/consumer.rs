use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relayq_broker::{Broker, Delivery};
use relayq_core::{Error, Result, Task};

use crate::hooks::Hook;
use crate::middleware::Next;
use crate::queue::Queue;
use crate::request::Request;

/// How long a cancelled pipeline gets to unwind before its future is
/// dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Join handles for one queue's dispatch loop and worker pool.
pub(crate) struct ConsumerHandle {
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Wait for the dispatch loop and every worker to finish draining.
    pub(crate) async fn join(self) {
        let _ = self.dispatcher.await;
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Per-queue consumer: a single dispatch loop owning the broker consume
/// call, feeding `concurrency` workers through a bounded hand-off.
pub(crate) struct Consumer;

impl Consumer {
    pub(crate) fn start(
        queue: Arc<Queue>,
        broker: Arc<dyn Broker>,
        poll_timeout: Duration,
        error_backoff: Duration,
        shutdown: CancellationToken,
    ) -> ConsumerHandle {
        let concurrency = queue.concurrency().max(1);
        let (tx, rx) = mpsc::channel::<Delivery>(concurrency);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..concurrency)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let rx = Arc::clone(&rx);
                let shutdown = shutdown.clone();
                tokio::spawn(worker_loop(worker_id, queue, rx, shutdown))
            })
            .collect();

        let dispatcher = tokio::spawn(dispatch_loop(
            queue,
            broker,
            tx,
            poll_timeout,
            error_backoff,
            shutdown,
        ));

        ConsumerHandle {
            dispatcher,
            workers,
        }
    }
}

/// Pulls task ids off the broker and hands them to workers. The send
/// blocks once every worker is busy, so no further pop happens until a
/// slot frees up.
async fn dispatch_loop(
    queue: Arc<Queue>,
    broker: Arc<dyn Broker>,
    tx: mpsc::Sender<Delivery>,
    poll_timeout: Duration,
    error_backoff: Duration,
    shutdown: CancellationToken,
) {
    let names = vec![queue.name().to_string()];

    loop {
        let deliveries = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = broker.consume(&names, poll_timeout) => match result {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    warn!(queue = %queue.name(), error = %e, "consume failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(error_backoff) => {}
                    }
                    continue;
                }
            },
        };

        for delivery in deliveries {
            if tx.send(delivery).await.is_err() {
                return;
            }
        }
    }

    debug!(queue = %queue.name(), "dispatcher stopped");
    // Dropping the sender lets workers finish the queued hand-offs and
    // exit.
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Queue>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery>>>,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(delivery) = delivery else { break };
        process_delivery(&queue, delivery, &shutdown).await;
    }
    debug!(queue = %queue.name(), worker = worker_id, "worker stopped");
}

/// Run one dequeued task through hooks, middlewares, and the handler,
/// then write back the outcome.
async fn process_delivery(queue: &Arc<Queue>, delivery: Delivery, shutdown: &CancellationToken) {
    let mut task = match queue.decode(&delivery.data) {
        Ok(task) => task,
        Err(e) => {
            // Corrupt records are terminal: fail them, never retry.
            error!(
                queue = %delivery.queue,
                id = %delivery.id,
                error = %e,
                "cannot decode task record"
            );
            store_corrupt(queue, &delivery, &e).await;
            return;
        }
    };

    if task.status.is_terminal() {
        // Canceled (or otherwise finalized) between consume and execute.
        debug!(
            queue = %task.name,
            id = %task.id,
            status = task.status.as_str(),
            "skipping finalized task"
        );
        finalize(queue, &mut task, None).await;
        return;
    }

    task.mark_processing();
    let timeout = task.timeout;
    let started = Instant::now();
    let cancellation = CancellationToken::new();
    let mut req = Request::new(task.clone(), queue.serializer(), cancellation.clone());

    let hooks = queue.hooks();
    let outcome = match run_hooks(&hooks.on_start, &mut req, true).await {
        Err(e) => Err(e),
        Ok(()) => match queue.handler() {
            None => Err(Error::Handler("no handler subscribed".to_string())),
            Some(handler) => {
                let middlewares = queue.middlewares();
                let next = Next {
                    middlewares: &middlewares,
                    handler: &handler,
                };
                let pipeline = next.run(req.clone());
                tokio::pin!(pipeline);
                tokio::select! {
                    result = &mut pipeline => result,
                    _ = tokio::time::sleep(timeout) => {
                        // Deadline passed: cancel the token and keep
                        // polling so a handler selecting on it can take
                        // its cancellation branch and unwind. The attempt
                        // is a timeout either way.
                        cancellation.cancel();
                        match tokio::time::timeout(CANCEL_GRACE, &mut pipeline).await {
                            Ok(result) => {
                                debug!(
                                    queue = %task.name,
                                    id = %task.id,
                                    returned_ok = result.is_ok(),
                                    "pipeline unwound after cancellation"
                                );
                            }
                            Err(_) => {
                                warn!(
                                    queue = %task.name,
                                    id = %task.id,
                                    "pipeline ignored cancellation, dropping it"
                                );
                            }
                        }
                        Err(Error::Timeout(timeout))
                    }
                }
            }
        },
    };

    let exec_time = started.elapsed().as_secs_f64();

    match outcome {
        Ok(result) => {
            task.mark_succeeded(result, exec_time);
            req.task = task.clone();
            run_hooks_logged(&hooks.on_success, &mut req).await;
            finalize(queue, &mut task, Some(&mut req)).await;
            info!(queue = %task.name, id = %task.id, exec_time, "task succeeded");
        }
        Err(e) => {
            task.record_failure(e.to_string(), exec_time);

            // Failures during shutdown are finalized, not re-published.
            if task.can_retry() && !shutdown.is_cancelled() {
                let delay = task.retry_delay();
                let eta = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                task.schedule_retry(eta);
                req.task = task.clone();
                run_hooks_logged(&hooks.on_failure, &mut req).await;

                match queue.republish(&task).await {
                    Ok(()) => {
                        debug!(
                            queue = %task.name,
                            id = %task.id,
                            attempt = task.attempts,
                            ?delay,
                            error = %e,
                            "attempt failed, retry scheduled"
                        );
                    }
                    Err(republish_err) => {
                        // The task would be lost otherwise; fail it so the
                        // record at least tells the story.
                        error!(
                            queue = %task.name,
                            id = %task.id,
                            error = %republish_err,
                            "cannot schedule retry"
                        );
                        task.mark_failed();
                        finalize(queue, &mut task, Some(&mut req)).await;
                    }
                }
            } else {
                task.mark_failed();
                req.task = task.clone();
                run_hooks_logged(&hooks.on_failure, &mut req).await;
                finalize(queue, &mut task, Some(&mut req)).await;
                warn!(
                    queue = %task.name,
                    id = %task.id,
                    attempts = task.attempts,
                    error = %e,
                    "task failed permanently"
                );
            }
        }
    }
}

/// Run the completion hooks, then write the terminal record with its TTL
/// so inspectors can still read it.
async fn finalize(queue: &Arc<Queue>, task: &mut Task, req: Option<&mut Request>) {
    let hooks = queue.hooks();
    match req {
        Some(req) => {
            req.task = task.clone();
            run_hooks_logged(&hooks.on_complete, req).await;
        }
        None => {
            let mut req = Request::new(task.clone(), queue.serializer(), CancellationToken::new());
            run_hooks_logged(&hooks.on_complete, &mut req).await;
        }
    }

    if let Err(e) = queue.store(task).await {
        error!(queue = %task.name, id = %task.id, error = %e, "cannot store terminal record");
    }
}

/// Write a terminal failed record for bytes that would not decode.
async fn store_corrupt(queue: &Arc<Queue>, delivery: &Delivery, cause: &Error) {
    let mut task = Task::new(&delivery.queue, Vec::new());
    task.id = delivery.id.clone();
    task.ttl = queue.ttl();
    task.record_failure(format!("undecodable task record: {}", cause), 0.0);
    task.mark_failed();
    if let Err(e) = queue.store(&task).await {
        error!(queue = %delivery.queue, id = %delivery.id, error = %e, "cannot store corrupt-record failure");
    }
}

/// Run hooks in registration order. With `abort_on_error` a failing hook
/// stops the chain; otherwise failures are logged and skipped.
async fn run_hooks(hooks: &[Arc<dyn Hook>], req: &mut Request, abort_on_error: bool) -> Result<()> {
    for hook in hooks {
        match hook.call(req.clone()).await {
            Ok(updated) => *req = updated,
            Err(e) if abort_on_error => {
                return Err(Error::Handler(format!("start hook failed: {}", e)));
            }
            Err(e) => warn!(queue = %req.task.name, id = %req.task.id, error = %e, "event hook failed"),
        }
    }
    Ok(())
}

async fn run_hooks_logged(hooks: &[Arc<dyn Hook>], req: &mut Request) {
    // Hook failures outside on_start never affect the task outcome.
    let _ = run_hooks(hooks, req, false).await;
}
