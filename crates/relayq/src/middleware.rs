use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use relayq_core::Result;

use crate::handler::{Handler, HandlerOutput};
use crate::request::Request;

/// Cross-cutting wrapper around the handler.
///
/// Middlewares run in registration order, the first registered being the
/// outermost; each receives the request and the remainder of the pipeline
/// and may run code before and after it.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, req: Request, next: Next<'_>) -> Result<HandlerOutput>;
}

/// The remaining middlewares plus the terminal handler.
pub struct Next<'a> {
    pub(crate) middlewares: &'a [Arc<dyn Middleware>],
    pub(crate) handler: &'a Arc<dyn Handler>,
}

impl<'a> Next<'a> {
    /// Run the rest of the pipeline with the given request.
    pub fn run(self, req: Request) -> BoxFuture<'a, Result<HandlerOutput>> {
        match self.middlewares.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    middlewares: rest,
                    handler: self.handler,
                };
                middleware.call(req, next)
            }
            None => {
                let handler = Arc::clone(self.handler);
                Box::pin(async move { handler.handle(req).await })
            }
        }
    }
}

/// Middleware that traces every attempt with its outcome and duration.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn call(&self, req: Request, next: Next<'_>) -> Result<HandlerOutput> {
        let queue = req.task.name.clone();
        let id = req.task.id.clone();
        let attempt = req.task.attempts;
        debug!(queue = %queue, id = %id, attempt, "task attempt started");

        let started = Instant::now();
        let result = next.run(req).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => info!(queue = %queue, id = %id, attempt, ?elapsed, "task attempt finished"),
            Err(e) => {
                warn!(queue = %queue, id = %id, attempt, ?elapsed, error = %e, "task attempt errored")
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use relayq_core::{Error, JsonSerializer, Task};

    use crate::handler::HandlerFn;

    fn request() -> Request {
        Request::new(
            Task::new("q", vec![]),
            Arc::new(JsonSerializer),
            CancellationToken::new(),
        )
    }

    struct Recorder {
        label: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn call(&self, req: Request, next: Next<'_>) -> Result<HandlerOutput> {
            self.events.lock().push(format!("{}-before", self.label));
            let result = next.run(req).await;
            self.events.lock().push(format!("{}-after", self.label));
            result
        }
    }

    #[tokio::test]
    async fn test_middlewares_wrap_in_registration_order() {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let handler_events = events.clone();
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(move |_req: Request| {
            let events = handler_events.clone();
            async move {
                events.lock().push("handler".to_string());
                Ok(None)
            }
        }));

        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder {
                label: "outer",
                events: events.clone(),
            }),
            Arc::new(Recorder {
                label: "inner",
                events: events.clone(),
            }),
        ];

        let next = Next {
            middlewares: &middlewares,
            handler: &handler,
        };
        next.run(request()).await.unwrap();

        assert_eq!(
            *events.lock(),
            vec![
                "outer-before",
                "inner-before",
                "handler",
                "inner-after",
                "outer-after",
            ]
        );
    }

    struct Annotate;

    #[async_trait]
    impl Middleware for Annotate {
        async fn call(&self, mut req: Request, next: Next<'_>) -> Result<HandlerOutput> {
            req.context = req.context.with_value("seen", json!(true));
            next.run(req).await
        }
    }

    #[tokio::test]
    async fn test_middleware_context_reaches_handler() {
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(|req: Request| async move {
            assert_eq!(req.context.get("seen"), Some(&json!(true)));
            Ok(None)
        }));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(Annotate)];

        let next = Next {
            middlewares: &middlewares,
            handler: &handler,
        };
        next.run(request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_propagates_through_chain() {
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(|_req: Request| async move {
            Err(Error::Handler("boom".to_string()))
        }));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(LoggingMiddleware)];

        let next = Next {
            middlewares: &middlewares,
            handler: &handler,
        };
        let err = next.run(request()).await.unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
    }
}
