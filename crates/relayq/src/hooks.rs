use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use relayq_core::Result;

use crate::request::Request;

/// User callback invoked at a lifecycle transition of a task.
///
/// A hook receives the request and returns the request the next stage
/// should see, so it can swap in an extended [`Context`].
///
/// [`Context`]: crate::request::Context
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, req: Request) -> Result<Request>;
}

/// Adapter letting a plain async function register as a hook.
pub struct HookFn<F>(pub F);

#[async_trait]
impl<F, Fut> Hook for HookFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Request>> + Send,
{
    async fn call(&self, req: Request) -> Result<Request> {
        (self.0)(req).await
    }
}

/// Hooks registered on one queue, in registration order.
#[derive(Default, Clone)]
pub(crate) struct HookSet {
    pub(crate) on_start: Vec<Arc<dyn Hook>>,
    pub(crate) on_complete: Vec<Arc<dyn Hook>>,
    pub(crate) on_success: Vec<Arc<dyn Hook>>,
    pub(crate) on_failure: Vec<Arc<dyn Hook>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use relayq_core::{JsonSerializer, Task};

    #[tokio::test]
    async fn test_hooks_extend_the_context_for_later_stages() {
        let first = HookFn(|req: Request| async move {
            let mut req = req;
            req.context = req.context.with_value("step", json!(1));
            Ok(req)
        });
        let second = HookFn(|req: Request| async move {
            // Sees what the first hook added.
            assert_eq!(req.context.get("step"), Some(&json!(1)));
            let mut req = req;
            req.context = req.context.with_value("step", json!(2));
            Ok(req)
        });

        let mut req = Request::new(
            Task::new("q", vec![]),
            Arc::new(JsonSerializer),
            CancellationToken::new(),
        );
        req = first.call(req).await.unwrap();
        req = second.call(req).await.unwrap();

        assert_eq!(req.context.get("step"), Some(&json!(2)));
    }
}
