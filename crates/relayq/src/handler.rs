use std::future::Future;

use async_trait::async_trait;

use relayq_core::Result;

use crate::request::Request;

/// Bytes optionally produced by a successful handler, stored on the
/// terminal record.
pub type HandlerOutput = Option<Vec<u8>>;

/// User code executed for each task of a queue.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request) -> Result<HandlerOutput>;
}

/// Adapter letting a plain async function subscribe as a handler.
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput>> + Send,
{
    async fn handle(&self, req: Request) -> Result<HandlerOutput> {
        (self.0)(req).await
    }
}
