use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use relayq_core::{Result, Serializer, Task};

/// Immutable key/value annotations attached to one execution.
///
/// Hooks extend the context by building a new one with [`with_value`];
/// later hooks and the handler read the latest. Earlier snapshots are
/// never mutated.
///
/// [`with_value`]: Context::with_value
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<HashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new context carrying the extra entry.
    pub fn with_value(&self, key: impl Into<String>, value: Value) -> Context {
        let mut values: HashMap<String, Value> = (*self.values).clone();
        values.insert(key.into(), value);
        Context {
            values: Arc::new(values),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One handler invocation: the task being executed, its context, and the
/// cancellation signal tied to the per-attempt deadline.
#[derive(Clone)]
pub struct Request {
    pub task: Task,
    pub context: Context,
    serializer: Arc<dyn Serializer>,
    cancellation: CancellationToken,
}

impl Request {
    pub(crate) fn new(
        task: Task,
        serializer: Arc<dyn Serializer>,
        cancellation: CancellationToken,
    ) -> Self {
        Request {
            task,
            context: Context::new(),
            serializer,
            cancellation,
        }
    }

    /// Deserialize the task payload into a concrete type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.serializer.loads(&self.task.payload)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Cancelled when the attempt deadline passes; handlers doing long
    /// work should select against it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
