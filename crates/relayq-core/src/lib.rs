mod error;
mod options;
mod serializer;
mod task;

pub use error::{Error, Result};
pub use options::{EffectiveOptions, PublishOptions, QueueOptions};
pub use serializer::{JsonSerializer, Serializer};
pub use task::{Task, TaskStatus};

pub use task::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT, DEFAULT_TTL};
