use serde_json::Value;

use crate::error::Result;

/// Bidirectional bytes/value codec used for task records and payloads.
///
/// Implementations must guarantee that `loads(dumps(x))` yields a value
/// semantically equal to `x`.
pub trait Serializer: Send + Sync {
    /// Encode a value to bytes.
    fn dumps(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes back into a value.
    fn loads(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON codec, the default serializer.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
