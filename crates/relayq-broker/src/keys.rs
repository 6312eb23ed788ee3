//! Reference key layout shared by every driver.
//!
//! - `{queue}`: list of task ids, tail-pushed on publish, head-popped on
//!   consume.
//! - `{queue}:delay`: sorted set of task ids scored by eta in
//!   unix-milliseconds.
//! - `{queue}:task:{id}`: the serialized task record.

/// Key of the live list for a queue.
pub fn live(queue: &str) -> String {
    queue.to_string()
}

/// Key of the delayed sorted set for a queue.
pub fn delay(queue: &str) -> String {
    format!("{}:delay", queue)
}

/// Key of a task record.
pub fn task(queue: &str, id: &str) -> String {
    format!("{}:task:{}", queue, id)
}
