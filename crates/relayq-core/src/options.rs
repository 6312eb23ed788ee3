use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::task::{default_retry_intervals, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT, DEFAULT_TTL};

/// Per-publish options. Unset fields fall back to queue, then engine,
/// then built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub id: Option<String>,
    pub eta: Option<DateTime<Utc>>,
    pub countdown: Option<Duration>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_intervals: Option<Vec<Duration>>,
    pub ttl: Option<Duration>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.retry_intervals = Some(intervals);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Resolve `eta`/`countdown` into an absolute execution time.
    ///
    /// Setting both is a configuration error.
    pub fn resolve_eta(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match (self.eta, self.countdown) {
            (Some(_), Some(_)) => Err(Error::Config(
                "eta and countdown are mutually exclusive".to_string(),
            )),
            (Some(eta), None) => Ok(Some(eta)),
            (None, Some(countdown)) => {
                let delta = chrono::Duration::from_std(countdown)
                    .map_err(|e| Error::Config(format!("countdown out of range: {}", e)))?;
                Ok(Some(now + delta))
            }
            (None, None) => Ok(None),
        }
    }
}

/// Per-queue options, merged over the engine defaults at queue creation.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_intervals: Option<Vec<Duration>>,
    pub ttl: Option<Duration>,
    /// Number of parallel workers for this queue.
    pub concurrency: Option<usize>,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.retry_intervals = Some(intervals);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

/// Fully-resolved execution options after task > queue > engine layering.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_intervals: Vec<Duration>,
    pub ttl: Duration,
}

impl Default for EffectiveOptions {
    fn default() -> Self {
        EffectiveOptions {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_intervals: default_retry_intervals(),
            ttl: DEFAULT_TTL,
        }
    }
}

impl EffectiveOptions {
    /// Layer queue-level overrides on top of these defaults.
    pub fn merge_queue(&self, opts: &QueueOptions) -> EffectiveOptions {
        EffectiveOptions {
            timeout: opts.timeout.unwrap_or(self.timeout),
            max_retries: opts.max_retries.unwrap_or(self.max_retries),
            retry_intervals: opts
                .retry_intervals
                .clone()
                .unwrap_or_else(|| self.retry_intervals.clone()),
            ttl: opts.ttl.unwrap_or(self.ttl),
        }
    }

    /// Layer publish-time overrides on top of the queue options.
    pub fn merge_publish(&self, opts: &PublishOptions) -> EffectiveOptions {
        EffectiveOptions {
            timeout: opts.timeout.unwrap_or(self.timeout),
            max_retries: opts.max_retries.unwrap_or(self.max_retries),
            retry_intervals: opts
                .retry_intervals
                .clone()
                .unwrap_or_else(|| self.retry_intervals.clone()),
            ttl: opts.ttl.unwrap_or(self.ttl),
        }
    }
}
