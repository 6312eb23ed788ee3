use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relayq_core::{Error, Result};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{keys, Broker, Delivery, QueueStats};

/// One value in the keyspace, mirroring the primitives a remote store
/// provides.
enum Entry {
    List(VecDeque<String>),
    ZSet(BTreeSet<(i64, String)>),
    Record {
        data: Vec<u8>,
        expires_at: Option<Instant>,
    },
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn list_mut(&mut self, key: &str) -> &mut VecDeque<String> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()));
        match entry {
            Entry::List(list) => list,
            _ => unreachable!("key type is fixed by the layout"),
        }
    }

    fn zset_mut(&mut self, key: &str) -> &mut BTreeSet<(i64, String)> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::ZSet(BTreeSet::new()));
        match entry {
            Entry::ZSet(set) => set,
            _ => unreachable!("key type is fixed by the layout"),
        }
    }

    fn list_len(&self, key: &str) -> usize {
        match self.entries.get(key) {
            Some(Entry::List(list)) => list.len(),
            _ => 0,
        }
    }

    fn zset_len(&self, key: &str) -> usize {
        match self.entries.get(key) {
            Some(Entry::ZSet(set)) => set.len(),
            _ => 0,
        }
    }

    /// Read a record, expiring it lazily the way a remote store would.
    fn record(&mut self, key: &str) -> Option<Vec<u8>> {
        match self.entries.get(key) {
            Some(Entry::Record { data, expires_at }) => {
                if expires_at.map(|at| at <= Instant::now()).unwrap_or(false) {
                    self.entries.remove(key);
                    None
                } else {
                    Some(data.clone())
                }
            }
            _ => None,
        }
    }

    fn put_record(&mut self, key: &str, data: Vec<u8>, expires_at: Option<Instant>) {
        self.entries
            .insert(key.to_string(), Entry::Record { data, expires_at });
    }

    fn remove_id(&mut self, queue: &str, id: &str) {
        let list = self.list_mut(&keys::live(queue));
        list.retain(|entry| entry != id);

        let zset = self.zset_mut(&keys::delay(queue));
        zset.retain(|(_, entry)| entry != id);
    }
}

/// In-process broker implementing the reference key layout.
///
/// Every multi-key operation runs under a single lock, which gives the
/// same atomicity a remote store's server-side scripts provide. Intended
/// for tests and single-process deployments; production drivers implement
/// [`Broker`] against a remote store using the same layout.
pub struct MemoryBroker {
    keyspace: Mutex<Keyspace>,
    ready: Notify,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            keyspace: Mutex::new(Keyspace::default()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Broker("broker is closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Pop the next id with a live record off one queue.
    fn try_pop(keyspace: &mut Keyspace, queue: &str) -> Option<Delivery> {
        loop {
            let id = keyspace.list_mut(&keys::live(queue)).pop_front()?;
            // Ids whose record was deleted out from under them are dropped.
            if let Some(data) = keyspace.record(&keys::task(queue, &id)) {
                return Some(Delivery {
                    queue: queue.to_string(),
                    id,
                    data,
                });
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn initialize(&self) -> Result<()> {
        self.check_open()
    }

    async fn ping(&self) -> Result<()> {
        self.check_open()
    }

    async fn publish(
        &self,
        queue: &str,
        id: &str,
        data: &[u8],
        eta: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check_open()?;
        let now = Utc::now();
        {
            let mut keyspace = self.keyspace.lock();
            keyspace.put_record(&keys::task(queue, id), data.to_vec(), None);
            match eta {
                Some(eta) if eta > now => {
                    keyspace
                        .zset_mut(&keys::delay(queue))
                        .insert((eta.timestamp_millis(), id.to_string()));
                }
                _ => {
                    keyspace.list_mut(&keys::live(queue)).push_back(id.to_string());
                }
            }
        }
        self.ready.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queues: &[String], timeout: Duration) -> Result<Vec<Delivery>> {
        self.check_open()?;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a publish racing with
            // the check cannot be missed.
            notified.as_mut().enable();

            {
                let mut keyspace = self.keyspace.lock();
                let deliveries: Vec<Delivery> = queues
                    .iter()
                    .filter_map(|queue| Self::try_pop(&mut keyspace, queue))
                    .collect();
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
            }

            tokio::select! {
                _ = &mut notified => {
                    self.check_open()?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(Vec::new());
                }
            }
        }
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let mut keyspace = self.keyspace.lock();
        Ok(keyspace.record(&keys::task(queue, id)))
    }

    async fn delete(&self, queue: &str, id: &str) -> Result<()> {
        self.check_open()?;
        let mut keyspace = self.keyspace.lock();
        keyspace.entries.remove(&keys::task(queue, id));
        keyspace.remove_id(queue, id);
        Ok(())
    }

    async fn set(&self, queue: &str, id: &str, data: &[u8], ttl: Duration) -> Result<()> {
        self.check_open()?;
        let mut keyspace = self.keyspace.lock();
        keyspace.put_record(&keys::task(queue, id), data.to_vec(), Some(Instant::now() + ttl));
        Ok(())
    }

    async fn empty(&self, queue: &str) -> Result<()> {
        self.check_open()?;
        let mut keyspace = self.keyspace.lock();
        keyspace.entries.remove(&keys::live(queue));
        keyspace.entries.remove(&keys::delay(queue));
        Ok(())
    }

    async fn count(&self, queue: &str) -> Result<QueueStats> {
        self.check_open()?;
        let keyspace = self.keyspace.lock();
        Ok(QueueStats {
            direct: keyspace.list_len(&keys::live(queue)),
            delayed: keyspace.zset_len(&keys::delay(queue)),
        })
    }

    async fn list(&self, queue: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let keyspace = self.keyspace.lock();
        match keyspace.entries.get(&keys::live(queue)) {
            Some(Entry::List(list)) => Ok(list.iter().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn cancel(&self, queue: &str, id: &str) -> Result<()> {
        self.check_open()?;
        let mut keyspace = self.keyspace.lock();
        keyspace.remove_id(queue, id);
        Ok(())
    }

    async fn promote_delayed(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.check_open()?;
        let promoted = {
            let mut keyspace = self.keyspace.lock();
            let cutoff = now.timestamp_millis();

            let zset = keyspace.zset_mut(&keys::delay(queue));
            let due: Vec<(i64, String)> = zset
                .iter()
                .take_while(|(score, _)| *score <= cutoff)
                .cloned()
                .collect();
            for entry in &due {
                zset.remove(entry);
            }

            let list = keyspace.list_mut(&keys::live(queue));
            let ids: Vec<String> = due.into_iter().map(|(_, id)| id).collect();
            for id in &ids {
                list.push_back(id.clone());
            }
            ids
        };
        if !promoted.is_empty() {
            self.ready.notify_waiters();
        }
        Ok(promoted)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn broker() -> MemoryBroker {
        MemoryBroker::new()
    }

    #[tokio::test]
    async fn test_publish_immediate_goes_live() {
        let broker = broker();
        broker.publish("q", "t1", b"data", None).await.unwrap();

        let stats = broker.count("q").await.unwrap();
        assert_eq!(stats.direct, 1);
        assert_eq!(stats.delayed, 0);
        assert_eq!(stats.total(), 1);
        assert_eq!(broker.list("q").await.unwrap(), vec!["t1".to_string()]);
        assert_eq!(broker.get("q", "t1").await.unwrap(), Some(b"data".to_vec()));
    }

    #[tokio::test]
    async fn test_publish_future_eta_goes_delayed() {
        let broker = broker();
        let eta = Utc::now() + chrono::Duration::seconds(60);
        broker.publish("q", "t1", b"data", Some(eta)).await.unwrap();

        let stats = broker.count("q").await.unwrap();
        assert_eq!(stats.direct, 0);
        assert_eq!(stats.delayed, 1);
        assert!(broker.list("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_past_eta_goes_live() {
        let broker = broker();
        let eta = Utc::now() - chrono::Duration::seconds(60);
        broker.publish("q", "t1", b"data", Some(eta)).await.unwrap();

        let stats = broker.count("q").await.unwrap();
        assert_eq!(stats.direct, 1);
        assert_eq!(stats.delayed, 0);
    }

    #[tokio::test]
    async fn test_consume_fifo_order() {
        let broker = broker();
        broker.publish("q", "t1", b"1", None).await.unwrap();
        broker.publish("q", "t2", b"2", None).await.unwrap();

        let queues = vec!["q".to_string()];
        let first = broker.consume(&queues, Duration::from_millis(10)).await.unwrap();
        let second = broker.consume(&queues, Duration::from_millis(10)).await.unwrap();

        assert_eq!(first[0].id, "t1");
        assert_eq!(second[0].id, "t2");
    }

    #[tokio::test]
    async fn test_consume_round_robin_across_queues() {
        let broker = broker();
        broker.publish("a", "t1", b"1", None).await.unwrap();
        broker.publish("b", "t2", b"2", None).await.unwrap();

        let queues = vec!["a".to_string(), "b".to_string()];
        let deliveries = broker.consume(&queues, Duration::from_millis(10)).await.unwrap();

        // One item dequeued from each queue in a single pass.
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].queue, "a");
        assert_eq!(deliveries[1].queue, "b");
    }

    #[tokio::test]
    async fn test_consume_times_out_empty() {
        let broker = broker();
        let queues = vec!["q".to_string()];

        let start = std::time::Instant::now();
        let deliveries = broker.consume(&queues, Duration::from_millis(30)).await.unwrap();

        assert!(deliveries.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_consume_wakes_on_publish() {
        let broker = Arc::new(broker());
        let consumer = broker.clone();

        let handle = tokio::spawn(async move {
            consumer
                .consume(&["q".to_string()], Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish("q", "t1", b"data", None).await.unwrap();

        let deliveries = handle.await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].id, "t1");
    }

    #[tokio::test]
    async fn test_consume_skips_deleted_records() {
        let broker = broker();
        broker.publish("q", "t1", b"1", None).await.unwrap();
        broker.publish("q", "t2", b"2", None).await.unwrap();

        // Remove t1's record but leave its id on the live list.
        {
            let mut keyspace = broker.keyspace.lock();
            keyspace.entries.remove(&keys::task("q", "t1"));
        }

        let deliveries = broker
            .consume(&["q".to_string()], Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(deliveries[0].id, "t2");
    }

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let broker = broker();
        broker.publish("q", "t1", b"1", None).await.unwrap();
        broker.delete("q", "t1").await.unwrap();

        assert_eq!(broker.count("q").await.unwrap().total(), 0);
        assert!(broker.get("q", "t1").await.unwrap().is_none());

        // Idempotent.
        broker.delete("q", "t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_keeps_record() {
        let broker = broker();
        let eta = Utc::now() + chrono::Duration::seconds(60);
        broker.publish("q", "t1", b"1", Some(eta)).await.unwrap();
        broker.publish("q", "t2", b"2", None).await.unwrap();

        broker.cancel("q", "t1").await.unwrap();
        broker.cancel("q", "t2").await.unwrap();

        let stats = broker.count("q").await.unwrap();
        assert_eq!(stats.total(), 0);
        // Metadata survives for inspection.
        assert!(broker.get("q", "t1").await.unwrap().is_some());
        assert!(broker.get("q", "t2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_drops_lists_not_records() {
        let broker = broker();
        let eta = Utc::now() + chrono::Duration::seconds(60);
        broker.publish("q", "t1", b"1", None).await.unwrap();
        broker.publish("q", "t2", b"2", Some(eta)).await.unwrap();

        broker.empty("q").await.unwrap();

        let stats = broker.count("q").await.unwrap();
        assert_eq!(stats.direct, 0);
        assert_eq!(stats.delayed, 0);
        assert!(broker.get("q", "t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_with_ttl_expires() {
        let broker = broker();
        broker
            .set("q", "t1", b"done", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(broker.get("q", "t1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(broker.get("q", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_promote_delayed_moves_due_ids() {
        let broker = broker();
        let now = Utc::now();
        broker
            .publish("q", "due", b"1", Some(now + chrono::Duration::milliseconds(5)))
            .await
            .unwrap();
        broker
            .publish("q", "later", b"2", Some(now + chrono::Duration::seconds(60)))
            .await
            .unwrap();

        let promoted = broker
            .promote_delayed("q", now + chrono::Duration::milliseconds(10))
            .await
            .unwrap();
        assert_eq!(promoted, vec!["due".to_string()]);

        // Never in both places: the promoted id lives only on the live list.
        let stats = broker.count("q").await.unwrap();
        assert_eq!(stats.direct, 1);
        assert_eq!(stats.delayed, 1);
        assert_eq!(broker.list("q").await.unwrap(), vec!["due".to_string()]);
    }

    #[tokio::test]
    async fn test_promote_delayed_nothing_due() {
        let broker = broker();
        let now = Utc::now();
        broker
            .publish("q", "later", b"1", Some(now + chrono::Duration::seconds(60)))
            .await
            .unwrap();

        let promoted = broker.promote_delayed("q", now).await.unwrap();
        assert!(promoted.is_empty());
        assert_eq!(broker.count("q").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let broker = broker();
        broker.close().await.unwrap();

        assert!(broker.ping().await.is_err());
        assert!(broker.publish("q", "t1", b"1", None).await.is_err());
    }
}
