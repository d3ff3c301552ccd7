//! In-memory WorkQueue with consumer groups.
//!
//! Streams are append-only logs keyed by name. Each consumer group keeps a
//! cursor (last delivered offset) and a pending list of delivered but
//! unacknowledged entries. An entry is dropped from the log once every
//! known group has acknowledged it.
//!
//! The file-backed variant journals appends and acks. Once the journal
//! outgrows the live entries it is rewritten to just those, plus a
//! watermark per stream so offsets never go backwards.
//!
//! 待機は Mutex + Notify。`Notified` はロックを取る前に
//! enable しておくので、チェックと待機の間の append を取りこぼさない。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{EntryId, TaskId, TaskPayload};
use crate::error::{JournalError, QueueError};
use crate::impls::journal::Journal;
use crate::ports::{Clock, Claim, PendingEntry, QueueEntry, WorkQueue};

/// What the file-backed queue journals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum QueueRecord {
    Append {
        stream: String,
        entry: QueueEntry,
    },
    Ack {
        stream: String,
        group: String,
        entry_id: EntryId,
    },
    /// Highest offset ever handed out on `stream`.
    Watermark { stream: String, last_id: EntryId },
}

#[derive(Debug)]
struct PendingClaim {
    consumer: String,
    delivery_count: u32,
    touched_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<EntryId, PendingClaim>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, QueueEntry>,
    last_id: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    /// Some group has delivered and acknowledged `id`.
    fn is_retired(&self, id: EntryId) -> bool {
        self.groups
            .values()
            .any(|g| id.offset() <= g.last_delivered && !g.pending.contains_key(&id))
    }

    /// Drop leading entries every group has delivered and acknowledged.
    fn trim(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        while let Some((&id, _)) = self.entries.first_key_value() {
            let done = self
                .groups
                .values()
                .all(|g| id.offset() <= g.last_delivered && !g.pending.contains_key(&id));
            if !done {
                break;
            }
            self.entries.remove(&id);
        }
    }
}

struct QueueState {
    streams: HashMap<String, StreamState>,
    journal: Option<Journal<QueueRecord>>,
}

impl QueueState {
    async fn persist(&mut self, record: &QueueRecord) -> Result<(), QueueError> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(record).await?;
        }
        Ok(())
    }

    /// What a fresh journal needs to rebuild the current state.
    fn live_records(&self) -> Vec<QueueRecord> {
        let mut names: Vec<&String> = self.streams.keys().collect();
        names.sort();
        let mut out = Vec::new();
        for name in names {
            let s = &self.streams[name];
            if s.last_id == 0 {
                continue;
            }
            out.push(QueueRecord::Watermark {
                stream: name.clone(),
                last_id: EntryId::new(s.last_id),
            });
            out.extend(
                s.entries
                    .values()
                    .filter(|e| !s.is_retired(e.entry_id))
                    .map(|e| QueueRecord::Append {
                        stream: name.clone(),
                        entry: e.clone(),
                    }),
            );
        }
        out
    }

    /// Rewrite the journal to the live records. Returns whether it was
    /// rewritten.
    async fn compact(&mut self) -> Result<bool, JournalError> {
        if self.journal.is_none() {
            return Ok(false);
        }
        let records = self.live_records();
        let Some(journal) = self.journal.as_mut() else {
            return Ok(false);
        };
        let before = journal.lines();
        if records.len() >= before {
            return Ok(false);
        }
        journal.rewrite(&records).await?;
        info!(before, after = records.len(), "queue journal compacted");
        Ok(true)
    }

    async fn compact_if_grown(&mut self) {
        let live: usize = self.streams.values().map(|s| s.entries.len() + 1).sum();
        if !self.journal.as_ref().is_some_and(|j| j.wants_compaction(live)) {
            return;
        }
        if let Err(e) = self.compact().await {
            warn!(error = %e, "queue journal compaction failed");
        }
    }

    fn ensure_groups(&mut self, group: &str, streams: &[String]) {
        for stream in streams {
            self.streams
                .entry(stream.clone())
                .or_default()
                .groups
                .entry(group.to_string())
                .or_default();
        }
    }

    /// Reassign the oldest expired pending entry to `consumer`.
    fn reclaim_expired(
        &mut self,
        group: &str,
        consumer: &str,
        streams: &[String],
        claim_timeout: Duration,
        now: Instant,
    ) -> Option<Claim> {
        for stream in streams {
            let Some(s) = self.streams.get_mut(stream) else {
                continue;
            };
            let Some(g) = s.groups.get_mut(group) else {
                continue;
            };
            for (entry_id, pending) in g.pending.iter_mut() {
                if now.duration_since(pending.touched_at) < claim_timeout {
                    continue;
                }
                let Some(entry) = s.entries.get(entry_id) else {
                    continue;
                };
                info!(
                    stream = %stream,
                    entry_id = %entry_id,
                    task_id = %entry.task_id,
                    from = %pending.consumer,
                    to = %consumer,
                    "reclaiming expired claim"
                );
                pending.consumer = consumer.to_string();
                pending.delivery_count += 1;
                pending.touched_at = now;
                return Some(Claim {
                    stream: stream.clone(),
                    group: group.to_string(),
                    consumer: consumer.to_string(),
                    entry: entry.clone(),
                    delivery_count: pending.delivery_count,
                });
            }
        }
        None
    }

    /// Deliver the oldest undelivered entry across `streams`.
    fn deliver_next(
        &mut self,
        group: &str,
        consumer: &str,
        streams: &[String],
        now: Instant,
    ) -> Option<Claim> {
        let mut best: Option<(&String, EntryId, DateTime<Utc>)> = None;
        for stream in streams {
            let Some(s) = self.streams.get(stream) else {
                continue;
            };
            let cursor = s.groups.get(group).map_or(0, |g| g.last_delivered);
            if let Some((id, entry)) = s.entries.range(EntryId::new(cursor + 1)..).next()
                && best.is_none_or(|(_, _, at)| entry.appended_at < at)
            {
                best = Some((stream, *id, entry.appended_at));
            }
        }

        let (stream, entry_id, _) = best?;
        let stream = stream.clone();
        let s = self.streams.get_mut(&stream)?;
        let entry = s.entries.get(&entry_id)?.clone();
        let g = s.groups.entry(group.to_string()).or_default();
        g.last_delivered = entry_id.offset();
        g.pending.insert(
            entry_id,
            PendingClaim {
                consumer: consumer.to_string(),
                delivery_count: 1,
                touched_at: now,
            },
        );
        Some(Claim {
            stream,
            group: group.to_string(),
            consumer: consumer.to_string(),
            entry,
            delivery_count: 1,
        })
    }

    fn next_expiry(&self, group: &str, streams: &[String], claim_timeout: Duration) -> Option<Instant> {
        streams
            .iter()
            .filter_map(|stream| self.streams.get(stream)?.groups.get(group))
            .flat_map(|g| g.pending.values())
            .map(|p| p.touched_at + claim_timeout)
            .min()
    }
}

pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    claim_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryWorkQueue {
    pub fn new(claim_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::restore(claim_timeout, clock, Vec::new(), None)
    }

    /// Rebuild from journal records.
    ///
    /// Acknowledged entries are dropped; everything else becomes deliverable
    /// again, since no claim survives a restart. Offsets keep increasing from
    /// the highest one seen.
    pub(crate) fn restore(
        claim_timeout: Duration,
        clock: Arc<dyn Clock>,
        records: Vec<QueueRecord>,
        journal: Option<Journal<QueueRecord>>,
    ) -> Self {
        let mut streams: HashMap<String, StreamState> = HashMap::new();
        let mut acked: HashSet<(String, EntryId)> = HashSet::new();
        for record in records {
            match record {
                QueueRecord::Append { stream, entry } => {
                    let s = streams.entry(stream).or_default();
                    s.last_id = s.last_id.max(entry.entry_id.offset());
                    s.entries.insert(entry.entry_id, entry);
                }
                QueueRecord::Ack {
                    stream, entry_id, ..
                } => {
                    acked.insert((stream, entry_id));
                }
                QueueRecord::Watermark { stream, last_id } => {
                    let s = streams.entry(stream).or_default();
                    s.last_id = s.last_id.max(last_id.offset());
                }
            }
        }
        for (stream, entry_id) in &acked {
            if let Some(s) = streams.get_mut(stream) {
                s.entries.remove(entry_id);
            }
        }

        Self {
            state: Mutex::new(QueueState { streams, journal }),
            notify: Notify::new(),
            claim_timeout,
            clock,
        }
    }

    /// Drop retired entries from the journal.
    pub(crate) async fn compact_journal(&self) -> Result<bool, JournalError> {
        self.state.lock().await.compact().await
    }

    pub fn claim_timeout(&self) -> Duration {
        self.claim_timeout
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn append(
        &self,
        stream: &str,
        task_id: TaskId,
        payload: &TaskPayload,
    ) -> Result<EntryId, QueueError> {
        let entry_id = {
            let mut state = self.state.lock().await;
            let last_id = state.streams.get(stream).map_or(0, |s| s.last_id);
            let entry = QueueEntry {
                entry_id: EntryId::new(last_id + 1),
                task_id,
                kind: payload.kind(),
                payload: payload.clone(),
                appended_at: self.clock.now(),
            };
            state
                .persist(&QueueRecord::Append {
                    stream: stream.to_string(),
                    entry: entry.clone(),
                })
                .await?;

            let entry_id = entry.entry_id;
            let s = state.streams.entry(stream.to_string()).or_default();
            s.last_id = entry_id.offset();
            s.entries.insert(entry_id, entry);
            entry_id
        };

        debug!(stream, entry_id = %entry_id, task_id = %task_id, "entry appended");
        self.notify.notify_waiters();
        Ok(entry_id)
    }

    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        block: Duration,
    ) -> Result<Option<Claim>, QueueError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = self.state.lock().await;
                state.ensure_groups(group, streams);
                let now = Instant::now();
                if let Some(claim) =
                    state.reclaim_expired(group, consumer, streams, self.claim_timeout, now)
                {
                    return Ok(Some(claim));
                }
                if let Some(claim) = state.deliver_next(group, consumer, streams, now) {
                    return Ok(Some(claim));
                }
                state.next_expiry(group, streams, self.claim_timeout)
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake = next_expiry.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn touch(&self, claim: &Claim) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let pending = state
            .streams
            .get_mut(&claim.stream)
            .and_then(|s| s.groups.get_mut(&claim.group))
            .and_then(|g| g.pending.get_mut(&claim.entry.entry_id))
            .filter(|p| p.consumer == claim.consumer);

        match pending {
            Some(p) => {
                p.touched_at = Instant::now();
                Ok(())
            }
            None => Err(QueueError::ClaimLost {
                stream: claim.stream.clone(),
                entry_id: claim.entry.entry_id,
                consumer: claim.consumer.clone(),
            }),
        }
    }

    async fn ack(&self, claim: &Claim) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let is_pending = state
            .streams
            .get(&claim.stream)
            .and_then(|s| s.groups.get(&claim.group))
            .is_some_and(|g| g.pending.contains_key(&claim.entry.entry_id));
        if !is_pending {
            // 既に ack 済み（冪等）
            return Ok(());
        }

        state
            .persist(&QueueRecord::Ack {
                stream: claim.stream.clone(),
                group: claim.group.clone(),
                entry_id: claim.entry.entry_id,
            })
            .await?;

        if let Some(s) = state.streams.get_mut(&claim.stream) {
            if let Some(g) = s.groups.get_mut(&claim.group) {
                g.pending.remove(&claim.entry.entry_id);
            }
            s.trim();
        }
        state.compact_if_grown().await;
        debug!(
            stream = %claim.stream,
            entry_id = %claim.entry.entry_id,
            consumer = %claim.consumer,
            "entry acknowledged"
        );
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, QueueError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        let Some(s) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get(group) else {
            return Ok(Vec::new());
        };
        Ok(g.pending
            .iter()
            .filter_map(|(id, p)| {
                let entry = s.entries.get(id)?;
                Some(PendingEntry {
                    entry_id: *id,
                    task_id: entry.task_id,
                    consumer: p.consumer.clone(),
                    delivery_count: p.delivery_count,
                    idle: now.duration_since(p.touched_at),
                })
            })
            .collect())
    }

    async fn len(&self, stream: &str) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.streams.get(stream).map_or(0, |s| s.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payload::TemplateReview;
    use crate::ports::SystemClock;
    use ulid::Ulid;

    const STREAM: &str = "tasks:template-review";
    const GROUP: &str = "task-workers";

    fn queue(claim_timeout: Duration) -> InMemoryWorkQueue {
        InMemoryWorkQueue::new(claim_timeout, Arc::new(SystemClock))
    }

    fn streams() -> Vec<String> {
        vec![STREAM.to_string()]
    }

    fn payload() -> TaskPayload {
        TaskPayload::TemplateReview(TemplateReview {
            template_id: "iso-14001".into(),
            content: "6.1 Risks".into(),
        })
    }

    async fn append(q: &InMemoryWorkQueue) -> TaskId {
        let task_id = TaskId::from_ulid(Ulid::new());
        q.append(STREAM, task_id, &payload()).await.unwrap();
        task_id
    }

    async fn claim_now(q: &InMemoryWorkQueue, consumer: &str) -> Option<Claim> {
        q.claim(GROUP, consumer, &streams(), Duration::ZERO)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn each_entry_goes_to_one_consumer() {
        let q = queue(Duration::from_secs(60));
        let t1 = append(&q).await;
        let t2 = append(&q).await;

        let a = claim_now(&q, "a").await.unwrap();
        let b = claim_now(&q, "b").await.unwrap();
        assert_eq!(a.task_id(), t1);
        assert_eq!(b.task_id(), t2);
        assert!(claim_now(&q, "c").await.is_none());

        let pending = q.pending(STREAM, GROUP).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].consumer, "a");
    }

    #[tokio::test]
    async fn ack_removes_entry_permanently() {
        let q = queue(Duration::from_millis(10));
        append(&q).await;

        let claim = claim_now(&q, "a").await.unwrap();
        q.ack(&claim).await.unwrap();
        q.ack(&claim).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(claim_now(&q, "b").await.is_none());
        assert!(q.pending(STREAM, GROUP).await.unwrap().is_empty());
        assert_eq!(q.len(STREAM).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_claim_is_reclaimed_by_another_consumer() {
        let q = queue(Duration::from_millis(30));
        let task_id = append(&q).await;

        let first = claim_now(&q, "a").await.unwrap();
        assert!(claim_now(&q, "b").await.is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = claim_now(&q, "b").await.unwrap();
        assert_eq!(second.task_id(), task_id);
        assert_eq!(second.delivery_count, 2);
        assert!(second.is_redelivery());

        // 元の consumer はもう claim を持っていない
        assert!(matches!(
            q.touch(&first).await,
            Err(QueueError::ClaimLost { .. })
        ));
        q.touch(&second).await.unwrap();
    }

    #[tokio::test]
    async fn touch_keeps_claim_alive() {
        let q = queue(Duration::from_millis(40));
        append(&q).await;
        let claim = claim_now(&q, "a").await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            q.touch(&claim).await.unwrap();
        }
        assert!(claim_now(&q, "b").await.is_none());
    }

    #[tokio::test]
    async fn blocked_claim_wakes_on_append() {
        let q = Arc::new(queue(Duration::from_secs(60)));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                q.claim(GROUP, "a", &streams(), Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let task_id = append(&q).await;

        let claim = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(claim.task_id(), task_id);
    }

    #[tokio::test]
    async fn blocked_claim_times_out_empty() {
        let q = queue(Duration::from_secs(60));
        let claim = q
            .claim(GROUP, "a", &streams(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(claim.is_none());
    }

    #[tokio::test]
    async fn new_group_reads_from_the_beginning() {
        let q = queue(Duration::from_secs(60));
        let t1 = append(&q).await;

        let claim = q
            .claim("late-group", "x", &streams(), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.task_id(), t1);
        assert_eq!(claim.entry.entry_id, EntryId::new(1));
    }

    #[tokio::test]
    async fn claims_oldest_entry_across_streams() {
        let q = queue(Duration::from_secs(60));
        let parse = "tasks:document-parse".to_string();
        let first = TaskId::from_ulid(Ulid::new());
        q.append(&parse, first, &payload()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        append(&q).await;

        let both = vec![STREAM.to_string(), parse.clone()];
        let claim = q
            .claim(GROUP, "a", &both, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.task_id(), first);
        assert_eq!(claim.stream, parse);
    }
}
