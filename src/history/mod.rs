use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::protocol::{Frame, TableId, MSG_PING, MSG_PONG};

const DEFAULT_MAX_LEN: usize = 100;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);

struct HistoryEntry {
    sequence_id: u64,
    frame: Frame,
    recorded_at: Instant,
}

/// Per-table ring of recently broadcast frames, used to replay missed
/// messages to reconnecting clients.
///
/// Sequence ids come from one instance-local counter, so they are strictly
/// increasing across all tables for the life of the process. Rings are
/// bounded by both length and age; the age trim runs from the background
/// cleanup task.
pub struct MessageHistory {
    rings: RwLock<HashMap<TableId, VecDeque<HistoryEntry>>>,
    sequence: AtomicU64,
    max_len: usize,
    max_age: Duration,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEN, DEFAULT_MAX_AGE)
    }
}

impl MessageHistory {
    pub fn new(max_len: usize, max_age: Duration) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            max_len,
            max_age,
        }
    }

    /// Next instance-local sequence id, strictly increasing.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Stamp a frame with a fresh sequence id and record it in the table's
    /// ring. Heartbeat traffic is never recorded. Returns the stamped frame.
    pub async fn record(&self, table_id: &TableId, mut frame: Frame) -> Frame {
        let sequence_id = self.next_sequence();
        frame.sequence_id = Some(sequence_id);

        if matches!(frame.kind.as_str(), MSG_PING | MSG_PONG) {
            return frame;
        }

        let mut rings = self.rings.write().await;
        let ring = rings.entry(table_id.clone()).or_default();
        if ring.len() == self.max_len {
            ring.pop_front();
        }
        ring.push_back(HistoryEntry {
            sequence_id,
            frame: frame.clone(),
            recorded_at: Instant::now(),
        });
        frame
    }

    /// Frames a reconnecting client missed: everything recorded for the
    /// table with a sequence id greater than `last_seen`, ascending.
    pub async fn missed_since(&self, table_id: &TableId, last_seen: u64) -> Vec<Frame> {
        let rings = self.rings.read().await;
        rings
            .get(table_id)
            .map(|ring| {
                ring.iter()
                    .filter(|entry| entry.sequence_id > last_seen)
                    .map(|entry| entry.frame.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Age-trim every ring and drop rings that end up empty.
    pub async fn trim(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.max_age) else {
            return;
        };
        let mut rings = self.rings.write().await;
        for ring in rings.values_mut() {
            while ring
                .front()
                .map(|entry| entry.recorded_at < cutoff)
                .unwrap_or(false)
            {
                ring.pop_front();
            }
        }
        rings.retain(|_, ring| !ring.is_empty());
    }

    pub async fn drop_table(&self, table_id: &TableId) {
        self.rings.write().await.remove(table_id);
    }

    pub async fn table_len(&self, table_id: &TableId) -> usize {
        self.rings
            .read()
            .await
            .get(table_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub async fn ring_count(&self) -> usize {
        self.rings.read().await.len()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MSG_GAME_UPDATE;
    use serde_json::json;

    fn table() -> TableId {
        "t1".to_string()
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing() {
        let history = MessageHistory::default();
        let mut last = 0;
        for _ in 0..50 {
            let seq = history.next_sequence();
            assert!(seq > last);
            last = seq;
        }
    }

    #[tokio::test]
    async fn record_stamps_and_stores() {
        let history = MessageHistory::default();
        let frame = history
            .record(&table(), Frame::new(MSG_GAME_UPDATE, json!({ "n": 1 })))
            .await;

        assert_eq!(frame.sequence_id, Some(1));
        assert_eq!(history.table_len(&table()).await, 1);
    }

    #[tokio::test]
    async fn heartbeats_consume_sequences_but_are_not_stored() {
        let history = MessageHistory::default();
        let pong = history.record(&table(), Frame::pong()).await;

        assert!(pong.sequence_id.is_some());
        assert_eq!(history.table_len(&table()).await, 0);
    }

    #[tokio::test]
    async fn missed_since_returns_ascending_tail() {
        let history = MessageHistory::default();
        for i in 0..10 {
            history
                .record(&table(), Frame::new(MSG_GAME_UPDATE, json!({ "n": i })))
                .await;
        }

        let missed = history.missed_since(&table(), 7).await;
        assert_eq!(missed.len(), 3);
        let seqs: Vec<u64> = missed.iter().map(|f| f.sequence_id.unwrap()).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn missed_since_is_scoped_per_table() {
        let history = MessageHistory::default();
        let t2: TableId = "t2".to_string();
        history
            .record(&table(), Frame::new(MSG_GAME_UPDATE, json!({ "n": 1 })))
            .await;
        history
            .record(&t2, Frame::new(MSG_GAME_UPDATE, json!({ "n": 2 })))
            .await;

        let missed = history.missed_since(&t2, 0).await;
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].payload["n"], 2);
    }

    #[tokio::test]
    async fn ring_is_bounded_by_length() {
        let history = MessageHistory::new(5, DEFAULT_MAX_AGE);
        for i in 0..12 {
            history
                .record(&table(), Frame::new(MSG_GAME_UPDATE, json!({ "n": i })))
                .await;
        }

        assert_eq!(history.table_len(&table()).await, 5);
        // Oldest entries fell off the front.
        let missed = history.missed_since(&table(), 0).await;
        assert_eq!(missed.first().unwrap().sequence_id, Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn trim_drops_entries_past_max_age() {
        let history = MessageHistory::new(100, Duration::from_secs(60));
        history
            .record(&table(), Frame::new(MSG_GAME_UPDATE, json!({ "n": 0 })))
            .await;

        tokio::time::advance(Duration::from_secs(30)).await;
        history
            .record(&table(), Frame::new(MSG_GAME_UPDATE, json!({ "n": 1 })))
            .await;

        tokio::time::advance(Duration::from_secs(31)).await;
        history.trim().await;

        assert_eq!(history.table_len(&table()).await, 1);
        let remaining = history.missed_since(&table(), 0).await;
        assert_eq!(remaining[0].payload["n"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trim_removes_empty_rings() {
        let history = MessageHistory::new(100, Duration::from_secs(60));
        history
            .record(&table(), Frame::new(MSG_GAME_UPDATE, json!({})))
            .await;
        assert_eq!(history.ring_count().await, 1);

        tokio::time::advance(Duration::from_secs(120)).await;
        history.trim().await;
        assert_eq!(history.ring_count().await, 0);
    }
}
