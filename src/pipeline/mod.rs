use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::protocol::codec::{self, CompressionSettings, WireMessage};
use crate::protocol::{default_priority, is_realtime_critical, Frame, PRIORITY_FLUSH_NOW};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_window: Duration,
    pub max_batch_size: usize,
    pub adaptive: bool,
    pub dedup: bool,
    pub compression: CompressionSettings,
}

impl PipelineSettings {
    /// Per-connection settings derived from the gateway config.
    /// `compression_opt_in` is false when the client upgraded with
    /// `compression=off`.
    pub fn from_config(config: &Config, compression_opt_in: bool) -> Self {
        Self {
            batch_window: config.batch_window,
            max_batch_size: config.max_batch_size,
            adaptive: config.enable_adaptive_batching,
            dedup: config.enable_deduplication,
            compression: CompressionSettings {
                enabled: config.enable_batch_compression && compression_opt_in,
                level: config.compression_level,
                threshold: config.compression_threshold,
            },
        }
    }
}

// Adaptive-window constants (§ delivery tuning): EWMA weights, the minimum
// time between adjustments, and the window clamp.
const EWMA_PRIOR_WEIGHT: f64 = 0.7;
const EWMA_INSTANT_WEIGHT: f64 = 0.3;
const ADJUSTMENT_COOLDOWN: Duration = Duration::from_secs(5);
const WINDOW_FLOOR: Duration = Duration::from_millis(20);
const WINDOW_CAP: Duration = Duration::from_millis(500);
const HIGH_FREQUENCY: f64 = 20.0;
const LOW_FREQUENCY: f64 = 5.0;
const BATCH_SIZE_HISTORY: usize = 100;

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub messages: u64,
    pub batches: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub compressed: u64,
    pub send_failures: u64,
    batch_sizes: VecDeque<usize>,
}

impl PipelineStats {
    fn record_batch_size(&mut self, size: usize) {
        if self.batch_sizes.len() == BATCH_SIZE_HISTORY {
            self.batch_sizes.pop_front();
        }
        self.batch_sizes.push_back(size);
    }

    pub fn average_batch_size(&self) -> f64 {
        if self.batch_sizes.is_empty() {
            return 0.0;
        }
        self.batch_sizes.iter().sum::<usize>() as f64 / self.batch_sizes.len() as f64
    }

    pub fn batch_size_samples(&self) -> usize {
        self.batch_sizes.len()
    }
}

// ============================================================================
// Pipeline
// ============================================================================

struct QueuedItem {
    frame: Frame,
    priority: u8,
    enqueued_at: Instant,
    /// Monotonic arrival number, the tiebreak under identical timestamps.
    arrival: u64,
}

struct DeliveryState {
    window: Duration,
    ewma_frequency: f64,
    last_adjustment: Instant,
    last_message: Instant,
}

struct PipelineInner {
    settings: PipelineSettings,
    sink: Option<UnboundedSender<WireMessage>>,
    queue: Vec<QueuedItem>,
    timer: Option<JoinHandle<()>>,
    arrivals: u64,
    state: DeliveryState,
    stats: PipelineStats,
}

/// Per-connection outbound delivery pipeline.
///
/// Frames are queued by priority and flushed as a single `batch` frame when
/// the queue fills, a priority-10 frame arrives, or the batch window elapses.
/// Realtime-critical frames skip all of it and go straight to the sink as
/// uncompressed text.
///
/// Cheaply cloneable — all clones share the same queue via `Arc`.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Mutex<PipelineInner>>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, sink: UnboundedSender<WireMessage>) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Mutex::new(PipelineInner {
                state: DeliveryState {
                    window: settings.batch_window,
                    ewma_frequency: 0.0,
                    last_adjustment: now,
                    last_message: now,
                },
                settings,
                sink: Some(sink),
                queue: Vec::new(),
                timer: None,
                arrivals: 0,
                stats: PipelineStats::default(),
            })),
        }
    }

    /// Enqueue with the default priority for the frame type.
    pub async fn enqueue(&self, frame: Frame) {
        let priority = default_priority(&frame.kind);
        self.enqueue_with_priority(frame, priority).await;
    }

    pub async fn enqueue_with_priority(&self, frame: Frame, priority: u8) {
        let mut inner = self.inner.lock().await;
        inner.stats.messages += 1;
        Self::note_arrival(&mut inner);

        if is_realtime_critical(&frame.kind) {
            Self::send_now(&mut inner, &frame);
            return;
        }

        let arrival = inner.arrivals;
        inner.arrivals += 1;
        inner.queue.push(QueuedItem {
            frame,
            priority,
            enqueued_at: Instant::now(),
            arrival,
        });

        if inner.queue.len() >= inner.settings.max_batch_size || priority >= PRIORITY_FLUSH_NOW {
            Self::flush_inner(&mut inner);
        } else if inner.timer.is_none() {
            let pipeline = self.clone();
            let window = inner.state.window;
            inner.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                pipeline.flush().await;
            }));
        }
    }

    /// Flush whatever is queued right now as one batch.
    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        Self::flush_inner(&mut inner);
    }

    /// Send a frame immediately as uncompressed text, skipping the queue.
    /// Used for the welcome frame and direct unicast replies.
    pub async fn send_direct(&self, frame: &Frame) {
        let mut inner = self.inner.lock().await;
        inner.stats.messages += 1;
        Self::send_now(&mut inner, frame);
    }

    /// Ask the peer to close. The socket task translates this into a proper
    /// close handshake.
    pub async fn send_close(&self, code: u16, reason: &str) {
        let inner = self.inner.lock().await;
        if let Some(sink) = &inner.sink {
            let _ = sink.send(WireMessage::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }

    /// Detach the socket: pending output is discarded and future flushes are
    /// silent no-ops until `rebind`. Called when a connection enters its
    /// grace window.
    pub async fn detach(&self) {
        let mut inner = self.inner.lock().await;
        inner.sink = None;
        inner.queue.clear();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    /// Attach a fresh socket after a reconnect.
    pub async fn rebind(&self, sink: UnboundedSender<WireMessage>) {
        let mut inner = self.inner.lock().await;
        inner.sink = Some(sink);
    }

    /// Stop the batch timer. Terminal; called when the connection closes.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.sink = None;
        inner.queue.clear();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.sink.is_some()
    }

    /// Account an inbound frame's size against this connection.
    pub async fn note_bytes_in(&self, bytes: usize) {
        self.inner.lock().await.stats.bytes_in += bytes as u64;
    }

    pub async fn stats(&self) -> PipelineStats {
        self.inner.lock().await.stats.clone()
    }

    /// Current batch window; moves under adaptive tuning.
    pub async fn current_window(&self) -> Duration {
        self.inner.lock().await.state.window
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn send_now(inner: &mut PipelineInner, frame: &Frame) {
        let Some(sink) = inner.sink.clone() else {
            return;
        };
        match codec::encode_text(frame) {
            Ok(wire) => {
                if let WireMessage::Text(text) = &wire {
                    inner.stats.bytes_out += text.len() as u64;
                }
                if sink.send(wire).is_err() {
                    inner.stats.send_failures += 1;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode realtime frame");
                inner.stats.send_failures += 1;
            }
        }
    }

    fn flush_inner(inner: &mut PipelineInner) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if inner.queue.is_empty() {
            return;
        }
        let Some(sink) = inner.sink.clone() else {
            // Socket already gone: discard silently.
            inner.queue.clear();
            return;
        };

        let mut items = std::mem::take(&mut inner.queue);
        // Stable order: priority desc, then enqueue time asc, then arrival.
        items.sort_by_key(|item| (Reverse(item.priority), item.enqueued_at, item.arrival));

        let frames: Vec<Frame> = if inner.settings.dedup {
            let mut seen = std::collections::HashSet::new();
            items
                .into_iter()
                .filter(|item| seen.insert(codec::content_hash(&item.frame)))
                .map(|item| item.frame)
                .collect()
        } else {
            items.into_iter().map(|item| item.frame).collect()
        };

        inner.stats.record_batch_size(frames.len());

        let batch = codec::batch_frame(frames);
        let wire = match codec::encode(&batch, &inner.settings.compression) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode batch");
                inner.stats.send_failures += 1;
                return;
            }
        };

        match &wire {
            WireMessage::Text(text) => inner.stats.bytes_out += text.len() as u64,
            WireMessage::Binary(bytes) => {
                inner.stats.bytes_out += bytes.len() as u64;
                inner.stats.compressed += 1;
            }
            // encode() never produces a close.
            WireMessage::Close { .. } => {}
        }

        if sink.send(wire).is_err() {
            // Batch dropped; the close handler evicts the connection.
            inner.stats.send_failures += 1;
            return;
        }
        inner.stats.batches += 1;
    }

    /// EWMA frequency update plus the window adjustment, gated to at most one
    /// adjustment per cooldown period.
    fn note_arrival(inner: &mut PipelineInner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.state.last_message).as_secs_f64();
        inner.state.last_message = now;

        // Instantaneous frequency; clamp the denominator so a same-instant
        // burst does not produce infinities.
        let instant = 1.0 / elapsed.max(0.001);
        inner.state.ewma_frequency =
            EWMA_PRIOR_WEIGHT * inner.state.ewma_frequency + EWMA_INSTANT_WEIGHT * instant;

        if !inner.settings.adaptive {
            return;
        }
        if now.duration_since(inner.state.last_adjustment) < ADJUSTMENT_COOLDOWN {
            return;
        }

        let average = inner.stats.average_batch_size();
        let frequency = inner.state.ewma_frequency;
        if frequency > HIGH_FREQUENCY && average > 5.0 {
            inner.state.window = inner.state.window.mul_f64(0.8).max(WINDOW_FLOOR);
            inner.state.last_adjustment = now;
        } else if frequency < LOW_FREQUENCY && average < 2.0 {
            inner.state.window = inner.state.window.mul_f64(1.2).min(WINDOW_CAP);
            inner.state.last_adjustment = now;
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        MSG_BATCH, MSG_CHAT, MSG_DISCONNECT_WARNING, MSG_ERROR, MSG_GAME_UPDATE, MSG_PONG,
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            batch_window: Duration::from_millis(40),
            max_batch_size: 10,
            adaptive: false,
            dedup: false,
            compression: CompressionSettings {
                enabled: false,
                ..Default::default()
            },
        }
    }

    fn make_pipeline(
        settings: PipelineSettings,
    ) -> (Pipeline, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Pipeline::new(settings, tx), rx)
    }

    fn parse_batch(wire: WireMessage) -> Vec<Frame> {
        let text = match wire {
            WireMessage::Text(t) => t,
            other => panic!("expected text frame, got {other:?}"),
        };
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.kind, MSG_BATCH);
        serde_json::from_value(frame.payload["messages"].clone()).unwrap()
    }

    #[tokio::test]
    async fn realtime_frames_bypass_the_queue() {
        let (pipeline, mut rx) = make_pipeline(settings());

        pipeline
            .enqueue(Frame::new(MSG_CHAT, json!({ "message": "queued" })))
            .await;
        pipeline.enqueue(Frame::pong()).await;

        // The pong must arrive before the chat batch, without waiting for the
        // batch window.
        let first = rx.recv().await.unwrap();
        let text = match first {
            WireMessage::Text(t) => t,
            other => panic!("expected text, got {other:?}"),
        };
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.kind, MSG_PONG);
        assert_eq!(pipeline.queue_len().await, 1);
    }

    #[tokio::test]
    async fn queue_flushes_at_max_batch_size() {
        let (pipeline, mut rx) = make_pipeline(PipelineSettings {
            max_batch_size: 3,
            ..settings()
        });

        for i in 0..3 {
            pipeline
                .enqueue(Frame::new(MSG_GAME_UPDATE, json!({ "n": i })))
                .await;
        }

        let frames = parse_batch(rx.recv().await.unwrap());
        assert_eq!(frames.len(), 3);
        assert_eq!(pipeline.queue_len().await, 0);
    }

    #[tokio::test]
    async fn batch_timer_flushes_partial_queue() {
        let (pipeline, mut rx) = make_pipeline(settings());

        pipeline
            .enqueue(Frame::new(MSG_CHAT, json!({ "message": "solo" })))
            .await;
        assert_eq!(pipeline.queue_len().await, 1);

        let wire = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("batch timer must fire")
            .unwrap();
        let frames = parse_batch(wire);
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test]
    async fn priority_ten_forces_immediate_flush() {
        let (pipeline, mut rx) = make_pipeline(settings());

        pipeline
            .enqueue(Frame::new(MSG_CHAT, json!({ "message": "first" })))
            .await;
        pipeline
            .enqueue_with_priority(Frame::new(MSG_ERROR, json!({ "message": "boom" })), 10)
            .await;

        // No timer wait: the flush happened on enqueue.
        let frames = parse_batch(rx.try_recv().expect("flush must be immediate"));
        assert_eq!(frames.len(), 2);
        // Priority 10 sorts ahead of the chat despite arriving later.
        assert_eq!(frames[0].kind, MSG_ERROR);
        assert_eq!(frames[1].kind, MSG_CHAT);
    }

    #[tokio::test]
    async fn flush_orders_by_priority_then_arrival() {
        let (pipeline, mut rx) = make_pipeline(settings());

        pipeline
            .enqueue_with_priority(Frame::new(MSG_CHAT, json!({ "message": "a" })), 1)
            .await;
        pipeline
            .enqueue_with_priority(Frame::new(MSG_CHAT, json!({ "message": "b" })), 1)
            .await;
        pipeline
            .enqueue_with_priority(Frame::new(MSG_GAME_UPDATE, json!({ "n": 1 })), 3)
            .await;
        pipeline.flush().await;

        let frames = parse_batch(rx.recv().await.unwrap());
        assert_eq!(frames[0].kind, MSG_GAME_UPDATE);
        assert_eq!(frames[1].payload["message"], "a");
        assert_eq!(frames[2].payload["message"], "b");
    }

    #[tokio::test]
    async fn dedup_drops_repeats_and_preserves_first_seen_order() {
        let (pipeline, mut rx) = make_pipeline(PipelineSettings {
            dedup: true,
            ..settings()
        });

        pipeline
            .enqueue(Frame::new("update1", json!({ "data": 1 })))
            .await;
        pipeline
            .enqueue(Frame::new("update2", json!({ "data": 2 })))
            .await;
        pipeline
            .enqueue(Frame::new("update1", json!({ "data": 1 })))
            .await;
        pipeline
            .enqueue(Frame::new("update3", json!({ "data": 3 })))
            .await;
        pipeline.flush().await;

        let frames = parse_batch(rx.recv().await.unwrap());
        let kinds: Vec<&str> = frames.iter().map(|f| f.kind.as_str()).collect();
        assert_eq!(kinds, vec!["update1", "update2", "update3"]);
    }

    #[tokio::test]
    async fn dedup_keeps_same_type_with_different_payload() {
        let (pipeline, mut rx) = make_pipeline(PipelineSettings {
            dedup: true,
            ..settings()
        });

        pipeline
            .enqueue(Frame::new("update1", json!({ "data": 1 })))
            .await;
        pipeline
            .enqueue(Frame::new("update1", json!({ "data": 2 })))
            .await;
        pipeline.flush().await;

        let frames = parse_batch(rx.recv().await.unwrap());
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn large_batches_compress_to_binary() {
        let (pipeline, mut rx) = make_pipeline(PipelineSettings {
            compression: CompressionSettings::default(),
            ..settings()
        });

        let filler = "chip stack ".repeat(200);
        pipeline
            .enqueue(Frame::new(MSG_GAME_UPDATE, json!({ "state": filler })))
            .await;
        pipeline.flush().await;

        match rx.recv().await.unwrap() {
            WireMessage::Binary(bytes) => assert_eq!(bytes[0], codec::GZIP_MAGIC),
            other => panic!("expected compressed binary batch, got {other:?}"),
        }
        let stats = pipeline.stats().await;
        assert_eq!(stats.compressed, 1);
    }

    #[tokio::test]
    async fn detached_pipeline_discards_silently() {
        let (pipeline, mut rx) = make_pipeline(settings());
        pipeline.detach().await;

        pipeline
            .enqueue(Frame::new(MSG_CHAT, json!({ "message": "lost" })))
            .await;
        pipeline.flush().await;

        assert!(rx.try_recv().is_err());
        let stats = pipeline.stats().await;
        assert_eq!(stats.send_failures, 0, "detached discard is not a failure");
    }

    #[tokio::test]
    async fn dropped_sink_counts_send_failures() {
        let (pipeline, rx) = make_pipeline(settings());
        drop(rx);

        pipeline
            .enqueue(Frame::new(MSG_CHAT, json!({ "message": "x" })))
            .await;
        pipeline.flush().await;

        let stats = pipeline.stats().await;
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.batches, 0);
    }

    #[tokio::test]
    async fn rebind_resumes_delivery() {
        let (pipeline, _old_rx) = make_pipeline(settings());
        pipeline.detach().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        pipeline.rebind(tx).await;
        pipeline
            .enqueue(Frame::new(MSG_CHAT, json!({ "message": "back" })))
            .await;
        pipeline.flush().await;

        let frames = parse_batch(rx.recv().await.unwrap());
        assert_eq!(frames[0].payload["message"], "back");
    }

    #[tokio::test]
    async fn disconnect_warning_is_sent_immediately() {
        let (pipeline, mut rx) = make_pipeline(settings());

        pipeline
            .enqueue(Frame::new(MSG_CHAT, json!({ "message": "later" })))
            .await;
        pipeline
            .enqueue(Frame::new(MSG_DISCONNECT_WARNING, json!({ "secondsLeft": 10 })))
            .await;

        // The warning bypasses the queue and overtakes the pending chat.
        let first = rx.recv().await.unwrap();
        let text = match first {
            WireMessage::Text(t) => t,
            other => panic!("expected text, got {other:?}"),
        };
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.kind, MSG_DISCONNECT_WARNING);
    }

    #[tokio::test]
    async fn stats_track_messages_batches_and_history_cap() {
        let (pipeline, mut rx) = make_pipeline(PipelineSettings {
            max_batch_size: 2,
            ..settings()
        });

        for i in 0..8 {
            pipeline
                .enqueue(Frame::new(MSG_GAME_UPDATE, json!({ "n": i })))
                .await;
        }
        // Four full batches of two.
        for _ in 0..4 {
            rx.recv().await.unwrap();
        }

        let stats = pipeline.stats().await;
        assert_eq!(stats.messages, 8);
        assert_eq!(stats.batches, 4);
        assert!((stats.average_batch_size() - 2.0).abs() < f64::EPSILON);
        assert!(stats.batch_size_samples() <= BATCH_SIZE_HISTORY);
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_window_widens_when_traffic_is_sparse() {
        let settings = PipelineSettings {
            adaptive: true,
            batch_window: Duration::from_millis(100),
            ..settings()
        };
        let (pipeline, mut rx) = make_pipeline(settings);

        // One tiny batch every six seconds: the frequency EWMA sits far
        // below 5/s, the average batch size below 2, and every arrival is
        // past the adjustment cooldown.
        for i in 0..20 {
            tokio::time::advance(Duration::from_secs(6)).await;
            pipeline
                .enqueue(Frame::new(MSG_CHAT, json!({ "n": i })))
                .await;
            pipeline.flush().await;
            while rx.try_recv().is_ok() {}
        }

        let window = pipeline.current_window().await;
        assert!(
            window > Duration::from_millis(100),
            "window should widen, got {window:?}"
        );
        assert!(window <= WINDOW_CAP);
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_window_narrows_under_sustained_load() {
        let settings = PipelineSettings {
            adaptive: true,
            batch_window: Duration::from_millis(100),
            max_batch_size: 10,
            ..settings()
        };
        let (pipeline, mut rx) = make_pipeline(settings);

        // ~100 msgs/s with full ten-frame batches. The first adjustment can
        // only happen after the five-second cooldown, so run for six.
        for i in 0..600u32 {
            tokio::time::advance(Duration::from_millis(10)).await;
            pipeline
                .enqueue(Frame::new(MSG_GAME_UPDATE, json!({ "n": i })))
                .await;
            while rx.try_recv().is_ok() {}
        }

        let window = pipeline.current_window().await;
        assert!(
            window < Duration::from_millis(100),
            "window should narrow, got {window:?}"
        );
        assert!(window >= WINDOW_FLOOR);
    }

    #[tokio::test]
    async fn queue_never_exceeds_max_batch_size() {
        let (pipeline, mut rx) = make_pipeline(PipelineSettings {
            max_batch_size: 5,
            ..settings()
        });

        for i in 0..23 {
            pipeline
                .enqueue(Frame::new(MSG_GAME_UPDATE, json!({ "n": i })))
                .await;
            assert!(pipeline.queue_len().await < 5);
        }
        while rx.try_recv().is_ok() {}
    }
}
