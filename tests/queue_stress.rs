//! Concurrency stress for the queue core and rate limiter.
//!
//! Multi-threaded runtime throughout: these tests exist to catch lock
//! ordering and lost-update bugs that single-threaded tests cannot.

use async_trait::async_trait;
use chatrelay::config::{QueueLimits, RateLimitConfig};
use chatrelay::connection::ConnectionStateMachine;
use chatrelay::queue::{MessagePriority, MessageProcessor, MessageQueue, QueuedMessage};
use chatrelay::ratelimit::RateLimiter;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

struct RecordingProcessor {
    delivered: Mutex<Vec<QueuedMessage>>,
    delay: Duration,
}

impl RecordingProcessor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        })
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            delay,
        })
    }
}

#[async_trait]
impl MessageProcessor for RecordingProcessor {
    async fn process(&self, message: &QueuedMessage) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.delivered.lock().push(message.clone());
        Ok(())
    }
}

fn standalone_queue(limits: QueueLimits) -> MessageQueue {
    let machine = Arc::new(ConnectionStateMachine::new("conn-stress"));
    MessageQueue::new("conn-stress", "user-stress", limits, machine)
}

const BATCH: usize = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_flush_priority_sorted_and_fifo_within_batch() {
    let queue = standalone_queue(QueueLimits {
        max_size: 200,
        ..QueueLimits::default()
    });
    let processor = RecordingProcessor::new();
    queue.set_message_processor(processor.clone());

    // Three tasks enqueue one sequential batch each, racing each other.
    let barrier = Arc::new(Barrier::new(3));
    let mut tasks = Vec::new();
    for (label, priority) in [
        ("high", MessagePriority::High),
        ("normal", MessagePriority::Normal),
        ("low", MessagePriority::Low),
    ] {
        let queue = queue.clone();
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            for index in 0..BATCH {
                let accepted = queue
                    .enqueue_message(
                        json!({ "batch": label, "seq": index }),
                        &format!("{label}-{index}"),
                        priority,
                        None,
                    )
                    .await;
                assert!(accepted, "enqueue {label}-{index} should succeed");
            }
        }));
    }
    for task in tasks {
        task.await.expect("enqueue task should not panic");
    }
    assert_eq!(queue.total_size(), 3 * BATCH);

    assert!(queue.flush_queue().await);

    let delivered = processor.delivered.lock();
    assert_eq!(delivered.len(), 3 * BATCH, "exactly 150 deliveries");

    // Overall order is priority-sorted: every high before every normal,
    // every normal before every low.
    let rank_sequence: Vec<MessagePriority> =
        delivered.iter().map(|message| message.priority).collect();
    let mut sorted = rank_sequence.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(rank_sequence, sorted, "priority order must dominate");

    // FIFO within each batch: the per-batch seq numbers come out ascending.
    for label in ["high", "normal", "low"] {
        let seqs: Vec<u64> = delivered
            .iter()
            .filter(|message| message.message_data["batch"] == json!(label))
            .map(|message| message.message_data["seq"].as_u64().expect("seq"))
            .collect();
        let expected: Vec<u64> = (0..BATCH as u64).collect();
        assert_eq!(seqs, expected, "batch `{label}` must stay FIFO");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_racing_a_flush_never_double_delivers() {
    let queue = standalone_queue(QueueLimits {
        max_size: 500,
        ..QueueLimits::default()
    });
    let processor = RecordingProcessor::with_delay(Duration::from_millis(1));
    queue.set_message_processor(processor.clone());

    for index in 0..200 {
        queue
            .enqueue_message(json!({ "seq": index }), "chat_message", MessagePriority::Normal, None)
            .await;
    }

    let flusher = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.flush_queue().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.close("client went away");
    assert!(flusher.await.expect("flush task should not panic"));

    // The flush stops at the close boundary; whatever made it out was
    // delivered exactly once.
    let delivered = processor.delivered.lock();
    assert!(delivered.len() < 200, "close must stop the drain early");
    let unique: HashSet<String> = delivered
        .iter()
        .map(|message| message.message_id.clone())
        .collect();
    assert_eq!(unique.len(), delivered.len(), "no message delivered twice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limiter_admits_exactly_the_budget_under_contention() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        max_messages_per_minute: 100,
        max_messages_per_hour: 10_000,
        ..RateLimitConfig::default()
    }));

    let barrier = Arc::new(Barrier::new(4));
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let limiter = Arc::clone(&limiter);
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            let mut admitted = 0u32;
            for _ in 0..50 {
                if limiter.record_message("shared-user").is_ok() {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let mut total = 0u32;
    for task in tasks {
        total += task.await.expect("limiter task should not panic");
    }
    assert_eq!(total, 100, "contended recording must admit exactly the budget");

    let stats = limiter
        .get_user_stats("shared-user")
        .expect("tracked user");
    assert_eq!(stats.messages_in_window, 100);
}
