//! Per-session event queue.
//!
//! Unbounded FIFO between the runner (producer) and whichever stream
//! consumer currently holds the receiver. Sequence numbers are assigned at
//! enqueue; once a final event is queued every later `put` is refused.

use chrono::Utc;
use page_analysis_types::{Event, EventPayload};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

struct ProducerSide {
    tx: mpsc::UnboundedSender<Event>,
    next_sequence: u64,
    closed: bool,
}

pub struct EventQueue {
    session_id: String,
    producer: Mutex<ProducerSide>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl EventQueue {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.into(),
            producer: Mutex::new(ProducerSide {
                tx,
                next_sequence: 1,
                closed: false,
            }),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Enqueue without blocking. Returns the assigned sequence, or `None`
    /// if a final event was already queued.
    pub fn put(&self, source: &str, payload: EventPayload) -> Option<u64> {
        let mut producer = self.producer.lock();
        if producer.closed {
            log::debug!(
                "[QUEUE] {} refusing event after final: {}",
                self.session_id,
                payload.content()
            );
            return None;
        }

        let sequence = producer.next_sequence;
        let is_final = payload.is_final();
        let event = Event {
            session_id: self.session_id.clone(),
            sequence,
            timestamp: Utc::now(),
            is_final,
            source: source.to_string(),
            payload,
        };

        // The receiver lives in `self`, so the send cannot fail while we exist
        if producer.tx.send(event).is_err() {
            return None;
        }
        producer.next_sequence += 1;
        if is_final {
            producer.closed = true;
        }
        Some(sequence)
    }

    /// True once a final event has been queued
    pub fn is_closed(&self) -> bool {
        self.producer.lock().closed
    }

    /// Wait up to `timeout` for the next event. `None` means timeout,
    /// including time spent waiting for another consumer to release the
    /// receiver.
    pub async fn take(&self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await
        .ok()
        .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use page_analysis_types::Region;
    use std::sync::Arc;

    fn message(text: &str) -> EventPayload {
        EventPayload::Message {
            content: text.to_string(),
            region: Region::Process,
        }
    }

    fn final_error() -> EventPayload {
        EventPayload::Error {
            content: "failed".to_string(),
            error: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn fifo_with_monotonic_sequence() {
        let queue = EventQueue::new("s1");
        assert_eq!(queue.put("system", message("a")), Some(1));
        assert_eq!(queue.put("system", message("b")), Some(2));

        let first = queue.take(Duration::from_millis(50)).await.unwrap();
        let second = queue.take(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.payload.content(), "a");
        assert_eq!(second.sequence, 2);
        assert_eq!(first.session_id, "s1");
    }

    #[tokio::test]
    async fn take_times_out_when_empty() {
        let queue = EventQueue::new("s1");
        assert!(queue.take(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn refuses_events_after_final() {
        let queue = EventQueue::new("s1");
        queue.put("system", message("a"));
        assert_eq!(queue.put("system", final_error()), Some(2));
        assert!(queue.is_closed());
        assert_eq!(queue.put("system", message("late")), None);

        queue.take(Duration::from_millis(50)).await.unwrap();
        let last = queue.take(Duration::from_millis(50)).await.unwrap();
        assert!(last.is_final);
        assert!(queue.take(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_producers_get_unique_sequences() {
        let queue = Arc::new(EventQueue::new("s1"));
        let mut handles = Vec::new();
        for t in 0..4 {
            let q = queue.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    q.put("worker", message(&format!("{}-{}", t, i)));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..100 {
            let event = queue.take(Duration::from_millis(50)).await.unwrap();
            assert!(event.sequence > last);
            last = event.sequence;
        }
        assert_eq!(last, 100);
    }
}
