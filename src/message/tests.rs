use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::*;

#[derive(Default)]
struct Counts {
    acks: AtomicUsize,
    requeues: AtomicUsize,
    rejects: AtomicUsize,
}

struct CountingAcker(Arc<Counts>);

#[async_trait]
impl Acknowledger for CountingAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        if requeue {
            self.0.requeues.fetch_add(1, Ordering::SeqCst);
        } else {
            self.0.rejects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn test_outbound_ids_are_unique() {
    let a = OutboundMessage::new(b"same".to_vec());
    let b = OutboundMessage::new(b"same".to_vec());
    assert!(!a.id.is_empty());
    assert_ne!(a.id, b.id);
    assert_eq!(a.payload, b.payload);
}

#[tokio::test]
async fn test_inbound_ack_and_nack_reach_the_transport() {
    let counts = Arc::new(Counts::default());

    let msg = InboundMessage::new(
        "id-1".to_string(),
        b"hello".to_vec(),
        Box::new(CountingAcker(counts.clone())),
    );
    assert_eq!(msg.id(), "id-1");
    assert_eq!(msg.payload(), b"hello");
    msg.ack().await.unwrap();

    let msg = InboundMessage::new(
        "id-2".to_string(),
        Vec::new(),
        Box::new(CountingAcker(counts.clone())),
    );
    msg.nack(true).await.unwrap();

    assert_eq!(counts.acks.load(Ordering::SeqCst), 1);
    assert_eq!(counts.requeues.load(Ordering::SeqCst), 1);
    assert_eq!(counts.rejects.load(Ordering::SeqCst), 0);
}

#[test]
fn test_debug_hides_payload() {
    let msg = InboundMessage::new(
        "id".to_string(),
        b"secret".to_vec(),
        Box::new(CountingAcker(Arc::new(Counts::default()))),
    );
    let rendered = format!("{msg:?}");
    assert!(rendered.contains("payload_len: 6"));
    assert!(!rendered.contains("secret"));
}
