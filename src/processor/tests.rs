use serde_json::json;

use super::*;
use crate::bus::{InMemoryConsumer, InMemoryQueue, QueueMessage, WorkQueue};
use crate::config::WriteMode;
use crate::order::{OrderMessage, OrderRequest};
use crate::search::InMemoryIndex;

const WORK: Duration = Duration::from_millis(1);
const INDEX_TIMEOUT: Duration = Duration::from_millis(200);

fn processor(index: &Arc<InMemoryIndex>) -> OrderProcessor {
    OrderProcessor::new(index.clone(), WORK, INDEX_TIMEOUT)
}

fn order_body(id: &str) -> Vec<u8> {
    serde_json::to_vec(&OrderMessage {
        order_id: OrderId::new(id),
        order: OrderRequest::default(),
    })
    .unwrap()
}

async fn enqueue(queue: &InMemoryQueue, body: Vec<u8>) {
    queue.publish(QueueMessage::new(body)).await.unwrap();
}

async fn next(consumer: &mut InMemoryConsumer) -> QueueDelivery {
    tokio::time::timeout(Duration::from_secs(1), consumer.next_delivery())
        .await
        .expect("delivery")
        .expect("open")
        .expect("ok")
}

const REQUEUE_NOW: Disposition = Disposition::Requeue {
    delay: Duration::ZERO,
};

// ============================================================================
// Transition functions
// ============================================================================

#[test]
fn test_decode_rejects_non_object() {
    let bodies: [&[u8]; 4] = [b"not json", b"[1,2]", b"null", b""];
    for body in bodies {
        assert!(matches!(
            decode(body),
            Step::Failed(ProcessingError::Decode(_))
        ));
    }
}

#[test]
fn test_validate_requires_non_empty_string_id() {
    let cases = [
        json!({}),
        json!({"orderId": ""}),
        json!({"orderId": 42}),
        json!({"orderId": null}),
    ];
    for case in cases {
        let message = case.as_object().unwrap().clone();
        let step = validate(&message);
        assert!(
            matches!(step, Step::Failed(ProcessingError::MissingOrderId)),
            "{:?}",
            case
        );
    }

    let message = json!({"orderId": "X"}).as_object().unwrap().clone();
    assert!(matches!(validate(&message), Step::Validated(id) if id.as_str() == "X"));
}

#[test]
fn test_error_stage() {
    assert_eq!(ProcessingError::MissingOrderId.stage(), "validate");
    assert_eq!(
        ProcessingError::IndexTimeout(Duration::from_secs(3)).stage(),
        "index"
    );
}

#[tokio::test]
async fn test_evaluate_writes_processed_record() {
    let index = Arc::new(InMemoryIndex::new());

    let order_id = processor(&index).evaluate(&order_body("X")).await.unwrap();

    assert_eq!(order_id.as_str(), "X");
    let records = index.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "PROCESSED");
    assert_eq!(records[0].source, "rabbitmq");
}

#[tokio::test]
async fn test_evaluate_index_timeout() {
    let index = Arc::new(InMemoryIndex::new());
    index.set_write_delay(Some(Duration::from_secs(2)));

    let result = processor(&index).evaluate(&order_body("X")).await;

    assert!(matches!(result, Err(ProcessingError::IndexTimeout(_))));
    assert!(index.records().is_empty());
}

// ============================================================================
// Settlement
// ============================================================================

#[tokio::test]
async fn test_invalid_json_is_requeued_and_remains_consumable() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    enqueue(&queue, b"not json".to_vec()).await;
    let mut consumer = queue.consume();

    let disposition = processor(&index).handle(next(&mut consumer).await).await;

    assert_eq!(disposition, REQUEUE_NOW);
    assert_eq!(queue.ready_count(), 1);
    assert_eq!(queue.unacked_count(), 0);

    let again = next(&mut consumer).await;
    assert!(again.redelivered);
    assert_eq!(again.body, b"not json");
}

#[tokio::test]
async fn test_missing_order_id_is_requeued() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    enqueue(&queue, br#"{"orderId":"","order":{}}"#.to_vec()).await;
    let mut consumer = queue.consume();

    let disposition = processor(&index).handle(next(&mut consumer).await).await;

    assert_eq!(disposition, REQUEUE_NOW);
    assert_eq!(queue.depth(), 1);
    assert!(index.records().is_empty());
}

#[tokio::test]
async fn test_index_failure_keeps_message_and_writes_nothing() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    index.fail_next_writes(1);
    enqueue(&queue, order_body("X")).await;
    let mut consumer = queue.consume();

    let disposition = processor(&index).handle(next(&mut consumer).await).await;

    assert_eq!(disposition, REQUEUE_NOW);
    assert_eq!(queue.depth(), 1);
    assert_eq!(queue.acked_count(), 0);
    assert!(index.records().is_empty());
}

#[tokio::test]
async fn test_success_acks_and_writes_one_record() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    enqueue(&queue, order_body("X")).await;
    let mut consumer = queue.consume();

    let disposition = processor(&index).handle(next(&mut consumer).await).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(queue.depth(), 0);
    assert_eq!(queue.acked_count(), 1);
    assert_eq!(index.count_for(&OrderId::new("X")), 1);
}

#[tokio::test]
async fn test_transient_index_failure_then_success_writes_one_record() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    index.fail_next_writes(1);
    enqueue(&queue, order_body("X")).await;
    let mut consumer = queue.consume();
    let processor = processor(&index);

    assert_eq!(processor.handle(next(&mut consumer).await).await, REQUEUE_NOW);
    assert_eq!(
        processor.handle(next(&mut consumer).await).await,
        Disposition::Ack
    );

    assert_eq!(index.count_for(&OrderId::new("X")), 1);
    assert_eq!(queue.depth(), 0);
}

/// A consumer that dies after the index write but before acknowledging
/// leaves the message unacked; redelivery then inserts a second record for
/// the same order. This is the current insert-mode behavior.
#[tokio::test]
async fn test_crash_before_ack_duplicates_record_in_insert_mode() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    enqueue(&queue, order_body("X")).await;
    let processor = processor(&index);

    let mut crashed = queue.consume();
    let delivery = next(&mut crashed).await;
    processor.evaluate(&delivery.body).await.unwrap();
    drop(delivery);
    drop(crashed);
    queue.recover_unacked();

    let mut restarted = queue.consume();
    let redelivered = next(&mut restarted).await;
    assert!(redelivered.redelivered);
    assert_eq!(processor.handle(redelivered).await, Disposition::Ack);

    assert_eq!(index.count_for(&OrderId::new("X")), 2);
    assert_eq!(queue.depth(), 0);
}

#[tokio::test]
async fn test_crash_before_ack_keeps_one_record_in_upsert_mode() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::with_write_mode(WriteMode::Upsert));
    enqueue(&queue, order_body("X")).await;
    let processor = processor(&index);

    let mut crashed = queue.consume();
    let delivery = next(&mut crashed).await;
    processor.evaluate(&delivery.body).await.unwrap();
    drop(delivery);
    drop(crashed);
    queue.recover_unacked();

    let mut restarted = queue.consume();
    processor.handle(next(&mut restarted).await).await;

    assert_eq!(index.count_for(&OrderId::new("X")), 1);
}

#[tokio::test]
async fn test_bounded_policy_dead_letters_after_max_attempts() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    enqueue(&queue, b"not json".to_vec()).await;
    let mut consumer = queue.consume();
    let processor = processor(&index).with_policy(RedeliveryPolicy {
        max_attempts: Some(2),
        ..RedeliveryPolicy::forever()
    });

    assert_eq!(processor.handle(next(&mut consumer).await).await, REQUEUE_NOW);
    assert_eq!(
        processor.handle(next(&mut consumer).await).await,
        Disposition::DeadLetter
    );

    assert_eq!(queue.depth(), 0);
    assert_eq!(queue.dead_lettered().len(), 1);
}

// ============================================================================
// Consume loop
// ============================================================================

#[tokio::test]
async fn test_run_processes_until_shutdown() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    for id in ["A", "B", "C"] {
        enqueue(&queue, order_body(id)).await;
    }
    let mut consumer = queue.consume();
    let (tx, mut rx) = watch::channel(false);
    let processor = processor(&index);

    let run = processor.run(&mut consumer, &mut rx);
    let stop = async {
        while queue.acked_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
    };
    let (exit, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(run, stop)
    })
    .await
    .unwrap();

    assert_eq!(exit, RunExit::Shutdown);
    assert_eq!(index.records().len(), 3);
}

#[tokio::test]
async fn test_shutdown_cuts_requeue_delay_short() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    enqueue(&queue, b"not json".to_vec()).await;
    let mut consumer = queue.consume();
    let (tx, mut rx) = watch::channel(false);
    let processor = processor(&index).with_policy(RedeliveryPolicy {
        base_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(30),
        ..RedeliveryPolicy::forever()
    });

    let run = processor.run(&mut consumer, &mut rx);
    let stop = async {
        while queue.unacked_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
    };
    let (exit, ()) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(run, stop)
    })
    .await
    .expect("requeue delay held up shutdown");

    assert_eq!(exit, RunExit::Shutdown);
    assert_eq!(queue.ready_count(), 1);
    assert_eq!(queue.unacked_count(), 0);
}

#[tokio::test]
async fn test_run_returns_when_source_closes() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    let mut consumer = queue.consume();
    let (_tx, mut rx) = watch::channel(false);
    queue.close();

    let exit = processor(&index).run(&mut consumer, &mut rx).await;

    assert_eq!(exit, RunExit::SourceClosed);
}

#[tokio::test]
async fn test_consume_with_reconnect_retries_connect() {
    let queue = InMemoryQueue::new();
    let index = Arc::new(InMemoryIndex::new());
    enqueue(&queue, order_body("X")).await;
    let (tx, rx) = watch::channel(false);
    let processor = processor(&index);

    let mut attempts = 0;
    let connect = || {
        attempts += 1;
        let result = if attempts == 1 {
            Err(BusError::Connection("refused".to_string()))
        } else {
            Ok(queue.consume())
        };
        async move { result }
    };

    let consume = processor.consume_with_reconnect(connect, rx);
    let stop = async {
        while queue.acked_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
    };
    let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(consume, stop)
    })
    .await
    .unwrap();

    assert!(result.is_ok());
    assert_eq!(index.count_for(&OrderId::new("X")), 1);
}
