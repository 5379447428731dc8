use std::time::Duration;

use dramatiq_broker::BrokerConfig;

use crate::common::{init_tracing, make_test_broker, random_namespace, NamespaceGuard};

#[tokio::test]
async fn priority_respected() {
    let (broker, _guard) = make_test_broker("q").await;

    broker.enqueue("q", "a", b"A", Some(5)).await.unwrap();
    broker.enqueue("q", "b", b"B", Some(0)).await.unwrap();
    broker.enqueue("q", "c", b"C", Some(5)).await.unwrap();

    let mut consumer = broker.consume("q", 10);
    let mut order = Vec::new();
    for _ in 0..3 {
        let message = consumer.next_message().await.expect("message available");
        order.push(message.id.clone());
        broker.ack("q", &message.id).await.unwrap();
    }
    consumer.close().await.unwrap();

    assert_eq!(order, vec!["b", "a", "c"]);
}

#[tokio::test]
async fn default_priority_from_env() {
    init_tracing();
    std::env::set_var("dramatiq_actor_default_priority", "100");
    let namespace = random_namespace();
    let _guard = NamespaceGuard::new(namespace.clone(), "q");
    let config = BrokerConfig::from_env()
        .with_namespace(namespace)
        .with_redis_dsn("redis://localhost");
    let broker = dramatiq_broker::BrokerClient::connect(config).await.unwrap();
    std::env::remove_var("dramatiq_actor_default_priority");

    broker.enqueue("q", "x", b"X", None).await.unwrap();
    broker.enqueue("q", "y", b"Y", Some(50)).await.unwrap();

    let mut consumer = broker.consume("q", 10);
    let first = consumer.next_message().await.unwrap();
    broker.ack("q", &first.id).await.unwrap();
    let second = consumer.next_message().await.unwrap();
    broker.ack("q", &second.id).await.unwrap();
    consumer.close().await.unwrap();

    assert_eq!(vec![first.id, second.id], vec!["y", "x"]);
}

#[tokio::test]
async fn crash_recovery_via_maintenance() {
    let (broker_w1, _guard) = make_test_broker("q").await;
    // W2 shares the same namespace and Redis instance, but gets its own
    // worker id, so it can observe W1's abandoned in-flight message.
    let mut config_w2 = broker_w1.config().clone();
    config_w2.heartbeat_timeout = Duration::from_millis(50);
    config_w2.maintenance_probability = 1.0;

    let broker_w2 = dramatiq_broker::BrokerClient::connect(config_w2)
        .await
        .unwrap();

    broker_w1.enqueue("q", "m", b"M", Some(0)).await.unwrap();

    let mut consumer_w1 = broker_w1.consume("q", 1);
    let fetched = consumer_w1.next_message().await.unwrap();
    assert_eq!(fetched.id, "m");
    // W1 "crashes": stop its prefetch loop without acking, so its heartbeat
    // is never refreshed again and `m` stays assigned to its ack group.
    consumer_w1.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut consumer_w2 = broker_w2.consume("q", 1);
    let recovered = consumer_w2.next_message().await.unwrap();
    assert_eq!(recovered.id, "m");
    broker_w2.ack("q", &recovered.id).await.unwrap();
    consumer_w2.close().await.unwrap();
}

#[tokio::test]
async fn dlq_on_nack() {
    let (broker, _guard) = make_test_broker("q").await;
    broker.enqueue("q", "n", b"N", Some(0)).await.unwrap();

    let mut consumer = broker.consume("q", 10);
    let message = consumer.next_message().await.unwrap();
    assert_eq!(message.id, "n");
    broker.nack("q", &message.id).await.unwrap();
    consumer.close().await.unwrap();

    assert_eq!(broker.qsize("q").await.unwrap(), 0);

    let config = broker.config();
    let client = redis::Client::open(config.redis_dsn.clone()).unwrap();
    let mut conn = client.get_connection().unwrap();
    let dlq_key = format!("{}:q.XQ", config.namespace);
    let dlq_msgs_key = format!("{}:q.XQ.msgs", config.namespace);
    let in_dlq: bool = redis::Cmd::new()
        .arg("ZSCORE")
        .arg(&dlq_key)
        .arg("n")
        .query::<Option<f64>>(&mut conn)
        .unwrap()
        .is_some();
    assert!(in_dlq, "nacked message should land in the dead-letter zset");
    let payload: Option<Vec<u8>> = redis::Cmd::new()
        .arg("HGET")
        .arg(&dlq_msgs_key)
        .arg("n")
        .query(&mut conn)
        .unwrap();
    assert_eq!(payload, Some(b"N".to_vec()));
}

#[tokio::test]
async fn ack_is_idempotent() {
    let (broker, _guard) = make_test_broker("q").await;
    broker.enqueue("q", "m", b"M", Some(0)).await.unwrap();

    let mut consumer = broker.consume("q", 10);
    let message = consumer.next_message().await.unwrap();
    broker.ack("q", &message.id).await.unwrap();
    // A second ack of the same message must not error or resurrect it.
    broker.ack("q", &message.id).await.unwrap();
    consumer.close().await.unwrap();

    assert_eq!(broker.qsize("q").await.unwrap(), 0);
}

#[tokio::test]
async fn requeue_restores_original_priority() {
    let (broker, _guard) = make_test_broker("q").await;
    broker.enqueue("q", "m", b"M", Some(7)).await.unwrap();

    let consumer = broker.consume("q", 10);
    // Give the background prefetch loop time to pull "m" into its buffer,
    // then close without ever handing it to `next_message` — the consumer
    // must requeue it at the priority it was fetched with.
    tokio::time::sleep(Duration::from_millis(100)).await;
    consumer.close().await.unwrap();

    let config = broker.config();
    let client = redis::Client::open(config.redis_dsn.clone()).unwrap();
    let mut conn = client.get_connection().unwrap();
    let queue_key = format!("{}:q", config.namespace);
    let score: Option<f64> = redis::Cmd::new()
        .arg("ZSCORE")
        .arg(&queue_key)
        .arg("m")
        .query(&mut conn)
        .unwrap();
    assert_eq!(score, Some(7.0));
}

#[tokio::test]
async fn dlq_entries_expire_after_ttl() {
    let (broker_w1, _guard) = make_test_broker("q").await;
    let mut config = broker_w1.config().clone();
    config.dead_message_ttl = Duration::from_millis(50);
    config.maintenance_probability = 1.0;
    let broker = dramatiq_broker::BrokerClient::connect(config).await.unwrap();

    broker.enqueue("q", "n", b"N", Some(0)).await.unwrap();
    let mut consumer = broker.consume("q", 10);
    let message = consumer.next_message().await.unwrap();
    broker.nack("q", &message.id).await.unwrap();
    consumer.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    // Any script call with maintenance sampled in sweeps expired DLQ entries.
    broker.enqueue("q", "other", b"O", Some(0)).await.unwrap();
    let mut consumer = broker.consume("q", 10);
    let other = consumer.next_message().await.unwrap();
    broker.ack("q", &other.id).await.unwrap();
    consumer.close().await.unwrap();

    let dlq_config = broker.config();
    let client = redis::Client::open(dlq_config.redis_dsn.clone()).unwrap();
    let mut conn = client.get_connection().unwrap();
    let dlq_key = format!("{}:q.XQ", dlq_config.namespace);
    let dlq_msgs_key = format!("{}:q.XQ.msgs", dlq_config.namespace);
    let score: Option<f64> = redis::Cmd::new()
        .arg("ZSCORE")
        .arg(&dlq_key)
        .arg("n")
        .query(&mut conn)
        .unwrap();
    assert_eq!(score, None, "expired DLQ member must be gone from the zset");
    let payload: Option<Vec<u8>> = redis::Cmd::new()
        .arg("HGET")
        .arg(&dlq_msgs_key)
        .arg("n")
        .query(&mut conn)
        .unwrap();
    assert_eq!(payload, None, "expired DLQ member's payload must be gone too");
}

#[tokio::test]
async fn dead_worker_heartbeat_is_removed_once_drained() {
    let (broker_w1, _guard) = make_test_broker("q").await;
    let mut config_w2 = broker_w1.config().clone();
    config_w2.heartbeat_timeout = Duration::from_millis(50);
    config_w2.maintenance_probability = 1.0;
    let broker_w2 = dramatiq_broker::BrokerClient::connect(config_w2)
        .await
        .unwrap();

    broker_w1.enqueue("q", "m", b"M", Some(0)).await.unwrap();
    let mut consumer_w1 = broker_w1.consume("q", 1);
    let _ = consumer_w1.next_message().await.unwrap();
    consumer_w1.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut consumer_w2 = broker_w2.consume("q", 1);
    let recovered = consumer_w2.next_message().await.unwrap();
    broker_w2.ack("q", &recovered.id).await.unwrap();
    consumer_w2.close().await.unwrap();

    let config = broker_w2.config();
    let client = redis::Client::open(config.redis_dsn.clone()).unwrap();
    let mut conn = client.get_connection().unwrap();
    let heartbeats_key = format!("{}:__heartbeats__", config.namespace);
    let worker_id = broker_w1.worker_id().to_string();
    let score: Option<f64> = redis::Cmd::new()
        .arg("ZSCORE")
        .arg(&heartbeats_key)
        .arg(&worker_id)
        .query(&mut conn)
        .unwrap();
    assert_eq!(
        score, None,
        "a dead worker with no remaining ack groups must be dropped from heartbeats"
    );
}

#[tokio::test]
async fn purge_clears_queue_and_dlq() {
    let (broker, _guard) = make_test_broker("q").await;
    broker.enqueue("q", "a", b"A", Some(0)).await.unwrap();
    broker.enqueue("q", "b", b"B", Some(0)).await.unwrap();

    let mut consumer = broker.consume("q", 10);
    let first = consumer.next_message().await.unwrap();
    broker.nack("q", &first.id).await.unwrap();
    consumer.close().await.unwrap();

    broker.purge("q").await.unwrap();
    assert_eq!(broker.qsize("q").await.unwrap(), 0);
}

