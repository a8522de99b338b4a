use async_trait::async_trait;
use cravio_notify::{
    Acknowledge, ConnectionState, DeliveryGateway, DeliveryOutcome, DisconnectReason, Dispatch, Disposition,
    GatewayConfig, Identity, InboundDelivery, IngestionPipeline, NotificationMessage, NotifyError, Result,
};
use futures::stream;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Ack,
    Nack { requeue: bool },
}

#[derive(Clone, Default)]
struct Ledger(Arc<Mutex<Vec<(u64, Settled)>>>);

impl Ledger {
    fn entries(&self) -> Vec<(u64, Settled)> {
        self.0.lock().unwrap().clone()
    }
}

struct MemoryAcker {
    tag: u64,
    ledger: Ledger,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.ledger.0.lock().unwrap().push((self.tag, Settled::Ack));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.ledger.0.lock().unwrap().push((self.tag, Settled::Nack { requeue }));
        Ok(())
    }
}

fn delivery(ledger: &Ledger, tag: u64, body: &str) -> Result<InboundDelivery> {
    Ok(redelivery(ledger, tag, body, false))
}

fn redelivery(ledger: &Ledger, tag: u64, body: &str, redelivered: bool) -> InboundDelivery {
    InboundDelivery::new(
        tag,
        redelivered,
        body.as_bytes().to_vec(),
        MemoryAcker {
            tag,
            ledger: ledger.clone(),
        },
    )
}

fn setup() -> (Arc<DeliveryGateway>, IngestionPipeline, Ledger) {
    let gateway = DeliveryGateway::new(&GatewayConfig::default());
    let pipeline = IngestionPipeline::new(gateway.clone());
    (gateway, pipeline, Ledger::default())
}

#[tokio::test]
async fn connected_client_receives_exact_payload() {
    let (gateway, pipeline, ledger) = setup();
    let (mut conn, mut rx) = gateway.accept();
    gateway.on_register(&mut conn, Identity::new("a@x.com").unwrap());

    let body = r#"{"email":"a@x.com","orderId":"O1","status":"accepted"}"#;
    pipeline.run(stream::iter(vec![delivery(&ledger, 1, body)])).await.unwrap();

    let frame = rx.try_recv().expect("push expected");
    assert_eq!(frame.event, "notification");
    assert_eq!(frame.data, serde_json::from_str::<Value>(body).unwrap());
    assert_eq!(ledger.entries(), vec![(1, Settled::Ack)]);
    assert_eq!(pipeline.stats().delivered, 1);
}

#[tokio::test]
async fn offline_identity_is_acked_without_push() {
    let (gateway, pipeline, ledger) = setup();
    let (mut conn, mut rx) = gateway.accept();
    gateway.on_register(&mut conn, Identity::new("someone-else@x.com").unwrap());

    let body = r#"{"email":"b@x.com","orderId":"O2","status":"preparing"}"#;
    pipeline.run(stream::iter(vec![delivery(&ledger, 7, body)])).await.unwrap();

    assert!(rx.try_recv().is_err());
    assert_eq!(ledger.entries(), vec![(7, Settled::Ack)]);
    let stats = pipeline.stats();
    assert_eq!(stats.not_connected, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn malformed_message_is_rejected_and_loop_continues() {
    let (gateway, pipeline, ledger) = setup();
    let (mut conn, mut rx) = gateway.accept();
    gateway.on_register(&mut conn, Identity::new("a@x.com").unwrap());

    let deliveries = vec![
        delivery(&ledger, 1, "{not json"),
        delivery(&ledger, 2, r#"{"orderId":"O1"}"#),
        delivery(&ledger, 3, r#"{"email":"a@x.com","status":"ready"}"#),
    ];
    pipeline.run(stream::iter(deliveries)).await.unwrap();

    assert_eq!(
        ledger.entries(),
        vec![
            (1, Settled::Nack { requeue: false }),
            (2, Settled::Nack { requeue: false }),
            (3, Settled::Ack),
        ]
    );
    assert_eq!(rx.try_recv().unwrap().data, json!({"email": "a@x.com", "status": "ready"}));
    assert_eq!(pipeline.stats().rejected, 2);
}

#[tokio::test]
async fn reconnected_identity_receives_on_new_connection_only() {
    let (gateway, pipeline, ledger) = setup();

    let (mut first, mut rx1) = gateway.accept();
    gateway.on_register(&mut first, Identity::new("c@x.com").unwrap());
    gateway.on_disconnect(&mut first, DisconnectReason::PeerClosed);
    assert_eq!(first.state(), &ConnectionState::Disconnected);

    let (mut second, mut rx2) = gateway.accept();
    gateway.on_register(&mut second, Identity::new("c@x.com").unwrap());

    let body = r#"{"email":"c@x.com","orderId":"O3","status":"delivered"}"#;
    pipeline.run(stream::iter(vec![delivery(&ledger, 1, body)])).await.unwrap();

    assert!(rx1.try_recv().is_err());
    assert_eq!(rx2.try_recv().unwrap().data["orderId"], "O3");
}

#[tokio::test]
async fn per_identity_order_follows_queue_order() {
    let (gateway, pipeline, ledger) = setup();
    let (mut conn, mut rx) = gateway.accept();
    gateway.on_register(&mut conn, Identity::new("a@x.com").unwrap());

    let deliveries = (1..=5)
        .map(|n| delivery(&ledger, n, &format!(r#"{{"email":"a@x.com","seq":{n}}}"#)))
        .collect::<Vec<_>>();
    pipeline.run(stream::iter(deliveries)).await.unwrap();

    for n in 1..=5u64 {
        assert_eq!(rx.try_recv().unwrap().data["seq"], n);
    }
}

#[tokio::test]
async fn stream_error_ends_run_with_error() {
    let (_gateway, pipeline, ledger) = setup();
    let items = vec![
        delivery(&ledger, 1, r#"{"email":"a@x.com"}"#),
        Err(NotifyError::Processing("channel closed".into())),
        delivery(&ledger, 2, r#"{"email":"a@x.com"}"#),
    ];
    let result = pipeline.run(stream::iter(items)).await;

    assert!(matches!(result, Err(NotifyError::Processing(_))));
    assert_eq!(ledger.entries(), vec![(1, Settled::Ack)]);
}

struct FailingDispatch;

#[async_trait]
impl Dispatch for FailingDispatch {
    async fn dispatch(&self, _message: NotificationMessage) -> Result<DeliveryOutcome> {
        Err(NotifyError::Processing("store unavailable".into()))
    }
}

#[tokio::test]
async fn dispatch_error_requeues_first_time_and_drops_redelivery() {
    let pipeline = IngestionPipeline::new(Arc::new(FailingDispatch));
    let ledger = Ledger::default();
    let body = r#"{"email":"a@x.com"}"#;

    let first = pipeline.process(redelivery(&ledger, 1, body, false)).await;
    let second = pipeline.process(redelivery(&ledger, 1, body, true)).await;

    assert_eq!(first, Disposition::Requeued);
    assert_eq!(second, Disposition::Rejected);
    assert_eq!(
        ledger.entries(),
        vec![(1, Settled::Nack { requeue: true }), (1, Settled::Nack { requeue: false })]
    );
}

struct PanicOnce(AtomicUsize);

#[async_trait]
impl Dispatch for PanicOnce {
    async fn dispatch(&self, _message: NotificationMessage) -> Result<DeliveryOutcome> {
        if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("dispatcher bug");
        }
        Ok(DeliveryOutcome::NotConnected)
    }
}

#[tokio::test]
async fn panic_in_dispatch_is_nacked_and_consumer_keeps_running() {
    let pipeline = IngestionPipeline::new(Arc::new(PanicOnce(AtomicUsize::new(0))));
    let ledger = Ledger::default();

    let items = vec![
        delivery(&ledger, 1, r#"{"email":"a@x.com"}"#),
        delivery(&ledger, 2, r#"{"email":"a@x.com"}"#),
    ];
    pipeline.run(stream::iter(items)).await.unwrap();

    assert_eq!(
        ledger.entries(),
        vec![(1, Settled::Nack { requeue: true }), (2, Settled::Ack)]
    );
    assert_eq!(pipeline.stats().requeued, 1);
}
