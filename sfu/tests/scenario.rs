use std::{sync::Arc, time::Duration};

use conclave::{
    config::{CoordinatorConfig, WorkerConfig},
    coordinator::Coordinator,
    engine::loopback::LoopbackEngine,
    signaling::{message::ServerMessage, session::SignalingSession},
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct Client {
    session: SignalingSession,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    next_ack: u64,
}

impl Client {
    async fn open(coordinator: &Coordinator) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = SignalingSession::open(coordinator.clone(), tx).await;
        match rx.try_recv().unwrap() {
            ServerMessage::ConnectionSuccess { socket_id } => {
                assert_eq!(socket_id, session.connection_id())
            }
            other => panic!("expected connection-success, got {:?}", other),
        }
        Self {
            session,
            rx,
            next_ack: 0,
        }
    }

    async fn call(&mut self, event: &str, data: Value) -> Value {
        self.next_ack += 1;
        let id = self.next_ack;
        let frame = json!({"event": event, "ack": id, "data": data});
        self.session.handle_text(&frame.to_string()).await;
        loop {
            match self.rx.try_recv().unwrap() {
                ServerMessage::Ack { id: got, payload } if got == id => return payload,
                _ => continue,
            }
        }
    }

    async fn emit(&mut self, event: &str, data: Value) {
        let frame = json!({"event": event, "data": data});
        self.session.handle_text(&frame.to_string()).await;
    }

    async fn next_push(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn assert_quiet(&mut self) {
        if let Ok(message) = self.rx.try_recv() {
            panic!("unexpected message {:?}", message);
        }
    }
}

fn dtls() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{"algorithm": "sha-256", "value": "12:34:56"}]
    })
}

fn vp8() -> Value {
    json!({
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 101,
            "clockRate": 90000,
            "rtcpFeedback": [{"type": "nack"}]
        }],
        "encodings": [{"ssrc": 1111}]
    })
}

fn setup() -> (Coordinator, Arc<LoopbackEngine>) {
    let engine = LoopbackEngine::new(WorkerConfig::default());
    let coordinator = Coordinator::new(engine.clone(), CoordinatorConfig::default());
    (coordinator, engine)
}

async fn publisher(coordinator: &Coordinator, room: &str) -> (Client, String, bool) {
    let mut client = Client::open(coordinator).await;
    client.call("joinRoom", json!({"roomName": room})).await;
    client
        .call("createWebRtcTransport", json!({"consumer": false}))
        .await;
    client
        .emit("transport-connect", json!({"dtlsParameters": dtls()}))
        .await;
    let produced = client
        .call(
            "transport-produce",
            json!({"kind": "video", "rtpParameters": vp8(), "appData": {"source": "camera"}}),
        )
        .await;
    let id = produced["id"].as_str().unwrap().to_owned();
    let exist = produced["producersExist"].as_bool().unwrap();
    (client, id, exist)
}

#[tokio::test]
async fn two_peers_share_video() {
    let (coordinator, _engine) = setup();

    let (a, producer_id, producers_exist) = publisher(&coordinator, "x").await;
    assert!(!producers_exist);

    let mut b = Client::open(&coordinator).await;
    let joined = b.call("joinRoom", json!({"roomName": "x"})).await;
    assert!(joined["rtpCapabilities"]["codecs"].is_array());
    let recv = b
        .call("createWebRtcTransport", json!({"consumer": true}))
        .await;
    let recv_id = recv["params"]["id"].as_str().unwrap().to_owned();

    let producers = b.call("getProducers", Value::Null).await;
    assert_eq!(producers, json!([producer_id.clone()]));

    let consumed = b
        .call(
            "consume",
            json!({
                "rtpCapabilities": joined["rtpCapabilities"],
                "remoteProducerId": producer_id,
                "serverConsumerTransportId": recv_id,
            }),
        )
        .await;
    assert_eq!(consumed["params"]["kind"], "video");
    assert_eq!(consumed["params"]["producerId"], producer_id.as_str());
    let consumer_id = consumed["params"]["serverConsumerId"]
        .as_str()
        .unwrap()
        .to_owned();

    b.emit(
        "transport-recv-connect",
        json!({"dtlsParameters": dtls(), "serverConsumerTransportId": recv_id}),
    )
    .await;
    b.emit("consumer-resume", json!({"serverConsumerId": consumer_id}))
        .await;
    b.assert_quiet();

    a.session.close().await;
    coordinator.flush_events().await;

    assert_eq!(
        b.next_push().await,
        ServerMessage::ProducerClosed {
            remote_producer_id: producer_id
        }
    );
    let snapshot = coordinator.snapshot().await;
    assert_eq!(snapshot.peers, 1);
    assert_eq!(snapshot.producers, 0);
    assert_eq!(snapshot.consumers, 0);
    assert_eq!(snapshot.transports, 0);
}

#[tokio::test]
async fn new_producer_fanout_is_room_scoped() {
    let (coordinator, _engine) = setup();

    let mut b = Client::open(&coordinator).await;
    b.call("joinRoom", json!({"roomName": "x"})).await;
    let mut c = Client::open(&coordinator).await;
    c.call("joinRoom", json!({"roomName": "x"})).await;
    let mut outsider = Client::open(&coordinator).await;
    outsider.call("joinRoom", json!({"roomName": "y"})).await;

    let (mut a, producer_id, _) = publisher(&coordinator, "x").await;

    for client in [&mut b, &mut c] {
        assert_eq!(
            client.next_push().await,
            ServerMessage::NewProducer {
                producer_id: producer_id.clone()
            }
        );
        client.assert_quiet();
    }
    a.assert_quiet();
    outsider.assert_quiet();

    let second = b.call("getProducers", Value::Null).await;
    assert_eq!(second, json!([producer_id]));
    assert!(outsider
        .call("getProducers", Value::Null)
        .await
        .as_array()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn produce_before_transport_is_rejected() {
    let (coordinator, _engine) = setup();
    let mut a = Client::open(&coordinator).await;
    a.call("joinRoom", json!({"roomName": "x"})).await;

    let response = a
        .call("transport-produce", json!({"kind": "video", "rtpParameters": vp8()}))
        .await;
    assert!(response["error"]
        .as_str()
        .unwrap()
        .starts_with("ProtocolOrderError"));
    assert_eq!(coordinator.snapshot().await.producers, 0);
}

#[tokio::test]
async fn explicit_producer_close_cascades() {
    let (coordinator, _engine) = setup();
    let (mut a, producer_id, _) = publisher(&coordinator, "x").await;

    let mut b = Client::open(&coordinator).await;
    let joined = b.call("joinRoom", json!({"roomName": "x"})).await;
    let recv = b
        .call("createWebRtcTransport", json!({"consumer": true}))
        .await;
    b.call(
        "consume",
        json!({
            "rtpCapabilities": joined["rtpCapabilities"],
            "remoteProducerId": producer_id,
            "serverConsumerTransportId": recv["params"]["id"],
        }),
    )
    .await;

    a.emit("producer-close", json!({"producerId": producer_id}))
        .await;
    a.assert_quiet();
    coordinator.flush_events().await;

    assert_eq!(
        b.next_push().await,
        ServerMessage::ProducerClosed {
            remote_producer_id: producer_id
        }
    );
    let peer = coordinator.peer(b.session.connection_id()).await.unwrap();
    assert!(peer.owns_nothing());
    let snapshot = coordinator.snapshot().await;
    assert_eq!(snapshot.consumers, 0);
    assert_eq!(snapshot.producers, 0);
    assert_eq!(snapshot.transports, 1);
}

#[tokio::test]
async fn engine_death_fails_every_later_call() {
    let (coordinator, engine) = setup();
    let mut failures = coordinator.engine_failures();
    let mut a = Client::open(&coordinator).await;
    a.call("joinRoom", json!({"roomName": "x"})).await;

    engine.kill("segfault");
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap(),
        "segfault"
    );

    let response = a
        .call("createWebRtcTransport", json!({"consumer": false}))
        .await;
    assert!(response["error"]
        .as_str()
        .unwrap()
        .contains("EngineError"));
}
