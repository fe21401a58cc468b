// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by General Public License that can be found
// in the LICENSE file.

//! End-to-end broker behaviour, driven through in-memory duplex streams:
//! a real `Broker` on one side, either a real `tern` client or a raw packet
//! script on the other.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use codec::{
    ConnectPacket, ControlPacket, EncodePacket, PacketId, PublishPacket, PublishReleasePacket,
    QoS, SubscribeTopic,
};
use session::{MemoryPersister, Persister};
use shrike::Broker;
use tern::{AsyncClient, ConnectOptions, MessageHandler};

const RECV_DEADLINE: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(300);

/// Message/event sink handed to `tern` clients under test.
struct Recorder {
    messages: mpsc::UnboundedSender<PublishPacket>,
    subscribed: mpsc::UnboundedSender<usize>,
}

struct RecorderRx {
    messages: mpsc::UnboundedReceiver<PublishPacket>,
    subscribed: mpsc::UnboundedReceiver<usize>,
}

fn recorder() -> (Recorder, RecorderRx) {
    let (messages, messages_rx) = mpsc::unbounded_channel();
    let (subscribed, subscribed_rx) = mpsc::unbounded_channel();
    (
        Recorder {
            messages,
            subscribed,
        },
        RecorderRx {
            messages: messages_rx,
            subscribed: subscribed_rx,
        },
    )
}

impl MessageHandler for Recorder {
    fn on_message(&self, publish: &PublishPacket) {
        let _ = self.messages.send(publish.clone());
    }

    fn on_subscribe_success(&self, topics: &[SubscribeTopic]) {
        let _ = self.subscribed.send(topics.len());
    }
}

fn new_broker() -> (Broker, Arc<dyn Persister>) {
    let persister: Arc<dyn Persister> = Arc::new(MemoryPersister::new());
    (Broker::new(Arc::clone(&persister)), persister)
}

/// Connect a real client to the broker over a fresh duplex pipe.
async fn connect_client<H>(broker: &Broker, client_id: &str, clean_session: bool, handler: H) -> AsyncClient
where
    H: MessageHandler + 'static,
{
    let (client_side, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);

    let mut options = ConnectOptions::new("in-memory");
    options
        .set_client_id(client_id)
        .set_clean_session(clean_session)
        .set_keep_alive(30);
    AsyncClient::run(
        client_side,
        Arc::new(MemoryPersister::new()),
        options,
        handler,
    )
    .await
    .expect("client handshake")
}

async fn subscribe_and_wait(client: &AsyncClient, rx: &mut RecorderRx, filter: &str, qos: QoS) {
    client
        .subscribe(vec![SubscribeTopic::new(filter, qos).unwrap()])
        .await;
    timeout(RECV_DEADLINE, rx.subscribed.recv())
        .await
        .expect("suback deadline")
        .expect("suback");
}

async fn recv_message(rx: &mut RecorderRx) -> PublishPacket {
    timeout(RECV_DEADLINE, rx.messages.recv())
        .await
        .expect("message deadline")
        .expect("message")
}

async fn assert_silence(rx: &mut RecorderRx) {
    assert!(
        timeout(SILENCE, rx.messages.recv()).await.is_err(),
        "expected no message"
    );
}

// Raw packet plumbing for the scripted sides.

async fn write_raw<P: EncodePacket>(stream: &mut DuplexStream, packet: &P) {
    let mut buf = Vec::new();
    packet.encode(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
}

async fn read_raw(stream: &mut DuplexStream, buf: &mut Vec<u8>) -> ControlPacket {
    let packet = async {
        loop {
            if let Some((packet, used)) = ControlPacket::from_buffer(buf).unwrap() {
                buf.drain(..used);
                return packet;
            }
            let n_recv = stream.read_buf(buf).await.unwrap();
            assert!(n_recv > 0, "stream closed while expecting a packet");
        }
    };
    timeout(RECV_DEADLINE, packet).await.expect("read deadline")
}

/// Raw CONNECT/CONNACK exchange; returns the session-present flag.
async fn raw_connect(stream: &mut DuplexStream, buf: &mut Vec<u8>, connect: &ConnectPacket) -> bool {
    write_raw(stream, connect).await;
    match read_raw(stream, buf).await {
        ControlPacket::ConnectAck(ack) => {
            assert_eq!(ack.return_code(), codec::ConnectReturnCode::Accepted);
            ack.session_present()
        }
        other => panic!("expected connack, got {other:?}"),
    }
}

#[tokio::test]
async fn test_qos1_end_to_end() {
    let (broker, _persister) = new_broker();

    let (handler, mut events) = recorder();
    let subscriber = connect_client(&broker, "sub-1", true, handler).await;
    subscribe_and_wait(&subscriber, &mut events, "a/+", QoS::AtLeastOnce).await;

    let (pub_handler, _pub_events) = recorder();
    let publisher = connect_client(&broker, "pub-1", true, pub_handler).await;
    publisher
        .publish("a/x", QoS::AtLeastOnce, b"hi")
        .await
        .unwrap();

    let message = recv_message(&mut events).await;
    assert_eq!(message.topic(), "a/x");
    assert_eq!(message.message(), b"hi");
    assert_eq!(message.qos(), QoS::AtLeastOnce);
    assert!(!message.retain());
}

#[tokio::test]
async fn test_qos_clamped_to_subscription() {
    let (broker, _persister) = new_broker();

    let (handler, mut events) = recorder();
    let subscriber = connect_client(&broker, "sub-clamp", true, handler).await;
    subscribe_and_wait(&subscriber, &mut events, "a/+", QoS::AtMostOnce).await;

    let (pub_handler, _pub_events) = recorder();
    let publisher = connect_client(&broker, "pub-clamp", true, pub_handler).await;
    publisher
        .publish("a/x", QoS::ExactOnce, b"clamped")
        .await
        .unwrap();

    let message = recv_message(&mut events).await;
    assert_eq!(message.qos(), QoS::AtMostOnce);
}

#[tokio::test]
async fn test_qos2_duplicate_delivered_once() {
    let (broker, _persister) = new_broker();

    let (handler, mut events) = recorder();
    let subscriber = connect_client(&broker, "sub-2", true, handler).await;
    subscribe_and_wait(&subscriber, &mut events, "exact/#", QoS::ExactOnce).await;

    // Scripted publisher so the duplicate can be injected verbatim.
    let (mut raw, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);
    let mut buf = Vec::new();
    let connect = ConnectPacket::new("pub-2").unwrap();
    raw_connect(&mut raw, &mut buf, &connect).await;

    let mut publish = PublishPacket::new("exact/once", QoS::ExactOnce, b"only-once").unwrap();
    publish.set_packet_id(PacketId::new(5));
    write_raw(&mut raw, &publish).await;
    match read_raw(&mut raw, &mut buf).await {
        ControlPacket::PublishReceived(rec) => assert_eq!(rec.packet_id(), PacketId::new(5)),
        other => panic!("expected pubrec, got {other:?}"),
    }

    // Network glitch: the sender did not see the PUBREC and retries.
    publish.set_dup(true).unwrap();
    write_raw(&mut raw, &publish).await;
    match read_raw(&mut raw, &mut buf).await {
        ControlPacket::PublishReceived(rec) => assert_eq!(rec.packet_id(), PacketId::new(5)),
        other => panic!("expected pubrec again, got {other:?}"),
    }

    write_raw(&mut raw, &PublishReleasePacket::new(PacketId::new(5))).await;
    match read_raw(&mut raw, &mut buf).await {
        ControlPacket::PublishComplete(comp) => assert_eq!(comp.packet_id(), PacketId::new(5)),
        other => panic!("expected pubcomp, got {other:?}"),
    }

    let message = recv_message(&mut events).await;
    assert_eq!(message.message(), b"only-once");
    assert_silence(&mut events).await;
}

#[tokio::test]
async fn test_retained_delivery_and_removal() {
    let (broker, _persister) = new_broker();

    // Publish through the raw path to control the retain flag; the client
    // handle exposes topic/qos/payload only. No subscriber exists yet, the
    // message is only stored.
    let (mut raw, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);
    let mut buf = Vec::new();
    raw_connect(&mut raw, &mut buf, &ConnectPacket::new("raw-retain").unwrap()).await;
    let mut publish = PublishPacket::new("t/1", QoS::AtLeastOnce, b"state").unwrap();
    publish.set_packet_id(PacketId::new(1));
    publish.set_retain(true);
    write_raw(&mut raw, &publish).await;
    match read_raw(&mut raw, &mut buf).await {
        ControlPacket::PublishAck(ack) => assert_eq!(ack.packet_id(), PacketId::new(1)),
        other => panic!("expected puback, got {other:?}"),
    }

    // A later subscription to a matching filter yields the retained message,
    // QoS clamped to the filter's maximum, retain flag set.
    let (handler, mut events) = recorder();
    let subscriber = connect_client(&broker, "sub-retain", true, handler).await;
    subscribe_and_wait(&subscriber, &mut events, "t/+", QoS::AtMostOnce).await;

    let message = recv_message(&mut events).await;
    assert_eq!(message.topic(), "t/1");
    assert_eq!(message.message(), b"state");
    assert_eq!(message.qos(), QoS::AtMostOnce);
    assert!(message.retain());

    // A retained publish with an empty payload removes the stored message.
    let mut tombstone = PublishPacket::new("t/1", QoS::AtMostOnce, b"").unwrap();
    tombstone.set_retain(true);
    write_raw(&mut raw, &tombstone).await;

    // The tombstone itself is still routed to the live subscriber.
    let message = recv_message(&mut events).await;
    assert!(message.message().is_empty());

    sleep(SILENCE).await;
    let (handler_late, mut events_late) = recorder();
    let late_subscriber = connect_client(&broker, "sub-late", true, handler_late).await;
    subscribe_and_wait(&late_subscriber, &mut events_late, "t/+", QoS::AtLeastOnce).await;
    assert_silence(&mut events_late).await;
}

#[tokio::test]
async fn test_last_will_on_abnormal_close() {
    let (broker, _persister) = new_broker();

    let (handler, mut events) = recorder();
    let subscriber = connect_client(&broker, "sub-will", true, handler).await;
    subscribe_and_wait(&subscriber, &mut events, "last", QoS::AtMostOnce).await;

    // Client with a will, dropped without DISCONNECT.
    let (mut raw, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);
    let mut buf = Vec::new();
    let mut connect = ConnectPacket::new("will-a").unwrap();
    connect
        .set_will("last", b"gone", QoS::AtMostOnce, false)
        .unwrap();
    raw_connect(&mut raw, &mut buf, &connect).await;
    drop(raw);

    let message = recv_message(&mut events).await;
    assert_eq!(message.topic(), "last");
    assert_eq!(message.message(), b"gone");
}

#[tokio::test]
async fn test_clean_disconnect_suppresses_will() {
    let (broker, _persister) = new_broker();

    let (handler, mut events) = recorder();
    let subscriber = connect_client(&broker, "sub-quiet", true, handler).await;
    subscribe_and_wait(&subscriber, &mut events, "last", QoS::AtMostOnce).await;

    let (mut raw, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);
    let mut buf = Vec::new();
    let mut connect = ConnectPacket::new("will-b").unwrap();
    connect
        .set_will("last", b"gone", QoS::AtMostOnce, false)
        .unwrap();
    raw_connect(&mut raw, &mut buf, &connect).await;

    write_raw(&mut raw, &codec::DisconnectPacket::new()).await;
    drop(raw);

    assert_silence(&mut events).await;
    let _ = subscriber;
}

#[tokio::test]
async fn test_keepalive_timeout_publishes_will() {
    let (broker, _persister) = new_broker();

    let (handler, mut events) = recorder();
    let subscriber = connect_client(&broker, "sub-idle", true, handler).await;
    subscribe_and_wait(&subscriber, &mut events, "last", QoS::AtMostOnce).await;

    // One second keep-alive, then total silence: the broker must close the
    // connection at 1.5 times the interval and publish the will.
    let (mut raw, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);
    let mut buf = Vec::new();
    let mut connect = ConnectPacket::new("will-idle").unwrap();
    connect.set_keep_alive(1);
    connect
        .set_will("last", b"timed out", QoS::AtMostOnce, false)
        .unwrap();
    raw_connect(&mut raw, &mut buf, &connect).await;

    let message = recv_message(&mut events).await;
    assert_eq!(message.message(), b"timed out");

    // The broker side hung up on us.
    let mut probe = Vec::new();
    let n_recv = timeout(RECV_DEADLINE, raw.read_buf(&mut probe))
        .await
        .expect("close deadline")
        .unwrap();
    assert_eq!(n_recv, 0);
}

#[tokio::test]
async fn test_duplicate_client_id_displaces_older_connection() {
    let (broker, _persister) = new_broker();

    let (first_handler, _first_events) = recorder();
    let first = connect_client(&broker, "twin", true, first_handler).await;
    assert!(!first.is_dead());

    let (second_handler, mut second_events) = recorder();
    let second = connect_client(&broker, "twin", true, second_handler).await;

    // The displaced connection notices asynchronously.
    let deadline = tokio::time::Instant::now() + RECV_DEADLINE;
    while !first.is_dead() {
        assert!(tokio::time::Instant::now() < deadline, "old conn never closed");
        sleep(Duration::from_millis(20)).await;
    }

    // The second connection is the live one.
    subscribe_and_wait(&second, &mut second_events, "probe", QoS::AtMostOnce).await;
    broker
        .publish(
            PublishPacket::new("probe", QoS::AtMostOnce, b"ping").unwrap(),
            "twin",
        )
        .await;
    let message = recv_message(&mut second_events).await;
    assert_eq!(message.message(), b"ping");
}

#[tokio::test]
async fn test_subscription_replaced_not_duplicated() {
    let (broker, _persister) = new_broker();

    let (handler, mut events) = recorder();
    let subscriber = connect_client(&broker, "sub-replace", true, handler).await;
    subscribe_and_wait(&subscriber, &mut events, "a/#", QoS::AtMostOnce).await;
    // Covers the same space; replaces the previous subscription.
    subscribe_and_wait(&subscriber, &mut events, "a/+", QoS::AtLeastOnce).await;

    let (pub_handler, _pub_events) = recorder();
    let publisher = connect_client(&broker, "pub-replace", true, pub_handler).await;
    publisher
        .publish("a/x", QoS::AtLeastOnce, b"once")
        .await
        .unwrap();

    let message = recv_message(&mut events).await;
    assert_eq!(message.message(), b"once");
    assert_eq!(message.qos(), QoS::AtLeastOnce);
    assert_silence(&mut events).await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (broker, _persister) = new_broker();

    let (handler, mut events) = recorder();
    let subscriber = connect_client(&broker, "sub-unsub", true, handler).await;
    subscribe_and_wait(&subscriber, &mut events, "u/+", QoS::AtMostOnce).await;

    let (pub_handler, _pub_events) = recorder();
    let publisher = connect_client(&broker, "pub-unsub", true, pub_handler).await;
    publisher.publish("u/1", QoS::AtMostOnce, b"first").await.unwrap();
    let message = recv_message(&mut events).await;
    assert_eq!(message.message(), b"first");

    subscriber.unsubscribe(vec!["u/+".to_string()]).await;
    // No UNSUBACK event hook; give the round trip a moment.
    sleep(SILENCE).await;

    publisher.publish("u/1", QoS::AtMostOnce, b"second").await.unwrap();
    assert_silence(&mut events).await;
}

#[tokio::test]
async fn test_rejected_credentials_close_connection() {
    let (broker, _persister) = new_broker();
    broker.set_authenticator(|username, password| username == "user" && password == b"good");

    let (client_side, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);

    let mut options = ConnectOptions::new("in-memory");
    options
        .set_client_id("auth-fail")
        .set_auth("user", b"bad");
    let (handler, _events) = recorder();
    let err = AsyncClient::run(
        client_side,
        Arc::new(MemoryPersister::new()),
        options,
        handler,
    )
    .await
    .expect_err("handshake must fail");
    assert_eq!(err.kind(), tern::ErrorKind::AuthError);

    // With matching credentials the same broker accepts.
    let (client_side, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);
    let mut options = ConnectOptions::new("in-memory");
    options.set_client_id("auth-ok").set_auth("user", b"good");
    let (handler, _events) = recorder();
    let client = AsyncClient::run(
        client_side,
        Arc::new(MemoryPersister::new()),
        options,
        handler,
    )
    .await
    .expect("handshake");
    assert!(!client.is_dead());
}

#[tokio::test]
async fn test_broker_session_present_flag() {
    let (broker, _persister) = new_broker();

    // First connect with CleanSession=0: no stored record yet.
    let (mut raw, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);
    let mut buf = Vec::new();
    let mut connect = ConnectPacket::new("resumer").unwrap();
    connect.set_clean_session(false);
    assert!(!raw_connect(&mut raw, &mut buf, &connect).await);
    write_raw(&mut raw, &codec::DisconnectPacket::new()).await;
    drop(raw);
    sleep(SILENCE).await;

    // Second connect resumes the persisted record.
    let (mut raw, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);
    let mut buf = Vec::new();
    assert!(raw_connect(&mut raw, &mut buf, &connect).await);

    // CleanSession=1 discards it again.
    drop(raw);
    let (mut raw, broker_side) = tokio::io::duplex(4096);
    broker.serve_stream(broker_side);
    let mut buf = Vec::new();
    let mut clean_connect = ConnectPacket::new("resumer").unwrap();
    clean_connect.set_clean_session(true);
    assert!(!raw_connect(&mut raw, &mut buf, &clean_connect).await);
}
