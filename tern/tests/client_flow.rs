// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by General Public License that can be found
// in the LICENSE file.

//! Client engine behaviour against a scripted broker on an in-memory duplex
//! stream: session resumption, keep-alive pings, QoS 2 de-duplication and
//! CONNACK refusals.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use codec::{
    ConnectAckPacket, ConnectReturnCode, ControlPacket, EncodePacket, PacketId, PingResponsePacket,
    PublishAckPacket, PublishPacket, QoS, SubscribeAck, SubscribeAckPacket, SubscribeTopic,
};
use session::{MemoryPersister, Persister};
use tern::{AsyncClient, ConnectOptions, ErrorKind, MessageHandler};

const RECV_DEADLINE: Duration = Duration::from_secs(5);

struct Recorder {
    messages: mpsc::UnboundedSender<PublishPacket>,
    subscribed: mpsc::UnboundedSender<Vec<String>>,
}

struct RecorderRx {
    messages: mpsc::UnboundedReceiver<PublishPacket>,
    subscribed: mpsc::UnboundedReceiver<Vec<String>>,
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
        let granted = topics.iter().map(|t| t.topic().to_string()).collect();
        let _ = self.subscribed.send(granted);
    }
}

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

/// Accept the CONNECT the client is about to send.
async fn accept_connect(stream: &mut DuplexStream, buf: &mut Vec<u8>, session_present: bool) {
    match read_raw(stream, buf).await {
        ControlPacket::Connect(_connect) => {}
        other => panic!("expected connect, got {other:?}"),
    }
    write_raw(
        stream,
        &ConnectAckPacket::new(session_present, ConnectReturnCode::Accepted),
    )
    .await;
}

fn options(client_id: &str, clean_session: bool) -> ConnectOptions {
    let mut options = ConnectOptions::new("in-memory");
    options
        .set_client_id(client_id)
        .set_clean_session(clean_session)
        .set_keep_alive(30);
    options
}

async fn wait_dead(client: &AsyncClient) {
    let deadline = tokio::time::Instant::now() + RECV_DEADLINE;
    while !client.is_dead() {
        assert!(tokio::time::Instant::now() < deadline, "client never died");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_session_resumption_resends_with_dup() {
    let persister: Arc<dyn Persister> = Arc::new(MemoryPersister::new());

    // First connection: publish QoS 1, never see the PUBACK.
    let (client_side, mut broker_side) = tokio::io::duplex(4096);
    let (handler, _events) = recorder();
    let connect_loop = AsyncClient::run(
        client_side,
        Arc::clone(&persister),
        options("resumer", false),
        handler,
    );
    let script = async {
        let mut buf = Vec::new();
        accept_connect(&mut broker_side, &mut buf, false).await;
        broker_side
    };
    let (client, mut broker_side) = tokio::join!(connect_loop, script);
    let client = client.expect("handshake");

    client
        .publish("a/x", QoS::AtLeastOnce, b"unacked")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let first_pid = match read_raw(&mut broker_side, &mut buf).await {
        ControlPacket::Publish(publish) => {
            assert!(!publish.dup());
            assert_eq!(publish.message(), b"unacked");
            publish.packet_id()
        }
        other => panic!("expected publish, got {other:?}"),
    };

    // The network dies before any PUBACK.
    drop(broker_side);
    wait_dead(&client).await;

    // Second connection: the parked publish is re-sent with DUP set and the
    // packet id counter continues past the re-used id.
    let (client_side, mut broker_side) = tokio::io::duplex(4096);
    let (handler, _events) = recorder();
    let connect_loop = AsyncClient::run(
        client_side,
        Arc::clone(&persister),
        options("resumer", false),
        handler,
    );
    let script = async {
        let mut buf = Vec::new();
        accept_connect(&mut broker_side, &mut buf, true).await;
        let resent = match read_raw(&mut broker_side, &mut buf).await {
            ControlPacket::Publish(publish) => publish,
            other => panic!("expected re-sent publish, got {other:?}"),
        };
        (broker_side, buf, resent)
    };
    let (client, (mut broker_side, mut buf, resent)) = tokio::join!(connect_loop, script);
    let client = client.expect("handshake");

    assert!(resent.dup());
    assert_eq!(resent.packet_id(), first_pid);
    assert_eq!(resent.message(), b"unacked");

    // Acknowledge the retransmission, then check the counter moved on.
    write_raw(&mut broker_side, &PublishAckPacket::new(resent.packet_id())).await;
    client
        .publish("a/x", QoS::AtLeastOnce, b"fresh")
        .await
        .unwrap();
    match read_raw(&mut broker_side, &mut buf).await {
        ControlPacket::Publish(publish) => {
            assert!(publish.packet_id() > first_pid);
            assert!(!publish.dup());
        }
        other => panic!("expected publish, got {other:?}"),
    }
}

#[tokio::test]
async fn test_keep_alive_ping() {
    let persister: Arc<dyn Persister> = Arc::new(MemoryPersister::new());

    let (client_side, mut broker_side) = tokio::io::duplex(4096);
    let mut options = ConnectOptions::new("in-memory");
    options.set_client_id("pinger").set_keep_alive(1);
    let (handler, _events) = recorder();
    let connect_loop = AsyncClient::run(client_side, persister, options, handler);
    let script = async {
        let mut buf = Vec::new();
        accept_connect(&mut broker_side, &mut buf, false).await;
        (broker_side, buf)
    };
    let (client, (mut broker_side, mut buf)) = tokio::join!(connect_loop, script);
    let client = client.expect("handshake");

    // One second of write idleness triggers a PINGREQ.
    match read_raw(&mut broker_side, &mut buf).await {
        ControlPacket::PingRequest(_ping) => {}
        other => panic!("expected pingreq, got {other:?}"),
    }
    write_raw(&mut broker_side, &PingResponsePacket::new()).await;

    // And again, as long as the connection idles.
    match read_raw(&mut broker_side, &mut buf).await {
        ControlPacket::PingRequest(_ping) => {}
        other => panic!("expected second pingreq, got {other:?}"),
    }
    write_raw(&mut broker_side, &PingResponsePacket::new()).await;
    assert!(!client.is_dead());
}

#[tokio::test]
async fn test_qos2_duplicate_not_redelivered() {
    let persister: Arc<dyn Persister> = Arc::new(MemoryPersister::new());

    let (client_side, mut broker_side) = tokio::io::duplex(4096);
    let (handler, mut events) = recorder();
    let connect_loop = AsyncClient::run(
        client_side,
        persister,
        options("exactly", true),
        handler,
    );
    let script = async {
        let mut buf = Vec::new();
        accept_connect(&mut broker_side, &mut buf, false).await;
        (broker_side, buf)
    };
    let (client, (mut broker_side, mut buf)) = tokio::join!(connect_loop, script);
    let _client = client.expect("handshake");

    let mut publish = PublishPacket::new("e/1", QoS::ExactOnce, b"once").unwrap();
    publish.set_packet_id(PacketId::new(9));
    write_raw(&mut broker_side, &publish).await;
    match read_raw(&mut broker_side, &mut buf).await {
        ControlPacket::PublishReceived(rec) => assert_eq!(rec.packet_id(), PacketId::new(9)),
        other => panic!("expected pubrec, got {other:?}"),
    }

    // Duplicate before the PUBREL: acknowledged, not re-delivered.
    publish.set_dup(true).unwrap();
    write_raw(&mut broker_side, &publish).await;
    match read_raw(&mut broker_side, &mut buf).await {
        ControlPacket::PublishReceived(rec) => assert_eq!(rec.packet_id(), PacketId::new(9)),
        other => panic!("expected pubrec again, got {other:?}"),
    }

    write_raw(
        &mut broker_side,
        &codec::PublishReleasePacket::new(PacketId::new(9)),
    )
    .await;
    match read_raw(&mut broker_side, &mut buf).await {
        ControlPacket::PublishComplete(comp) => assert_eq!(comp.packet_id(), PacketId::new(9)),
        other => panic!("expected pubcomp, got {other:?}"),
    }

    let message = timeout(RECV_DEADLINE, events.messages.recv())
        .await
        .expect("message deadline")
        .expect("message");
    assert_eq!(message.message(), b"once");
    assert!(
        timeout(Duration::from_millis(300), events.messages.recv())
            .await
            .is_err(),
        "duplicate was re-delivered"
    );
}

#[tokio::test]
async fn test_suback_failure_codes_filter_subscriptions() {
    let persister: Arc<dyn Persister> = Arc::new(MemoryPersister::new());

    let (client_side, mut broker_side) = tokio::io::duplex(4096);
    let (handler, mut events) = recorder();
    let connect_loop = AsyncClient::run(
        client_side,
        persister,
        options("selective", true),
        handler,
    );
    let script = async {
        let mut buf = Vec::new();
        accept_connect(&mut broker_side, &mut buf, false).await;
        (broker_side, buf)
    };
    let (client, (mut broker_side, mut buf)) = tokio::join!(connect_loop, script);
    let client = client.expect("handshake");

    client
        .subscribe(vec![
            SubscribeTopic::new("ok/+", QoS::AtLeastOnce).unwrap(),
            SubscribeTopic::new("denied/#", QoS::AtMostOnce).unwrap(),
        ])
        .await;

    let packet_id = match read_raw(&mut broker_side, &mut buf).await {
        ControlPacket::Subscribe(subscribe) => {
            assert_eq!(subscribe.topics().len(), 2);
            subscribe.packet_id()
        }
        other => panic!("expected subscribe, got {other:?}"),
    };
    write_raw(
        &mut broker_side,
        &SubscribeAckPacket::new(
            packet_id,
            vec![SubscribeAck::QoS(QoS::AtLeastOnce), SubscribeAck::Failed],
        ),
    )
    .await;

    let granted = timeout(RECV_DEADLINE, events.subscribed.recv())
        .await
        .expect("suback deadline")
        .expect("suback");
    assert_eq!(granted, vec!["ok/+".to_string()]);
}

#[tokio::test]
async fn test_connack_refusals_surface_as_errors() {
    for (code, expected_kind) in [
        (ConnectReturnCode::Unauthorized, ErrorKind::AuthError),
        (
            ConnectReturnCode::MalformedUsernamePassword,
            ErrorKind::AuthError,
        ),
        (
            ConnectReturnCode::ServerUnavailable,
            ErrorKind::ConnectError,
        ),
    ] {
        let persister: Arc<dyn Persister> = Arc::new(MemoryPersister::new());
        let (client_side, mut broker_side) = tokio::io::duplex(4096);
        let (handler, _events) = recorder();
        let connect_loop = AsyncClient::run(
            client_side,
            persister,
            options("refused", true),
            handler,
        );
        let script = async {
            let mut buf = Vec::new();
            match read_raw(&mut broker_side, &mut buf).await {
                ControlPacket::Connect(_connect) => {}
                other => panic!("expected connect, got {other:?}"),
            }
            write_raw(&mut broker_side, &ConnectAckPacket::new(false, code)).await;
            broker_side
        };
        let (result, _broker_side) = tokio::join!(connect_loop, script);
        let err = result.expect_err("handshake must fail");
        assert_eq!(err.kind(), expected_kind, "return code {code:?}");
    }
}
