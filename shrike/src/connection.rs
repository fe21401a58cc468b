// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{interval, timeout};

use codec::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, ControlPacket, EncodePacket,
    PingResponsePacket, ProtocolLevel, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS, SubscribeAck, SubscribeAckPacket,
    SubscribePacket, SubscribeTopic, UnsubscribeAckPacket, UnsubscribePacket,
};
use session::{Session, KEY_BROKER_SESSION};

use crate::commands::ConnectionCmd;
use crate::error::{Error, ErrorKind};
use crate::events::EventListener as _;
use crate::registry::ConnectionHandle;
use crate::server::ServerContext;
use crate::stream::Transport;
use crate::types::{ConnectionId, COMMAND_QUEUE_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Stream accepted, CONNECT not yet seen.
    Connecting,
    Connected,
    Disconnected,
}

/// The binding of one accepted stream to a client identity and its session.
///
/// One task per connection: it reads frames off the stream, drains the
/// command queue other tasks route publishes into, and keeps the keep-alive
/// watchdog. The session is shared with the registry so routing sees
/// subscription changes immediately.
pub(crate) struct Connection<T: Transport> {
    id: ConnectionId,
    context: Arc<ServerContext>,
    stream: T,

    status: Status,
    client_id: String,
    keep_alive: Duration,
    clean_session: bool,
    registered: bool,
    suppress_will: bool,
    connect_packet: Option<ConnectPacket>,
    session: Arc<Session>,

    /// Instant of the last packet read from the client. The keep-alive
    /// watchdog compares against this; resetting a timestamp cannot race
    /// with close the way signalling a channel could.
    last_packet: Instant,

    sender: Sender<ConnectionCmd>,
    receiver: Receiver<ConnectionCmd>,
}

impl<T: Transport> Connection<T> {
    pub fn new(context: Arc<ServerContext>, stream: T) -> Self {
        let (sender, receiver) = tokio::sync::mpsc::channel(COMMAND_QUEUE_CAPACITY);
        Self {
            id: context.next_connection_id(),
            context,
            stream,
            status: Status::Connecting,
            client_id: String::new(),
            keep_alive: Duration::ZERO,
            clean_session: true,
            registered: false,
            suppress_will: false,
            connect_packet: None,
            session: Arc::new(Session::new()),
            last_packet: Instant::now(),
            sender,
            receiver,
        }
    }

    pub async fn run_loop(mut self) {
        let mut buf = Vec::with_capacity(1024);

        match self.handshake(&mut buf).await {
            Ok(()) => {
                if let Err(err) = self.serve(&mut buf).await {
                    log::warn!("connection: {} closed: {err}", self.client_id);
                }
            }
            Err(err) => {
                log::warn!("connection: handshake failed: {err}");
                self.suppress_will = true;
            }
        }

        self.release().await;
    }

    async fn send<P: EncodePacket>(&mut self, packet: &P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write_all(&buf).await
    }

    /// Read one complete control packet, buffering partial reads.
    async fn read_packet(stream: &mut T, buf: &mut Vec<u8>) -> Result<ControlPacket, Error> {
        loop {
            if let Some((packet, used)) = ControlPacket::from_buffer(buf)? {
                buf.drain(..used);
                return Ok(packet);
            }
            let n_recv = stream.read_buf(buf).await?;
            if n_recv == 0 {
                return Err(Error::new(
                    ErrorKind::SocketError,
                    "connection closed by peer",
                ));
            }
        }
    }

    /// Wait for the first packet, which must be a valid CONNECT, then bind
    /// the session, reply CONNACK and register with the broker.
    async fn handshake(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let deadline = Duration::from_secs(self.context.connect_timeout_secs);
        let packet = match timeout(deadline, Self::read_packet(&mut self.stream, buf)).await {
            Err(_elapsed) => {
                return Err(Error::new(
                    ErrorKind::TimeoutError,
                    "waiting for connect packet timeout",
                ));
            }
            Ok(Err(err)) => {
                if err.kind() == ErrorKind::ProtocolError {
                    let ack = ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol);
                    let _ = self.send(&ack).await;
                }
                return Err(err);
            }
            Ok(Ok(packet)) => packet,
        };

        let connect = match packet {
            ControlPacket::Connect(connect) => connect,
            _ => {
                return Err(Error::new(
                    ErrorKind::ConnectError,
                    "the first packet is not a connect packet",
                ));
            }
        };

        // The Server MUST respond with CONNACK return code 1 and close the
        // connection if the protocol level is not supported [MQTT-3.1.2-2].
        if connect.protocol_level() != ProtocolLevel::V311 {
            let ack = ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol);
            let _ = self.send(&ack).await;
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "unsupported protocol level",
            ));
        }

        if connect.connect_flags().has_username()
            && !self.context.authenticate(connect.username(), connect.password())
        {
            let ack = ConnectAckPacket::new(false, ConnectReturnCode::Unauthorized);
            let _ = self.send(&ack).await;
            return Err(Error::new(ErrorKind::AuthError, "auth fail"));
        }

        self.client_id = connect.client_id().to_string();
        self.keep_alive = Duration::from_secs(u64::from(connect.keep_alive()));
        self.clean_session = connect.connect_flags().clean_session();

        let session_present = self.bind_session(&connect);
        let ack = ConnectAckPacket::new(session_present, ConnectReturnCode::Accepted);
        self.send(&ack).await?;

        let displaced = self.context.conn_registry.add(ConnectionHandle {
            id: self.id,
            client_id: self.client_id.clone(),
            sender: self.sender.clone(),
            session: Arc::clone(&self.session),
        });
        self.registered = true;
        if let Some(old) = displaced {
            let _ = old.sender.send(ConnectionCmd::Close("old conn")).await;
        }

        if let Err(err) = self
            .context
            .with_events(|events| events.on_connected(&connect))
        {
            // The handshake-failure path suppresses the will anyway; make
            // the cause explicit.
            return Err(Error::from_string(
                ErrorKind::ConnectError,
                format!("listener rejected connection: {err}"),
            ));
        }

        self.connect_packet = Some(connect);
        self.status = Status::Connected;
        self.last_packet = Instant::now();
        Ok(())
    }

    /// Attach the session for this client id: fresh when no record exists or
    /// CleanSession is set, otherwise loaded from the persister. Returns the
    /// session-present flag for the CONNACK.
    fn bind_session(&mut self, connect: &ConnectPacket) -> bool {
        let client_id = connect.client_id();
        let blob = match self.context.persister.read(KEY_BROKER_SESSION, client_id) {
            Ok(blob) => blob,
            Err(err) => {
                log::warn!("connection: Failed to read session of {client_id}: {err}");
                Vec::new()
            }
        };

        if blob.is_empty() {
            self.session = Arc::new(Session::new());
            return false;
        }

        if connect.connect_flags().clean_session() {
            if let Err(err) = self.context.persister.delete(KEY_BROKER_SESSION, client_id) {
                log::warn!("connection: Failed to drop session of {client_id}: {err}");
            }
            self.session = Arc::new(Session::new());
            return false;
        }

        match Session::from_blob(&blob) {
            Ok(loaded) => {
                self.session = Arc::new(loaded);
                true
            }
            Err(err) => {
                log::warn!("connection: Session record of {client_id} invalid: {err}");
                self.session = Arc::new(Session::new());
                false
            }
        }
    }

    async fn serve(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut ticker = interval(Duration::from_secs(1));

        loop {
            if self.status == Status::Disconnected {
                return Ok(());
            }

            tokio::select! {
                ret = self.stream.read_buf(buf) => {
                    match ret {
                        Ok(0) => {
                            return Err(Error::new(
                                ErrorKind::SocketError,
                                "connection closed by peer",
                            ));
                        }
                        Ok(_n_recv) => self.drain_packets(buf).await?,
                        Err(err) => return Err(err),
                    }
                }
                Some(cmd) = self.receiver.recv() => {
                    self.handle_command(cmd).await?;
                }
                _ = ticker.tick() => {
                    // [MQTT-3.1.2-24]: no control packet within one and a
                    // half times the keep-alive period means the network has
                    // failed as far as this broker is concerned.
                    if !self.keep_alive.is_zero()
                        && self.last_packet.elapsed() > self.keep_alive * 3 / 2
                    {
                        return Err(Error::new(ErrorKind::TimeoutError, "keepalive timeout"));
                    }
                }
            }
        }
    }

    async fn drain_packets(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        while self.status != Status::Disconnected {
            match ControlPacket::from_buffer(buf)? {
                Some((packet, used)) => {
                    buf.drain(..used);
                    self.last_packet = Instant::now();
                    self.handle_packet(packet).await?;
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: ConnectionCmd) -> Result<(), Error> {
        match cmd {
            ConnectionCmd::Publish(packet) => self.send_publish_out(packet).await,
            ConnectionCmd::Close(cause) => {
                log::info!("connection: {} closed: {cause}", self.client_id);
                self.status = Status::Disconnected;
                Ok(())
            }
        }
    }

    async fn handle_packet(&mut self, packet: ControlPacket) -> Result<(), Error> {
        match packet {
            // A second CONNECT packet from a client is a protocol violation
            // [MQTT-3.1.0-2].
            ControlPacket::Connect(_connect) => Err(Error::new(
                ErrorKind::ConnectError,
                "second connect packet",
            )),
            ControlPacket::Publish(publish) => self.on_publish(publish).await,
            ControlPacket::PublishAck(ack) => {
                self.session.remove_pub_out(ack.packet_id());
                Ok(())
            }
            ControlPacket::PublishReceived(rec) => {
                self.send(&PublishReleasePacket::new(rec.packet_id())).await?;
                self.session.remove_pub_out(rec.packet_id());
                Ok(())
            }
            ControlPacket::PublishRelease(rel) => {
                self.session.remove_pub_in(rel.packet_id());
                self.send(&PublishCompletePacket::new(rel.packet_id())).await
            }
            ControlPacket::PublishComplete(_comp) => {
                // Release happened on PUBREC already.
                Ok(())
            }
            ControlPacket::Subscribe(subscribe) => self.on_subscribe(subscribe).await,
            ControlPacket::Unsubscribe(unsubscribe) => self.on_unsubscribe(unsubscribe).await,
            ControlPacket::PingRequest(_ping) => self.send(&PingResponsePacket::new()).await,
            ControlPacket::Disconnect(_disconnect) => {
                // A clean disconnect discards the will [MQTT-3.1.2-10].
                self.suppress_will = true;
                self.status = Status::Disconnected;
                Ok(())
            }
            other => Err(Error::from_string(
                ErrorKind::ConnectError,
                format!("invalid packet from client: {:?}", codec::Packet::packet_type(&other)),
            )),
        }
    }

    async fn on_publish(&mut self, publish: PublishPacket) -> Result<(), Error> {
        match publish.qos() {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.send(&PublishAckPacket::new(publish.packet_id())).await?;
            }
            QoS::ExactOnce => {
                self.send(&PublishReceivedPacket::new(publish.packet_id()))
                    .await?;
                // A re-delivered publish whose id is still recorded has been
                // routed before; acknowledge it but drop the payload.
                if publish.dup() && self.session.has_pub_in(publish.packet_id()) {
                    return Ok(());
                }
                self.session.add_pub_in(publish.packet_id());
            }
        }

        self.context.route_publish(&publish, &self.client_id).await;
        self.context
            .with_events(|events| events.on_publish_received(&publish));
        Ok(())
    }

    async fn on_subscribe(&mut self, subscribe: SubscribePacket) -> Result<(), Error> {
        let mut acks = Vec::with_capacity(subscribe.topics().len());
        let mut subscriptions = self.session.subscriptions();
        let mut granted: Vec<SubscribeTopic> = Vec::new();

        for topic in subscribe.topics() {
            let path = match self.context.filter_cache.get(topic.topic()) {
                Ok(path) => path,
                Err(err) => {
                    log::warn!("connection: Refuse filter {:?}: {err}", topic.topic());
                    acks.push(SubscribeAck::Failed);
                    continue;
                }
            };

            // A new subscription replaces an existing one covering the same
            // topic space; otherwise it is appended [MQTT-3.8.4-3].
            let mut replaced = false;
            for existing in &mut subscriptions {
                let Ok(existing_path) = self.context.filter_cache.get(existing.topic()) else {
                    continue;
                };
                if path.compare(&existing_path).overlaps() {
                    *existing = topic.clone();
                    replaced = true;
                    break;
                }
            }
            if !replaced {
                subscriptions.push(topic.clone());
            }

            granted.push(topic.clone());
            acks.push(SubscribeAck::QoS(topic.qos()));
        }

        // The new subscriptions take effect before the SUBACK is queued.
        self.session.set_subscriptions(subscriptions);

        for topic in &granted {
            let retained = self
                .context
                .retain_registry
                .matching(topic, &self.context.filter_cache);
            for publish in retained {
                self.send_publish_out(publish).await?;
            }
        }

        self.send(&SubscribeAckPacket::new(subscribe.packet_id(), acks))
            .await?;

        if !granted.is_empty() {
            self.context
                .with_events(|events| events.on_subscribe_success(&granted));
        }
        Ok(())
    }

    async fn on_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> Result<(), Error> {
        let filters: Vec<String> = unsubscribe
            .topics()
            .iter()
            .map(|topic| topic.as_ref().to_string())
            .collect();
        self.session.remove_subscriptions(&filters);

        self.send(&UnsubscribeAckPacket::new(unsubscribe.packet_id()))
            .await?;

        self.context
            .with_events(|events| events.on_unsubscribe_success(&filters));
        Ok(())
    }

    /// Write a routed publish to this connection's client. QoS 1/2 copies
    /// get a fresh packet id and are parked in the session until the client
    /// acknowledges; the parked copy is pre-marked DUP for retransmission.
    async fn send_publish_out(&mut self, mut packet: PublishPacket) -> Result<(), Error> {
        if packet.qos() != QoS::AtMostOnce {
            let packet_id = self.context.next_packet_id();
            packet.set_packet_id(packet_id);

            let mut parked = packet.clone();
            parked.set_dup(true)?;
            self.session.add_pub_out(packet_id, parked);
        }
        self.send(&packet).await
    }

    /// Tear the connection down exactly once: deregister, publish the Last
    /// Will unless suppressed, persist or drop the session record, notify
    /// the host.
    async fn release(mut self) {
        if !self.registered {
            return;
        }

        self.context.conn_registry.remove(&self.client_id, self.id);

        if !self.suppress_will {
            self.publish_will().await;
        }

        // The persister may block; keep its calls off the async tasks.
        let persister = Arc::clone(&self.context.persister);
        let client_id = self.client_id.clone();
        if self.clean_session {
            let _task = tokio::task::spawn_blocking(move || {
                if let Err(err) = persister.delete(KEY_BROKER_SESSION, &client_id) {
                    log::error!("connection: Failed to drop session record of {client_id}: {err}");
                }
            });
        } else {
            match self.session.to_blob() {
                Ok(blob) => {
                    let _task = tokio::task::spawn_blocking(move || {
                        if let Err(err) = persister.save(KEY_BROKER_SESSION, &client_id, &blob) {
                            log::error!(
                                "connection: Failed to persist session of {client_id}: {err}"
                            );
                        }
                    });
                }
                Err(err) => {
                    log::error!(
                        "connection: Failed to encode session of {}: {err}",
                        self.client_id
                    );
                }
            }
        }

        self.context.with_events(|events| events.on_disconnected());
    }

    async fn publish_will(&mut self) {
        let Some(connect) = self.connect_packet.take() else {
            return;
        };
        if !connect.connect_flags().will() {
            return;
        }
        let Some(will_topic) = connect.will_topic() else {
            return;
        };

        match PublishPacket::new(
            will_topic,
            connect.connect_flags().will_qos(),
            connect.will_message(),
        ) {
            Ok(mut will) => {
                will.set_retain(connect.connect_flags().will_retain());
                self.context.route_publish(&will, &self.client_id).await;
            }
            Err(err) => {
                log::warn!(
                    "connection: Invalid will message of {}: {err}",
                    self.client_id
                );
            }
        }
    }
}
