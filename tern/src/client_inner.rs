// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, timeout};

use codec::{
    ConnectReturnCode, ControlPacket, DisconnectPacket, EncodePacket, PacketId, PingRequestPacket,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, QoS, SubTopic, SubscribeAck, SubscribeAckPacket, SubscribePacket,
    SubscribeTopic, UnsubscribeAckPacket, UnsubscribePacket,
};
use session::{Persister, Session, KEY_CLIENT_SESSION};

use crate::connect_options::ConnectOptions;
use crate::error::{Error, ErrorKind};
use crate::handler::MessageHandler;
use crate::stream::Transport;

/// Wait this much past the keep-alive interval for any server packet before
/// declaring the connection dead.
const SERVER_REPLY_GRACE: Duration = Duration::from_secs(10);

/// Commands the [`crate::AsyncClient`] handle enqueues to the connection
/// task.
#[derive(Debug)]
pub(crate) enum ClientCmd {
    Publish(PublishPacket),
    Subscribe(Vec<SubscribeTopic>),
    Unsubscribe(Vec<String>),
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Connected,
    Disconnected,
}

/// The client side of the protocol state machine, one task per connection.
///
/// Reads server packets off the stream, drains the host's command queue,
/// pings within the keep-alive window, and reconciles the persisted session
/// on connect.
pub(crate) struct ClientInner<T: Transport> {
    stream: T,
    options: ConnectOptions,
    persister: Arc<dyn Persister>,
    handler: Box<dyn MessageHandler>,

    status: Status,
    session: Session,

    /// Per-connection packet id counter; packet ids are scoped to one
    /// session in MQTT, so connections do not share it.
    packet_id: u16,

    /// Filters sent in a SUBSCRIBE, waiting for its SUBACK.
    pending_subscribes: HashMap<u16, Vec<SubscribeTopic>>,

    /// Filters sent in an UNSUBSCRIBE, waiting for its UNSUBACK.
    pending_unsubscribes: HashMap<u16, Vec<String>>,

    /// Last write towards the server; a PINGREQ goes out when it ages past
    /// the keep-alive interval.
    last_write: Instant,

    /// Last packet from the server; the connection dies when it ages past
    /// keep-alive plus [`SERVER_REPLY_GRACE`].
    last_server: Instant,

    receiver: Receiver<ClientCmd>,
    dead: Arc<AtomicBool>,
}

impl<T: Transport> ClientInner<T> {
    pub fn new(
        stream: T,
        options: ConnectOptions,
        persister: Arc<dyn Persister>,
        handler: Box<dyn MessageHandler>,
        receiver: Receiver<ClientCmd>,
        dead: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stream,
            options,
            persister,
            handler,
            status: Status::Connected,
            session: Session::new(),
            packet_id: 0,
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            last_write: Instant::now(),
            last_server: Instant::now(),
            receiver,
            dead,
        }
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    fn next_packet_id(&mut self) -> PacketId {
        self.packet_id = self.packet_id.wrapping_add(1);
        if self.packet_id == 0 {
            self.packet_id = 1;
        }
        PacketId::new(self.packet_id)
    }

    async fn send<P: EncodePacket>(&mut self, packet: &P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write_all(&buf).await?;
        self.last_write = Instant::now();
        Ok(())
    }

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
                    "connection closed by server",
                ));
            }
        }
    }

    /// Send CONNECT and wait for the CONNACK, then reconcile the persisted
    /// session.
    pub async fn handshake(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let connect = self.options.to_connect_packet()?;
        self.send(&connect).await?;

        let deadline = self.options.connect_timeout();
        let packet = match timeout(deadline, Self::read_packet(&mut self.stream, buf)).await {
            Err(_elapsed) => {
                return Err(Error::new(
                    ErrorKind::TimeoutError,
                    "waiting for connack packet timeout",
                ));
            }
            Ok(Err(err)) => return Err(err),
            Ok(Ok(packet)) => packet,
        };

        let ack = match packet {
            ControlPacket::ConnectAck(ack) => ack,
            _ => {
                return Err(Error::new(
                    ErrorKind::ConnectError,
                    "the first packet is not a connack packet",
                ));
            }
        };

        match ack.return_code() {
            ConnectReturnCode::Accepted => {}
            ConnectReturnCode::MalformedUsernamePassword | ConnectReturnCode::Unauthorized => {
                return Err(Error::new(ErrorKind::AuthError, "auth fail"));
            }
            code => {
                return Err(Error::from_string(
                    ErrorKind::ConnectError,
                    format!("connect refused: {code:?}"),
                ));
            }
        }

        self.resume_session().await
    }

    /// Load the persisted session. With CleanSession the record is dropped;
    /// otherwise every parked publish is re-sent as a duplicate and the
    /// packet id counter jumps past the largest re-used id.
    async fn resume_session(&mut self) -> Result<(), Error> {
        let client_id = self.options.client_id().to_string();
        let blob = match self.persister.read(KEY_CLIENT_SESSION, &client_id) {
            Ok(blob) => blob,
            Err(err) => {
                log::warn!("client: Failed to read session of {client_id}: {err}");
                Vec::new()
            }
        };
        if blob.is_empty() {
            return Ok(());
        }

        if self.options.clean_session() {
            if let Err(err) = self.persister.delete(KEY_CLIENT_SESSION, &client_id) {
                log::warn!("client: Failed to drop session of {client_id}: {err}");
            }
            return Ok(());
        }

        match Session::from_blob(&blob) {
            Ok(loaded) => self.session = loaded,
            Err(err) => {
                log::warn!("client: Session record of {client_id} invalid: {err}");
                return Ok(());
            }
        }

        let parked = self.session.reset_pub_out();
        let mut max_packet_id = 0;
        for (packet_id, packet) in parked {
            max_packet_id = max_packet_id.max(packet_id.value());
            self.send(&packet).await?;
            self.session.add_pub_out(packet_id, packet);
        }
        if self.packet_id < max_packet_id {
            self.packet_id = max_packet_id;
        }
        Ok(())
    }

    pub async fn run_loop(mut self, mut buf: Vec<u8>) {
        if let Err(err) = self.serve(&mut buf).await {
            log::warn!("client: {} closed: {err}", self.options.client_id());
        }
        self.release();
    }

    async fn serve(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut ticker = interval(Duration::from_secs(1));
        let keep_alive = Duration::from_secs(u64::from(self.options.keep_alive()));
        self.last_write = Instant::now();
        self.last_server = Instant::now();

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
                                "connection closed by server",
                            ));
                        }
                        Ok(_n_recv) => self.drain_packets(buf).await?,
                        Err(err) => return Err(err),
                    }
                }
                cmd = self.receiver.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await?,
                        // Handle dropped without an explicit disconnect.
                        None => self.handle_command(ClientCmd::Disconnect).await?,
                    }
                }
                _ = ticker.tick() => {
                    if keep_alive.is_zero() {
                        continue;
                    }
                    if self.last_server.elapsed() > keep_alive + SERVER_REPLY_GRACE {
                        return Err(Error::new(ErrorKind::TimeoutError, "keepalive timeout"));
                    }
                    if self.last_write.elapsed() >= keep_alive {
                        self.send(&PingRequestPacket::new()).await?;
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
                    self.last_server = Instant::now();
                    self.handle_packet(packet).await?;
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: ClientCmd) -> Result<(), Error> {
        match cmd {
            ClientCmd::Publish(mut packet) => {
                if packet.qos() != QoS::AtMostOnce {
                    let packet_id = self.next_packet_id();
                    packet.set_packet_id(packet_id);

                    let mut parked = packet.clone();
                    parked.set_dup(true)?;
                    self.session.add_pub_out(packet_id, parked);
                }
                self.send(&packet).await
            }
            ClientCmd::Subscribe(topics) => {
                if topics.is_empty() {
                    return Ok(());
                }
                let packet_id = self.next_packet_id();
                self.pending_subscribes
                    .insert(packet_id.value(), topics.clone());
                self.send(&SubscribePacket::with_topics(packet_id, topics))
                    .await
            }
            ClientCmd::Unsubscribe(filters) => {
                let mut topics = Vec::with_capacity(filters.len());
                for filter in &filters {
                    match SubTopic::new(filter) {
                        Ok(topic) => topics.push(topic),
                        Err(err) => {
                            log::warn!("client: Skip invalid filter {filter:?}: {err}");
                        }
                    }
                }
                if topics.is_empty() {
                    return Ok(());
                }
                let packet_id = self.next_packet_id();
                self.pending_unsubscribes.insert(packet_id.value(), filters);
                self.send(&UnsubscribePacket::with_topics(packet_id, topics))
                    .await
            }
            ClientCmd::Disconnect => {
                self.status = Status::Disconnected;
                self.send(&DisconnectPacket::new()).await
            }
        }
    }

    async fn handle_packet(&mut self, packet: ControlPacket) -> Result<(), Error> {
        match packet {
            ControlPacket::Publish(publish) => self.on_message(publish).await,
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
            ControlPacket::SubscribeAck(ack) => {
                self.on_subscribe_ack(&ack);
                Ok(())
            }
            ControlPacket::UnsubscribeAck(ack) => {
                self.on_unsubscribe_ack(&ack);
                Ok(())
            }
            ControlPacket::PingResponse(_pong) => Ok(()),
            other => Err(Error::from_string(
                ErrorKind::ConnectError,
                format!(
                    "invalid packet from server: {:?}",
                    codec::Packet::packet_type(&other)
                ),
            )),
        }
    }

    async fn on_message(&mut self, publish: PublishPacket) -> Result<(), Error> {
        match publish.qos() {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.send(&PublishAckPacket::new(publish.packet_id())).await?;
            }
            QoS::ExactOnce => {
                self.send(&PublishReceivedPacket::new(publish.packet_id()))
                    .await?;
                // Acknowledged but already delivered; do not hand it to the
                // host twice.
                if publish.dup() && self.session.has_pub_in(publish.packet_id()) {
                    return Ok(());
                }
                self.session.add_pub_in(publish.packet_id());
            }
        }

        self.handler.on_message(&publish);
        Ok(())
    }

    /// The broker confirmed a SUBSCRIBE: enter the granted filters into the
    /// session, dropping the ones it refused.
    fn on_subscribe_ack(&mut self, ack: &SubscribeAckPacket) {
        let Some(requested) = self.pending_subscribes.remove(&ack.packet_id().value()) else {
            log::warn!("client: Unrequested suback {}", ack.packet_id());
            return;
        };
        if requested.len() != ack.acks().len() {
            log::warn!("client: Suback {} code count mismatch", ack.packet_id());
            return;
        }

        let mut granted = Vec::with_capacity(requested.len());
        for (topic, code) in requested.into_iter().zip(ack.acks()) {
            if *code == SubscribeAck::Failed {
                continue;
            }
            granted.push(topic);
        }
        if granted.is_empty() {
            return;
        }

        // Re-subscribing to a known filter replaces the old entry.
        let filters: Vec<String> = granted
            .iter()
            .map(|topic| topic.topic().to_string())
            .collect();
        self.session.remove_subscriptions(&filters);
        self.session.append_subscriptions(&granted);

        self.handler.on_subscribe_success(&granted);
    }

    fn on_unsubscribe_ack(&mut self, ack: &UnsubscribeAckPacket) {
        let Some(filters) = self.pending_unsubscribes.remove(&ack.packet_id().value()) else {
            log::warn!("client: Unrequested unsuback {}", ack.packet_id());
            return;
        };
        self.session.remove_subscriptions(&filters);
        self.handler.on_unsubscribe_success(&filters);
    }

    /// Save or drop the session record, mark the handle dead, tell the
    /// host. The record is written before the dead flag flips so a host
    /// that reconnects on `is_dead` finds the session already stored.
    fn release(&mut self) {
        let client_id = self.options.client_id();
        if self.options.clean_session() {
            if let Err(err) = self.persister.delete(KEY_CLIENT_SESSION, client_id) {
                log::error!("client: Failed to drop session record of {client_id}: {err}");
            }
        } else if let Err(err) =
            self.session
                .save(KEY_CLIENT_SESSION, client_id, self.persister.as_ref())
        {
            log::error!("client: Failed to persist session of {client_id}: {err}");
        }

        self.mark_dead();
        self.handler.on_disconnected();
    }
}
