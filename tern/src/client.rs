// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

use codec::{PublishPacket, QoS, SubscribeTopic};
use session::Persister;

use crate::client_inner::{ClientCmd, ClientInner};
use crate::connect_options::ConnectOptions;
use crate::error::Error;
use crate::handler::MessageHandler;
use crate::stream::{Stream, Transport};

const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Host-facing handle onto a running client connection.
///
/// All operations enqueue to the connection task; after the connection died
/// they turn into no-ops, observable through [`AsyncClient::is_dead`].
#[derive(Clone, Debug)]
pub struct AsyncClient {
    sender: Sender<ClientCmd>,
    dead: Arc<AtomicBool>,
}

impl AsyncClient {
    /// Dial the broker in `options` and run the protocol over the resulting
    /// stream. See [`AsyncClient::run`].
    ///
    /// # Errors
    ///
    /// Returns error if dialing or the MQTT handshake fails.
    pub async fn dial<H>(
        options: ConnectOptions,
        persister: Arc<dyn Persister>,
        handler: H,
    ) -> Result<Self, Error>
    where
        H: MessageHandler + 'static,
    {
        let stream = Stream::connect(&options).await?;
        Self::run(stream, persister, options, handler).await
    }

    /// Run the MQTT protocol over an established transport stream.
    ///
    /// Sends CONNECT, waits for the CONNACK, resumes the persisted session,
    /// then spawns the connection task and returns the handle. Received
    /// messages and connection events go to `handler`.
    ///
    /// # Errors
    ///
    /// Returns error if the handshake fails: `AuthError` when the broker
    /// refused the credentials, `ConnectError` for other refusals,
    /// `TimeoutError` when no CONNACK arrived in time.
    pub async fn run<T, H>(
        stream: T,
        persister: Arc<dyn Persister>,
        options: ConnectOptions,
        handler: H,
    ) -> Result<Self, Error>
    where
        T: Transport + 'static,
        H: MessageHandler + 'static,
    {
        let (sender, receiver) = tokio::sync::mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let dead = Arc::new(AtomicBool::new(false));
        let mut inner = ClientInner::new(
            stream,
            options,
            persister,
            Box::new(handler),
            receiver,
            Arc::clone(&dead),
        );

        let mut buf = Vec::with_capacity(1024);
        if let Err(err) = inner.handshake(&mut buf).await {
            inner.mark_dead();
            return Err(err);
        }
        tokio::spawn(inner.run_loop(buf));

        Ok(Self { sender, dead })
    }

    /// Publish `payload` to `topic`. QoS 1/2 messages get their packet id on
    /// the connection task and are tracked until acknowledged.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name.
    pub async fn publish(&self, topic: &str, qos: QoS, payload: &[u8]) -> Result<(), Error> {
        let packet = PublishPacket::new(topic, qos, payload)?;
        self.command(ClientCmd::Publish(packet)).await;
        Ok(())
    }

    /// Subscribe to `topics`. The granted filters enter the session when the
    /// SUBACK arrives.
    pub async fn subscribe(&self, topics: Vec<SubscribeTopic>) {
        self.command(ClientCmd::Subscribe(topics)).await;
    }

    /// Unsubscribe from the exact filter strings in `filters`.
    pub async fn unsubscribe(&self, filters: Vec<String>) {
        self.command(ClientCmd::Unsubscribe(filters)).await;
    }

    /// Send DISCONNECT and close the connection cleanly, saving the session
    /// and suppressing the Will Message on the broker.
    pub async fn disconnect(&self) {
        self.command(ClientCmd::Disconnect).await;
    }

    /// Whether the connection task has terminated.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    async fn command(&self, cmd: ClientCmd) {
        if self.is_dead() {
            return;
        }
        // A closed queue means the connection died concurrently; the
        // operation degrades to the same no-op as after `is_dead`.
        let _ = self.sender.send(cmd).await;
    }
}
