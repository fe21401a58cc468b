// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Subscribe to `hello/#` on a local broker and publish one message to it.
//!
//! Start a broker first, e.g. `cargo run --bin shrike`, then
//! `cargo run --example tcp_pubsub`.

use std::sync::Arc;
use std::time::Duration;

use codec::{PublishPacket, QoS, SubscribeTopic};
use session::MemoryPersister;
use tern::{AsyncClient, ConnectOptions};

fn on_message(publish: &PublishPacket) {
    println!(
        "[{}] {}",
        publish.topic(),
        String::from_utf8_lossy(publish.message())
    );
}

#[tokio::main]
async fn main() -> Result<(), tern::Error> {
    env_logger::init();

    let mut options = ConnectOptions::new("127.0.0.1:1883");
    options.set_client_id("tcp-pubsub-example");
    let client = AsyncClient::dial(options, Arc::new(MemoryPersister::new()), on_message).await?;

    client
        .subscribe(vec![SubscribeTopic::new("hello/#", QoS::AtLeastOnce).unwrap()])
        .await;
    client
        .publish("hello/world", QoS::AtLeastOnce, b"greetings")
        .await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    client.disconnect().await;
    Ok(())
}
