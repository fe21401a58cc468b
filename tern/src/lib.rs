// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

mod client;
mod client_inner;
pub mod connect_options;
pub mod error;
pub mod handler;
pub mod stream;

pub use client::AsyncClient;
pub use connect_options::{ConnectOptions, ConnectType, LastWill, MqttsConnect, WsConnect};
pub use error::{Error, ErrorKind};
pub use handler::MessageHandler;
pub use stream::{Stream, Transport};
