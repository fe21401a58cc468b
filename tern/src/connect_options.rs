// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::time::Duration;

use codec::utils::random_string;
use codec::{ConnectPacket, QoS};

use crate::error::Error;

/// Credentials presented in CONNECT.
#[derive(Clone, Debug)]
pub struct UsernameAuth {
    pub username: String,
    pub password: Vec<u8>,
}

/// Will Message installed at connect time, published by the broker if this
/// client disappears without a DISCONNECT packet.
#[derive(Clone, Debug)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Debug)]
pub struct MqttsConnect {
    /// Server name for certificate validation.
    pub domain: String,
}

#[derive(Clone, Debug)]
pub struct WsConnect {
    /// Request path of the websocket endpoint, e.g. `/mqtt`.
    pub path: String,
}

/// Which transport [`crate::Stream::connect`] dials.
#[derive(Clone, Debug)]
pub enum ConnectType {
    /// Plain TCP, port 1883 by convention.
    Mqtt,

    /// TCP with TLS, port 8883 by convention. Certificates are validated
    /// against the bundled webpki roots.
    Mqtts(MqttsConnect),

    /// Websocket with sub-protocol `MQTT`.
    Ws(WsConnect),
}

/// Everything needed to dial a broker and introduce this client.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    address: String,
    connect_type: ConnectType,
    client_id: String,
    keep_alive: u16,
    clean_session: bool,
    connect_timeout: Duration,
    auth: Option<UsernameAuth>,
    last_will: Option<LastWill>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:1883".to_string(),
            connect_type: ConnectType::Mqtt,
            client_id: random_string(8),
            keep_alive: 60,
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            auth: None,
            last_will: None,
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_connect_type(&mut self, connect_type: ConnectType) -> &mut Self {
        self.connect_type = connect_type;
        self
    }

    #[must_use]
    pub const fn connect_type(&self) -> &ConnectType {
        &self.connect_type
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Keep-alive interval in seconds; zero turns keep-alive off.
    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn set_auth(&mut self, username: &str, password: &[u8]) -> &mut Self {
        self.auth = Some(UsernameAuth {
            username: username.to_string(),
            password: password.to_vec(),
        });
        self
    }

    #[must_use]
    pub const fn auth(&self) -> Option<&UsernameAuth> {
        self.auth.as_ref()
    }

    pub fn set_last_will(&mut self, last_will: LastWill) -> &mut Self {
        self.last_will = Some(last_will);
        self
    }

    #[must_use]
    pub const fn last_will(&self) -> Option<&LastWill> {
        self.last_will.as_ref()
    }

    /// Build the CONNECT packet these options describe.
    ///
    /// # Errors
    ///
    /// Returns error if the client id, will topic or credentials do not fit
    /// the packet fields.
    pub fn to_connect_packet(&self) -> Result<ConnectPacket, Error> {
        let mut packet = ConnectPacket::new(&self.client_id)?;
        packet.set_keep_alive(self.keep_alive);
        packet.set_clean_session(self.clean_session);
        if let Some(last_will) = &self.last_will {
            packet.set_will(
                &last_will.topic,
                &last_will.message,
                last_will.qos,
                last_will.retain,
            )?;
        }
        if let Some(auth) = &self.auth {
            packet.set_username(&auth.username)?;
            packet.set_password(&auth.password)?;
        }
        Ok(packet)
    }
}
