// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};

use crate::connect_options::{ConnectOptions, ConnectType, MqttsConnect, WsConnect};
use crate::error::{Error, ErrorKind};

/// The byte stream the client engine drives.
///
/// `Stream` below covers the provided network transports; tokio's in-memory
/// duplex pipe implements it too so the engine can be exercised without a
/// socket.
pub trait Transport: Send {
    /// Read some bytes, appending to `buf`. Returning 0 means the server
    /// closed the stream.
    fn read_buf(
        &mut self,
        buf: &mut Vec<u8>,
    ) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Write the whole of `buf` to the stream.
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;
}

/// A duplex connection to a broker.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
    Ws(Box<WebSocketStream<TcpStream>>),
}

impl Stream {
    /// Dial the broker the options point at.
    ///
    /// # Errors
    ///
    /// Returns error if the TCP, TLS or websocket handshake fails.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, Error> {
        match options.connect_type() {
            ConnectType::Mqtt => Self::connect_mqtt(options.address()).await,
            ConnectType::Mqtts(mqtts) => Self::connect_mqtts(options.address(), mqtts).await,
            ConnectType::Ws(ws) => Self::connect_ws(options.address(), ws).await,
        }
    }

    async fn connect_mqtt(address: &str) -> Result<Self, Error> {
        let tcp_stream = TcpStream::connect(address).await?;
        Ok(Self::Mqtt(tcp_stream))
    }

    async fn connect_mqtts(address: &str, mqtts: &MqttsConnect) -> Result<Self, Error> {
        let mut root_store = RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                anchor.subject,
                anchor.spki,
                anchor.name_constraints,
            )
        }));
        let tls_config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let server_name = ServerName::try_from(mqtts.domain.as_str()).map_err(|err| {
            Error::from_string(
                ErrorKind::CertError,
                format!("Invalid domain {:?}: {err}", mqtts.domain),
            )
        })?;
        let tcp_stream = TcpStream::connect(address).await?;
        let tls_stream = connector.connect(server_name, tcp_stream).await?;
        Ok(Self::Mqtts(Box::new(tls_stream)))
    }

    async fn connect_ws(address: &str, ws: &WsConnect) -> Result<Self, Error> {
        let ws_url = format!("ws://{}{}", address, ws.path);
        let tcp_stream = TcpStream::connect(address).await?;
        let (ws_stream, _response) = tokio_tungstenite::client_async(&ws_url, tcp_stream)
            .await
            .map_err(Error::from)?;
        Ok(Self::Ws(Box::new(ws_stream)))
    }
}

impl Transport for Stream {
    async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.read_buf(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.read_buf(buf).await?),
            Self::Ws(ws_stream) => match ws_stream.next().await {
                Some(msg) => {
                    let data = msg?.into_data();
                    let data_len = data.len();
                    buf.extend(data);
                    Ok(data_len)
                }
                None => Ok(0),
            },
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.write_all(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.write_all(buf).await?),
            Self::Ws(ws_stream) => {
                ws_stream.send(Message::binary(buf.to_vec())).await?;
                Ok(())
            }
        }
    }
}

impl Transport for tokio::io::DuplexStream {
    async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        Ok(AsyncReadExt::read_buf(self, buf).await?)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        Ok(AsyncWriteExt::write_all(self, buf).await?)
    }
}
