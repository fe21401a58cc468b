// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::config::{ListenerConfig, Protocol};
use crate::error::{Error, ErrorKind};
use crate::server::Broker;
use crate::stream::Stream;

/// Bind `config.address` and feed every accepted stream into the broker.
///
/// Runs until the socket breaks. TLS and websocket handshakes happen on the
/// connection's own task so a stuck peer cannot block the accept loop.
pub(crate) async fn serve_listener(broker: Broker, config: ListenerConfig) -> Result<(), Error> {
    let tcp_listener = TcpListener::bind(&config.address).await.map_err(|err| {
        Error::from_string(
            ErrorKind::SocketError,
            format!("Failed to bind {}: {err}", config.address),
        )
    })?;
    log::info!("listener: {:?} on {}", config.protocol, config.address);

    let acceptor = match config.protocol {
        Protocol::Mqtts | Protocol::Wss => Some(load_tls_acceptor(&config)?),
        Protocol::Mqtt | Protocol::Ws => None,
    };

    loop {
        let (tcp_stream, peer) = tcp_listener.accept().await?;
        log::debug!("listener: accepted {peer}");

        let broker = broker.clone();
        let acceptor = acceptor.clone();
        let protocol = config.protocol;
        tokio::spawn(async move {
            match upgrade_stream(tcp_stream, protocol, acceptor).await {
                Ok(stream) => {
                    broker.serve_stream(stream);
                }
                Err(err) => {
                    log::warn!("listener: Failed to upgrade stream from {peer}: {err}");
                }
            }
        });
    }
}

/// Wrap a fresh TCP stream in the listener's transport layers.
async fn upgrade_stream(
    tcp_stream: TcpStream,
    protocol: Protocol,
    acceptor: Option<TlsAcceptor>,
) -> Result<Stream, Error> {
    match protocol {
        Protocol::Mqtt => Ok(Stream::Mqtt(tcp_stream)),
        Protocol::Mqtts => {
            let acceptor = require_acceptor(acceptor)?;
            let tls_stream = acceptor.accept(tcp_stream).await?;
            Ok(Stream::Mqtts(Box::new(tls_stream)))
        }
        Protocol::Ws => {
            let ws_stream =
                tokio_tungstenite::accept_hdr_async(tcp_stream, subprotocol_callback).await?;
            Ok(Stream::Ws(Box::new(ws_stream)))
        }
        Protocol::Wss => {
            let acceptor = require_acceptor(acceptor)?;
            let tls_stream = acceptor.accept(tcp_stream).await?;
            let ws_stream =
                tokio_tungstenite::accept_hdr_async(tls_stream, subprotocol_callback).await?;
            Ok(Stream::Wss(Box::new(ws_stream)))
        }
    }
}

fn require_acceptor(acceptor: Option<TlsAcceptor>) -> Result<TlsAcceptor, Error> {
    match acceptor {
        Some(acceptor) => Ok(acceptor),
        None => Err(Error::new(ErrorKind::CertError, "tls acceptor missing")),
    }
}

/// Accept the `MQTT` websocket sub-protocol when the client offers one.
#[allow(clippy::unnecessary_wraps)]
fn subprotocol_callback(
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    if request.headers().contains_key("Sec-WebSocket-Protocol") {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("MQTT"));
    }
    Ok(response)
}

fn load_tls_acceptor(config: &ListenerConfig) -> Result<TlsAcceptor, Error> {
    let cert_file = config.cert_file.as_ref().ok_or_else(|| {
        Error::from_string(
            ErrorKind::CertError,
            format!("cert_file missing for listener {}", config.address),
        )
    })?;
    let key_file = config.key_file.as_ref().ok_or_else(|| {
        Error::from_string(
            ErrorKind::CertError,
            format!("key_file missing for listener {}", config.address),
        )
    })?;

    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let tls_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| {
            Error::from_string(ErrorKind::CertError, format!("Invalid cert or key: {err}"))
        })?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, Error> {
    let mut reader = BufReader::new(File::open(path).map_err(|err| {
        Error::from_string(ErrorKind::CertError, format!("Failed to open {path:?}: {err}"))
    })?);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|err| {
        Error::from_string(ErrorKind::CertError, format!("Failed to parse {path:?}: {err}"))
    })?;
    if certs.is_empty() {
        return Err(Error::from_string(
            ErrorKind::CertError,
            format!("No certificate in {path:?}"),
        ));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey, Error> {
    let mut reader = BufReader::new(File::open(path).map_err(|err| {
        Error::from_string(ErrorKind::CertError, format!("Failed to open {path:?}: {err}"))
    })?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(|err| {
        Error::from_string(ErrorKind::CertError, format!("Failed to parse {path:?}: {err}"))
    })?;
    if keys.is_empty() {
        return Err(Error::from_string(
            ErrorKind::CertError,
            format!("No pkcs8 private key in {path:?}"),
        ));
    }
    Ok(PrivateKey(keys.remove(0)))
}
