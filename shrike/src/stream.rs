// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};

use crate::error::Error;

/// The byte stream a connection engine drives.
///
/// This is the seam between the protocol core and whatever carries the
/// bytes; the engine never sees a concrete socket type. `Stream` below
/// covers the provided network transports, and tokio's in-memory duplex
/// pipe implements it for tests and embedding.
pub trait Transport: Send {
    /// Read some bytes, appending to `buf`. Returning 0 means the peer
    /// closed the stream.
    fn read_buf(
        &mut self,
        buf: &mut Vec<u8>,
    ) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Write the whole of `buf` to the stream.
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Each `Stream` represents a duplex connection to a client.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
    Ws(Box<WebSocketStream<TcpStream>>),
    Wss(Box<WebSocketStream<TlsStream<TcpStream>>>),
}

impl Transport for Stream {
    async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.read_buf(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.read_buf(buf).await?),
            Self::Ws(ws_stream) => read_ws(ws_stream, buf).await,
            Self::Wss(wss_stream) => read_ws(wss_stream, buf).await,
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
            Self::Wss(wss_stream) => {
                wss_stream.send(Message::binary(buf.to_vec())).await?;
                Ok(())
            }
        }
    }
}

/// A websocket frame carries one or more complete MQTT packets; append the
/// frame body and let the packet framer sort it out.
async fn read_ws<S>(ws_stream: &mut WebSocketStream<S>, buf: &mut Vec<u8>) -> Result<usize, Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    match ws_stream.next().await {
        Some(msg) => {
            let data = msg?.into_data();
            let data_len = data.len();
            buf.extend(data);
            Ok(data_len)
        }
        None => Ok(0),
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
