//! Transport listeners and the link abstraction over them.
//!
//! Every URL scheme ends up as a [`LinkReader`]/[`LinkWriter`] pair: byte
//! streams (TCP, Unix sockets, serial devices, pipes) run a
//! [`FrameReader`]/[`FrameWriter`] with the scheme's framing, WebSockets
//! carry exactly one RPC frame per binary message. Serial devices and
//! pipes serve a single peer at a time and are reopened when the peer
//! goes away.

use std::io;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use shv_core::framing::{FrameError, FrameReader, FrameWriter, Framing, RxFrame};
use shv_core::url::{RpcUrl, Scheme};

use crate::broker::{BrokerHandle, PeerAuth};
use crate::peer::run_peer;

/// Failure to set a listener up; fatal at startup.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("cannot listen on {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot listen on {url}: {reason}")]
    Unsupported { url: String, reason: &'static str },
}

// ── Link abstraction ──────────────────────────────────────────────────────────

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
type ServerWs = WebSocketStream<TcpStream>;
type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reading half of a connected link.
pub enum LinkReader {
    Stream(FrameReader<BoxedRead>),
    Ws(SplitStream<ServerWs>),
    WsClient(SplitStream<ClientWs>),
}

/// Writing half of a connected link.
pub enum LinkWriter {
    Stream(FrameWriter<BoxedWrite>),
    Ws(SplitSink<ServerWs, WsMessage>),
    WsClient(SplitSink<ClientWs, WsMessage>),
}

impl LinkReader {
    pub async fn read_frame(&mut self) -> Result<RxFrame, FrameError> {
        match self {
            LinkReader::Stream(reader) => reader.read_frame().await,
            LinkReader::Ws(ws) => ws_read(ws).await,
            LinkReader::WsClient(ws) => ws_read(ws).await,
        }
    }
}

async fn ws_read<S>(ws: &mut SplitStream<WebSocketStream<S>>) -> Result<RxFrame, FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            None => return Err(FrameError::Closed),
            Some(Err(err)) => return Err(FrameError::Io(io::Error::other(err))),
            Some(Ok(WsMessage::Binary(data))) => return Ok(RxFrame::Frame(data)),
            Some(Ok(WsMessage::Close(_))) => return Err(FrameError::Closed),
            // Text and control messages are not RPC frames.
            Some(Ok(_)) => continue,
        }
    }
}

impl LinkWriter {
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        match self {
            LinkWriter::Stream(writer) => writer.write_frame(payload).await,
            LinkWriter::Ws(sink) => sink
                .send(WsMessage::Binary(payload.to_vec()))
                .await
                .map_err(|err| FrameError::Io(io::Error::other(err))),
            LinkWriter::WsClient(sink) => sink
                .send(WsMessage::Binary(payload.to_vec()))
                .await
                .map_err(|err| FrameError::Io(io::Error::other(err))),
        }
    }
}

/// Splits any byte stream into a framed link pair.
pub fn split_stream<S>(stream: S, framing: Framing) -> (LinkReader, LinkWriter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (
        LinkReader::Stream(FrameReader::new(Box::new(read), framing)),
        LinkWriter::Stream(FrameWriter::new(Box::new(write), framing)),
    )
}

// ── Listeners ─────────────────────────────────────────────────────────────────

/// Binds every configured listen URL and spawns its accept task. Any bind
/// failure aborts startup.
pub async fn start_listeners(
    urls: &[RpcUrl],
    handle: BrokerHandle,
) -> Result<Vec<JoinHandle<()>>, BindError> {
    let mut tasks = Vec::new();
    for url in urls {
        tasks.push(start_listener(url, handle.clone()).await?);
    }
    Ok(tasks)
}

async fn start_listener(url: &RpcUrl, handle: BrokerHandle) -> Result<JoinHandle<()>, BindError> {
    let framing = url.framing();
    match url.scheme {
        Scheme::Tcp | Scheme::TcpSerial => {
            let listener = bind_tcp(url).await?;
            info!(%url, "listening");
            Ok(tokio::spawn(accept_tcp(listener, framing, handle)))
        }
        Scheme::Ws => {
            let listener = bind_tcp(url).await?;
            info!(%url, "listening");
            Ok(tokio::spawn(accept_ws(listener, handle)))
        }
        Scheme::Wss => Err(BindError::Unsupported {
            url: url.to_string(),
            reason: "wss requires TLS termination below the broker; listen on ws instead",
        }),
        Scheme::Unix => {
            // A stale socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(&url.location);
            let listener = UnixListener::bind(&url.location)
                .map_err(|source| BindError::Io { url: url.to_string(), source })?;
            info!(%url, "listening");
            Ok(tokio::spawn(accept_unix(listener, framing, handle)))
        }
        Scheme::Serial | Scheme::Pipe => {
            info!(%url, "serving single-peer device");
            let location = url.location.clone();
            Ok(tokio::spawn(serve_device(location, framing, handle)))
        }
    }
}

async fn bind_tcp(url: &RpcUrl) -> Result<TcpListener, BindError> {
    TcpListener::bind((url.location.as_str(), url.port))
        .await
        .map_err(|source| BindError::Io { url: url.to_string(), source })
}

async fn accept_tcp(listener: TcpListener, framing: Framing, handle: BrokerHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                let _ = stream.set_nodelay(true);
                let (reader, writer) = split_stream(stream, framing);
                tokio::spawn(run_peer(reader, writer, handle.clone(), PeerAuth::Login));
            }
            Err(err) => {
                // Transient (EMFILE and friends); keep accepting.
                error!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_ws(listener: TcpListener, handle: BrokerHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted websocket connection");
                let handle = handle.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => {
                            let (sink, stream) = ws.split();
                            run_peer(
                                LinkReader::Ws(stream),
                                LinkWriter::Ws(sink),
                                handle,
                                PeerAuth::Login,
                            )
                            .await;
                        }
                        Err(err) => debug!(%addr, %err, "websocket handshake failed"),
                    }
                });
            }
            Err(err) => {
                error!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_unix(listener: UnixListener, framing: Framing, handle: BrokerHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let (reader, writer) = split_stream(stream, framing);
                tokio::spawn(run_peer(reader, writer, handle.clone(), PeerAuth::Login));
            }
            Err(err) => {
                error!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Serial devices and FIFOs carry one peer; when it goes away the device
/// is reopened and a fresh login is expected.
async fn serve_device(location: String, framing: Framing, handle: BrokerHandle) {
    loop {
        match tokio::fs::OpenOptions::new().read(true).write(true).open(&location).await {
            Ok(file) => {
                info!(device = %location, "device opened");
                let (reader, writer) = split_stream(file, framing);
                run_peer(reader, writer, handle.clone(), PeerAuth::Login).await;
                info!(device = %location, "device session ended");
            }
            Err(err) => {
                warn!(device = %location, %err, "cannot open device, retrying");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
