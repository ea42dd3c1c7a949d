//! Broker-initiated connections.
//!
//! Each `[[connect]]` entry dials its URL, performs the client side of the
//! hello/login handshake, pushes the configured subscriptions to the remote
//! broker and then joins the local peer table as a pre-authenticated peer
//! with the configured mount point. A dropped link reconnects with
//! exponential backoff: base 500 ms, capped at 60 s, ±20 % jitter.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shv_core::chainpack;
use shv_core::framing::{FrameError, RxFrame};
use shv_core::login::map_get;
use shv_core::rpcmessage::{RpcMessage, RpcMessageType};
use shv_core::url::Scheme;

use crate::broker::{BrokerHandle, PeerAuth};
use crate::config::{BrokerConfig, Connect};
use crate::peer::run_peer;
use crate::transport::{split_stream, LinkReader, LinkWriter};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum ConnectError {
    #[error("dial failed: {0}")]
    Dial(#[from] std::io::Error),

    #[error("link failed during handshake: {0}")]
    Link(#[from] FrameError),

    #[error("handshake timed out")]
    Timeout,

    #[error("malformed {0} response")]
    MalformedResponse(&'static str),

    #[error("login refused: {0}")]
    LoginRefused(String),

    #[error("scheme {0} is not supported for outbound connections")]
    UnsupportedScheme(&'static str),
}

/// Spawns one reconnect loop per configured connection.
pub fn start_outbound(config: Arc<BrokerConfig>, handle: BrokerHandle) -> Vec<JoinHandle<()>> {
    config
        .connect
        .iter()
        .cloned()
        .map(|connect| tokio::spawn(connect_loop(connect, handle.clone())))
        .collect()
}

async fn connect_loop(connect: Connect, handle: BrokerHandle) {
    let mut attempt: u32 = 0;
    loop {
        match connect_once(&connect, &handle).await {
            Ok(()) => {
                info!(url = %connect.url, "outbound connection ended");
                attempt = 0;
            }
            Err(err) => {
                warn!(url = %connect.url, %err, "outbound connection failed");
                attempt = attempt.saturating_add(1);
            }
        }
        tokio::time::sleep(backoff_delay(attempt)).await;
    }
}

/// Exponential backoff with jitter so a flock of reconnecting brokers does
/// not thunder in step.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(7));
    let capped = exp.min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    capped.mul_f64(jitter)
}

async fn connect_once(connect: &Connect, handle: &BrokerHandle) -> Result<(), ConnectError> {
    let url = &connect.url;
    let (mut reader, mut writer) = match url.scheme {
        Scheme::Tcp | Scheme::TcpSerial => {
            let stream = TcpStream::connect((url.location.as_str(), url.port)).await?;
            let _ = stream.set_nodelay(true);
            split_stream(stream, url.framing())
        }
        Scheme::Unix => {
            let stream = UnixStream::connect(&url.location).await?;
            split_stream(stream, url.framing())
        }
        Scheme::Serial | Scheme::Pipe => {
            let file = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&url.location)
                .await?;
            split_stream(file, url.framing())
        }
        Scheme::Ws => {
            let target = format!("ws://{}:{}{}", url.location, url.port, url.path);
            let (ws, _) = tokio_tungstenite::connect_async(target.as_str())
                .await
                .map_err(|err| ConnectError::Dial(std::io::Error::other(err)))?;
            let (sink, stream) = futures_util::StreamExt::split(ws);
            (LinkReader::WsClient(stream), LinkWriter::WsClient(sink))
        }
        Scheme::Wss => return Err(ConnectError::UnsupportedScheme("wss")),
    };

    login_handshake(&mut reader, &mut writer, connect).await?;
    info!(url = %url, user = %url.login.user, "outbound login complete");

    // Subscriptions live on the remote broker; responses come back as
    // broker-directed and are consumed by the router.
    for ri in &connect.subscriptions {
        let msg = RpcMessage::request(
            ".broker/currentClient",
            "subscribe",
            Some(shv_core::RpcValue::from(ri.to_string())),
        );
        writer.write_frame(&msg.to_chainpack()).await?;
    }

    run_peer(
        reader,
        writer,
        handle.clone(),
        PeerAuth::Preauth {
            user: url.login.user.clone(),
            roles: connect.roles.clone(),
            mount_point: connect.mount_point.clone(),
        },
    )
    .await;
    Ok(())
}

async fn login_handshake(
    reader: &mut LinkReader,
    writer: &mut LinkWriter,
    connect: &Connect,
) -> Result<(), ConnectError> {
    let hello = RpcMessage::request("", "hello", None);
    let hello_id = hello.request_id().expect("requests carry an id");
    writer.write_frame(&hello.to_chainpack()).await?;
    let resp = wait_response(reader, hello_id).await?;
    let nonce = resp
        .result()
        .and_then(|r| map_get(r, &["nonce"]))
        .and_then(|n| n.as_str())
        .ok_or(ConnectError::MalformedResponse("hello"))?
        .to_string();

    let param = connect.url.login.to_value(&nonce, false);
    let login = RpcMessage::request("", "login", Some(param));
    let login_id = login.request_id().expect("requests carry an id");
    writer.write_frame(&login.to_chainpack()).await?;
    let resp = wait_response(reader, login_id).await?;
    if let Some(err) = resp.error() {
        return Err(ConnectError::LoginRefused(err.message));
    }
    Ok(())
}

/// Reads frames until the response to `rqid` shows up. Anything else at
/// this stage is unexpected and skipped.
async fn wait_response(reader: &mut LinkReader, rqid: i64) -> Result<RpcMessage, ConnectError> {
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let frame = tokio::time::timeout_at(deadline, reader.read_frame())
            .await
            .map_err(|_| ConnectError::Timeout)??;
        let payload = match frame {
            RxFrame::Frame(payload) => payload,
            RxFrame::Reset => return Err(ConnectError::MalformedResponse("reset")),
        };
        let Ok(value) = chainpack::unpack(&payload) else {
            debug!("skipping undecodable frame during handshake");
            continue;
        };
        match RpcMessage::from_value(value) {
            Ok(msg)
                if msg.classify() == Ok(RpcMessageType::Response)
                    && msg.request_id() == Some(rqid) =>
            {
                return Ok(msg)
            }
            _ => debug!("skipping unexpected message during handshake"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        for attempt in 0..20 {
            let delay = backoff_delay(attempt);
            assert!(delay >= BACKOFF_BASE.mul_f64(0.8), "attempt {attempt} too short");
            assert!(delay <= BACKOFF_CAP.mul_f64(1.2), "attempt {attempt} too long");
        }
        // Jitter aside, consecutive early attempts roughly double.
        let early = backoff_delay(1).as_millis();
        let later = backoff_delay(4).as_millis();
        assert!(later > early);
    }
}
