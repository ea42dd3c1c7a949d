//! Per-connection tasks: one reader, one writer, one idle watchdog.
//!
//! The reader decodes frames into RPC messages and forwards them to the
//! router; undecodable frames are counted and skipped, the link stays up.
//! The writer drains the bounded queue the router fills. The watchdog
//! pings a silent peer once the negotiated idle timeout passes and drops
//! the link when another half of the timeout brings no answer.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use shv_core::chainpack;
use shv_core::framing::{FrameError, RxFrame};
use shv_core::rpcmessage::RpcMessage;

use crate::broker::{BrokerHandle, PeerAuth, PeerControl, PeerLink, SEND_QUEUE_CAPACITY};
use crate::transport::{LinkReader, LinkWriter};

/// Runs one peer until its link dies, the router drops it, or the watchdog
/// gives up. Owns both halves of the link.
pub async fn run_peer(
    mut reader: LinkReader,
    mut writer: LinkWriter,
    handle: BrokerHandle,
    auth: PeerAuth,
) {
    let (msg_tx, mut msg_rx) = mpsc::channel::<RpcMessage>(SEND_QUEUE_CAPACITY);
    let (ctrl_tx, mut ctrl_rx) = watch::channel(PeerControl::default());

    let Some(client_id) =
        handle.register(PeerLink { sender: msg_tx.clone(), control: ctrl_tx }, auth).await
    else {
        return;
    };

    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            if let Err(err) = writer.write_frame(&msg.to_chainpack()).await {
                debug!(client_id, %err, "write failed");
                break;
            }
        }
    });

    let mut last_activity = Instant::now();
    let mut pinged = false;
    let mut parse_errors: u64 = 0;

    loop {
        let control = ctrl_rx.borrow().clone();
        if control.drop_link {
            break;
        }
        let deadline = if pinged {
            last_activity + control.idle_timeout + control.idle_timeout / 2
        } else {
            last_activity + control.idle_timeout
        };

        tokio::select! {
            frame = reader.read_frame() => match frame {
                Ok(RxFrame::Frame(payload)) => {
                    last_activity = Instant::now();
                    pinged = false;
                    match decode(&payload) {
                        Ok(msg) => {
                            if !handle.message(client_id, msg).await {
                                return; // router is gone
                            }
                        }
                        Err(err) => {
                            parse_errors += 1;
                            warn!(client_id, parse_errors, %err, "skipping undecodable frame");
                        }
                    }
                }
                Ok(RxFrame::Reset) => {
                    info!(client_id, "peer reset the link");
                    break;
                }
                Err(FrameError::Closed) => {
                    debug!(client_id, "link closed");
                    break;
                }
                Err(err) => {
                    debug!(client_id, %err, "link failed");
                    break;
                }
            },
            changed = ctrl_rx.changed() => {
                if changed.is_err() || ctrl_rx.borrow().drop_link {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline.into()) => {
                if pinged {
                    info!(client_id, "idle watchdog expired");
                    break;
                }
                pinged = true;
                let _ = msg_tx.try_send(RpcMessage::request(".app", "ping", None));
            }
        }
    }

    drop(msg_tx);
    handle.disconnected(client_id).await;
    // Give queued output (error responses, lsmod) a moment to drain; the
    // router still holds its sender until the disconnect is processed.
    if tokio::time::timeout(Duration::from_millis(100), &mut writer_task).await.is_err() {
        writer_task.abort();
    }
}

fn decode(payload: &[u8]) -> Result<RpcMessage, String> {
    let value = chainpack::unpack(payload).map_err(|e| e.to_string())?;
    RpcMessage::from_value(value).map_err(|e| e.to_string())
}
