//! Serializes command replies and tagged stream frames back onto the
//! socket. Replies take priority over stream data so a client waiting on
//! a response never gets stuck behind a large transfer.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::Session;
use crate::wire::{Tagged, Value};

pub async fn run<W>(
    mut writer_half: W,
    session: Arc<Session>,
    mut cmd_out_rx: mpsc::Receiver<Value>,
    mut data_out_rx: mpsc::Receiver<Tagged>,
    terminate_tx: mpsc::Sender<()>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut shutdown = session.watch_shutdown();

    loop {
        // Replies always go out ahead of stream data when both are ready.
        if let Ok(reply) = cmd_out_rx.try_recv() {
            if write_value(&mut writer_half, &reply).await.is_err() {
                break;
            }
            continue;
        }

        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            reply = cmd_out_rx.recv() => {
                match reply {
                    Some(reply) => {
                        if write_value(&mut writer_half, &reply).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = data_out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if write_tagged(&mut writer_half, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Flush whatever replies are already queued before tearing the
    // connection down, since Rust's channel closure doesn't carry the
    // same drain-then-close semantics this was ported from.
    while let Ok(reply) = cmd_out_rx.try_recv() {
        if write_value(&mut writer_half, &reply).await.is_err() {
            break;
        }
    }

    let _ = writer_half.flush().await;
    let _ = terminate_tx.send(()).await;
}

async fn write_value<W: AsyncWrite + Unpin>(w: &mut W, value: &Value) -> std::io::Result<()> {
    w.write_all(&value.to_bytes()).await?;
    w.flush().await
}

async fn write_tagged<W: AsyncWrite + Unpin>(w: &mut W, tagged: &Tagged) -> std::io::Result<()> {
    w.write_all(&tagged.to_bytes()).await?;
    w.flush().await
}
