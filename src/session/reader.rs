//! Turns incoming wire frames into decoded commands and stream chunks.
//! Framing errors are reported to the client without dropping the
//! connection; I/O errors end the session.

use std::sync::Arc;

use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc;

use super::streams::Frame as StreamFrame;
use super::worker::OUT_MARKER;
use super::{Command, Session};
use crate::wire::{self, Value};

pub async fn run<R>(
    reader_half: R,
    session: Arc<Session>,
    cmd_in_tx: mpsc::Sender<Command>,
    terminate_tx: mpsc::Sender<()>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = wire::Reader::new(BufReader::new(reader_half));

    loop {
        if session.is_shutting_down() {
            break;
        }

        match reader.read_frame().await {
            Ok(wire::Frame::Value(Value::Array(values))) => {
                if cmd_in_tx.send(values).await.is_err() {
                    break;
                }
            }
            Ok(wire::Frame::Value(_)) => {
                if send_proto_error(&cmd_in_tx, "commands must be sent as arrays").await.is_err() {
                    break;
                }
            }
            Ok(wire::Frame::Tagged(tagged)) => {
                if handle_stream_frame(&session, tagged, &cmd_in_tx).await.is_err() {
                    break;
                }
            }
            Err(wire::Error::Format(msg)) => {
                if send_proto_error(&cmd_in_tx, &msg).await.is_err() {
                    break;
                }
            }
            Err(wire::Error::Io(_)) => break,
        }
    }

    let _ = terminate_tx.send(()).await;
}

async fn send_proto_error(cmd_in_tx: &mpsc::Sender<Command>, message: &str) -> Result<(), ()> {
    let reply = Value::error("PROTO", message.to_string());
    cmd_in_tx
        .send(vec![Value::Str(OUT_MARKER.to_string()), reply])
        .await
        .map_err(|_| ())
}

async fn handle_stream_frame(
    session: &Arc<Session>,
    tagged: wire::Tagged,
    cmd_in_tx: &mpsc::Sender<Command>,
) -> Result<(), ()> {
    let id: u32 = match tagged.tag.parse() {
        Ok(id) => id,
        Err(_) => return send_proto_error(cmd_in_tx, "invalid stream tag").await,
    };

    let Some(frames_tx) = session.stream_frame_sender(id).await else {
        return send_proto_error(cmd_in_tx, "stream is not open for writing").await;
    };

    let frame = match tagged.value {
        Value::Blob(data) => StreamFrame::Data(data),
        Value::Null => StreamFrame::Finish,
        _ => return send_proto_error(cmd_in_tx, "stream frames must be blob or null").await,
    };

    let _ = frames_tx.send(frame).await;
    Ok(())
}
