//! Per-stream tasks: one per open transfer, each driving a read, write, or
//! copy to completion, cancellation, or (for writes) an inactivity
//! timeout.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant, Sleep};

use super::Session;
use crate::wire::{Tagged, Value};

const CHUNK_SIZE: usize = 64 * 1024;
const WRITE_WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
const STREAM_FRAME_DEPTH: usize = 5;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub enum StreamDirection {
    Read { path: PathBuf },
    Write { tmp_path: PathBuf, final_path: PathBuf },
    Copy { src: PathBuf, dst_tmp: PathBuf, dst_final: PathBuf },
}

/// A chunk arriving from the client for an open write stream.
pub enum Frame {
    Data(Vec<u8>),
    Finish,
}

pub struct StreamHandle {
    frames_tx: Option<mpsc::Sender<Frame>>,
    cancel_tx: mpsc::Sender<()>,
}

impl StreamHandle {
    /// `None` for a read or copy stream, which never accepts client-sent
    /// data frames.
    pub fn frames(&self) -> Option<mpsc::Sender<Frame>> {
        self.frames_tx.clone()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.try_send(());
    }
}

/// Spawns the task driving this stream and returns both the handle used to
/// feed it frames/cancellation and its `JoinHandle`, so the caller can wait
/// for it to actually finish tearing down (e.g. discarding a tmp file) at
/// connection shutdown instead of leaving it detached.
pub fn spawn(session: Arc<Session>, id: u32, direction: StreamDirection) -> (StreamHandle, tokio::task::JoinHandle<()>) {
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>(2);

    let frames_tx = match &direction {
        StreamDirection::Write { .. } => {
            let (tx, rx) = mpsc::channel::<Frame>(STREAM_FRAME_DEPTH);
            let task = tokio::spawn(run_write(session.clone(), id, direction_take(direction), rx, cancel_rx));
            return (StreamHandle { frames_tx: Some(tx), cancel_tx }, task);
        }
        StreamDirection::Read { .. } => None,
        StreamDirection::Copy { .. } => None,
    };

    let task = match direction {
        StreamDirection::Read { path } => tokio::spawn(run_read(session, id, path, cancel_rx)),
        StreamDirection::Copy { src, dst_tmp, dst_final } => {
            tokio::spawn(run_copy(session, id, src, dst_tmp, dst_final, cancel_rx))
        }
        StreamDirection::Write { .. } => unreachable!("handled above"),
    };

    (StreamHandle { frames_tx, cancel_tx }, task)
}

/// Only reachable for the `Write` arm; lets `spawn` move the direction
/// into the write task without fighting the borrow checker over the match
/// it's already inside.
fn direction_take(direction: StreamDirection) -> (PathBuf, PathBuf) {
    match direction {
        StreamDirection::Write { tmp_path, final_path } => (tmp_path, final_path),
        _ => unreachable!(),
    }
}

async fn run_read(session: Arc<Session>, id: u32, path: PathBuf, mut cancel_rx: mpsc::Receiver<()>) {
    let mut shutdown = session.watch_shutdown();
    let result = read_loop(&session, id, &path, &mut cancel_rx, &mut shutdown).await;

    if let Err(err) = result {
        let _ = session
            .data_out()
            .send(Tagged { tag: id.to_string(), value: Value::error("IO", err.to_string()) })
            .await;
    }

    session.release_stream(id).await;
}

async fn read_loop(
    session: &Arc<Session>,
    id: u32,
    path: &PathBuf,
    cancel_rx: &mut mpsc::Receiver<()>,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<(), StreamError> {
    let mut file = File::open(path).await?;
    let mut buf_a = vec![0u8; CHUNK_SIZE];
    let mut buf_b = vec![0u8; CHUNK_SIZE];
    let mut use_a = true;

    loop {
        let buf = if use_a { &mut buf_a } else { &mut buf_b };
        use_a = !use_a;

        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = cancel_rx.recv() => return Ok(()),
            n = file.read(buf) => {
                let n = n?;
                if n == 0 {
                    let _ = session.data_out().send(Tagged { tag: id.to_string(), value: Value::Null }).await;
                    return Ok(());
                }
                let chunk = buf[..n].to_vec();
                let _ = session.data_out().send(Tagged { tag: id.to_string(), value: Value::Blob(chunk) }).await;
            }
        }
    }
}

async fn run_write(
    session: Arc<Session>,
    id: u32,
    (tmp_path, final_path): (PathBuf, PathBuf),
    mut frames_rx: mpsc::Receiver<Frame>,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let mut shutdown = session.watch_shutdown();

    let file = match File::create(&tmp_path).await {
        Ok(f) => f,
        Err(err) => {
            let _ = session
                .data_out()
                .send(Tagged { tag: id.to_string(), value: Value::error("IO", err.to_string()) })
                .await;
            session.release_stream(id).await;
            return;
        }
    };

    let outcome = write_loop(&session, id, file, &tmp_path, &final_path, &mut frames_rx, &mut cancel_rx, &mut shutdown).await;

    if let Err(err) = outcome {
        let _ = session
            .data_out()
            .send(Tagged { tag: id.to_string(), value: Value::error("IO", err.to_string()) })
            .await;
    }

    session.release_stream(id).await;
}

enum WriteOutcome {
    Finished,
    Cancelled,
    Failed(StreamError),
}

async fn write_loop(
    session: &Arc<Session>,
    id: u32,
    mut file: File,
    tmp_path: &PathBuf,
    final_path: &PathBuf,
    frames_rx: &mut mpsc::Receiver<Frame>,
    cancel_rx: &mut mpsc::Receiver<()>,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<(), StreamError> {
    let mut watchdog = Box::pin(sleep(WRITE_WATCHDOG_INTERVAL));

    let outcome = loop {
        tokio::select! {
            _ = shutdown.changed() => break WriteOutcome::Cancelled,
            _ = cancel_rx.recv() => break WriteOutcome::Cancelled,
            () = &mut watchdog => {
                let _ = session.data_out().send(Tagged {
                    tag: id.to_string(),
                    value: Value::error("TIMEOUT", "Timed out due to inactivity"),
                }).await;
                break WriteOutcome::Cancelled;
            }
            frame = frames_rx.recv() => {
                match frame {
                    None | Some(Frame::Finish) => break WriteOutcome::Finished,
                    Some(Frame::Data(chunk)) => {
                        match file.write_all(&chunk).await {
                            Ok(()) => reset_watchdog(watchdog.as_mut()),
                            Err(err) => break WriteOutcome::Failed(err.into()),
                        }
                    }
                }
            }
        }
    };

    match outcome {
        WriteOutcome::Cancelled => {
            drop(file);
            let _ = tokio::fs::remove_file(tmp_path).await;
            Ok(())
        }
        WriteOutcome::Finished => {
            drop(file);
            if let Err(err) = tokio::fs::rename(tmp_path, final_path).await {
                let _ = tokio::fs::remove_file(tmp_path).await;
                return Err(err.into());
            }
            Ok(())
        }
        WriteOutcome::Failed(err) => {
            drop(file);
            let _ = tokio::fs::remove_file(tmp_path).await;
            Err(err)
        }
    }
}

fn reset_watchdog(sleep: Pin<&mut Sleep>) {
    sleep.reset(Instant::now() + WRITE_WATCHDOG_INTERVAL);
}

async fn run_copy(
    session: Arc<Session>,
    id: u32,
    src: PathBuf,
    dst_tmp: PathBuf,
    dst_final: PathBuf,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let mut shutdown = session.watch_shutdown();
    let result = copy_loop(&src, &dst_tmp, &dst_final, &mut cancel_rx, &mut shutdown).await;

    match result {
        Ok(true) => {
            let _ = session.data_out().send(Tagged { tag: id.to_string(), value: Value::Null }).await;
        }
        Ok(false) => {} // cancelled; no notification, matching a write-stream cancel
        Err(err) => {
            let _ = session
                .data_out()
                .send(Tagged { tag: id.to_string(), value: Value::error("IO", err.to_string()) })
                .await;
        }
    }

    session.release_stream(id).await;
}

enum CopyOutcome {
    Finished,
    Cancelled,
    Failed(StreamError),
}

/// Returns `Ok(true)` on success, `Ok(false)` if cancelled partway through.
async fn copy_loop(
    src: &PathBuf,
    dst_tmp: &PathBuf,
    dst_final: &PathBuf,
    cancel_rx: &mut mpsc::Receiver<()>,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<bool, StreamError> {
    let mut src_file = File::open(src).await?;
    let mut dst_file = File::create(dst_tmp).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];

    let outcome = loop {
        tokio::select! {
            _ = shutdown.changed() => break CopyOutcome::Cancelled,
            _ = cancel_rx.recv() => break CopyOutcome::Cancelled,
            n = src_file.read(&mut buf) => {
                match n {
                    Ok(0) => break CopyOutcome::Finished,
                    Ok(n) => {
                        if let Err(err) = dst_file.write_all(&buf[..n]).await {
                            break CopyOutcome::Failed(err.into());
                        }
                    }
                    Err(err) => break CopyOutcome::Failed(err.into()),
                }
            }
        }
    };

    match outcome {
        CopyOutcome::Cancelled => {
            drop(dst_file);
            let _ = tokio::fs::remove_file(dst_tmp).await;
            Ok(false)
        }
        CopyOutcome::Finished => {
            drop(dst_file);
            if let Err(err) = tokio::fs::rename(dst_tmp, dst_final).await {
                let _ = tokio::fs::remove_file(dst_tmp).await;
                return Err(err.into());
            }
            Ok(true)
        }
        CopyOutcome::Failed(err) => {
            drop(dst_file);
            let _ = tokio::fs::remove_file(dst_tmp).await;
            Err(err)
        }
    }
}
