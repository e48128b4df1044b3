//! The per-connection session engine: a reader task turns wire frames into
//! commands and stream chunks, a worker task dispatches commands
//! sequentially, a writer task serializes replies and stream frames back
//! onto the socket, and a set of per-stream tasks drive file transfers.
//! All four kinds of task communicate over bounded channels and watch a
//! shared shutdown signal.

mod reader;
mod streams;
mod worker;
mod writer;

pub use streams::{StreamDirection, StreamError};
pub use worker::CommandHandler;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;

use crate::wire::{Tagged, Value};

pub const MAX_STREAMS: usize = 16;
const COMMAND_CHANNEL_DEPTH: usize = 5;
const OUT_CHANNEL_DEPTH: usize = 5;

/// Commands arrive on the reader->worker channel as the raw array of
/// values the client sent, command name included at index 0.
pub type Command = Vec<Value>;

struct StreamSlot {
    handle: streams::StreamHandle,
}

pub struct Session {
    cmd_out_tx: mpsc::Sender<Value>,
    data_out_tx: mpsc::Sender<Tagged>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    streams: Mutex<[Option<StreamSlot>; MAX_STREAMS]>,
    /// Join handles for every stream task ever spawned on this session,
    /// kept around (even past the stream's own completion) so shutdown can
    /// wait for all of them to actually finish tearing down.
    stream_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Session {
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn watch_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub(crate) fn cmd_out(&self) -> mpsc::Sender<Value> {
        self.cmd_out_tx.clone()
    }

    pub(crate) fn data_out(&self) -> mpsc::Sender<Tagged> {
        self.data_out_tx.clone()
    }

    /// Allocates the lowest free stream slot, spawning a task that drives
    /// the transfer until it finishes, is cancelled, or the session shuts
    /// down.
    pub async fn open_stream(
        self: &Arc<Self>,
        direction: StreamDirection,
    ) -> Option<u32> {
        let mut streams = self.streams.lock().await;
        let id = streams.iter().position(|s| s.is_none())?;

        let (handle, task) = streams::spawn(self.clone(), id as u32, direction);
        streams[id] = Some(StreamSlot { handle });
        self.stream_tasks.lock().await.push(task);

        Some(id as u32)
    }

    /// Takes every stream task handle recorded so far, leaving none behind.
    /// Called once at shutdown so `handle()` can await them.
    async fn take_stream_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        std::mem::take(&mut *self.stream_tasks.lock().await)
    }

    pub async fn close_stream(&self, id: u32) -> bool {
        let streams = self.streams.lock().await;
        match streams.get(id as usize).and_then(|s| s.as_ref()) {
            Some(slot) => {
                slot.handle.cancel();
                true
            }
            None => false,
        }
    }

    async fn release_stream(&self, id: u32) {
        let mut streams = self.streams.lock().await;
        if let Some(slot) = streams.get_mut(id as usize) {
            *slot = None;
        }
    }

    async fn stream_frame_sender(&self, id: u32) -> Option<mpsc::Sender<streams::Frame>> {
        let streams = self.streams.lock().await;
        streams.get(id as usize).and_then(|s| s.as_ref()).and_then(|s| s.handle.frames())
    }
}

/// Drives one connection end to end: spawns the reader/writer/worker
/// tasks, waits for a terminate signal from any of them, then tears
/// everything down and waits for in-flight stream tasks to finish.
pub async fn handle<R, W>(reader_half: R, writer_half: W, cb: impl CommandHandler + 'static)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_in_tx, cmd_in_rx) = mpsc::channel::<Command>(COMMAND_CHANNEL_DEPTH);
    let (cmd_out_tx, cmd_out_rx) = mpsc::channel::<Value>(OUT_CHANNEL_DEPTH);
    let (data_out_tx, data_out_rx) = mpsc::channel::<Tagged>(OUT_CHANNEL_DEPTH);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (terminate_tx, mut terminate_rx) = mpsc::channel::<()>(3);

    let session = Arc::new(Session {
        cmd_out_tx,
        data_out_tx,
        shutdown_tx,
        shutdown_rx,
        streams: Mutex::new(std::array::from_fn(|_| None)),
        stream_tasks: Mutex::new(Vec::new()),
    });

    let mut tasks = JoinSet::new();

    {
        let session = session.clone();
        let terminate_tx = terminate_tx.clone();
        tasks.spawn(async move {
            reader::run(reader_half, session, cmd_in_tx, terminate_tx).await;
        });
    }

    {
        let session = session.clone();
        let terminate_tx = terminate_tx.clone();
        tasks.spawn(async move {
            writer::run(writer_half, session, cmd_out_rx, data_out_rx, terminate_tx).await;
        });
    }

    {
        let session = session.clone();
        tasks.spawn(async move {
            worker::run(session, cmd_in_rx, cb).await;
        });
    }

    drop(terminate_tx);
    terminate_rx.recv().await;
    session.shutdown();

    while tasks.join_next().await.is_some() {}

    for task in session.take_stream_tasks().await {
        let _ = task.await;
    }
}
