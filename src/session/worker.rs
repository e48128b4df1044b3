//! Dispatches decoded commands sequentially against a caller-supplied
//! handler and feeds replies back out through the session's command-reply
//! channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Command, Session};
use crate::wire::Value;

/// A sentinel command name the reader uses to hand the worker a pre-built
/// reply (a framing error, say) without routing it through the real
/// dispatch table.
pub(crate) const OUT_MARKER: &str = "\0OUT";

/// Implemented by whatever owns the server-side state (user database, VFS
/// root, auth context) needed to actually execute a command. One instance
/// is constructed per connection.
#[async_trait]
pub trait CommandHandler: Send {
    async fn dispatch(&mut self, session: &Arc<Session>, command: Vec<Value>) -> Value;

    /// Called once the worker sees a QUIT command, after the OK reply for
    /// it has already been queued.
    fn on_quit(&mut self) {}
}

pub async fn run(session: Arc<Session>, mut cmd_in_rx: mpsc::Receiver<Command>, mut cb: impl CommandHandler) {
    while let Some(command) = cmd_in_rx.recv().await {
        if session.is_shutting_down() {
            break;
        }

        if let Some(Value::Str(marker)) = command.first() {
            if marker == OUT_MARKER {
                if let Some(reply) = command.into_iter().nth(1) {
                    if session.cmd_out().send(reply).await.is_err() {
                        break;
                    }
                }
                continue;
            }
        }

        let is_quit = matches!(
            command.first(),
            Some(Value::Str(name)) if name.eq_ignore_ascii_case("QUIT")
        );

        let reply = if is_quit {
            Value::ok()
        } else {
            cb.dispatch(&session, command).await
        };

        if session.cmd_out().send(reply).await.is_err() {
            break;
        }

        if is_quit {
            cb.on_quit();
            session.shutdown();
            break;
        }
    }
}
