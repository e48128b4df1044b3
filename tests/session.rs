//! End-to-end exercises of the session engine over an in-memory duplex
//! pipe: a `commands::Handler` on one end, raw wire frames on the other.

use std::sync::Arc;
use std::time::Duration;

use flybywire::commands::Handler;
use flybywire::db;
use flybywire::session;
use flybywire::wire::{self, Tagged, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};

struct Client<R, W> {
    reader: wire::Reader<R>,
    writer: W,
}

impl<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin> Client<R, W> {
    async fn command(&mut self, parts: Vec<Value>) -> Value {
        wire::write_value(&mut self.writer, &Value::Array(parts)).await.unwrap();
        self.reader.read_value().await.unwrap()
    }

    async fn frame(&mut self) -> wire::Frame {
        self.reader.read_frame().await.unwrap()
    }

    async fn send_tagged(&mut self, tagged: Tagged) {
        wire::write_tagged(&mut self.writer, &tagged).await.unwrap();
    }
}

fn str_val(s: &str) -> Value {
    Value::Str(s.to_string())
}

async fn start_session(root: &std::path::Path) -> Client<BufReader<tokio::io::DuplexStream>, tokio::io::DuplexStream> {
    let flydb = Arc::new(db::Handle::open(root.to_path_buf()).await.unwrap());
    let handler = Handler::new(flydb, root.to_path_buf(), None);

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_reader, server_writer) = tokio::io::split(server_io);
    tokio::spawn(async move {
        session::handle(server_reader, server_writer, handler).await;
    });

    let (client_reader, client_writer) = tokio::io::split(client_io);
    Client { reader: wire::Reader::new(BufReader::new(client_reader)), writer: client_writer }
}

#[tokio::test]
async fn ping_and_bootstrap_adduser() {
    let dir = TempDir::new().unwrap();
    let mut client = start_session(dir.path()).await;

    assert_eq!(client.command(vec![str_val("PING")]).await, Value::Str("PONG".into()));

    let reply = client
        .command(vec![str_val("ADDUSER"), str_val("alice"), str_val("hunter2")])
        .await;
    assert_eq!(reply, Value::ok());

    let who = client.command(vec![str_val("WHOAMI")]).await;
    match who {
        Value::Str(name) => assert_eq!(name, "alice"),
        other => panic!("unexpected WHOAMI reply: {other:?}"),
    }
}

#[tokio::test]
async fn malformed_top_level_value_does_not_drop_connection() {
    let dir = TempDir::new().unwrap();
    let mut client = start_session(dir.path()).await;

    wire::write_value(&mut client.writer, &str_val("not an array")).await.unwrap();
    match client.frame().await {
        wire::Frame::Value(Value::Error { code, .. }) => assert_eq!(code, "PROTO"),
        other => panic!("expected a PROTO error reply, got {other:?}"),
    }

    assert_eq!(client.command(vec![str_val("PING")]).await, Value::Str("PONG".into()));
}

#[tokio::test]
async fn reserved_path_is_denied_in_single_user_mode() {
    let dir = TempDir::new().unwrap();
    let mut client = start_session(dir.path()).await;

    let reply = client.command(vec![str_val("MKDIR"), str_val("/.fly/evil")]).await;
    assert!(matches!(reply, Value::Error { .. }), "expected reserved path to be denied, got {reply:?}");
}

#[tokio::test]
async fn write_stream_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut client = start_session(dir.path()).await;

    let reply = client.command(vec![str_val("STREAM"), str_val("W"), str_val("/upload.bin")]).await;
    let Value::Integer(id) = reply else { panic!("expected a stream id, got {reply:?}") };
    let tag = id.to_string();

    client.send_tagged(Tagged { tag: tag.clone(), value: Value::Blob(vec![1, 2, 3, 4]) }).await;
    client.send_tagged(Tagged { tag, value: Value::Null }).await;

    // Give the writer task a moment to flush and rename the file into place.
    for _ in 0..20 {
        if tokio::fs::metadata(dir.path().join("upload.bin")).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let data = tokio::fs::read(dir.path().join("upload.bin")).await.unwrap();
    assert_eq!(data, vec![1, 2, 3, 4]);

    let listing = client.command(vec![str_val("LIST"), str_val("/upload.bin")]).await;
    match listing {
        Value::Table { rows, .. } => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0][0], Value::Str("F".into()));
        }
        other => panic!("expected a table, got {other:?}"),
    }
}

#[tokio::test]
async fn stream_capacity_is_bounded() {
    let dir = TempDir::new().unwrap();
    let mut client = start_session(dir.path()).await;

    let mut ids = Vec::new();
    for i in 0..session::MAX_STREAMS {
        let reply = client
            .command(vec![str_val("STREAM"), str_val("W"), str_val(&format!("/f{i}.bin"))])
            .await;
        match reply {
            Value::Integer(id) => ids.push(id),
            other => panic!("expected stream {i} to open, got {other:?}"),
        }
    }

    let overflow = client.command(vec![str_val("STREAM"), str_val("W"), str_val("/overflow.bin")]).await;
    match overflow {
        Value::Error { code, .. } => assert_eq!(code, "TOOMANY"),
        other => panic!("expected TOOMANY, got {other:?}"),
    }

    for id in ids {
        let reply = client.command(vec![str_val("CLOSE"), Value::Integer(id)]).await;
        assert_eq!(reply, Value::ok());
    }
}
