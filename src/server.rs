//! Accepts connections, optionally behind TLS, and spawns a session for
//! each one sharing the same user database and VFS root.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::commands;
use crate::config::ServerConfig;
use crate::crypto;
use crate::db;
use crate::session;
use crate::tls;

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let root: PathBuf = config.root.clone();
    let flydb = Arc::new(db::Handle::open(root.clone()).await?);

    let token_key = crypto::random_key();

    let acceptor = if config.tls {
        let store = tls::CertStore::load_or_generate(&root).await?;
        Some(store)
    } else {
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, tls = config.tls, "server started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let flydb = flydb.clone();
        let root = root.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, acceptor, flydb, root, token_key).await {
                warn!(%peer, %err, "connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    cert_store: Option<Arc<tls::CertStore>>,
    flydb: Arc<db::Handle>,
    root: PathBuf,
    token_key: [u8; crypto::KEY_LEN],
) -> anyhow::Result<()> {
    let handler = commands::Handler::new(flydb, root, Some(token_key));

    match cert_store {
        Some(store) => {
            let acceptor = TlsAcceptor::from(store.current().await);
            let tls_stream = acceptor.accept(stream).await?;
            let (reader, writer) = split(tls_stream);
            run_session(reader, writer, handler).await;
        }
        None => {
            let (reader, writer) = split(stream);
            run_session(reader, writer, handler).await;
        }
    }

    Ok(())
}

async fn run_session<R, W>(reader: R, writer: W, handler: commands::Handler)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    session::handle(reader, writer, handler).await;
}
