//! The `fly cp` client: connects to a remote server over TCP or TLS (with
//! trust-on-first-use fingerprint pinning) and speaks the wire protocol
//! directly to upload or download a single file.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::{ClientArgs, ClientCommand};
use crate::tls;
use crate::wire::{self, Value};

const CHUNK_SIZE: usize = 32 * 1024;

pub async fn run(args: ClientArgs) -> anyhow::Result<()> {
    let ClientCommand::Cp { source, dest, notls } = args.command;

    let source = parse_target(&source);
    let dest = parse_target(&dest);

    match (&source.host, &dest.host) {
        (Some(_), Some(_)) => anyhow::bail!("Transfers between servers are not currently supported"),
        (None, None) => anyhow::bail!("Local file transfers are not currently supported"),
        _ => {}
    }

    let host = source.host.clone().or_else(|| dest.host.clone()).unwrap();
    let conn = connect(&host, notls).await?;

    let (read_half, write_half) = tokio::io::split(conn);
    let mut reader = wire::Reader::new(BufReader::new(read_half));
    let mut writer = write_half;

    if source.host.is_none() {
        upload(&mut writer, &mut reader, &source.path, &dest.path).await
    } else {
        download(&mut writer, &mut reader, &source.path, &dest.path).await
    }
}

struct Target {
    path: String,
    host: Option<String>,
}

fn parse_target(s: &str) -> Target {
    let Some(rest) = s.strip_prefix("//") else {
        return Target { path: s.to_string(), host: None };
    };

    let (host, path) = match rest.find('/') {
        Some(i) => (rest[..i].to_string(), rest[i..].to_string()),
        None => (rest.to_string(), "/".to_string()),
    };

    let host = if host.contains(':') { host } else { format!("{host}:6767") };
    Target { path, host: Some(host) }
}

async fn send_command<W, R>(writer: &mut W, reader: &mut wire::Reader<R>, name: &str, args: Vec<Value>) -> wire::Result<Value>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    let mut values = vec![Value::Str(name.to_string())];
    values.extend(args);
    wire::write_value(writer, &Value::Array(values)).await?;
    reader.read_value().await
}

struct RemoteFileInfo {
    is_file: bool,
}

async fn stat_remote<W, R>(writer: &mut W, reader: &mut wire::Reader<R>, remote_path: &str) -> anyhow::Result<Option<RemoteFileInfo>>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    let reply = send_command(writer, reader, "LIST", vec![Value::Str(remote_path.to_string())]).await?;

    if let Value::Error { code, message } = &reply {
        if code == "NOTFOUND" {
            return Ok(None);
        }
        anyhow::bail!("Remote: {message}");
    }

    let Value::Table { rows, .. } = reply else {
        return Ok(Some(RemoteFileInfo { is_file: false }));
    };

    let file_name = Path::new(remote_path).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

    let is_file = rows.len() == 1
        && !file_name.is_empty()
        && matches!(&rows[0][0], Value::Str(t) if t == "F")
        && matches!(&rows[0][1], Value::Str(n) if n == &file_name);

    Ok(Some(RemoteFileInfo { is_file }))
}

async fn download<W, R>(writer: &mut W, reader: &mut wire::Reader<R>, source_path: &str, dest_path: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    let info = stat_remote(writer, reader, source_path).await?;
    let Some(info) = info else {
        anyhow::bail!("Remote: No such file or directory");
    };
    if !info.is_file {
        anyhow::bail!("Only regular file downloads are currently supported.");
    }

    let mut dest_path = PathBuf::from(dest_path);
    if let Ok(meta) = tokio::fs::metadata(&dest_path).await {
        if meta.is_dir() {
            let name = Path::new(source_path).file_name().unwrap_or_default();
            dest_path = dest_path.join(name);
        }
    }

    let tmp_path = {
        let mut p = dest_path.clone().into_os_string();
        p.push(".fly-download");
        PathBuf::from(p)
    };
    let mut file = tokio::fs::File::create(&tmp_path).await?;

    let reply = send_command(writer, reader, "STREAM", vec![Value::Str("R".into()), Value::Str(source_path.to_string())]).await?;
    if let Value::Error { message, .. } = &reply {
        anyhow::bail!("Remote: {message}");
    }
    let Some(stream_id) = reply.as_integer() else {
        anyhow::bail!("Unexpected reply to STREAM");
    };
    let stream_tag = stream_id.to_string();

    loop {
        let frame = reader.read_frame().await?;
        let wire::Frame::Tagged(tagged) = frame else {
            anyhow::bail!("Unexpected value, expected a tagged stream frame");
        };
        if tagged.tag != stream_tag {
            anyhow::bail!("Unexpected stream ID {}", tagged.tag);
        }
        match tagged.value {
            Value::Null => break,
            Value::Blob(data) => file.write_all(&data).await?,
            other => anyhow::bail!("Unexpected {}, expected a blob", other.name()),
        }
    }

    file.flush().await?;
    drop(file);
    tokio::fs::rename(&tmp_path, &dest_path).await?;
    Ok(())
}

async fn upload<W, R>(writer: &mut W, reader: &mut wire::Reader<R>, source_path: &str, dest_path: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    let mut file = tokio::fs::File::open(source_path).await?;
    let meta = file.metadata().await?;
    if !meta.is_file() {
        anyhow::bail!("Only regular file uploads are currently supported.");
    }

    let mut dest_path = dest_path.to_string();
    if let Some(info) = stat_remote(writer, reader, &dest_path).await? {
        if !info.is_file {
            let name = Path::new(source_path).file_name().unwrap_or_default().to_string_lossy().to_string();
            dest_path = format!("{}/{}", dest_path.trim_end_matches('/'), name);
        }
    }

    let reply = send_command(writer, reader, "STREAM", vec![Value::Str("W".into()), Value::Str(dest_path.clone())]).await?;
    if let Value::Error { message, .. } = &reply {
        anyhow::bail!("Remote: {message}");
    }
    let Some(stream_id) = reply.as_integer() else {
        anyhow::bail!("Unexpected reply to STREAM");
    };
    let stream_tag = stream_id.to_string();

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let tagged = wire::Tagged { tag: stream_tag.clone(), value: Value::Blob(buf[..n].to_vec()) };
        wire::write_tagged(writer, &tagged).await?;
    }
    wire::write_tagged(writer, &wire::Tagged { tag: stream_tag, value: Value::Null }).await?;

    for _ in 0..10 {
        let reply = send_command(writer, reader, "LIST", vec![Value::Str(dest_path.clone())]).await?;
        if !matches!(reply, Value::Error { .. }) {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    anyhow::bail!("Unknown error occurred")
}

enum Conn {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for Conn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

async fn connect(host: &str, disable_tls: bool) -> anyhow::Result<Conn> {
    let stream = TcpStream::connect(host).await?;

    if disable_tls {
        return Ok(Conn::Plain(stream));
    }

    loop {
        let verifier = Arc::new(FingerprintCapture::default());
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = host.split(':').next().unwrap_or(host).to_string();
        let name = rustls::pki_types::ServerName::try_from(server_name)?;

        let stream_for_attempt = TcpStream::connect(host).await?;
        let tls_stream = connector.connect(name, stream_for_attempt).await?;

        let fingerprint = verifier.fingerprint.lock().unwrap().clone().unwrap_or_default();

        match check_known_host(host, &fingerprint).await? {
            HostTrust::Known => {
                drop(stream);
                return Ok(Conn::Tls(tls_stream));
            }
            HostTrust::Changed => {
                println!("REMOTE HOST IDENTIFICATION HAS CHANGED!!!");
                println!("It is possible that someone is doing something nasty!");
                println!("The host fingerprint is {fingerprint}");
                println!("Add this fingerprint to ~/.fly/known_hosts to get rid of this message.");
                anyhow::bail!("refusing to connect to a host with a changed fingerprint");
            }
            HostTrust::Unknown => {
                if !trust_prompt(host, &fingerprint) {
                    anyhow::bail!("connection aborted by user");
                }
                allow_fingerprint(host, &fingerprint).await?;
                continue;
            }
        }
    }
}

enum HostTrust {
    Known,
    Changed,
    Unknown,
}

async fn check_known_host(host: &str, fingerprint: &str) -> anyhow::Result<HostTrust> {
    let known_hosts = read_known_hosts().await?;
    for (known_host, known_fingerprint) in known_hosts {
        if known_host == host {
            return Ok(if known_fingerprint == fingerprint { HostTrust::Known } else { HostTrust::Changed });
        }
    }
    Ok(HostTrust::Unknown)
}

fn known_hosts_path() -> anyhow::Result<PathBuf> {
    let home = dirs_home()?;
    Ok(home.join(".fly").join("known_hosts"))
}

fn dirs_home() -> anyhow::Result<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from).ok_or_else(|| anyhow::anyhow!("could not determine home directory"))
}

async fn read_known_hosts() -> anyhow::Result<Vec<(String, String)>> {
    let path = known_hosts_path()?;
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(t) => t,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_reader(text.as_bytes());
    let mut hosts = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() == 2 {
            hosts.push((record[0].to_string(), record[1].to_string()));
        }
    }
    Ok(hosts)
}

async fn allow_fingerprint(host: &str, fingerprint: &str) -> anyhow::Result<()> {
    let path = known_hosts_path()?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut existing = tokio::fs::read(&path).await.unwrap_or_default();
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(vec![]);
    writer.write_record([host, fingerprint])?;
    existing.extend_from_slice(&writer.into_inner()?);
    tokio::fs::write(&path, existing).await?;
    Ok(())
}

fn trust_prompt(host: &str, fingerprint: &str) -> bool {
    use std::io::Write;
    println!("The authenticity of host {host} cannot be established");
    println!("Host fingerprint is {fingerprint}");

    loop {
        print!("Are you sure you want to continue connecting (yes/no)? ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        match line.trim() {
            "yes" => return true,
            "no" => return false,
            _ => continue,
        }
    }
}

/// Skips normal chain validation (the server's certificate is
/// self-signed) and instead captures the leaf certificate so the caller
/// can pin it against `~/.fly/known_hosts` by fingerprint.
#[derive(Default)]
struct FingerprintCapture {
    fingerprint: std::sync::Mutex<Option<String>>,
}

impl std::fmt::Debug for FingerprintCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintCapture").finish()
    }
}

impl rustls::client::danger::ServerCertVerifier for FingerprintCapture {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        *self.fingerprint.lock().unwrap() = Some(tls::fingerprint(end_entity.as_ref()));
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}
