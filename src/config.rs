//! Server/client configuration: CLI flags layered over an optional TOML
//! file, defaults filled in last.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "fly-server", version, about = "FlyByWire file-access server")]
pub struct ServerArgs {
    /// Root directory to serve.
    pub rootdir: Option<PathBuf>,

    /// TCP port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Disable TLS.
    #[arg(long)]
    pub notls: bool,

    /// Turn on debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Optional TOML config file overlaying these defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    rootdir: Option<PathBuf>,
    port: Option<u16>,
    notls: Option<bool>,
    debug: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub port: u16,
    pub tls: bool,
    pub debug: bool,
}

impl ServerConfig {
    /// Builds the effective configuration: file settings first, CLI flags
    /// overriding them, command-line presence always winning over the file.
    pub async fn load(args: ServerArgs) -> anyhow::Result<ServerConfig> {
        let file_config = match &args.config {
            Some(path) => {
                let text = tokio::fs::read_to_string(path).await?;
                toml::from_str(&text)?
            }
            None => FileConfig::default(),
        };

        let root = args
            .rootdir
            .or(file_config.rootdir)
            .ok_or_else(|| anyhow::anyhow!("usage: fly-server ROOTDIR"))?;

        Ok(ServerConfig {
            root,
            port: args.port.or(file_config.port).unwrap_or(6767),
            tls: !(args.notls || file_config.notls.unwrap_or(false)),
            debug: args.debug || file_config.debug.unwrap_or(false),
        })
    }
}

#[derive(Debug, Parser)]
#[command(name = "fly", version, about = "FlyByWire client")]
pub struct ClientArgs {
    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum ClientCommand {
    /// Copies a file to or from a FlyByWire server.
    Cp {
        source: String,
        dest: String,
        /// Skip TLS certificate fingerprint verification.
        #[arg(long)]
        notls: bool,
    },
}
