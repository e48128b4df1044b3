use clap::Parser;
use flybywire::client;
use flybywire::config::ClientArgs;

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();

    if let Err(err) = client::run(args).await {
        eprintln!("fly: {err}");
        std::process::exit(1);
    }
}
