use clap::Parser;
use icap_gateway::{Config, EchoFactory, IcapResult, Server};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "icap-gateway", version, about = "RFC 3507 ICAP adaptation gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address override (defaults to 0.0.0.0:<app.port>).
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> IcapResult<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    init_tracing(&config.app.log_level);
    info!(config = %cli.config.display(), services = config.app.services.len(), "configuration loaded");

    let mut builder = Server::builder()
        .config(config)
        .factory("echo", Box::new(EchoFactory));
    if let Some(bind) = &cli.bind {
        builder = builder.bind(bind);
    }

    let server = builder.build().await?;
    info!(addr = %server.local_addr()?, "listening");
    server.run().await
}
