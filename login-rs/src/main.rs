use clap::Parser;
use login_rs::auth::AuthClient;
use login_rs::config::Config;
use login_rs::imap::LoginServer;
use login_rs::master::ChannelMaster;
use login_rs::security::TlsProvider;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Pre-authentication IMAP front-end")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config_found = args.config.exists();
    let config = if config_found {
        Config::from_file(&args.config)?
    } else {
        Config::default()
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if !config_found {
        info!("No config file found, using defaults");
    }
    info!("Starting IMAP login front-end");
    info!("  Listening on: {}", config.server.listen_addr);
    info!("  Auth service: {}", config.auth.service_addr);

    let config = Arc::new(config);
    let tls = TlsProvider::from_config(&config.tls)?;
    let auth = Arc::new(AuthClient::new(config.auth.service_addr.clone()));

    // Without an embedding post-login process, handed-off sessions are
    // told goodbye and closed here.
    let (master, mut handoffs) = ChannelMaster::new();
    tokio::spawn(async move {
        while let Some(mut handoff) = handoffs.recv().await {
            warn!(
                user = %handoff.user,
                peer = %handoff.peer,
                "No post-login process configured, closing session"
            );
            let _ = handoff
                .stream
                .write_all(b"* BYE No post-login service available.\r\n")
                .await;
            let _ = handoff.stream.shutdown().await;
        }
    });

    let server = LoginServer::new(config, auth, Arc::new(master), tls);
    let registry = server.registry().clone();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            registry.destroy_all();
        }
    }

    Ok(())
}
