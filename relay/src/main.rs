use clap::Parser;
use log::{error, info};
use relay::config::MixerSettings;
use relay::network::{BoxError, Server, ServerMessage};

/// Main-method of the relay.
/// Parses command-line arguments, loads settings, then runs the mix loop until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Relay IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Relay port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// JSON settings file; defaults apply when omitted
        #[clap(short, long)]
        settings: Option<String>,
        /// Mixer threads, overriding the settings file
        #[clap(short, long)]
        threads: Option<usize>,
        /// Broadcast frames per second, overriding the settings file
        #[clap(short = 'r', long)]
        tick_rate: Option<u32>,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => MixerSettings::load(path)?,
        None => MixerSettings::default(),
    };
    if let Some(rate) = args.tick_rate {
        settings.broadcast_rate = rate;
        settings = settings.validated();
    }

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, settings, args.threads).await?;
    let control = server.control_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            if let Err(e) = control.send(ServerMessage::Shutdown) {
                error!("Failed to signal shutdown: {}", e);
            }
        }
    });

    server.run().await
}
