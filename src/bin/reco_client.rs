use std::time::Duration;

use clap::Parser;

use reco_stream::{client::render_frame, config::DEFAULT_PORT, DetectionClient};

/// Prints the detections streamed by a reco-server.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Server host.
    #[arg(env = "RECO_HOST")]
    host: String,

    #[arg(long, short, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connect timeout in seconds.
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let timeout = Duration::from_secs(args.timeout);
    let client = DetectionClient::connect(&args.host, args.port, timeout)?;
    client.run(|frame| println!("{}", render_frame(frame)))?;
    Ok(())
}
