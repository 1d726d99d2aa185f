use clap::Parser;
use leader::network::Coordinator;
use log::{error, info};
use shared::{SessionError, TuningArgs};

/// Standalone round coordinator for a lock-step session
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:4000
    bind_addr: String,

    /// Grid width in cells
    width: i32,

    /// Grid height in cells
    height: i32,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[tokio::main]
async fn main() -> Result<(), SessionError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.tuning.into_config()?;

    let coordinator = Coordinator::bind(&args.bind_addr, args.width, args.height, config).await?;

    tokio::select! {
        result = coordinator.run() => {
            match result {
                Ok(finish) => info!(target: "leader", "Final standings (first out first): {:?}", finish),
                Err(e) => {
                    error!(target: "leader", "Coordinator failed: {}", e);
                    return Err(e);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(target: "leader", "Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
