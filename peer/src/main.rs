use clap::{ArgAction, Parser};
use leader::network::Coordinator;
use log::{error, info};
use peer::ai::ScriptedAi;
use peer::network::{spawn_coordinator, Follower, PeerOptions};
use peer::relay::{decision_channels, EngineRelay};
use shared::config::validate_grid;
use shared::net::resolve;
use shared::{SessionError, TuningArgs};
use std::net::IpAddr;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port of the local decision process
    decision_port: u16,

    /// Address of the session leader, e.g. 127.0.0.1:4000
    leader_addr: String,

    /// Whether this peer starts the session and leads it first
    #[arg(action = ArgAction::Set)]
    is_leader: bool,

    /// Grid width in cells
    width: i32,

    /// Grid height in cells
    height: i32,

    /// Name shown to the other players
    nickname: String,

    /// Play with the built-in AI instead of connecting to a decision process
    #[arg(long)]
    ai: bool,

    /// Local IP to bind the follower and any later coordinator socket on
    #[arg(long, default_value = "127.0.0.1")]
    bind_ip: IpAddr,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[tokio::main]
async fn main() -> Result<(), SessionError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.tuning.into_config()?;
    validate_grid(args.width, args.height)?;

    let coordinator = if args.is_leader {
        let coordinator =
            Coordinator::bind(&args.leader_addr, args.width, args.height, config.clone()).await?;
        Some(spawn_coordinator(coordinator, true))
    } else {
        None
    };
    let leader_addr = resolve(&args.leader_addr).await?;

    let (decider, port) = decision_channels();
    let decision_task = if args.ai {
        info!(target: "client", "Playing with the built-in AI");
        let start_delay = args.is_leader.then_some(config.lobby_timeout / 3);
        let ai = ScriptedAi::new(
            args.width,
            args.height,
            config.min_game_speed,
            start_delay,
            config.seed,
        );
        tokio::spawn(ai.run(port))
    } else {
        let relay =
            EngineRelay::connect(args.decision_port, config.min_game_speed, args.is_leader).await?;
        tokio::spawn(relay.run(port))
    };

    let options = PeerOptions {
        bind_ip: args.bind_ip,
        leader_addr,
        is_leader: args.is_leader,
        nickname: args.nickname,
        width: args.width,
        height: args.height,
    };
    let mut follower = Follower::join(options, config, decider).await?;
    if let Some(handle) = coordinator {
        follower.attach_coordinator(handle);
    }

    let finish = follower.run().await?;
    info!(target: "client", "Final order of death: {:?}", finish);

    match decision_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(target: "client", "Decision process failed: {}", e),
        Err(e) => error!(target: "client", "Decision task panicked: {}", e),
    }

    Ok(())
}
