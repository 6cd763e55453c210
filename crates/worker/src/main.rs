use anyhow::Result;
use clap::Parser;
use dispatch_core::{Config, LogNotifier, Messenger};
use dispatch_worker::fixture::{Fixture, LogMessenger};
use dispatch_worker::Manager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dispatch-worker")]
#[command(about = "Campaign dispatch worker", version)]
struct Args {
    /// JSON file with campaigns, audiences and attachments.
    #[arg(long)]
    fixture: Option<PathBuf>,
    /// Name the logging messenger registers under.
    #[arg(long, default_value = "email")]
    messenger: String,
    /// Exit once no campaign is left running.
    #[arg(long)]
    exit_when_idle: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let fixture = match &args.fixture {
        Some(path) => Fixture::load(path)?,
        None => Fixture::default(),
    };
    info!(campaigns = fixture.campaigns.len(), "fixture loaded");

    let store = Arc::new(fixture.into_store());
    let messenger = Arc::new(LogMessenger::new(&args.messenger));
    let manager = Manager::new(config, store, Arc::new(LogNotifier));
    manager.add_messenger(messenger.clone())?;

    let run = tokio::spawn(manager.clone().run());
    info!("worker starting");

    if args.exit_when_idle {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            _ = wait_until_idle(&manager) => info!("no campaigns left running"),
        }
    } else {
        tokio::signal::ctrl_c().await?;
        info!("interrupted");
    }

    manager.close();
    if let Err(err) = run.await {
        warn!(error = %err, "manager task failed");
    }
    messenger.flush().await?;
    messenger.close().await?;
    info!(pushed = messenger.pushed(), "worker stopped");

    Ok(())
}

async fn wait_until_idle(manager: &Manager) {
    // Give the first campaign scan a chance to start pipes.
    tokio::time::sleep(manager.config().scan_interval + Duration::from_millis(500)).await;
    while manager.has_running_campaigns() {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_args_with_all_options() {
        let args = Args::try_parse_from([
            "dispatch-worker",
            "--fixture",
            "fixtures/demo.json",
            "--messenger",
            "postback",
            "--exit-when-idle",
        ])
        .unwrap();

        assert_eq!(args.fixture, Some(PathBuf::from("fixtures/demo.json")));
        assert_eq!(args.messenger, "postback");
        assert!(args.exit_when_idle);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["dispatch-worker"]).unwrap();

        assert!(args.fixture.is_none());
        assert_eq!(args.messenger, "email");
        assert!(!args.exit_when_idle);
    }

    #[test]
    fn test_args_unknown_flag_fails() {
        let result = Args::try_parse_from(["dispatch-worker", "--token", "abc"]);
        assert!(result.is_err());
    }
}
