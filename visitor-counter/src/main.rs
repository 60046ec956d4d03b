#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use {
    std::{path::PathBuf, sync::Arc, process::exit},
    tracing::{Level, info, error},
    tracing_subscriber::FmtSubscriber,
    clap::{Parser, Subcommand},
    anyhow::Context,
    visitor_counter::{
        handler::VisitorHandler,
        metrics::Metrics,
        server::{config::ServerConfig, server::VisitorServer},
    },
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the visitor function over http.
    Serve {
        config_file: PathBuf,
    },
    /// Invoke the function once and print the response envelope.
    Incr {
        config_file: PathBuf,
    },
    /// Print the current count without changing it.
    Get {
        config_file: PathBuf,
    },
    /// Create the counter record. Fails if it already exists.
    Provision {
        config_file: PathBuf,

        #[arg(long, default_value_t = 0)]
        count: u64,
    },
}

impl Command {
    fn config_file(&self) -> &PathBuf {
        match self {
            Self::Serve { config_file }
            | Self::Incr { config_file }
            | Self::Get { config_file }
            | Self::Provision { config_file, .. } => config_file,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config_path = args.command.config_file().clone();
    let config = match ServerConfig::load(config_path.clone()).await {
        Ok(v) => v,
        Err(err) => {
            FmtSubscriber::builder().with_max_level(Level::INFO).init();
            error!("failed to load config from {config_path:?}: {err}");
            exit(-1);
        }
    };

    FmtSubscriber::builder().with_max_level(Level::from(config.log_level)).init();
    info!("loaded config from {config_path:?}");

    if let Err(err) = run_command(config, args.command).await {
        error!("{err:?}");
        exit(-1);
    }
}

async fn run_command(config: ServerConfig, command: Command) -> anyhow::Result<()> {
    let metrics = Metrics::new().context("failed to init metrics")?;

    match command {
        Command::Serve { .. } => {
            VisitorServer::new(config, metrics).serve().await?;
        },
        Command::Incr { .. } => {
            let handler = Arc::new(VisitorHandler::new(config.storage, config.counter, metrics));
            let response = tokio::task::spawn_blocking(move || handler.invoke()).await?;
            let success = response.status.is_success();
            let envelope = response.into_envelope()?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            if !success {
                anyhow::bail!("invocation failed with status {}", envelope.status_code);
            }
        },
        Command::Get { .. } => {
            let handler = VisitorHandler::new(config.storage, config.counter, metrics);
            let count = tokio::task::spawn_blocking(move || handler.service()?.current()).await??;
            println!("{count}");
        },
        Command::Provision { count, .. } => {
            let handler = VisitorHandler::new(config.storage, config.counter, metrics);
            tokio::task::spawn_blocking(move || handler.service()?.provision(count)).await??;
            println!("counter record created with count {count}");
        },
    }

    Ok(())
}
