use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use coinpbx::config::Config;
use coinpbx::simulate::run_simulation;
use dotenv::dotenv;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Coin telephone call control",
    long_about = None
)]
struct Cli {
    /// Path to the configuration file
    #[clap(
        long,
        global = true,
        help = "Path to the configuration file (TOML format)"
    )]
    conf: Option<String>,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit
    CheckConfig,
    /// Run the configured coin call scenario against the in-memory host
    Simulate {
        /// Application arguments, overriding `[simulate].args`
        #[clap(long)]
        args: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let mut config = if let Some(ref path) = cli.conf {
        println!("Loading config from: {}", path);
        Config::load(path)?
    } else {
        println!("Loading default config");
        Config::default()
    };
    println!("Start at {}", Utc::now());

    let command = cli.command.unwrap_or(Commands::Simulate { args: None });
    if matches!(command, Commands::CheckConfig) {
        match config.coin.validate() {
            Ok(()) => {
                println!("Configuration is valid.");
                return Ok(());
            }
            Err(err) => {
                eprintln!("Configuration validation failed: {}", err);
                std::process::exit(1);
            }
        }
    }

    let mut env_filter = EnvFilter::from_default_env();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        env_filter = env_filter.add_directive(level.into());
    }

    let mut guard_holder = None;
    if let Some(ref log_file) = config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| anyhow::anyhow!("{}: {}", e, log_file))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        guard_holder = Some(guard);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }

    if let Commands::Simulate { args: Some(args) } = command {
        config.simulate.get_or_insert_with(Default::default).args = args;
    }
    let summary = run_simulation(&config).await;

    match summary {
        Ok(summary) => {
            info!(call_id = %summary.call_id, "simulation finished");
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Coin call failed: {}", e);
            // flush buffered file logs before exiting
            drop(guard_holder);
            std::process::exit(1);
        }
    }
}
