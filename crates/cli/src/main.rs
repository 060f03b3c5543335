mod accounts_commands;
mod queue_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
    wagate_config::{ConfigLocator, Layout},
};

#[derive(Parser)]
#[command(name = "wagate", about = "wagate: multi-tenant WhatsApp gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory holding wagate.{toml,yaml,yml,json}.
    #[arg(long, global = true, env = "WAGATE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Overrides `data_dir`: database, queue, media and device state.
    #[arg(long, global = true, env = "WAGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stored instance management.
    Accounts {
        #[command(subcommand)]
        action: accounts_commands::AccountsAction,
    },
    /// History sync queue inspection.
    Queue {
        #[command(subcommand)]
        action: queue_commands::QueueAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the config file path in use.
    Path,
    /// Print the effective configuration.
    Show,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let locator = ConfigLocator::new(cli.config_dir.clone());
    let mut config = locator.load()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }
    let layout = Layout::resolve(&config);

    match cli.command {
        Commands::Gateway { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            info!(version = env!("CARGO_PKG_VERSION"), "wagate starting");
            layout.prepare()?;
            wagate_gateway::start_gateway(config, layout).await
        },
        Commands::Accounts { action } => {
            layout.prepare()?;
            accounts_commands::handle_accounts(action, &layout).await
        },
        Commands::Queue { action } => {
            layout.prepare()?;
            queue_commands::handle_queue(action, &layout, &config.queue.name).await
        },
        Commands::Config { action } => match action {
            ConfigAction::Path => {
                println!("{}", locator.path().display());
                Ok(())
            },
            ConfigAction::Show => {
                let effective = serde_json::json!({ "config": config, "layout": layout });
                println!("{}", serde_json::to_string_pretty(&effective)?);
                Ok(())
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_overrides_are_optional() {
        let cli = Cli::try_parse_from(["wagate", "gateway"]).unwrap();
        assert!(matches!(cli.command, Commands::Gateway {
            bind: None,
            port: None
        }));

        let cli = Cli::try_parse_from(["wagate", "--json-logs", "gateway", "--port", "9000"])
            .unwrap();
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Commands::Gateway {
            port: Some(9000),
            ..
        }));
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "wagate",
            "queue",
            "len",
            "--config-dir",
            "/tmp/wagate",
            "--log-level",
            "debug",
            "--data-dir",
            "/srv/wagate",
        ])
        .unwrap();
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/wagate")));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/srv/wagate")));
        assert_eq!(cli.log_level, "debug");
    }
}
