use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use install_sessiond::config::DaemonConfig;
use install_sessiond::rpc::client::{read_port_file, InstallerClient};
use install_sessiond::rpc::subscription::{ObserverSubscription, SubscriptionEvent};
use install_sessiond::session::{SessionId, SessionInfo};
use install_sessiond::{build_info, daemon, paths};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "install-sessiond")]
#[command(about = "Install session coordination daemon")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Config file (defaults to ~/.install-sessiond/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Uid to authenticate as when talking to the daemon
    #[arg(long, global = true, default_value = "0")]
    uid: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground
    Serve,
    /// List live sessions for a user
    List {
        #[arg(long, default_value = "0")]
        user: u32,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one session
    Info { session_id: i32 },
    /// Abandon a session
    Abandon { session_id: i32 },
    /// Stream session events for a user until interrupted
    Watch {
        #[arg(long, default_value = "0")]
        user: u32,
    },
    /// Reconcile staging after a volume becomes available
    VolumeMounted {
        /// Adopted volume uuid; omit for internal storage
        volume: Option<String>,
    },
    /// Print the persisted session document without contacting the daemon
    Dump,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig> {
    let path = match path {
        Some(path) => return DaemonConfig::load(&path),
        None => paths::default_config_path()?,
    };
    DaemonConfig::load_or_default(&path)
}

fn print_session_row(info: &SessionInfo) {
    println!(
        "{:>10}  {:<18} {:<24} uid={:<6} user={:<3} progress={:.2}{}",
        info.session_id,
        info.state.to_string(),
        info.installer_package,
        info.installer_uid,
        info.user_id,
        info.progress,
        if info.active { "  (open)" } else { "" }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => {
            let config = load_config(cli.config)?;
            tracing::info!(sha = build_info::short_sha(), "install-sessiond starting");
            daemon::run_daemon(config).await
        }
        Command::List { user, json } => {
            let client = InstallerClient::connect_default(cli.uid).await?;
            let sessions = client.list_sessions(user).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No sessions for user {}", user);
            } else {
                for info in &sessions {
                    print_session_row(info);
                }
            }
            Ok(())
        }
        Command::Info { session_id } => {
            let client = InstallerClient::connect_default(cli.uid).await?;
            let info = client
                .session_info(SessionId(session_id))
                .await?
                .with_context(|| format!("Session {} not found", session_id))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Command::Abandon { session_id } => {
            let client = InstallerClient::connect_default(cli.uid).await?;
            client.abandon(SessionId(session_id)).await?;
            println!("Abandoned session {}", session_id);
            Ok(())
        }
        Command::Watch { user } => {
            let port_info = read_port_file(&paths::sessiond_port_path()?)?;
            let mut subscription = ObserverSubscription::connect(&port_info, cli.uid, user).await?;
            while let Some(event) = subscription.recv().await {
                match event {
                    SubscriptionEvent::Registered(id) => {
                        eprintln!("Watching user {} as observer {}", user, id)
                    }
                    SubscriptionEvent::Session(event) => {
                        println!("{}", serde_json::to_string(&event)?)
                    }
                }
            }
            eprintln!("Daemon closed the subscription");
            Ok(())
        }
        Command::VolumeMounted { volume } => {
            let client = InstallerClient::connect_default(cli.uid).await?;
            let report = client.volume_mounted(volume).await?;
            println!(
                "Volume {}: deleted {}, failed {}",
                report.volume,
                report.deleted.len(),
                report.failed.len()
            );
            for path in &report.failed {
                println!("  failed: {}", path.display());
            }
            Ok(())
        }
        Command::Dump => {
            let config = load_config(cli.config)?;
            print!("{}", daemon::offline_dump(&config)?);
            Ok(())
        }
    }
}
