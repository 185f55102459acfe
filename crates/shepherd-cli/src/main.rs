mod cmd_doctor;
mod cmd_watch;

use clap::{Parser, Subcommand};
use shepherd_conductor::config::ShepherdConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "shepherd",
    version,
    about = "Watch pull requests and fix failing CI with a coding agent"
)]
struct Cli {
    /// Config file (default: <store>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch one or more pull requests until their CI passes
    Watch {
        /// `https://<host>/<owner>/<repo>/pull/<n>` or `<owner>/<repo>#<n>`
        #[arg(required = true)]
        prs: Vec<String>,
        /// Squash the session's commits with this message once CI passes
        #[arg(long)]
        squash_message: Option<String>,
        /// Do not write per-session events.jsonl
        #[arg(long)]
        no_journal: bool,
    },
    /// Check that git, gh and the coding agent are reachable
    Doctor,
    /// Print the effective configuration
    Config {
        /// Also save it to the config file
        #[arg(long)]
        write: bool,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = ShepherdConfig::load(cli.config.as_deref())?;

    match cli.cmd {
        Command::Watch {
            prs,
            squash_message,
            no_journal,
        } => cmd_watch::execute(config, &prs, squash_message.as_deref(), !no_journal),
        Command::Doctor => cmd_doctor::execute(&config),
        Command::Config { write } => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("# store: {}", shepherd_store::store_root().display());
            println!("# workspaces: {}", config.workspaces_root().display());
            println!("{json}");
            if write {
                let path = cli.config.unwrap_or_else(shepherd_store::config_path);
                shepherd_store::write_atomic(&path, json.as_bytes())?;
                println!("# written to {}", path.display());
            }
            Ok(())
        }
    }
}
