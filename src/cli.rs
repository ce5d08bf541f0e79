use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};
use crate::{env_loader, logging};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "harvester", version, about = "Harvest social-media collections into archives")]
struct Cli {
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,
    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one harvest session for a collection.
    Harvest(HarvestCmd),
    /// Force-release a collection left locked by a crashed session.
    Unlock(UnlockCmd),
    /// Create, check and update collection configurations.
    #[command(subcommand)]
    Config(ConfigCmd),
    /// Show the last finished harvest of a collection.
    Last(LastCmd),
    /// Fetch live stats from a running harvester.
    Status(ControlCmd),
    /// Ask a running harvester to stop collecting.
    Stop(StopCmd),
    /// Ask a running harvester to stop and exit.
    Shutdown(ControlCmd),
}

#[derive(Debug, Args)]
struct HarvestCmd {
    collection_id: String,
    /// JSON-lines file of captured items to harvest from.
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    collections_path: Option<PathBuf>,
    /// Remote store: a directory, `dir:<path>`, or an http(s) base URL.
    #[arg(long)]
    remote: Option<String>,
    #[arg(long)]
    items_per_file: Option<u64>,
    #[arg(long)]
    secs_per_file: Option<u64>,
    /// Start the control server on this port.
    #[arg(long)]
    port: Option<u16>,
    /// Log load, memory and disk usage periodically.
    #[arg(long)]
    monitor: bool,
    /// Keep running after the harvest until a shutdown request arrives.
    #[arg(long)]
    wait: bool,
}

#[derive(Debug, Args)]
struct UnlockCmd {
    collection_id: String,
    #[arg(long)]
    collections_path: Option<PathBuf>,
    #[arg(long)]
    remote: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCmd {
    /// Print a starter configuration.
    Template {
        /// user_timeline, filter or search.
        collection_type: String,
        #[arg(long)]
        id: Option<String>,
    },
    /// Check a configuration file and list every problem.
    Validate { file: PathBuf },
    /// Publish a new or edited configuration together with its changeset.
    Update {
        file: PathBuf,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        collections_path: Option<PathBuf>,
        /// Apply even when the stored configuration changed since this copy was taken.
        #[arg(long)]
        force: bool,
    },
    /// Describe the recorded configuration history of a collection.
    Changes {
        collection_id: String,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        collections_path: Option<PathBuf>,
        #[arg(long)]
        deletes_only: bool,
    },
    /// Add user ids to a user_timeline configuration file.
    UserIds {
        file: PathBuf,
        #[arg(required = true)]
        user_ids: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct LastCmd {
    collection_id: String,
    #[arg(long)]
    remote: Option<String>,
}

#[derive(Debug, Args)]
struct ControlCmd {
    /// `host:port` or URL of the harvester's control server.
    #[arg(long, default_value = "localhost:80")]
    host: String,
    #[arg(long)]
    secret_key: Option<String>,
}

#[derive(Debug, Args)]
struct StopCmd {
    #[command(flatten)]
    target: ControlCmd,
    /// Seconds to wait for the harvester to report stopped; 0 returns at once.
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug);
    for key in env_loader::unknown_env_keys() {
        warn!("ignoring unknown environment variable {key}");
    }

    let report = match cli.command {
        Command::Harvest(cmd) => commands::harvest::run(&commands::harvest::HarvestArgs {
            collection_id: cmd.collection_id,
            source: cmd.source,
            collections_path: cmd.collections_path,
            remote: cmd.remote,
            items_per_file: cmd.items_per_file,
            secs_per_file: cmd.secs_per_file,
            port: cmd.port,
            monitor: cmd.monitor,
            wait: cmd.wait,
        })?,
        Command::Unlock(cmd) => {
            commands::unlock::run(&cmd.collection_id, cmd.collections_path, cmd.remote.as_deref())?
        }
        Command::Config(ConfigCmd::Template {
            collection_type,
            id,
        }) => commands::config::template(&collection_type, id.as_deref())?,
        Command::Config(ConfigCmd::Validate { file }) => commands::config::validate(&file)?,
        Command::Config(ConfigCmd::Update {
            file,
            remote,
            collections_path,
            force,
        }) => commands::config::update(&file, remote.as_deref(), collections_path, force)?,
        Command::Config(ConfigCmd::Changes {
            collection_id,
            remote,
            collections_path,
            deletes_only,
        }) => commands::config::changes(
            &collection_id,
            remote.as_deref(),
            collections_path,
            deletes_only,
        )?,
        Command::Config(ConfigCmd::UserIds { file, user_ids }) => {
            commands::config::user_ids(&file, &user_ids)?
        }
        Command::Last(cmd) => commands::last::run(&cmd.collection_id, cmd.remote.as_deref())?,
        Command::Status(cmd) => commands::control::status(&cmd.host, cmd.secret_key.as_deref())?,
        Command::Stop(cmd) => commands::control::stop(
            &cmd.target.host,
            cmd.target.secret_key.as_deref(),
            cmd.timeout_secs,
        )?,
        Command::Shutdown(cmd) => {
            commands::control::shutdown(&cmd.host, cmd.secret_key.as_deref())?
        }
    };

    render(&report, cli.json)?;
    if !report.ok {
        anyhow::bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}

fn render(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for detail in &report.details {
        println!("{detail}");
    }
    for issue in &report.issues {
        eprintln!("issue: {issue}");
    }
    Ok(())
}
