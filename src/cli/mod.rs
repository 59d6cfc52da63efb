//! Command line interface
//!
//! Inspects and drives the local side of a Syncpoint client. Requests such
//! as pairing or new channels are written to the local store and replicate
//! the next time a client with a reachable remote runs.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::client::Client;
use crate::config::{ClientConfig, CONFIG_FILE_NAME};
use crate::models::{Channel, Installation, Model};
use crate::replication::LoopbackReplicator;

#[derive(Parser, Debug)]
#[command(name = "syncpoint")]
#[command(about = "Syncpoint client - pairing, channels and installations", long_about = None)]
pub struct Args {
    /// Directory containing syncpoint.toml
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a configuration file
    Init {
        /// URL of the remote Syncpoint service
        #[arg(long)]
        remote_url: String,

        /// Application id
        #[arg(long)]
        app_id: String,

        /// Directory of the local store
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Show the session and replication state
    Status,

    /// List known channels
    Channels,

    /// List installations of every device
    Installations,

    /// Request pairing with the service
    Pair {
        /// Pairing scheme, e.g. "console"
        #[arg(long = "type")]
        pairing_type: String,

        /// Scheme-specific token
        #[arg(long)]
        token: String,
    },

    /// Create a channel owned by this identity
    MakeChannel {
        /// Channel name
        name: String,
    },
}

/// Execute a command. Must run within a Tokio runtime.
pub fn execute(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Init {
            remote_url,
            app_id,
            data_dir,
        } => cmd_init(&args.dir, remote_url, app_id, data_dir),
        Command::Status => with_client(&args.dir, cmd_status),
        Command::Channels => with_client(&args.dir, cmd_channels),
        Command::Installations => with_client(&args.dir, cmd_installations),
        Command::Pair {
            pairing_type,
            token,
        } => with_client(&args.dir, |client| {
            client.pair(&pairing_type, &token)?;
            cmd_status(client)
        }),
        Command::MakeChannel { name } => with_client(&args.dir, |client| {
            let channel = client.channel_named(&name)?;
            print_json(&channel_view(&channel))
        }),
    }
}

fn cmd_init(
    dir: &Path,
    remote_url: String,
    app_id: String,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = ClientConfig::new(remote_url, app_id);
    config.data_dir = data_dir;
    config.validate()?;
    std::fs::create_dir_all(dir)?;
    config.save(dir)?;
    println!("Wrote {}", dir.join(CONFIG_FILE_NAME).display());
    Ok(())
}

fn with_client(dir: &Path, run: impl FnOnce(&Client) -> anyhow::Result<()>) -> anyhow::Result<()> {
    let config = ClientConfig::load(dir)?;
    let client = Client::initialize_with_config(config, Arc::new(LoopbackReplicator::new()))?;
    let result = run(&client);
    client.shutdown();
    result
}

fn cmd_status(client: &Client) -> anyhow::Result<()> {
    let session = client.session();
    print_json(&json!({
        "app_id": client.app_id(),
        "remote_url": client.config().remote_url,
        "session": {
            "id": session.id(),
            "state": session.state(),
            "owner_id": session.owner_id(),
            "error": session.error(),
            "control_database": session.control_database(),
            "pairing": session.pairing_user_properties(),
        },
        "replication": {
            "handshake": session.handshake_status(),
            "control": session.control_status(),
        },
        "local_databases": client.local_server().list_databases()?,
    }))
}

fn cmd_channels(client: &Client) -> anyhow::Result<()> {
    let channels: Vec<Value> = client
        .session()
        .my_channels()
        .iter()
        .chain(client.session().unpaired_channels().iter())
        .map(|channel| channel_view(&channel))
        .collect();
    print_json(&Value::Array(dedup_by_id(channels)))
}

fn cmd_installations(client: &Client) -> anyhow::Result<()> {
    let installations: Vec<Value> = client
        .session()
        .all_installations()
        .iter()
        .map(|installation| installation_view(&installation))
        .collect();
    print_json(&Value::Array(installations))
}

fn channel_view(channel: &Channel) -> Value {
    json!({
        "id": channel.id(),
        "name": channel.name(),
        "state": channel.state(),
        "owner_id": channel.owner_id(),
        "cloud_database": channel.cloud_database(),
        "subscription": channel.subscription().map(|s| s.id().to_string()),
        "install_pending": channel.is_install_pending(),
    })
}

fn installation_view(installation: &Installation) -> Value {
    json!({
        "id": installation.id(),
        "channel_id": installation.channel_id(),
        "subscription_id": installation.subscription_id(),
        "local": installation.is_local(),
        "local_db_name": installation.local_db_name(),
        "state": installation.state(),
        "status": installation.status(),
    })
}

fn dedup_by_id(mut views: Vec<Value>) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    views.retain(|view| seen.insert(view["id"].to_string()));
    views
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
