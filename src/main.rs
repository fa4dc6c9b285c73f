//! tarfs-monitor - Mount a tar archive read-only and record file accesses
//!
//! Usage:
//!   tarfs-monitor mount <TAR> <MOUNTPOINT>  - Mount until Ctrl-C, then print the access log
//!   tarfs-monitor ls <TAR>                  - List the tree the archive produces
//!   tarfs-monitor config-init <FILE>        - Write the default configuration

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tarfs_monitor::{
    config::Config,
    monitor::{Monitor, NullMonitor, OpenReadMonitor},
    mount::{build_tree, mount},
    tree::{Node, NodeKind},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tarfs-monitor")]
#[command(version)]
#[command(about = "Read-only FUSE view of a tar layer that records file access order")]
struct Cli {
    /// Configuration file path (defaults to the per-user config if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount an archive and record opens and reads until interrupted
    Mount {
        /// Tar archive to serve
        archive: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Write the access log here instead of stdout
        #[arg(long)]
        log: Option<PathBuf>,

        /// Do not record accesses
        #[arg(long, conflicts_with = "log")]
        no_log: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Print the tree an archive produces, without mounting
    Ls {
        /// Tar archive to read
        archive: PathBuf,
    },

    /// Write the default configuration to a file
    ConfigInit {
        /// Destination file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_command(cli.command, cli.config.as_deref()) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Mount {
            archive,
            mount_point,
            log,
            no_log,
            allow_other,
        } => {
            let mut config = load_config(config_path)?;
            if allow_other {
                config.mount.allow_other = true;
            }
            cmd_mount(&config, &archive, &mount_point, log.as_deref(), no_log)
        }
        Commands::Ls { archive } => cmd_ls(&load_config(config_path)?, &archive),
        Commands::ConfigInit { file } => cmd_config_init(&file),
    }
}

/// Explicit path, else the default path if it exists, else built-in defaults
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Config::load(path).with_context(|| format!("loading {:?}", path));
    }
    let default = Config::default_path();
    if default.exists() {
        return Config::load(&default).with_context(|| format!("loading {:?}", default));
    }
    let mut config = Config::default();
    config.apply_env_overrides();
    Ok(config)
}

fn cmd_mount(
    config: &Config,
    archive: &Path,
    mount_point: &Path,
    log: Option<&Path>,
    no_log: bool,
) -> anyhow::Result<()> {
    let file = File::open(archive).with_context(|| format!("opening {:?}", archive))?;
    let monitor: Arc<dyn Monitor> = if no_log {
        Arc::new(NullMonitor)
    } else {
        Arc::new(OpenReadMonitor::new())
    };

    info!("Mounting {:?} at {:?}", archive, mount_point);
    let handle = mount(mount_point, Arc::new(file), monitor.clone(), config)?;

    info!("Press Ctrl-C to unmount");
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(tokio::signal::ctrl_c())?;

    handle.cleanup()?;
    if no_log {
        return Ok(());
    }

    let events = monitor.dump_log();
    let json = serde_json::to_string_pretty(&events)?;
    match log {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {:?}", path))?;
            info!("Wrote {} events to {:?}", events.len(), path);
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn cmd_ls(config: &Config, archive: &Path) -> anyhow::Result<()> {
    let file = File::open(archive).with_context(|| format!("opening {:?}", archive))?;
    let tree = build_tree(Arc::new(file), config)?;

    for (path, node) in tree.walk() {
        println!("{} {:o} {}", describe(node), node.meta.mode & 0o7777, display_path(&path, node));
    }
    Ok(())
}

fn cmd_config_init(file: &Path) -> anyhow::Result<()> {
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Config::default().save(file)?;
    info!("Wrote default configuration to {:?}", file);
    Ok(())
}

/// Type letter, plus device numbers for device nodes
fn describe(node: &Node) -> String {
    match &node.kind {
        NodeKind::Directory { .. } => "d".to_string(),
        NodeKind::File { .. } => "-".to_string(),
        NodeKind::Symlink { .. } => "l".to_string(),
        NodeKind::Device { .. } | NodeKind::Whiteout => {
            let letter = match node.to_fuser_type() {
                fuser::FileType::BlockDevice => 'b',
                fuser::FileType::NamedPipe => 'p',
                _ => 'c',
            };
            let (major, minor) = node.device_numbers();
            format!("{} {},{}", letter, major, minor)
        }
    }
}

fn display_path(path: &str, node: &Node) -> String {
    match &node.kind {
        NodeKind::Symlink { target } => format!("/{} -> {}", path, target),
        _ => format!("/{}", path),
    }
}
