// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use storage_layout::{Host, LayoutConfig, LayoutKind, StorageLayout, System, parse_any};
use storage_sys::mount::find_mount;
use storage_types::LayoutSummary;
use tracing_subscriber::{EnvFilter, fmt};

/// Create, inspect and edit strict EFI disk layouts
#[derive(Parser)]
#[command(name = "strict-storage", version)]
struct Cli {
    /// Configuration file (defaults to $STRICT_STORAGE_CONFIG, then /etc/strict-storage.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Boot and root devices of an existing layout
#[derive(Args)]
struct Devices {
    /// Boot ESP; the device mounted on /boot when omitted
    #[arg(long)]
    boot_dev: Option<String>,

    /// Root device; the device mounted on / when omitted
    #[arg(long)]
    root_dev: Option<String>,

    /// Layout to expect; every known layout is tried when omitted
    #[arg(long)]
    layout: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the layout of existing devices as JSON
    Show {
        #[command(flatten)]
        devices: Devices,
    },
    /// Partition raw disks, build a layout and mount it
    Create {
        #[arg(long)]
        layout: String,
        #[arg(long)]
        mount: PathBuf,
        #[arg(required = true)]
        disks: Vec<String>,
    },
    /// Bring an existing layout online and mount it
    Detect {
        #[arg(long)]
        layout: String,
        #[arg(long)]
        mount: PathBuf,
        #[arg(required = true)]
        disks: Vec<String>,
    },
    /// Add a disk to the running layout
    AddDisk {
        #[command(flatten)]
        devices: Devices,
        disk: String,
    },
    /// Remove a disk from the running layout
    RemoveDisk {
        #[command(flatten)]
        devices: Devices,
        disk: String,
    },
    /// Copy the boot ESP onto a pending ESP
    SyncEsp {
        #[command(flatten)]
        devices: Devices,
        dest: String,
    },
}

#[derive(Serialize)]
struct ShowOutput {
    #[serde(flatten)]
    summary: LayoutSummary,
    issues: Vec<String>,
}

#[derive(Serialize)]
struct EditOutput {
    boot_disk_changed: bool,
    #[serde(flatten)]
    summary: LayoutSummary,
}

fn mounted_source(dir: &str) -> Result<String> {
    let entry = find_mount(Path::new(dir))?
        .with_context(|| format!("nothing is mounted on {dir}"))?;
    Ok(entry.source)
}

fn open_running(
    host: Arc<dyn Host>,
    config: &LayoutConfig,
    devices: &Devices,
) -> Result<Box<dyn StorageLayout>> {
    let boot_dev = match &devices.boot_dev {
        Some(dev) => dev.clone(),
        None => mounted_source("/boot")?,
    };
    let root_dev = match &devices.root_dev {
        Some(dev) => dev.clone(),
        None => mounted_source("/")?,
    };
    let layout = match &devices.layout {
        Some(name) => name.parse::<LayoutKind>()?.parse(host, config, &boot_dev, &root_dev)?,
        None => parse_any(host, config, &boot_dev, &root_dev)?,
    };
    tracing::info!("found {} layout", layout.name());
    Ok(layout)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_edit(layout: &dyn StorageLayout, boot_disk_changed: bool) -> Result<()> {
    if boot_disk_changed {
        tracing::warn!("boot disk changed, the boot loader must be reinstalled");
    }
    print_json(&EditOutput {
        boot_disk_changed,
        summary: layout.summary(),
    })
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storage_layout=info,storage_sys=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("strict-storage must run as root");
    }

    let config = LayoutConfig::load(cli.config.as_deref())?;
    config.validate()?;
    let host: Arc<dyn Host> = Arc::new(System::new(&config));

    match cli.command {
        Commands::Show { devices } => {
            let layout = open_running(host, &config, &devices)?;
            print_json(&ShowOutput {
                summary: layout.summary(),
                issues: layout.check()?,
            })?;
        }
        Commands::Create {
            layout,
            mount,
            disks,
        } => {
            let kind: LayoutKind = layout.parse()?;
            let layout = kind.create_and_mount(host, &config, &disks, &mount)?;
            print_json(&layout.summary())?;
        }
        Commands::Detect {
            layout,
            mount,
            disks,
        } => {
            let kind: LayoutKind = layout.parse()?;
            let layout = kind.detect_and_mount(host, &config, &disks, &mount)?;
            print_json(&layout.summary())?;
        }
        Commands::AddDisk { devices, disk } => {
            let mut layout = open_running(host, &config, &devices)?;
            let changed = layout.add_disk(&disk)?;
            layout.optimize_rootdev()?;
            print_edit(layout.as_ref(), changed)?;
        }
        Commands::RemoveDisk { devices, disk } => {
            let mut layout = open_running(host, &config, &devices)?;
            let changed = layout.remove_disk(&disk)?;
            print_edit(layout.as_ref(), changed)?;
        }
        Commands::SyncEsp { devices, dest } => {
            let layout = open_running(host, &config, &devices)?;
            layout.sync_esp(&dest)?;
            tracing::info!("copied {} onto {dest}", layout.dev_boot().unwrap_or_default());
        }
    }

    Ok(())
}
