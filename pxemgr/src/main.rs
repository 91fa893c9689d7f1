#![allow(clippy::multiple_crate_versions)]
#![doc = include_str!("../../README.md")]

extern crate alloc;

use std::{
    io::{self, Write as _},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::{debug, info};
use nix::unistd::Uid;
use types::{ImageKind, PxeError};

mod audit;
mod bootfiles;
mod command;
mod config;
mod detect;
mod export;
mod host;
mod journal;
mod manager;
mod menu;
mod mount;
mod registry;
mod report;
mod textfile;

#[cfg(test)]
mod test_host;

use crate::{
    audit::Auditor,
    config::Settings,
    host::SystemHost,
    manager::{AddOptions, AddOutcome, Manager},
    report::Reporter,
    textfile::FileLock,
};

const LOCK_NAME: &str = "pxemgr.lock";

#[derive(Debug, Subcommand)]
enum CliSubcommand {
    /// Register an ISO or IMG file
    Add {
        #[arg(help = "Image file (.iso or .img)")]
        file: PathBuf,

        #[arg(short = 'y', long, help = "Overwrite an existing image without asking")]
        force: bool,

        #[arg(long, help = "Register under this name instead of the file name")]
        name: Option<String>,
    },

    /// Unregister an image and everything derived from it
    Remove {
        #[arg(help = "Image Name")]
        name: String,

        #[arg(long, value_enum, help = "Image kind, when an ISO and an IMG share the name")]
        kind: Option<ImageKind>,
    },

    /// List the registered images
    List,

    /// Report the state of services, mounts, exports and disks
    Status,

    /// Check that the registry and the system agree
    Validate,

    /// Remove mounts, exports, links and menu entries no image owns
    Cleanup,

    /// Regenerate the ISO boot menu entries
    Refresh {
        #[arg(long, help = "Detect the content of every ISO again")]
        redetect: bool,
    },
}

impl CliSubcommand {
    fn is_mutating(&self) -> bool {
        match self {
            Self::Add { .. } | Self::Remove { .. } | Self::Cleanup | Self::Refresh { .. } => true,
            Self::List | Self::Status | Self::Validate => false,
        }
    }
}

#[derive(Parser)]
#[command(version, about = "PXE Boot Image Manager")]
struct Cli {
    #[arg(short, long, global = true, help = "Configuration File")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, conflicts_with = "quiet", help = "Show debug output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Only show warnings and errors")]
    quiet: bool,

    #[clap(subcommand)]
    command: CliSubcommand,
}

fn confirm(question: &str) -> bool {
    let mut stderr = io::stderr();
    if write!(stderr, "{question} [y/N] ")
        .and_then(|()| stderr.flush())
        .is_err()
    {
        return false;
    }

    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }

    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    debug!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let settings = Settings::load(cli.config.as_deref()).context("Invalid configuration")?;
    let host = SystemHost::new(&settings);

    let _lock = if cli.command.is_mutating() {
        if !Uid::effective().is_root() {
            return Err(PxeError::NotRoot.into());
        }

        Some(FileLock::try_acquire(&settings.lock_dir, LOCK_NAME)?)
    } else {
        None
    };

    let mut stdout = io::stdout().lock();

    match cli.command {
        CliSubcommand::Add { file, force, name } => {
            let options = AddOptions {
                force,
                name,
                confirm: &confirm,
            };

            match Manager::new(&settings, &host).add(&file, &options)? {
                AddOutcome::Added(image) => info!("{} is ready to boot", image.name),
                AddOutcome::Skipped => info!("Nothing was changed"),
            }
        }
        CliSubcommand::Remove { name, kind } => {
            Manager::new(&settings, &host).remove(&name, kind)?;
        }
        CliSubcommand::List => {
            Reporter::new(&settings, &host).list(&mut stdout)?;
        }
        CliSubcommand::Status => {
            Reporter::new(&settings, &host).status(&mut stdout)?;
        }
        CliSubcommand::Validate => {
            let findings = Auditor::new(&settings, &host).validate(&mut stdout)?;

            if !findings.is_ok() {
                return Ok(ExitCode::FAILURE);
            }
        }
        CliSubcommand::Cleanup => {
            Auditor::new(&settings, &host).cleanup()?;
        }
        CliSubcommand::Refresh { redetect } => {
            Manager::new(&settings, &host).refresh(redetect)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
