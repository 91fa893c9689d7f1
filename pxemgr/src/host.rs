use core::{fmt::Debug, time::Duration};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, warn};
use serde::Deserialize;
use types::PxeError;

use crate::{
    command,
    config::Settings,
    mount::{self, InspectionMount, MountStrategy},
};

/// A mounted filesystem, as listed by the kernel
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MountInfo {
    pub(crate) source: PathBuf,
    pub(crate) target: PathBuf,
}

/// A loop device and the file behind it
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct LoopInfo {
    pub(crate) device: PathBuf,
    pub(crate) backing_file: Option<PathBuf>,
}

/// Outcome of a boot menu syntax check
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum MenuCheck {
    Valid,
    Invalid(String),
    Unavailable,
}

/// Read-only view of an image's content
pub(crate) trait Inspection: Debug {
    fn root(&self) -> &Path;
}

impl Inspection for InspectionMount {
    fn root(&self) -> &Path {
        self.mount_point()
    }
}

/// Every side effect on the system outside of plain files
pub(crate) trait Host: Debug {
    fn inspect(
        &self,
        image: &Path,
        strategy: &MountStrategy,
    ) -> Result<Box<dyn Inspection>, PxeError>;

    fn mount(&self, image: &Path, target: &Path, strategy: &MountStrategy)
        -> Result<(), PxeError>;

    fn unmount(&self, target: &Path) -> Result<(), PxeError>;

    fn mounts(&self) -> Result<Vec<MountInfo>, PxeError>;

    fn reload_exports(&self) -> Result<(), PxeError>;

    fn restart_service(&self, name: &str) -> Result<(), PxeError>;

    fn service_state(&self, name: &str) -> String;

    fn check_menu(&self, path: &Path) -> MenuCheck;

    fn loop_devices(&self) -> Result<Vec<LoopInfo>, PxeError>;

    fn detach_loop(&self, device: &Path) -> Result<(), PxeError>;

    fn is_mounted(&self, target: &Path) -> Result<bool, PxeError> {
        Ok(self.mounts()?.iter().any(|m| m.target == target))
    }
}

/// Decodes the octal escapes the kernel uses for whitespace in mount paths
pub(crate) fn unescape_mount_path(field: &str) -> PathBuf {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        let digits: String = chars.clone().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) if digits.len() == 3 => {
                out.push(char::from(byte));
                chars.nth(2);
            }
            _ => out.push(c),
        }
    }

    PathBuf::from(out)
}

pub(crate) fn parse_mounts(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;

            Some(MountInfo {
                source: unescape_mount_path(source),
                target: unescape_mount_path(target),
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct LosetupDevice {
    name: PathBuf,

    #[serde(rename = "back-file")]
    back_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LosetupOutput {
    #[serde(rename = "loopdevices", default)]
    devices: Vec<LosetupDevice>,
}

pub(crate) fn parse_losetup(content: &str) -> Result<Vec<LoopInfo>, PxeError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let out: LosetupOutput = serde_json::from_str(content)?;

    Ok(out
        .devices
        .into_iter()
        .map(|d| LoopInfo {
            device: d.name,
            backing_file: d
                .back_file
                .map(|f| PathBuf::from(f.trim_end_matches(" (deleted)"))),
        })
        .collect())
}

/// The real system
#[derive(Debug)]
pub(crate) struct SystemHost {
    command_timeout: Duration,
    mount_timeout: Duration,
}

impl SystemHost {
    pub(crate) fn new(settings: &Settings) -> Self {
        Self {
            command_timeout: settings.command_timeout,
            mount_timeout: settings.mount_timeout,
        }
    }
}

impl Host for SystemHost {
    fn inspect(
        &self,
        image: &Path,
        strategy: &MountStrategy,
    ) -> Result<Box<dyn Inspection>, PxeError> {
        Ok(Box::new(mount::inspect(image, strategy, self.mount_timeout)?))
    }

    fn mount(
        &self,
        image: &Path,
        target: &Path,
        strategy: &MountStrategy,
    ) -> Result<(), PxeError> {
        mount::mount_persistent(image, target, strategy)
    }

    fn unmount(&self, target: &Path) -> Result<(), PxeError> {
        mount::unmount(target)
    }

    fn mounts(&self) -> Result<Vec<MountInfo>, PxeError> {
        Ok(parse_mounts(&fs::read_to_string("/proc/self/mounts")?))
    }

    fn reload_exports(&self) -> Result<(), PxeError> {
        command::run(Command::new("exportfs").arg("-ra"), self.command_timeout)?;
        Ok(())
    }

    fn restart_service(&self, name: &str) -> Result<(), PxeError> {
        command::run(
            Command::new("systemctl").args(["restart", name]),
            self.command_timeout,
        )?;
        Ok(())
    }

    fn service_state(&self, name: &str) -> String {
        match command::output(
            Command::new("systemctl").args(["is-active", name]),
            self.command_timeout,
        ) {
            Ok(out) if !out.stdout.trim().is_empty() => out.stdout.trim().to_owned(),
            Ok(_) => String::from("unknown"),
            Err(e) => {
                debug!("Couldn't query {name}: {e}");
                String::from("unknown")
            }
        }
    }

    fn check_menu(&self, path: &Path) -> MenuCheck {
        if !command::tool_available("grub-script-check") {
            return MenuCheck::Unavailable;
        }

        match command::run(
            Command::new("grub-script-check").arg(path.as_os_str()),
            self.command_timeout,
        ) {
            Ok(_) => MenuCheck::Valid,
            Err(PxeError::Command { stderr, .. }) => MenuCheck::Invalid(stderr),
            Err(e) => {
                warn!("Couldn't check the boot menu: {e}");
                MenuCheck::Unavailable
            }
        }
    }

    fn loop_devices(&self) -> Result<Vec<LoopInfo>, PxeError> {
        let out = command::run(
            Command::new("losetup").args(["--list", "--json"]),
            self.command_timeout,
        )?;

        parse_losetup(&out.stdout)
    }

    fn detach_loop(&self, device: &Path) -> Result<(), PxeError> {
        command::run(
            Command::new("losetup").arg("-d").arg(device.as_os_str()),
            self.command_timeout,
        )?;
        Ok(())
    }
}
