use alloc::fmt;
use core::{str::FromStr, time::Duration};
use std::{
    fs::File,
    io,
    os::fd::AsFd as _,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, error, info, log_enabled, trace, warn, Level};
use loopdev::LoopControl;
use probe::{FilesystemKind, ImageLayout, Partition};
use serde::Deserialize;
use sys_mount::{FilesystemType, Mount, MountFlags, Unmount as _, UnmountFlags};
use tempfile::TempDir;
use types::{ImageKind, PxeError};

use crate::command;

/// Filesystems tried when the probe didn't recognize the image
const FALLBACK_FILESYSTEMS: [&str; 6] = ["ext4", "vfat", "iso9660", "squashfs", "xfs", "btrfs"];

/// Whether an IMG holds a bare filesystem or a whole disk
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ImgType {
    Filesystem,
    Partitioned,
}

impl ImgType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Partitioned => "partitioned",
        }
    }
}

impl FromStr for ImgType {
    type Err = PxeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filesystem" => Ok(Self::Filesystem),
            "partitioned" => Ok(Self::Partitioned),
            _ => Err(PxeError::Custom(format!("Unknown IMG type {s}"))),
        }
    }
}

impl fmt::Display for ImgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the content of an image file gets attached
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum MountStrategy {
    /// Loop device over the whole file
    Loop { fstype: Option<FilesystemKind> },

    /// Loop device restricted to one partition of a disk image
    Partition {
        number: usize,
        offset: u64,
        size: u64,
        fstype: Option<FilesystemKind>,
    },
}

impl MountStrategy {
    pub(crate) fn fstype(&self) -> Option<FilesystemKind> {
        match self {
            Self::Loop { fstype } | Self::Partition { fstype, .. } => *fstype,
        }
    }

    /// Filesystem type column of an fstab line
    pub(crate) fn fstab_type(&self) -> &'static str {
        self.fstype().map_or("auto", FilesystemKind::mount_type)
    }

    /// Options column of an fstab line
    pub(crate) fn fstab_options(&self) -> String {
        match self {
            Self::Loop { .. } => String::from("loop,ro"),
            Self::Partition { offset, size, .. } => {
                format!("loop,ro,offset={offset},sizelimit={size}")
            }
        }
    }

    fn mount_types(&self) -> Vec<&'static str> {
        self.fstype().map_or_else(
            || FALLBACK_FILESYSTEMS.to_vec(),
            |fs| vec![fs.mount_type()],
        )
    }
}

impl fmt::Display for MountStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loop { fstype } => {
                write!(f, "loop mount")?;
                if let Some(fs) = fstype {
                    write!(f, " ({fs})")?;
                }
                Ok(())
            }
            Self::Partition { number, offset, .. } => {
                write!(f, "partition {number} at offset {offset}")
            }
        }
    }
}

/// Picks the strategy matching what the probe found
pub(crate) fn select_strategy(kind: ImageKind, layout: &ImageLayout) -> MountStrategy {
    if kind == ImageKind::Iso {
        return MountStrategy::Loop {
            fstype: Some(FilesystemKind::Iso9660),
        };
    }

    match layout {
        ImageLayout::Filesystem(fs) => MountStrategy::Loop { fstype: Some(*fs) },
        ImageLayout::Partitioned { partitions, .. } => match partitions.first() {
            Some(part) => MountStrategy::Partition {
                number: part.number,
                offset: part.offset_bytes(),
                size: part.size_bytes(),
                fstype: None,
            },
            None => {
                info!("Partition table has no usable partition, falling back to a direct mount");
                MountStrategy::Loop { fstype: None }
            }
        },
        ImageLayout::Unknown => MountStrategy::Loop { fstype: None },
    }
}

/// The mount strategy of an image, along with what we learnt choosing it
#[derive(Clone, Debug)]
pub(crate) struct MountPlan {
    pub(crate) strategy: MountStrategy,
    pub(crate) img_type: Option<ImgType>,
}

fn partition_by_number(layout: &ImageLayout, number: usize) -> Option<&Partition> {
    match layout {
        ImageLayout::Partitioned { partitions, .. } => {
            partitions.iter().find(|p| p.number == number)
        }
        ImageLayout::Filesystem(_) | ImageLayout::Unknown => None,
    }
}

/// Probes an image file and figures out how to mount it
pub(crate) fn plan(kind: ImageKind, path: &Path) -> Result<MountPlan, PxeError> {
    if kind == ImageKind::Iso {
        return Ok(MountPlan {
            strategy: select_strategy(kind, &ImageLayout::Unknown),
            img_type: None,
        });
    }

    let layout = probe::probe_file(path)?;
    let mut strategy = select_strategy(kind, &layout);

    if let MountStrategy::Partition { number, fstype, .. } = &mut strategy {
        if let Some(part) = partition_by_number(&layout, *number) {
            *fstype = probe::probe_partition_file(path, part)?;
        }
    }

    let img_type = match layout {
        ImageLayout::Partitioned { .. } => ImgType::Partitioned,
        ImageLayout::Filesystem(_) | ImageLayout::Unknown => ImgType::Filesystem,
    };

    debug!("{} is a {img_type} image, using {strategy}", path.display());

    Ok(MountPlan {
        strategy,
        img_type: Some(img_type),
    })
}

#[derive(Debug)]
struct LoopDevice {
    loopdev: loopdev::LoopDevice,
    path: PathBuf,
    detach: bool,
    _file: File,
}

impl LoopDevice {
    fn create(
        ctrl: &LoopControl,
        file: File,
        strategy: &MountStrategy,
        part_scan: bool,
        autoclear: bool,
    ) -> Result<Self, PxeError> {
        let loop_device = ctrl.next_free()?;
        let path = loop_device.path().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "Loop Device File Not Found")
        })?;

        if log_enabled!(Level::Debug) {
            debug!("Using loop device {}", path.display());
        }

        let mut options = loop_device
            .with()
            .read_only(true)
            .part_scan(part_scan)
            .autoclear(autoclear);

        if let MountStrategy::Partition { offset, size, .. } = strategy {
            if !part_scan {
                options = options.offset(*offset).size_limit(*size);
            }
        }

        options.attach_fd(file.as_fd())?;

        debug!("Attached the loop device to our file");

        Ok(Self {
            loopdev: loop_device,
            path,
            detach: !autoclear,
            _file: file,
        })
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if !self.detach {
            return;
        }

        debug!("Destroying loop device {}", self.path.display());

        if let Err(e) = self.loopdev.detach() {
            error!("Couldn't detach the Loop Device: {e}");
        }
    }
}

/// Partition mappings created by kpartx, removed when dropped
#[derive(Debug)]
struct PartitionMappings {
    device: PathBuf,
    parts: Vec<PathBuf>,
    timeout: Duration,
}

impl PartitionMappings {
    fn create(device: &Path, timeout: Duration) -> Result<Self, PxeError> {
        let out = command::run(
            Command::new("kpartx").arg("-av").arg(device.as_os_str()),
            timeout,
        )?;

        // add map loop0p1 (253:0): 0 1046528 linear 7:0 2048
        let parts = out
            .stdout
            .lines()
            .filter_map(|l| l.strip_prefix("add map "))
            .filter_map(|l| l.split_whitespace().next())
            .map(|name| Path::new("/dev/mapper").join(name))
            .collect();

        Ok(Self {
            device: device.to_path_buf(),
            parts,
            timeout,
        })
    }
}

impl Drop for PartitionMappings {
    fn drop(&mut self) {
        debug!("Removing partition mappings of {}", self.device.display());

        if let Err(e) = command::run(
            Command::new("kpartx")
                .arg("-d")
                .arg(self.device.as_os_str()),
            self.timeout,
        ) {
            error!("Couldn't remove the partition mappings: {e}");
        }
    }
}

#[derive(Debug)]
struct MountGuard {
    mount: Mount,
    source: PathBuf,
}

impl MountGuard {
    fn new(source: &Path, target: &Path, types: &[&str]) -> Result<Self, PxeError> {
        debug!("Mounting {} on {}", source.display(), target.display());

        let mount = Mount::builder()
            .fstype(FilesystemType::Set(types))
            .flags(MountFlags::RDONLY)
            .mount(source, target)
            .map_err(|e| PxeError::Mount {
                target: target.to_path_buf(),
                reason: e.to_string(),
            })?;

        trace!("Mount Successful");

        Ok(Self {
            mount,
            source: source.to_path_buf(),
        })
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        debug!(
            "Unmounting {} from {}",
            self.source.display(),
            self.mount.target_path().display()
        );

        if let Err(e) = self.mount.unmount(UnmountFlags::DETACH) {
            error!("Couldn't unmount {}: {e}", self.source.display());
        }
    }
}

/// Read-only view of an image, torn down when dropped
#[derive(Debug)]
pub(crate) struct InspectionMount {
    mount: Option<MountGuard>,
    _mappings: Option<PartitionMappings>,
    _loopdev: LoopDevice,
    dir: TempDir,
}

impl Drop for InspectionMount {
    fn drop(&mut self) {
        // The mount has to go before the mappings and the loop device.
        drop(self.mount.take());
    }
}

impl InspectionMount {
    pub(crate) fn mount_point(&self) -> &Path {
        self.dir.path()
    }
}

#[derive(Debug, Deserialize)]
struct LsblkPartition {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    #[serde(rename = "children", default)]
    parts: Vec<LsblkPartition>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(rename = "blockdevices")]
    devices: Vec<LsblkDevice>,
}

fn find_device_parts(dev: &Path, timeout: Duration) -> Result<Vec<PathBuf>, PxeError> {
    let output = command::run(
        Command::new("lsblk")
            .args(["--json", "--paths", "--output", "PATH"])
            .arg(dev.as_os_str()),
        timeout,
    )?;

    let res: LsblkOutput = serde_json::from_str(&output.stdout)?;

    Ok(res
        .devices
        .into_iter()
        .next()
        .map(|d| d.parts.into_iter().map(|p| p.path).collect())
        .unwrap_or_default())
}

/// Picks the device of the partition to mount, from the kernel partition
/// scan first, then from the mappings `map` creates.
///
/// Failures of either source count as no partition at all, leaving the
/// caller to mount the whole device.
fn pick_partition<M>(
    number: usize,
    scan: impl FnOnce() -> Result<Vec<PathBuf>, PxeError>,
    map: impl FnOnce() -> Result<(Vec<PathBuf>, M), PxeError>,
) -> (Option<PathBuf>, Option<M>) {
    let scanned = match scan() {
        Ok(parts) => parts,
        Err(e) => {
            warn!("Couldn't list the partitions of the loop device: {e}");
            Vec::new()
        }
    };

    let (parts, mappings) = if scanned.is_empty() {
        debug!("Kernel found no partition, trying kpartx");

        match map() {
            Ok((parts, mappings)) => (parts, Some(mappings)),
            Err(e) => {
                warn!("Couldn't map the partitions: {e}");
                (Vec::new(), None)
            }
        }
    } else {
        (scanned, None)
    };

    let chosen = parts
        .get(number.saturating_sub(1))
        .or_else(|| parts.first())
        .cloned();

    (chosen, mappings)
}

/// Attaches an image and mounts it read-only in a scratch directory.
///
/// Partitioned images get their partitions from the kernel partition scan,
/// then from kpartx, and fall back to mounting the whole loop device.
pub(crate) fn inspect(
    image: &Path,
    strategy: &MountStrategy,
    timeout: Duration,
) -> Result<InspectionMount, PxeError> {
    let dir = TempDir::new()?;
    let file = File::open(image)?;

    let ctrl = LoopControl::open()?;
    let partitioned = matches!(strategy, MountStrategy::Partition { .. });
    let loop_device = LoopDevice::create(&ctrl, file, strategy, partitioned, false)?;

    let mut mappings = None;
    let mut source = loop_device.path.clone();

    if let MountStrategy::Partition { number, .. } = strategy {
        let (chosen, mapped) = pick_partition(
            *number,
            || find_device_parts(&loop_device.path, timeout),
            || {
                PartitionMappings::create(&loop_device.path, timeout)
                    .map(|m| (m.parts.clone(), m))
            },
        );
        mappings = mapped;

        match chosen {
            Some(part) => source = part,
            None => debug!("No partition could be mapped, mounting the raw device"),
        }
    }

    let mount = MountGuard::new(&source, dir.path(), &strategy.mount_types())?;

    Ok(InspectionMount {
        mount: Some(mount),
        _mappings: mappings,
        _loopdev: loop_device,
        dir,
    })
}

/// Mounts an image for good, the loop device going away with the mount
pub(crate) fn mount_persistent(
    image: &Path,
    target: &Path,
    strategy: &MountStrategy,
) -> Result<(), PxeError> {
    let file = File::open(image)?;
    let ctrl = LoopControl::open()?;
    let loop_device = LoopDevice::create(&ctrl, file, strategy, false, true)?;

    let types = strategy.mount_types();
    Mount::builder()
        .fstype(FilesystemType::Set(&types))
        .flags(MountFlags::RDONLY)
        .mount(&loop_device.path, target)
        .map_err(|e| PxeError::Mount {
            target: target.to_path_buf(),
            reason: e.to_string(),
        })?;

    info!("Mounted {} on {}", image.display(), target.display());

    Ok(())
}

pub(crate) fn unmount(target: &Path) -> Result<(), PxeError> {
    sys_mount::unmount(target, UnmountFlags::empty()).map_err(|e| PxeError::Mount {
        target: target.to_path_buf(),
        reason: e.to_string(),
    })
}
