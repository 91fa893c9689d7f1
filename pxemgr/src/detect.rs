use std::{fs, path::Path};

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use types::Architecture;

use crate::bootfiles::{exists_in_root, resolve_in_root};

pub(crate) const UNKNOWN: &str = "unknown";

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d+(?:\.\d+){0,2})\b").expect("Invalid regex"));

static ARCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(amd64|x86_64|x86-64|i386|i686|arm64|aarch64)\b")
        .expect("Invalid regex")
});

static CODENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)""#).expect("Invalid regex"));

static REDHAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(centos|red hat|rhel|rocky|almalinux|alma|fedora)\b")
        .expect("Invalid regex")
});

static FILENAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(ubuntu|debian|centos|rhel|rocky|almalinux|fedora)[-_ ]?(\d+(?:\.\d+)*)?")
        .expect("Invalid regex")
});

const UBUNTU_PARAMS: &str =
    "boot=casper netboot=nfs nfsroot=@SERVER@:@NFS_ROOT@/@NAME@ ip=dhcp ---";
const DEBIAN_LIVE_PARAMS: &str =
    "boot=live netboot=nfs nfsroot=@SERVER@:@NFS_ROOT@/@NAME@ ip=dhcp ---";
const DEBIAN_INSTALL_PARAMS: &str = "ip=dhcp priority=critical ---";
const REDHAT_PARAMS: &str = "inst.stage2=@HTTP_ROOT@/@NAME@ inst.repo=@HTTP_ROOT@/@NAME@ ip=dhcp";
const NFSROOT_PARAMS: &str = "root=/dev/nfs nfsroot=@SERVER@:@NFS_ROOT@/@NAME@ ip=dhcp ro";

const OS_RELEASE_IDS: [&str; 7] = [
    "ubuntu",
    "debian",
    "rhel",
    "centos",
    "rocky",
    "almalinux",
    "fedora",
];

/// What we could learn about an image by looking at its content
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Detection {
    pub(crate) distro: String,
    pub(crate) version: String,
    pub(crate) arch: Architecture,
    pub(crate) release_name: String,
    pub(crate) kernel_path: String,
    pub(crate) initrd_path: String,
    pub(crate) boot_params: String,
}

impl Detection {
    fn new(distro: &str) -> Self {
        Self {
            distro: distro.to_owned(),
            version: String::from(UNKNOWN),
            arch: Architecture::default(),
            release_name: String::from(UNKNOWN),
            kernel_path: String::new(),
            initrd_path: String::new(),
            boot_params: String::new(),
        }
    }

    pub(crate) fn unknown() -> Self {
        Self::new(UNKNOWN)
    }

    /// Sets the boot files to the first candidates found in the image
    fn with_boot_files(
        mut self,
        root: &Path,
        kernels: &[&str],
        initrds: &[&str],
        params: &str,
    ) -> Self {
        let first = |candidates: &[&str]| {
            candidates
                .iter()
                .find(|c| exists_in_root(root, c))
                .map(|c| (*c).to_owned())
        };

        if let Some(kernel) = first(kernels) {
            self.kernel_path = kernel;
            self.initrd_path = first(initrds).unwrap_or_default();
            self.boot_params = params.to_owned();
        } else {
            debug!("No kernel found among {kernels:?}");
        }

        self
    }
}

/// One way of recognizing a family of images
pub(crate) trait Detector: Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, root: &Path, file_name: &str) -> Option<Detection>;
}

fn read_marker(root: &Path, rel: &str) -> Option<String> {
    fs::read_to_string(root.join(rel)).ok()
}

// os-release is usually a symlink, which must not escape the image
fn read_in_root(root: &Path, rel: &str) -> Option<String> {
    fs::read_to_string(resolve_in_root(root, rel)?).ok()
}

fn first_version(text: &str) -> Option<String> {
    VERSION_RE.captures(text).map(|c| c[1].to_owned())
}

fn first_arch(text: &str) -> Option<Architecture> {
    ARCH_RE
        .captures(text)
        .and_then(|c| Architecture::recognize(&c[1]))
}

/// Ubuntu and Debian media, through `.disk/info`
#[derive(Debug)]
struct DiskInfo;

impl Detector for DiskInfo {
    fn name(&self) -> &'static str {
        "disk-info"
    }

    fn detect(&self, root: &Path, _file_name: &str) -> Option<Detection> {
        let info = read_marker(root, ".disk/info")?;
        let lower = info.to_ascii_lowercase();

        let mut detection = if lower.contains("ubuntu") {
            let distro = if lower.contains("server") {
                "ubuntu-server"
            } else {
                "ubuntu-desktop"
            };

            Detection::new(distro).with_boot_files(
                root,
                &["casper/vmlinuz", "casper/vmlinuz.efi"],
                &["casper/initrd", "casper/initrd.gz", "casper/initrd.lz"],
                UBUNTU_PARAMS,
            )
        } else if lower.contains("debian") {
            let detection = Detection::new("debian").with_boot_files(
                root,
                &["live/vmlinuz"],
                &["live/initrd.img"],
                DEBIAN_LIVE_PARAMS,
            );

            if detection.kernel_path.is_empty() {
                detection.with_boot_files(
                    root,
                    &["install.amd/vmlinuz", "install/vmlinuz", "install.a64/vmlinuz"],
                    &[
                        "install.amd/initrd.gz",
                        "install/initrd.gz",
                        "install.a64/initrd.gz",
                    ],
                    DEBIAN_INSTALL_PARAMS,
                )
            } else {
                detection
            }
        } else {
            debug!("Unrecognized .disk/info content: {}", info.trim());
            return None;
        };

        if let Some(version) = first_version(&info) {
            detection.version = version;
        }

        if let Some(arch) = first_arch(&info) {
            detection.arch = arch;
        }

        if let Some(c) = CODENAME_RE.captures(&info) {
            detection.release_name = c[1].to_owned();
        }

        Some(detection)
    }
}

/// Red Hat family installation media, through `.discinfo` and `media.repo`
#[derive(Debug)]
struct RedHat;

impl Detector for RedHat {
    fn name(&self) -> &'static str {
        "redhat"
    }

    fn detect(&self, root: &Path, _file_name: &str) -> Option<Detection> {
        let discinfo = read_marker(root, ".discinfo");
        let media_repo = read_marker(root, "media.repo");

        if discinfo.is_none() && media_repo.is_none() {
            return None;
        }

        let product = media_repo
            .as_deref()
            .and_then(|repo| {
                repo.lines()
                    .find_map(|l| l.trim().strip_prefix("name="))
                    .map(str::to_owned)
            })
            .or_else(|| discinfo.as_deref().and_then(|d| d.lines().nth(1)).map(str::to_owned))
            .unwrap_or_default();

        let distro = REDHAT_RE.captures(&product).map_or("redhat", |c| {
            match c[1].to_ascii_lowercase().as_str() {
                "centos" => "centos",
                "red hat" | "rhel" => "rhel",
                "rocky" => "rocky",
                "almalinux" | "alma" => "almalinux",
                "fedora" => "fedora",
                _ => "redhat",
            }
        });

        let mut detection = Detection::new(distro).with_boot_files(
            root,
            &["images/pxeboot/vmlinuz"],
            &["images/pxeboot/initrd.img"],
            REDHAT_PARAMS,
        );

        if let Some(version) = first_version(&product) {
            detection.version = version;
        }

        // .discinfo: timestamp, release, architecture
        if let Some(arch) = discinfo
            .as_deref()
            .and_then(|d| d.lines().nth(2))
            .and_then(Architecture::recognize)
        {
            detection.arch = arch;
        }

        detection.release_name = if product.is_empty() {
            String::from(UNKNOWN)
        } else {
            product.trim().to_owned()
        };

        Some(detection)
    }
}

fn os_release_field<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|l| {
        l.strip_prefix(key)?
            .strip_prefix('=')
            .map(|v| v.trim().trim_matches('"').trim_matches('\''))
    })
}

/// Installed root filesystems, through `os-release`
#[derive(Debug)]
struct OsRelease;

impl Detector for OsRelease {
    fn name(&self) -> &'static str {
        "os-release"
    }

    fn detect(&self, root: &Path, _file_name: &str) -> Option<Detection> {
        let content = ["etc/os-release", "usr/lib/os-release"]
            .iter()
            .find_map(|p| read_in_root(root, p))?;

        let distro = os_release_field(&content, "ID")?.to_ascii_lowercase();
        if !OS_RELEASE_IDS.contains(&distro.as_str()) {
            debug!("Unrecognized os-release ID {distro}");
            return None;
        }

        let mut detection = Detection::new(&distro).with_boot_files(
            root,
            &["boot/vmlinuz", "vmlinuz"],
            &["boot/initrd.img", "initrd.img", "boot/initrd"],
            NFSROOT_PARAMS,
        );

        if let Some(version) = os_release_field(&content, "VERSION_ID") {
            detection.version = version.to_owned();
        }

        if let Some(codename) = os_release_field(&content, "VERSION_CODENAME") {
            if !codename.is_empty() {
                detection.release_name = codename.to_owned();
            }
        }

        Some(detection)
    }
}

/// Any root filesystem with a kernel where we expect one
#[derive(Debug)]
struct GenericKernel;

impl Detector for GenericKernel {
    fn name(&self) -> &'static str {
        "generic-kernel"
    }

    fn detect(&self, root: &Path, _file_name: &str) -> Option<Detection> {
        let detection = Detection::new("linux").with_boot_files(
            root,
            &["boot/vmlinuz", "vmlinuz"],
            &["boot/initrd.img", "initrd.img"],
            NFSROOT_PARAMS,
        );

        (!detection.kernel_path.is_empty()).then_some(detection)
    }
}

/// Last resort, guesses from the file name and never fails
#[derive(Debug)]
struct FileName;

impl Detector for FileName {
    fn name(&self) -> &'static str {
        "file-name"
    }

    fn detect(&self, _root: &Path, file_name: &str) -> Option<Detection> {
        let mut detection = Detection::new(UNKNOWN);

        if let Some(c) = FILENAME_RE.captures(file_name) {
            detection.distro = c[1].to_ascii_lowercase();

            if let Some(version) = c.get(2) {
                detection.version = version.as_str().to_owned();
            }
        }

        Some(detection)
    }
}

static DETECTORS: [&dyn Detector; 5] = [&DiskInfo, &RedHat, &OsRelease, &GenericKernel, &FileName];

/// Runs the detectors in priority order, the first match wins
pub(crate) fn detect(root: &Path, file_name: &str) -> Detection {
    for detector in DETECTORS {
        let Some(mut detection) = detector.detect(root, file_name) else {
            continue;
        };

        if detection.arch == Architecture::default() {
            if let Some(arch) = first_arch(file_name) {
                detection.arch = arch;
            }
        }

        info!(
            "Detected {} {} ({}) using {}",
            detection.distro,
            detection.version,
            detection.arch,
            detector.name()
        );

        return detection;
    }

    Detection::unknown()
}

/// Replaces the placeholders of a boot parameters template
pub(crate) fn render_params(
    template: &str,
    name: &str,
    server: &str,
    nfs_root: &str,
    http_root: &str,
) -> String {
    template
        .replace("@NAME@", name)
        .replace("@SERVER@", server)
        .replace("@NFS_ROOT@", nfs_root)
        .replace("@HTTP_ROOT@", http_root)
}
