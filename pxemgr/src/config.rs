use core::time::Duration;
use std::{
    fs,
    io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use log::debug;
use serde::Deserialize;
use types::{ImageKind, PxeError};

pub(crate) const DEFAULT_CONFIG_PATH: &str = "/etc/pxemgr/config.toml";

const DEFAULT_EXPORTS_FILE: &str = "/etc/exports";
const DEFAULT_FSTAB_FILE: &str = "/etc/fstab";
const DEFAULT_LOCK_DIR: &str = "/run/lock/pxemgr";
const DEFAULT_HTTP_PATH: &str = "pxe";
const DEFAULT_BOOT_SERVICE: &str = "tftpd-hpa";
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MOUNT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MENU_TIMEOUT_SECS: u32 = 30;
const DEFAULT_MENU_ENTRY: &str = "pxemgr-local";
const DEFAULT_MONITORED_SERVICES: [&str; 4] = [
    "tftpd-hpa",
    "isc-dhcp-server",
    "nfs-kernel-server",
    "nginx",
];

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPaths {
    project_dir: Option<PathBuf>,
    tftp_root: Option<PathBuf>,
    nfs_root: Option<PathBuf>,
    http_root: Option<PathBuf>,
    menu_file: Option<PathBuf>,
    exports_file: Option<PathBuf>,
    fstab_file: Option<PathBuf>,
    lock_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNetwork {
    server_ip: Option<String>,
    subnet: Option<String>,
    http_path: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum HttpLinkMode {
    #[default]
    Symlink,
    Copy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHttp {
    link_mode: Option<HttpLinkMode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommands {
    timeout_secs: Option<u64>,
    mount_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServices {
    boot_service: Option<String>,
    monitored: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMenu {
    timeout_secs: Option<u32>,
    default_entry: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    paths: RawPaths,

    #[serde(default)]
    network: RawNetwork,

    #[serde(default)]
    http: RawHttp,

    #[serde(default)]
    commands: RawCommands,

    #[serde(default)]
    services: RawServices,

    #[serde(default)]
    menu: RawMenu,
}

/// Validated, immutable settings handed to every component.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub(crate) project_dir: PathBuf,
    pub(crate) tftp_root: PathBuf,
    pub(crate) nfs_root: PathBuf,
    pub(crate) http_root: PathBuf,
    pub(crate) menu_file: PathBuf,
    pub(crate) exports_file: PathBuf,
    pub(crate) fstab_file: PathBuf,
    pub(crate) lock_dir: PathBuf,
    pub(crate) server_ip: Ipv4Addr,
    pub(crate) subnet: String,
    pub(crate) http_path: String,
    pub(crate) http_link: HttpLinkMode,
    pub(crate) command_timeout: Duration,
    pub(crate) mount_timeout: Duration,
    pub(crate) boot_service: Option<String>,
    pub(crate) monitored_services: Vec<String>,
    pub(crate) menu_timeout: u32,
    pub(crate) menu_default: String,
}

fn require<T>(value: Option<T>, key: &str, missing: &mut Vec<String>) -> Option<T> {
    if value.is_none() {
        missing.push(key.to_owned());
    }

    value
}

fn check_absolute(key: &str, path: &Path) -> Result<(), PxeError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(PxeError::InvalidSetting {
            key: key.to_owned(),
            reason: format!("{} isn't an absolute path", path.display()),
        })
    }
}

fn parse_subnet(subnet: &str) -> Result<(), PxeError> {
    let invalid = |reason: &str| PxeError::InvalidSetting {
        key: String::from("network.subnet"),
        reason: format!("{subnet}: {reason}"),
    };

    let (addr, prefix) = subnet
        .split_once('/')
        .ok_or_else(|| invalid("expected a.b.c.d/prefix"))?;

    addr.parse::<Ipv4Addr>()
        .map_err(|_e| invalid("invalid network address"))?;

    let prefix: u8 = prefix.parse().map_err(|_e| invalid("invalid prefix"))?;
    if prefix > 32 {
        return Err(invalid("prefix is larger than 32"));
    }

    Ok(())
}

impl Settings {
    fn from_raw(raw: RawConfig) -> Result<Self, PxeError> {
        let mut missing = Vec::new();

        let server_ip = require(raw.network.server_ip, "network.server_ip", &mut missing);
        let subnet = require(raw.network.subnet, "network.subnet", &mut missing);
        let project_dir = require(raw.paths.project_dir, "paths.project_dir", &mut missing);
        let tftp_root = require(raw.paths.tftp_root, "paths.tftp_root", &mut missing);
        let nfs_root = require(raw.paths.nfs_root, "paths.nfs_root", &mut missing);
        let http_root = require(raw.paths.http_root, "paths.http_root", &mut missing);

        let (
            Some(server_ip),
            Some(subnet),
            Some(project_dir),
            Some(tftp_root),
            Some(nfs_root),
            Some(http_root),
        ) = (server_ip, subnet, project_dir, tftp_root, nfs_root, http_root)
        else {
            return Err(PxeError::MissingSettings(missing));
        };

        let server_ip = server_ip
            .parse::<Ipv4Addr>()
            .map_err(|_e| PxeError::InvalidSetting {
                key: String::from("network.server_ip"),
                reason: format!("{server_ip} isn't an IPv4 address"),
            })?;

        parse_subnet(&subnet)?;

        let menu_file = raw
            .paths
            .menu_file
            .unwrap_or_else(|| tftp_root.join("grub").join("grub.cfg"));

        let exports_file = raw
            .paths
            .exports_file
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORTS_FILE));

        let fstab_file = raw
            .paths
            .fstab_file
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FSTAB_FILE));

        let lock_dir = raw
            .paths
            .lock_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_DIR));

        for (key, path) in [
            ("paths.project_dir", &project_dir),
            ("paths.tftp_root", &tftp_root),
            ("paths.nfs_root", &nfs_root),
            ("paths.http_root", &http_root),
            ("paths.menu_file", &menu_file),
            ("paths.exports_file", &exports_file),
            ("paths.fstab_file", &fstab_file),
            ("paths.lock_dir", &lock_dir),
        ] {
            check_absolute(key, path)?;
        }

        let http_path = raw
            .network
            .http_path
            .unwrap_or_else(|| String::from(DEFAULT_HTTP_PATH))
            .trim_matches('/')
            .to_owned();

        let boot_service = match raw.services.boot_service {
            Some(s) if s.is_empty() => None,
            Some(s) => Some(s),
            None => Some(String::from(DEFAULT_BOOT_SERVICE)),
        };

        let monitored_services = raw.services.monitored.unwrap_or_else(|| {
            DEFAULT_MONITORED_SERVICES
                .iter()
                .map(|s| (*s).to_owned())
                .collect()
        });

        Ok(Self {
            project_dir,
            tftp_root,
            nfs_root,
            http_root,
            menu_file,
            exports_file,
            fstab_file,
            lock_dir,
            server_ip,
            subnet,
            http_path,
            http_link: raw.http.link_mode.unwrap_or_default(),
            command_timeout: Duration::from_secs(
                raw.commands
                    .timeout_secs
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
            ),
            mount_timeout: Duration::from_secs(
                raw.commands
                    .mount_timeout_secs
                    .unwrap_or(DEFAULT_MOUNT_TIMEOUT_SECS),
            ),
            boot_service,
            monitored_services,
            menu_timeout: raw.menu.timeout_secs.unwrap_or(DEFAULT_MENU_TIMEOUT_SECS),
            menu_default: raw
                .menu
                .default_entry
                .unwrap_or_else(|| String::from(DEFAULT_MENU_ENTRY)),
        })
    }

    pub(crate) fn from_toml_str(content: &str) -> Result<Self, PxeError> {
        let raw: RawConfig = toml::from_str(content)?;
        Self::from_raw(raw)
    }

    fn find_config_file() -> Result<Option<PathBuf>, PxeError> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME"))
            .map_err(<xdg::BaseDirectoriesError as Into<io::Error>>::into)?;

        if let Some(path) = xdg_dirs.find_config_file("config.toml") {
            return Ok(Some(path));
        }

        let system = PathBuf::from(DEFAULT_CONFIG_PATH);
        Ok(system.exists().then_some(system))
    }

    /// Loads the settings from an explicit path, or from the first configuration file found.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self, PxeError> {
        let path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(PxeError::NotFound(p.to_path_buf()));
                }

                Some(p.to_path_buf())
            }
            None => Self::find_config_file()?,
        };

        let Some(path) = path else {
            debug!("No configuration file found, only defaults are available");
            return Self::from_raw(RawConfig::default());
        };

        debug!("Loading configuration from {}", path.display());

        let content = fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub(crate) fn artifacts_dir(&self, kind: ImageKind) -> PathBuf {
        self.project_dir.join("artifacts").join(kind.as_str())
    }

    pub(crate) fn kernels_dir(&self, kind: ImageKind) -> PathBuf {
        self.tftp_root.join("kernels").join(kind.as_str())
    }

    pub(crate) fn nfs_dir(&self, kind: ImageKind) -> PathBuf {
        self.nfs_root.join(kind.as_str())
    }

    pub(crate) fn http_dir(&self, kind: ImageKind) -> PathBuf {
        self.http_root.join(kind.as_str())
    }

    pub(crate) fn http_url(&self, kind: ImageKind) -> String {
        if self.http_path.is_empty() {
            format!("http://{}/{}", self.server_ip, kind)
        } else {
            format!("http://{}/{}/{}", self.server_ip, self.http_path, kind)
        }
    }
}
