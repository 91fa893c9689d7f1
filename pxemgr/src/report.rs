use std::{io::Write, path::Path};

use comfy_table::{presets::NOTHING, Table};
use log::debug;
use nix::sys::statvfs::statvfs;
use types::{ImageKind, PxeError};

use crate::{
    config::Settings,
    export::Exporter,
    host::Host,
    menu::{entry_key, MenuSync},
    registry::Registry,
};

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING).set_header(header.to_vec());
    table
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.0} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.0} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Size and usage of the filesystem holding a path
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct DiskUsage {
    pub(crate) total: u64,
    pub(crate) available: u64,
}

impl DiskUsage {
    #[allow(clippy::useless_conversion)]
    pub(crate) fn of(path: &Path) -> Result<Self, PxeError> {
        let stat = statvfs(path)?;
        let frsize = u64::from(stat.fragment_size());

        Ok(Self {
            total: u64::from(stat.blocks()) * frsize,
            available: u64::from(stat.blocks_available()) * frsize,
        })
    }

    pub(crate) fn used(self) -> u64 {
        self.total.saturating_sub(self.available)
    }

    pub(crate) fn percent(self) -> u64 {
        if self.total == 0 {
            return 0;
        }

        self.used() * 100 / self.total
    }
}

/// Read-only views of the registry and the system state
#[derive(Debug)]
pub(crate) struct Reporter<'a, H: Host + ?Sized> {
    settings: &'a Settings,
    host: &'a H,
    registry: Registry<'a>,
    exporter: Exporter<'a, H>,
    menu: MenuSync<'a, H>,
}

impl<'a, H: Host + ?Sized> Reporter<'a, H> {
    pub(crate) fn new(settings: &'a Settings, host: &'a H) -> Self {
        Self {
            settings,
            host,
            registry: Registry::new(settings),
            exporter: Exporter::new(settings, host),
            menu: MenuSync::new(settings, host),
        }
    }

    /// Prints every registered image along with the state of its derived resources.
    ///
    /// Returns how many images are registered.
    pub(crate) fn list<W: Write>(&self, out: &mut W) -> Result<usize, PxeError> {
        let entries = self.registry.scan()?;
        if entries.is_empty() {
            writeln!(out, "No image registered")?;
            return Ok(0);
        }

        let menu = self.menu.load()?;
        let mut table = table(&[
            "NAME", "KIND", "DISTRO", "VERSION", "ARCH", "MOUNT", "EXPORT", "HTTP", "MENU",
        ]);

        for entry in &entries {
            let mnt = self.exporter.mount_point(entry.kind, &entry.name);

            let (distro, version, arch) = match &entry.image {
                Ok(image) => (
                    image.distro.clone(),
                    image.version.clone(),
                    image.arch.to_string(),
                ),
                Err(e) => {
                    debug!("Can't read {}: {e}", entry.name);
                    (String::from("(invalid metadata)"), String::new(), String::new())
                }
            };

            table.add_row(vec![
                entry.name.clone(),
                entry.kind.to_string(),
                distro,
                version,
                arch,
                yes_no(self.host.is_mounted(&mnt)?).to_owned(),
                yes_no(self.exporter.has_export(&mnt)?).to_owned(),
                yes_no(self.exporter.has_http(entry.kind, &entry.name)).to_owned(),
                yes_no(menu.contains(&entry_key(entry.kind, &entry.name))).to_owned(),
            ]);
        }

        writeln!(out, "{table}")?;

        Ok(entries.len())
    }

    fn disk_usage<W: Write>(&self, out: &mut W) -> Result<(), PxeError> {
        let mut table = table(&["PATH", "SIZE", "USED", "AVAILABLE", "USE%"]);

        for path in [
            self.settings.project_dir.join("artifacts"),
            self.settings.tftp_root.clone(),
            self.settings.nfs_root.clone(),
        ] {
            let row = match DiskUsage::of(&path) {
                Ok(usage) => vec![
                    path.display().to_string(),
                    format_size(usage.total),
                    format_size(usage.used()),
                    format_size(usage.available),
                    format!("{}%", usage.percent()),
                ],
                Err(e) => {
                    debug!("Can't stat {}: {e}", path.display());
                    vec![path.display().to_string(), String::from("missing")]
                }
            };

            table.add_row(row);
        }

        writeln!(out, "{table}")?;
        Ok(())
    }

    /// Prints the state of the services, mounts, exports and disks
    pub(crate) fn status<W: Write>(&self, out: &mut W) -> Result<(), PxeError> {
        writeln!(out, "Services")?;
        let mut services = table(&["SERVICE", "STATE"]);
        for service in &self.settings.monitored_services {
            services.add_row(vec![service.clone(), self.host.service_state(service)]);
        }
        writeln!(out, "{services}")?;
        writeln!(out)?;

        writeln!(out, "Images")?;
        let mut images = table(&["NAME", "KIND", "MOUNT POINT", "MOUNTED"]);
        for kind in ImageKind::ALL {
            for name in self.registry.names(kind)? {
                let mnt = self.exporter.mount_point(kind, &name);

                images.add_row(vec![
                    name.clone(),
                    kind.to_string(),
                    mnt.display().to_string(),
                    yes_no(self.host.is_mounted(&mnt)?).to_owned(),
                ]);
            }
        }
        writeln!(out, "{images}")?;
        writeln!(out)?;

        writeln!(
            out,
            "NFS exports: {}, fstab entries: {}",
            self.exporter.export_entries()?.len(),
            self.exporter.fstab_entries()?.len()
        )?;
        writeln!(out)?;

        writeln!(out, "Disk usage")?;
        self.disk_usage(out)
    }
}
