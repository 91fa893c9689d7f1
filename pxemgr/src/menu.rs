use core::str::FromStr;
use std::collections::HashSet;

use grub::{EntryKey, Menu, MenuEntry, ENTRIES_MARKER};
use log::{debug, info, warn};
use types::{ImageKind, PxeError};

use crate::{
    bootfiles,
    config::Settings,
    detect::render_params,
    host::Host,
    registry::BootImage,
    textfile::TextFile,
};

pub(crate) fn entry_key(kind: ImageKind, name: &str) -> EntryKey {
    EntryKey::new(kind.as_str(), name)
}

pub(crate) fn entry_id(kind: ImageKind, name: &str) -> String {
    format!("pxemgr-{kind}-{name}")
}

/// Entries every menu carries, whatever is registered
pub(crate) fn static_entries() -> Vec<MenuEntry> {
    vec![
        MenuEntry::new("Boot from local disk")
            .id("pxemgr-local")
            .class("local")
            .command("exit", ""),
        MenuEntry::new("Reboot")
            .id("pxemgr-reboot")
            .class("reboot")
            .command("reboot", ""),
        MenuEntry::new("Shutdown")
            .id("pxemgr-shutdown")
            .class("shutdown")
            .command("halt", ""),
        MenuEntry::new("Network diagnostics")
            .id("pxemgr-diagnostics")
            .class("diagnostics")
            .command("echo", "\"Network cards:\"")
            .command("net_ls_cards", "")
            .command("echo", "\"Addresses:\"")
            .command("net_ls_addr", "")
            .command("sleep", "--interruptible 30"),
    ]
}

fn skeleton(settings: &Settings) -> Menu {
    let mut menu = Menu::default();

    menu.push_line("# Network boot menu, managed by pxemgr");
    menu.push_line(&format!("set timeout={}", settings.menu_timeout));
    menu.push_line(&format!("set default={}", settings.menu_default));
    menu.push_line("");
    menu.push_line(ENTRIES_MARKER);

    menu
}

/// Builds the menu entry booting an image, `None` if it has no kernel
pub(crate) fn render_entry(settings: &Settings, image: &BootImage) -> Option<MenuEntry> {
    let kernel = bootfiles::kernel_url(image)?;

    let params = render_params(
        &image.boot_params,
        &image.name,
        &settings.server_ip.to_string(),
        &settings.nfs_dir(image.kind).to_string_lossy(),
        &settings.http_url(image.kind),
    );

    let linux_args = if params.is_empty() {
        kernel
    } else {
        format!("{kernel} {params}")
    };

    let title = format!(
        "{} ({} {} {})",
        image.name, image.distro, image.version, image.arch
    );

    let mut entry = MenuEntry::new(&title)
        .id(&entry_id(image.kind, &image.name))
        .class(&image.distro)
        .command("linux", &linux_args);

    if let Some(initrd) = bootfiles::initrd_url(image) {
        entry = entry.command("initrd", &initrd);
    }

    Some(entry)
}

/// Keeps the boot menu in line with the registered images
#[derive(Debug)]
pub(crate) struct MenuSync<'a, H: Host + ?Sized> {
    settings: &'a Settings,
    host: &'a H,
}

impl<'a, H: Host + ?Sized> MenuSync<'a, H> {
    pub(crate) fn new(settings: &'a Settings, host: &'a H) -> Self {
        Self { settings, host }
    }

    fn file(&self) -> TextFile<'a> {
        TextFile::new(&self.settings.menu_file, &self.settings.lock_dir).with_backup()
    }

    fn parse_or_skeleton(&self, content: &str) -> Menu {
        if content.trim().is_empty() {
            debug!("Starting the boot menu from scratch");
            skeleton(self.settings)
        } else {
            Menu::parse(content)
        }
    }

    /// The current menu, or the one we would create if there's none yet
    pub(crate) fn load(&self) -> Result<Menu, PxeError> {
        let content = self.file().read()?;
        Ok(self.parse_or_skeleton(&content))
    }

    fn restart_boot_service(&self) {
        let Some(service) = &self.settings.boot_service else {
            return;
        };

        match self.host.restart_service(service) {
            Ok(()) => debug!("Restarted {service}"),
            Err(e) => warn!("Couldn't restart {service}: {e}"),
        }
    }

    /// Applies an edit to the menu, restoring the static entries along the way
    fn update<F>(&self, f: F) -> Result<bool, PxeError>
    where
        F: FnOnce(&mut Menu),
    {
        let changed = self.file().edit(|content| {
            let mut menu = self.parse_or_skeleton(content);

            let restored = menu.ensure_entries(&static_entries());
            if restored > 0 {
                info!("Restored {restored} static menu entries");
            }

            f(&mut menu);

            Ok(menu.to_string())
        })?;

        if changed {
            self.restart_boot_service();
        }

        Ok(changed)
    }

    /// Writes the menu if missing, with its static entries
    pub(crate) fn ensure(&self) -> Result<bool, PxeError> {
        self.update(|_| {})
    }

    /// Adds or replaces the entry of an image.
    ///
    /// Returns `false`, leaving the menu alone, when the boot files of the
    /// image aren't in the TFTP tree.
    pub(crate) fn add_entry(&self, image: &BootImage) -> Result<bool, PxeError> {
        if !bootfiles::present(self.settings, image) {
            warn!("{} has no boot files, not adding it to the menu", image.name);
            return Ok(false);
        }

        let Some(entry) = render_entry(self.settings, image) else {
            return Ok(false);
        };

        let key = entry_key(image.kind, &image.name);
        self.update(|menu| menu.upsert(&key, &entry))?;

        info!("Menu entry {key} is in place");

        Ok(true)
    }

    pub(crate) fn remove_entry(&self, kind: ImageKind, name: &str) -> Result<bool, PxeError> {
        let key = entry_key(kind, name);

        if !self.load()?.contains(&key) {
            debug!("No menu entry for {key}");
            return Ok(false);
        }

        self.update(|menu| {
            menu.remove(&key);
        })?;

        info!("Removed menu entry {key}");

        Ok(true)
    }

    /// Regenerates every entry of a kind from the given images.
    ///
    /// Entries of other kinds and unmanaged entries are left untouched.
    pub(crate) fn refresh_all(
        &self,
        kind: ImageKind,
        images: &[BootImage],
    ) -> Result<usize, PxeError> {
        let entries: Vec<_> = images
            .iter()
            .filter(|i| i.kind == kind)
            .filter(|i| {
                let present = bootfiles::present(self.settings, i);
                if !present {
                    debug!("Skipping {}, its boot files are missing", i.name);
                }
                present
            })
            .filter_map(|i| Some((entry_key(kind, &i.name), render_entry(self.settings, i)?)))
            .collect();

        let count = entries.len();
        let namespace = kind.as_str();

        self.update(|menu| {
            let dropped = menu.retain(|k| k.namespace != namespace);
            debug!("Dropped {dropped} {namespace} entries");

            for (key, entry) in &entries {
                menu.upsert(key, entry);
            }
        })?;

        info!("Regenerated {count} {namespace} menu entries");

        Ok(count)
    }

    /// Managed entries whose key names an image kind
    pub(crate) fn managed_keys(&self) -> Result<Vec<(ImageKind, String)>, PxeError> {
        Ok(self
            .load()?
            .entries()
            .filter_map(|e| {
                let kind = ImageKind::from_str(&e.key.namespace).ok()?;
                Some((kind, e.key.name.clone()))
            })
            .collect())
    }

    /// Drops the managed entries with no registered image behind them
    pub(crate) fn remove_orphans(
        &self,
        registered: &HashSet<(ImageKind, String)>,
    ) -> Result<usize, PxeError> {
        let mut removed = 0;

        self.update(|menu| {
            removed = menu.retain(|key| {
                ImageKind::from_str(&key.namespace)
                    .is_ok_and(|kind| registered.contains(&(kind, key.name.clone())))
            });
        })?;

        if removed > 0 {
            info!("Removed {removed} orphaned menu entries");
        }

        Ok(removed)
    }
}
