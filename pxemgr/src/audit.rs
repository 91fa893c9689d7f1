use std::{
    collections::HashSet,
    io::Write,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use types::{ImageKind, PxeError};

use crate::{
    bootfiles,
    config::Settings,
    export::{remove_any, remove_empty_dir, Exporter},
    host::{Host, MenuCheck},
    menu::{entry_key, MenuSync},
    registry::Registry,
};

type Registered = HashSet<(ImageKind, String)>;

/// Problems found by [`Auditor::validate`]
#[derive(Debug, Default)]
pub(crate) struct Findings {
    pub(crate) errors: Vec<String>,
    pub(crate) warnings: Vec<String>,
}

impl Findings {
    fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }

    fn warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    pub(crate) fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Cross-checks the registry against the derived resources, and repairs what has no owner left
#[derive(Debug)]
pub(crate) struct Auditor<'a, H: Host + ?Sized> {
    settings: &'a Settings,
    host: &'a H,
    registry: Registry<'a>,
    exporter: Exporter<'a, H>,
    menu: MenuSync<'a, H>,
}

impl<'a, H: Host + ?Sized> Auditor<'a, H> {
    pub(crate) fn new(settings: &'a Settings, host: &'a H) -> Self {
        Self {
            settings,
            host,
            registry: Registry::new(settings),
            exporter: Exporter::new(settings, host),
            menu: MenuSync::new(settings, host),
        }
    }

    fn registered(&self) -> Result<Registered, PxeError> {
        let mut registered = HashSet::new();

        for kind in ImageKind::ALL {
            for name in self.registry.names(kind)? {
                registered.insert((kind, name));
            }
        }

        Ok(registered)
    }

    /// Mount points in our NFS tree, as (kind, name, mount point)
    fn managed_mounts(&self) -> Result<Vec<(ImageKind, String, PathBuf)>, PxeError> {
        let mut found = Vec::new();

        for mount in self.host.mounts()? {
            for kind in ImageKind::ALL {
                let Ok(rel) = mount.target.strip_prefix(self.settings.nfs_dir(kind)) else {
                    continue;
                };

                if let Some(name) = rel.to_str().filter(|n| !n.is_empty() && !n.contains('/')) {
                    found.push((kind, name.to_owned(), mount.target.clone()));
                }
            }
        }

        Ok(found)
    }

    fn check_images(&self, findings: &mut Findings) -> Result<(), PxeError> {
        let menu = self.menu.load()?;

        for entry in self.registry.scan()? {
            let id = format!("{}/{}", entry.kind, entry.name);

            if !self.registry.image_path(entry.kind, &entry.name).exists() {
                findings.error(format!("{id}: image file is missing"));
            }

            let image = match entry.image {
                Ok(image) => image,
                Err(e) => {
                    findings.error(format!("{id}: unreadable metadata: {e}"));
                    continue;
                }
            };

            if image.has_kernel() && !bootfiles::present(self.settings, &image) {
                findings.warning(format!("{id}: boot files are missing"));
            } else if image.has_kernel()
                && !menu.contains(&entry_key(image.kind, &image.name))
            {
                findings.warning(format!("{id}: no boot menu entry"));
            }

            let mnt = self.exporter.mount_point(image.kind, &image.name);

            if !self.host.is_mounted(&mnt)? {
                findings.warning(format!("{id}: not mounted on {}", mnt.display()));
            }

            if !self.exporter.has_fstab(&mnt)? {
                findings.warning(format!("{id}: no fstab entry"));
            }

            if !self.exporter.has_export(&mnt)? {
                findings.warning(format!("{id}: not exported over NFS"));
            }

            if !self.exporter.has_http(image.kind, &image.name) {
                findings.warning(format!("{id}: not published over HTTP"));
            }
        }

        Ok(())
    }

    fn check_orphans(&self, findings: &mut Findings) -> Result<(), PxeError> {
        let registered = self.registered()?;
        let orphan = |kind: ImageKind, name: &str| !registered.contains(&(kind, name.to_owned()));

        for (kind, name) in self.menu.managed_keys()? {
            if orphan(kind, &name) {
                findings.warning(format!("{kind}/{name}: menu entry without image"));
            }
        }

        for (kind, name, _) in self.exporter.export_entries()? {
            if orphan(kind, &name) {
                findings.warning(format!("{kind}/{name}: NFS export without image"));
            }
        }

        for (kind, name, _) in self.exporter.fstab_entries()? {
            if orphan(kind, &name) {
                findings.warning(format!("{kind}/{name}: fstab entry without image"));
            }
        }

        for (kind, name, _) in self.managed_mounts()? {
            if orphan(kind, &name) {
                findings.warning(format!("{kind}/{name}: mounted without image"));
            }
        }

        Ok(())
    }

    fn check_menu(&self, findings: &mut Findings) {
        let path = &self.settings.menu_file;
        if !path.exists() {
            debug!("No boot menu to check");
            return;
        }

        match self.host.check_menu(path) {
            MenuCheck::Valid => debug!("{} is valid", path.display()),
            MenuCheck::Invalid(reason) => {
                findings.error(format!("{}: invalid syntax: {reason}", path.display()));
            }
            MenuCheck::Unavailable => {
                warn!("grub-script-check isn't available, skipping the menu syntax check");
            }
        }
    }

    /// Runs every consistency check and prints what was found
    pub(crate) fn validate<W: Write>(&self, out: &mut W) -> Result<Findings, PxeError> {
        let mut findings = Findings::default();

        self.check_images(&mut findings)?;
        self.check_orphans(&mut findings)?;
        self.check_menu(&mut findings);

        for error in &findings.errors {
            writeln!(out, "ERROR: {error}")?;
        }

        for warning in &findings.warnings {
            writeln!(out, "WARNING: {warning}")?;
        }

        writeln!(
            out,
            "errors={} warnings={}",
            findings.errors.len(),
            findings.warnings.len()
        )?;

        Ok(findings)
    }

    fn is_artifact(&self, path: &Path) -> bool {
        ImageKind::ALL
            .into_iter()
            .any(|kind| path.starts_with(self.settings.artifacts_dir(kind)))
    }

    fn detach_stale_loops(&self) -> Result<usize, PxeError> {
        let sources: HashSet<PathBuf> = self.host.mounts()?.into_iter().map(|m| m.source).collect();
        let mut detached = 0;

        for dev in self.host.loop_devices()? {
            let Some(backing) = &dev.backing_file else {
                continue;
            };

            if !self.is_artifact(backing) || sources.contains(&dev.device) {
                continue;
            }

            match self.host.detach_loop(&dev.device) {
                Ok(()) => {
                    info!("Detached {} ({})", dev.device.display(), backing.display());
                    detached += 1;
                }
                Err(e) => warn!("Couldn't detach {}: {e}", dev.device.display()),
            }
        }

        Ok(detached)
    }

    /// Removes every derived resource no registered image owns.
    ///
    /// Returns how many were removed.
    pub(crate) fn cleanup(&self) -> Result<usize, PxeError> {
        let registered = self.registered()?;
        let orphan = |kind: ImageKind, name: &str| !registered.contains(&(kind, name.to_owned()));
        let mut removed = 0;

        for (kind, name, mnt) in self.managed_mounts()? {
            if orphan(kind, &name) {
                self.host.unmount(&mnt)?;
                info!("Unmounted {}", mnt.display());
                removed += 1;
            }
        }

        for (kind, name, mnt) in self.exporter.fstab_entries()? {
            if orphan(kind, &name) && self.exporter.remove_fstab(&mnt)? {
                info!("Removed the fstab entry for {}", mnt.display());
                removed += 1;
            }
        }

        let mut exports = 0;
        for (kind, name, mnt) in self.exporter.export_entries()? {
            if orphan(kind, &name) && self.exporter.remove_export(&mnt)? {
                info!("Removed the NFS export of {}", mnt.display());
                exports += 1;
            }
        }

        if exports > 0 {
            self.exporter.reload();
            removed += exports;
        }

        for kind in ImageKind::ALL {
            for name in Exporter::<H>::dir_names(&self.settings.http_dir(kind))? {
                if orphan(kind, &name) && remove_any(&self.settings.http_dir(kind).join(&name))? {
                    info!("Removed the HTTP link of {kind}/{name}");
                    removed += 1;
                }
            }

            for name in Exporter::<H>::dir_names(&self.settings.kernels_dir(kind))? {
                if orphan(kind, &name) && bootfiles::remove(self.settings, kind, &name)? {
                    removed += 1;
                }
            }

            for name in Exporter::<H>::dir_names(&self.settings.nfs_dir(kind))? {
                let mnt = self.exporter.mount_point(kind, &name);

                if orphan(kind, &name) && !self.host.is_mounted(&mnt)? {
                    remove_empty_dir(&mnt);
                    if !mnt.exists() {
                        debug!("Removed {}", mnt.display());
                        removed += 1;
                    }
                }
            }
        }

        if self.menu.ensure()? {
            info!("Restored the boot menu");
        }
        removed += self.menu.remove_orphans(&registered)?;

        removed += self.detach_stale_loops()?;

        info!("Cleaned up {removed} orphaned resources");

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink, path::PathBuf};

    use test_log::test;
    use types::ImageKind;

    use crate::{
        audit::Auditor,
        bootfiles,
        export::Exporter,
        host::MenuCheck,
        manager::{AddOptions, Manager},
        test_host::TestEnv,
    };

    fn add_ubuntu(env: &TestEnv) {
        let options = AddOptions {
            force: true,
            name: None,
            confirm: &|_: &str| false,
        };

        Manager::new(&env.settings, &env.host)
            .add(&env.ubuntu_server_iso(), &options)
            .unwrap();
    }

    #[test]
    fn test_validate_clean() {
        let env = TestEnv::new();
        add_ubuntu(&env);

        let mut out = Vec::new();
        let findings = Auditor::new(&env.settings, &env.host)
            .validate(&mut out)
            .unwrap();

        assert!(findings.is_ok());
        assert!(findings.warnings.is_empty());
        assert_eq!(String::from_utf8(out).unwrap(), "errors=0 warnings=0\n");
    }

    #[test]
    fn test_validate_missing_kernel_dir() {
        let env = TestEnv::new();
        add_ubuntu(&env);

        fs::remove_dir_all(bootfiles::boot_dir(
            &env.settings,
            ImageKind::Iso,
            "ubuntu-24.04-server",
        ))
        .unwrap();

        let mut out = Vec::new();
        let findings = Auditor::new(&env.settings, &env.host)
            .validate(&mut out)
            .unwrap();

        assert!(findings.is_ok());
        assert_eq!(findings.warnings.len(), 1);
        assert!(findings.warnings[0].contains("ubuntu-24.04-server"));
        assert!(String::from_utf8(out)
            .unwrap()
            .ends_with("errors=0 warnings=1\n"));
    }

    #[test]
    fn test_validate_errors() {
        let env = TestEnv::new();
        add_ubuntu(&env);

        let img_dir = env.settings.artifacts_dir(ImageKind::Img);
        fs::create_dir_all(&img_dir).unwrap();
        fs::write(img_dir.join("broken.info"), "DISTRO=unquoted\n").unwrap();

        env.host
            .set_menu_check(MenuCheck::Invalid(String::from("syntax error")));

        let findings = Auditor::new(&env.settings, &env.host)
            .validate(&mut Vec::new())
            .unwrap();

        // Missing image file, unreadable metadata and menu syntax
        assert_eq!(findings.errors.len(), 3);
        assert!(!findings.is_ok());
    }

    #[test]
    fn test_validate_orphans() {
        let env = TestEnv::new();
        let exporter = Exporter::new(&env.settings, &env.host);
        let ghost = exporter.mount_point(ImageKind::Iso, "ghost");

        exporter.add_export(&ghost).unwrap();

        let findings = Auditor::new(&env.settings, &env.host)
            .validate(&mut Vec::new())
            .unwrap();

        assert!(findings.is_ok());
        assert_eq!(findings.warnings.len(), 1);
        assert!(findings.warnings[0].contains("iso/ghost"));
    }

    #[test]
    fn test_cleanup() {
        let env = TestEnv::new();
        add_ubuntu(&env);

        let exporter = Exporter::new(&env.settings, &env.host);
        let ghost = exporter.mount_point(ImageKind::Iso, "ghost");
        let ghost_image = env.settings.artifacts_dir(ImageKind::Iso).join("ghost.iso");

        fs::create_dir_all(&ghost).unwrap();
        exporter.add_export(&ghost).unwrap();
        fs::write(
            &env.settings.fstab_file,
            format!(
                "{}{} {} iso9660 loop,ro 0 0\n",
                fs::read_to_string(&env.settings.fstab_file).unwrap(),
                ghost_image.display(),
                ghost.display()
            ),
        )
        .unwrap();
        env.host.add_mount(&PathBuf::from("/dev/loop7"), &ghost);
        env.host.add_loop("/dev/loop8", &ghost_image);
        env.host.add_loop("/dev/loop9", &PathBuf::from("/var/lib/other.img"));

        fs::create_dir_all(env.settings.http_dir(ImageKind::Iso)).unwrap();
        symlink(&ghost, exporter.http_link(ImageKind::Iso, "ghost")).unwrap();
        fs::create_dir_all(bootfiles::boot_dir(&env.settings, ImageKind::Iso, "ghost")).unwrap();

        let mut menu = fs::read_to_string(&env.settings.menu_file).unwrap();
        menu.push_str("### BEGIN PXEMGR iso:ghost ###\nmenuentry \"ghost\" {\n}\n### END PXEMGR iso:ghost ###\n");
        fs::write(&env.settings.menu_file, menu).unwrap();

        let auditor = Auditor::new(&env.settings, &env.host);
        assert_eq!(auditor.validate(&mut Vec::new()).unwrap().warnings.len(), 4);

        // mount, fstab, export, http, kernels, mount point, menu, loop8
        assert_eq!(auditor.cleanup().unwrap(), 8);

        assert!(!ghost.exists());
        assert!(!exporter.has_export(&ghost).unwrap());
        assert!(!exporter.has_fstab(&ghost).unwrap());
        assert!(!exporter.has_http(ImageKind::Iso, "ghost"));
        assert_eq!(env.host.detached(), vec![PathBuf::from("/dev/loop8")]);

        let findings = auditor.validate(&mut Vec::new()).unwrap();
        assert!(findings.is_ok());
        assert!(findings.warnings.is_empty());

        assert_eq!(auditor.cleanup().unwrap(), 0);
    }
}
