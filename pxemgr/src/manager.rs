use std::{fs, path::Path};

use log::{debug, info, warn};
use types::{ImageKind, PxeError};

use crate::{
    bootfiles,
    config::Settings,
    detect,
    export::{remove_empty_dir, Exporter},
    host::Host,
    journal::{Journal, Step},
    menu::MenuSync,
    mount::{self, MountPlan, MountStrategy},
    registry::{validate_name, BootImage, ImgDetails, Registry},
};

/// How to handle an `add`
pub(crate) struct AddOptions<'c> {
    /// Overwrite an existing registration without asking
    pub(crate) force: bool,

    /// Name to register the image under, instead of the file stem
    pub(crate) name: Option<String>,

    /// Asks the operator a yes/no question
    pub(crate) confirm: &'c dyn Fn(&str) -> bool,
}

#[derive(Debug)]
pub(crate) enum AddOutcome {
    Added(Box<BootImage>),
    Skipped,
}

fn img_details(plan: &MountPlan) -> Option<ImgDetails> {
    let img_type = plan.img_type?;

    let (part_offset, part_size) = match plan.strategy {
        MountStrategy::Partition { offset, size, .. } => (Some(offset), Some(size)),
        MountStrategy::Loop { .. } => (None, None),
    };

    Some(ImgDetails {
        img_type,
        fs_type: plan.strategy.fstype(),
        part_offset,
        part_size,
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Registers and unregisters images along with everything derived from them
#[derive(Debug)]
pub(crate) struct Manager<'a, H: Host + ?Sized> {
    settings: &'a Settings,
    host: &'a H,
    registry: Registry<'a>,
    exporter: Exporter<'a, H>,
    menu: MenuSync<'a, H>,
}

impl<'a, H: Host + ?Sized> Manager<'a, H> {
    pub(crate) fn new(settings: &'a Settings, host: &'a H) -> Self {
        Self {
            settings,
            host,
            registry: Registry::new(settings),
            exporter: Exporter::new(settings, host),
            menu: MenuSync::new(settings, host),
        }
    }

    /// Registers an image file.
    ///
    /// Any failure undoes whatever was done so far.
    pub(crate) fn add(&self, file: &Path, options: &AddOptions<'_>) -> Result<AddOutcome, PxeError> {
        if !file.is_file() {
            return Err(PxeError::NotFound(file.to_path_buf()));
        }

        let kind = ImageKind::from_path(file)?;

        let name = match &options.name {
            Some(n) => n.clone(),
            None => file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| PxeError::UnsupportedImage(file.to_path_buf()))?,
        };
        validate_name(&name)?;

        for other in self.registry.find(&name).into_iter().filter(|k| *k != kind) {
            warn!("An {other} image is also named {name}, both are kept side by side");
        }

        let stored = self.registry.image_path(kind, &name);
        let in_place = same_file(file, &stored);

        if self.registry.exists(kind, &name) {
            let question = format!("The {kind} image {name} is already registered, overwrite it?");

            if !options.force && !(options.confirm)(&question) {
                info!("Keeping the existing {kind} image {name}");
                return Ok(AddOutcome::Skipped);
            }

            info!("Replacing the {kind} image {name}");
            self.teardown(kind, &name, in_place)?;
        }

        let mut journal = Journal::new();
        match self.register(file, kind, &name, in_place, &mut journal) {
            Ok(image) => {
                info!(
                    "Registered {name} ({} {} {})",
                    image.distro, image.version, image.arch
                );
                Ok(AddOutcome::Added(Box::new(image)))
            }
            Err(e) => {
                warn!("Adding {name} failed, rolling back {} steps", journal.len());
                self.rollback(journal);
                Err(e)
            }
        }
    }

    fn register(
        &self,
        file: &Path,
        kind: ImageKind,
        name: &str,
        in_place: bool,
        journal: &mut Journal,
    ) -> Result<BootImage, PxeError> {
        let stored = self.registry.image_path(kind, name);

        if !in_place {
            fs::create_dir_all(self.settings.artifacts_dir(kind))?;

            journal.record(Step::StoredImage(stored.clone()));
            fs::copy(file, &stored)?;
            info!("Stored {} as {}", file.display(), stored.display());
        }

        let plan = mount::plan(kind, &stored)?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let image = {
            let inspection = self.host.inspect(&stored, &plan.strategy)?;
            let detection = detect::detect(inspection.root(), &file_name);
            let image = BootImage::new(kind, name, &stored, detection, img_details(&plan));

            if image.has_kernel() {
                journal.record(Step::BootFiles {
                    kind,
                    name: name.to_owned(),
                });
                bootfiles::extract(self.settings, &image, inspection.root())?;
            } else {
                warn!("No kernel found in {name}, it won't be in the boot menu");
            }

            image
        };

        self.exporter
            .register_nfs(kind, name, &stored, &plan.strategy, journal)?;
        self.exporter.register_http(kind, name, journal)?;

        if self.menu.add_entry(&image)? {
            journal.record(Step::MenuEntry {
                kind,
                name: name.to_owned(),
            });
        }

        journal.record(Step::Sidecar {
            kind,
            name: name.to_owned(),
        });
        self.registry.save(&image)?;

        Ok(image)
    }

    fn undo(&self, step: &Step) -> Result<(), PxeError> {
        match step {
            Step::StoredImage(path) => fs::remove_file(path)?,
            Step::CreatedDir(path) => remove_empty_dir(path),
            Step::BootFiles { kind, name } => {
                bootfiles::remove(self.settings, *kind, name)?;
            }
            Step::FstabLine(mnt) => {
                self.exporter.remove_fstab(mnt)?;
            }
            Step::Mounted(mnt) => self.host.unmount(mnt)?,
            Step::ExportLine(mnt) => {
                if self.exporter.remove_export(mnt)? {
                    self.exporter.reload();
                }
            }
            Step::HttpLink { kind, name } => {
                self.exporter.unregister_http(*kind, name)?;
            }
            Step::MenuEntry { kind, name } => {
                self.menu.remove_entry(*kind, name)?;
            }
            Step::Sidecar { kind, name } => {
                self.registry.delete_sidecar(*kind, name)?;
            }
        }

        Ok(())
    }

    fn rollback(&self, journal: Journal) {
        for step in journal.unwind() {
            debug!("Undoing {step:?}");

            if let Err(e) = self.undo(&step) {
                warn!("Couldn't undo {step:?}: {e}");
            }
        }
    }

    /// Removes everything derived from an image, in the reverse order of its registration
    pub(crate) fn teardown(
        &self,
        kind: ImageKind,
        name: &str,
        keep_image: bool,
    ) -> Result<(), PxeError> {
        self.menu.remove_entry(kind, name)?;
        self.exporter.unregister_http(kind, name)?;
        self.exporter.unregister_nfs(kind, name)?;
        bootfiles::remove(self.settings, kind, name)?;
        self.registry.delete_sidecar(kind, name)?;

        if !keep_image {
            self.registry.delete_image(kind, name)?;
        }

        Ok(())
    }

    /// Unregisters an image, `kind` picking one when an ISO and an IMG share the name
    pub(crate) fn remove(
        &self,
        name: &str,
        kind: Option<ImageKind>,
    ) -> Result<ImageKind, PxeError> {
        let kinds = self.registry.find(name);

        let kind = match (kind, kinds.as_slice()) {
            (Some(k), found) if found.contains(&k) => k,
            (None, [k]) => *k,
            (None, [_, _, ..]) => return Err(PxeError::Ambiguous(name.to_owned())),
            _ => return Err(PxeError::NotRegistered(name.to_owned())),
        };

        self.teardown(kind, name, false)?;
        info!("Removed the {kind} image {name}");

        Ok(kind)
    }

    fn redetect(&self, image: &mut BootImage) -> Result<(), PxeError> {
        let plan = mount::plan(image.kind, &image.source)?;
        let inspection = self.host.inspect(&image.source, &plan.strategy)?;

        let file_name = image
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        image.update_detection(detect::detect(inspection.root(), &file_name));

        bootfiles::remove(self.settings, image.kind, &image.name)?;
        bootfiles::extract(self.settings, image, inspection.root())?;
        self.registry.save(image)?;

        Ok(())
    }

    /// Regenerates the ISO menu entries from the registry
    pub(crate) fn refresh(&self, redetect: bool) -> Result<usize, PxeError> {
        let mut images = self.registry.images(ImageKind::Iso)?;

        if redetect {
            for image in &mut images {
                if let Err(e) = self.redetect(image) {
                    warn!("Couldn't re-detect {}: {e}", image.name);
                }
            }
        }

        self.menu.refresh_all(ImageKind::Iso, &images)
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;
    use std::fs;

    use test_log::test;
    use types::{Architecture, ImageKind, PxeError};

    use crate::{
        bootfiles,
        export::Exporter,
        manager::{AddOptions, AddOutcome, Manager},
        menu::{entry_key, MenuSync},
        mount::ImgType,
        registry::{BootImage, Registry},
        test_host::TestEnv,
    };

    fn forced() -> AddOptions<'static> {
        AddOptions {
            force: true,
            name: None,
            confirm: &|_: &str| panic!("Shouldn't ask"),
        }
    }

    fn added(outcome: AddOutcome) -> BootImage {
        match outcome {
            AddOutcome::Added(image) => *image,
            AddOutcome::Skipped => panic!("Image was skipped"),
        }
    }

    #[test]
    fn test_add_ubuntu_server() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);

        let iso = env.ubuntu_server_iso();
        let image = added(manager.add(&iso, &forced()).unwrap());

        assert_eq!(image.name, "ubuntu-24.04-server");
        assert_eq!(image.kind, ImageKind::Iso);
        assert_eq!(image.distro, "ubuntu-server");
        assert_eq!(image.version, "24.04");
        assert_eq!(image.arch, Architecture::X86_64);
        assert_eq!(image.kernel_path, "casper/vmlinuz");

        let registry = Registry::new(&env.settings);
        assert_eq!(registry.get(ImageKind::Iso, &image.name).unwrap(), image);
        assert!(bootfiles::present(&env.settings, &image));

        let menu = fs::read_to_string(&env.settings.menu_file).unwrap();
        assert_eq!(
            menu.matches("### BEGIN PXEMGR iso:ubuntu-24.04-server ###")
                .count(),
            1
        );
        assert!(menu.contains("menuentry \"ubuntu-24.04-server ("));

        let exporter = Exporter::new(&env.settings, &env.host);
        let mnt = exporter.mount_point(ImageKind::Iso, &image.name);
        assert!(exporter.has_export(&mnt).unwrap());
        assert!(exporter.has_fstab(&mnt).unwrap());
        assert!(exporter.has_http(ImageKind::Iso, &image.name));
        assert_eq!(env.host.mount_count(&mnt), 1);
    }

    #[test]
    fn test_add_twice() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        let iso = env.ubuntu_server_iso();

        manager.add(&iso, &forced()).unwrap();
        manager.add(&iso, &forced()).unwrap();

        let registry = Registry::new(&env.settings);
        assert_eq!(registry.names(ImageKind::Iso).unwrap().len(), 1);

        let exporter = Exporter::new(&env.settings, &env.host);
        let mnt = exporter.mount_point(ImageKind::Iso, "ubuntu-24.04-server");
        assert_eq!(exporter.export_count(&mnt).unwrap(), 1);
        assert_eq!(exporter.fstab_count(&mnt).unwrap(), 1);
        assert_eq!(env.host.mount_count(&mnt), 1);

        let menu = fs::read_to_string(&env.settings.menu_file).unwrap();
        assert_eq!(menu.matches("--id pxemgr-iso-ubuntu-24.04-server").count(), 1);
        assert_eq!(menu.matches("--id pxemgr-local").count(), 1);
    }

    #[test]
    fn test_remove_is_inverse_of_add() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        MenuSync::new(&env.settings, &env.host).ensure().unwrap();

        let iso = env.ubuntu_server_iso();
        let before = env.snapshot();

        manager.add(&iso, &forced()).unwrap();
        assert_ne!(env.snapshot(), before);

        assert_eq!(
            manager.remove("ubuntu-24.04-server", None).unwrap(),
            ImageKind::Iso
        );

        assert_eq!(env.snapshot(), before);
        assert!(env.host.mounted().is_empty());
    }

    #[test]
    fn test_remove_leaves_only_the_menu_skeleton() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);

        let iso = env.ubuntu_server_iso();
        let before = env.snapshot();
        assert!(!env.settings.menu_file.exists());

        manager.add(&iso, &forced()).unwrap();
        manager.remove("ubuntu-24.04-server", None).unwrap();

        let after: Vec<_> = env
            .snapshot()
            .into_iter()
            .filter(|(path, _)| *path != env.settings.menu_file)
            .collect();
        assert_eq!(after, before);

        let menu = MenuSync::new(&env.settings, &env.host).load().unwrap();
        assert!(menu.has_marker());
        assert_eq!(menu.entries().count(), 0);
        assert!(menu.has_entry_id("pxemgr-local"));
    }

    #[test]
    fn test_same_name_different_kinds() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);

        manager
            .add(&env.image_file("foo.iso", &[]), &forced())
            .unwrap();
        manager
            .add(&env.image_file("foo.img", &[]), &forced())
            .unwrap();

        let registry = Registry::new(&env.settings);
        assert_eq!(registry.find("foo"), vec![ImageKind::Iso, ImageKind::Img]);

        assert!(matches!(
            manager.remove("foo", None),
            Err(PxeError::Ambiguous(_))
        ));

        manager.remove("foo", Some(ImageKind::Iso)).unwrap();
        assert_eq!(registry.find("foo"), vec![ImageKind::Img]);

        let exporter = Exporter::new(&env.settings, &env.host);
        let img_mnt = exporter.mount_point(ImageKind::Img, "foo");
        assert!(exporter.has_export(&img_mnt).unwrap());
        assert_eq!(env.host.mount_count(&img_mnt), 1);

        manager.remove("foo", None).unwrap();
        assert!(registry.find("foo").is_empty());
    }

    #[test]
    fn test_unknown_format() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);

        let file = env.image_file("mystery.iso", &[("README.txt", "hello")]);
        let image = added(manager.add(&file, &forced()).unwrap());

        assert_eq!(image.distro, "unknown");
        assert!(image.kernel_path.is_empty());
        assert!(!bootfiles::boot_dir(&env.settings, ImageKind::Iso, "mystery").exists());

        let menu = MenuSync::new(&env.settings, &env.host);
        assert!(!menu
            .load()
            .unwrap()
            .contains(&entry_key(ImageKind::Iso, "mystery")));
    }

    #[test]
    fn test_remove_nonexistent() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        let before = env.snapshot();

        assert!(matches!(
            manager.remove("nonexistent", None),
            Err(PxeError::NotRegistered(_))
        ));
        assert!(matches!(
            manager.remove("nonexistent", Some(ImageKind::Img)),
            Err(PxeError::NotRegistered(_))
        ));

        assert_eq!(env.snapshot(), before);
        assert_eq!(env.host.reloads(), 0);
    }

    #[test]
    fn test_mount_failure_rolls_back() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        let iso = env.ubuntu_server_iso();
        let before = env.snapshot();

        env.host.fail_mount(true);
        assert!(matches!(
            manager.add(&iso, &forced()),
            Err(PxeError::Mount { .. })
        ));

        assert_eq!(env.snapshot(), before);
        assert!(env.host.mounted().is_empty());
        assert!(!Registry::new(&env.settings).exists(ImageKind::Iso, "ubuntu-24.04-server"));
    }

    #[test]
    fn test_inspect_failure_rolls_back() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        let iso = env.ubuntu_server_iso();
        let before = env.snapshot();

        env.host.fail_inspect(true);
        manager.add(&iso, &forced()).unwrap_err();

        assert_eq!(env.snapshot(), before);
    }

    #[test]
    fn test_declined_overwrite() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        let iso = env.ubuntu_server_iso();

        manager.add(&iso, &forced()).unwrap();
        let before = env.snapshot();

        let asked = Cell::new(0);
        let confirm = |_: &str| {
            asked.set(asked.get() + 1);
            false
        };
        let options = AddOptions {
            force: false,
            name: None,
            confirm: &confirm,
        };

        assert!(matches!(
            manager.add(&iso, &options).unwrap(),
            AddOutcome::Skipped
        ));
        assert_eq!(asked.get(), 1);
        assert_eq!(env.snapshot(), before);
    }

    #[test]
    fn test_accepted_overwrite() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        let iso = env.ubuntu_server_iso();

        manager.add(&iso, &forced()).unwrap();

        let options = AddOptions {
            force: false,
            name: None,
            confirm: &|_: &str| true,
        };
        added(manager.add(&iso, &options).unwrap());

        let menu = fs::read_to_string(&env.settings.menu_file).unwrap();
        assert_eq!(menu.matches("--id pxemgr-iso-ubuntu-24.04-server").count(), 1);
    }

    #[test]
    fn test_name_override() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        let iso = env.ubuntu_server_iso();

        let options = AddOptions {
            force: true,
            name: Some(String::from("noble")),
            confirm: &|_: &str| false,
        };
        let image = added(manager.add(&iso, &options).unwrap());

        assert_eq!(image.name, "noble");
        assert_eq!(image.distro, "ubuntu-server");
        assert!(MenuSync::new(&env.settings, &env.host)
            .contains(ImageKind::Iso, "noble")
            .unwrap());

        let options = AddOptions {
            force: true,
            name: Some(String::from("no good")),
            confirm: &|_: &str| false,
        };
        assert!(matches!(
            manager.add(&iso, &options),
            Err(PxeError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn test_add_precondition_failures() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);

        assert!(matches!(
            manager.add(&env.dir.path().join("absent.iso"), &forced()),
            Err(PxeError::NotFound(_))
        ));

        let archive = env.dir.path().join("image.zip");
        fs::write(&archive, "zip").unwrap();
        assert!(matches!(
            manager.add(&archive, &forced()),
            Err(PxeError::UnsupportedImage(_))
        ));
    }

    #[test]
    fn test_partitioned_img_without_partitions() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);

        let file = env.image_file("disk.img", &[]);
        let mut content = vec![0_u8; 4096];
        content[510] = 0x55;
        content[511] = 0xaa;
        fs::write(&file, content).unwrap();

        let image = added(manager.add(&file, &forced()).unwrap());
        assert_eq!(image.img.unwrap().img_type, ImgType::Partitioned);

        let fstab = fs::read_to_string(&env.settings.fstab_file).unwrap();
        assert!(fstab.contains(" auto loop,ro 0 0"));
    }

    #[test]
    fn test_refresh_keeps_unmanaged_entries() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        manager.add(&env.ubuntu_server_iso(), &forced()).unwrap();

        let mut menu = fs::read_to_string(&env.settings.menu_file).unwrap();
        menu.push_str("menuentry \"ubuntu-tools\" --id tools {\n    linux /tools/vmlinuz\n}\n");
        fs::write(&env.settings.menu_file, &menu).unwrap();

        assert_eq!(manager.refresh(false).unwrap(), 1);

        let refreshed = fs::read_to_string(&env.settings.menu_file).unwrap();
        assert!(refreshed.contains("menuentry \"ubuntu-tools\" --id tools"));
        assert_eq!(
            refreshed
                .matches("### BEGIN PXEMGR iso:ubuntu-24.04-server ###")
                .count(),
            1
        );
    }

    #[test]
    fn test_refresh_redetect() {
        let env = TestEnv::new();
        let manager = Manager::new(&env.settings, &env.host);
        let iso = env.ubuntu_server_iso();
        manager.add(&iso, &forced()).unwrap();

        fs::remove_dir_all(bootfiles::boot_dir(
            &env.settings,
            ImageKind::Iso,
            "ubuntu-24.04-server",
        ))
        .unwrap();

        assert_eq!(manager.refresh(false).unwrap(), 0);
        assert_eq!(manager.refresh(true).unwrap(), 1);

        let image = Registry::new(&env.settings)
            .get(ImageKind::Iso, "ubuntu-24.04-server")
            .unwrap();
        assert!(bootfiles::present(&env.settings, &image));
    }
}
