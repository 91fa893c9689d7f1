use core::cell::RefCell;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use types::{Architecture, ImageKind, PxeError};

use crate::{
    bootfiles,
    config::Settings,
    detect::Detection,
    host::{Host, Inspection, LoopInfo, MenuCheck, MountInfo},
    mount::MountStrategy,
    registry::{BootImage, Registry},
};

#[derive(Debug)]
struct FakeInspection {
    root: PathBuf,
    _empty: Option<TempDir>,
}

impl Inspection for FakeInspection {
    fn root(&self) -> &Path {
        &self.root
    }
}

#[derive(Debug, Default)]
struct State {
    mounts: Vec<MountInfo>,
    contents: HashMap<String, PathBuf>,
    fail_mount: bool,
    fail_inspect: bool,
    menu_check: Option<MenuCheck>,
    loops: Vec<LoopInfo>,
    detached: Vec<PathBuf>,
    reloads: usize,
    restarts: Vec<String>,
}

/// In-memory stand-in for the system, images being directories
#[derive(Debug, Default)]
pub(crate) struct FakeHost {
    state: RefCell<State>,
}

impl FakeHost {
    /// Makes the given directory the content of the image files holding that key
    pub(crate) fn set_content(&self, key: &str, dir: &Path) {
        self.state
            .borrow_mut()
            .contents
            .insert(key.to_owned(), dir.to_path_buf());
    }

    pub(crate) fn fail_mount(&self, fail: bool) {
        self.state.borrow_mut().fail_mount = fail;
    }

    pub(crate) fn fail_inspect(&self, fail: bool) {
        self.state.borrow_mut().fail_inspect = fail;
    }

    pub(crate) fn set_menu_check(&self, check: MenuCheck) {
        self.state.borrow_mut().menu_check = Some(check);
    }

    pub(crate) fn add_loop(&self, device: &str, backing_file: &Path) {
        self.state.borrow_mut().loops.push(LoopInfo {
            device: PathBuf::from(device),
            backing_file: Some(backing_file.to_path_buf()),
        });
    }

    pub(crate) fn add_mount(&self, source: &Path, target: &Path) {
        self.state.borrow_mut().mounts.push(MountInfo {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
    }

    pub(crate) fn mount_count(&self, target: &Path) -> usize {
        self.state
            .borrow()
            .mounts
            .iter()
            .filter(|m| m.target == target)
            .count()
    }

    pub(crate) fn mounted(&self) -> Vec<PathBuf> {
        self.state
            .borrow()
            .mounts
            .iter()
            .map(|m| m.target.clone())
            .collect()
    }

    pub(crate) fn detached(&self) -> Vec<PathBuf> {
        self.state.borrow().detached.clone()
    }

    pub(crate) fn reloads(&self) -> usize {
        self.state.borrow().reloads
    }

    pub(crate) fn restarts(&self) -> Vec<String> {
        self.state.borrow().restarts.clone()
    }
}

impl Host for FakeHost {
    fn inspect(
        &self,
        image: &Path,
        _strategy: &MountStrategy,
    ) -> Result<Box<dyn Inspection>, PxeError> {
        let state = self.state.borrow();

        if state.fail_inspect {
            return Err(PxeError::Mount {
                target: image.to_path_buf(),
                reason: String::from("corrupt image"),
            });
        }

        // Image files hold the key of their content
        let key = String::from_utf8_lossy(&fs::read(image)?).into_owned();

        let inspection = match state.contents.get(&key) {
            Some(root) => FakeInspection {
                root: root.clone(),
                _empty: None,
            },
            None => {
                let empty = TempDir::new()?;
                FakeInspection {
                    root: empty.path().to_path_buf(),
                    _empty: Some(empty),
                }
            }
        };

        Ok(Box::new(inspection))
    }

    fn mount(
        &self,
        image: &Path,
        target: &Path,
        _strategy: &MountStrategy,
    ) -> Result<(), PxeError> {
        if self.state.borrow().fail_mount {
            return Err(PxeError::Mount {
                target: target.to_path_buf(),
                reason: String::from("wrong fs type"),
            });
        }

        self.add_mount(image, target);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), PxeError> {
        let mut state = self.state.borrow_mut();
        let before = state.mounts.len();
        state.mounts.retain(|m| m.target != target);

        if state.mounts.len() == before {
            return Err(PxeError::Mount {
                target: target.to_path_buf(),
                reason: String::from("not mounted"),
            });
        }

        Ok(())
    }

    fn mounts(&self) -> Result<Vec<MountInfo>, PxeError> {
        Ok(self.state.borrow().mounts.clone())
    }

    fn reload_exports(&self) -> Result<(), PxeError> {
        self.state.borrow_mut().reloads += 1;
        Ok(())
    }

    fn restart_service(&self, name: &str) -> Result<(), PxeError> {
        self.state.borrow_mut().restarts.push(name.to_owned());
        Ok(())
    }

    fn service_state(&self, _name: &str) -> String {
        String::from("active")
    }

    fn check_menu(&self, _path: &Path) -> MenuCheck {
        self.state
            .borrow()
            .menu_check
            .clone()
            .unwrap_or(MenuCheck::Unavailable)
    }

    fn loop_devices(&self) -> Result<Vec<LoopInfo>, PxeError> {
        Ok(self.state.borrow().loops.clone())
    }

    fn detach_loop(&self, device: &Path) -> Result<(), PxeError> {
        let mut state = self.state.borrow_mut();
        state.loops.retain(|l| l.device != device);
        state.detached.push(device.to_path_buf());
        Ok(())
    }
}

/// Settings rooted in a scratch directory, along with a fake host
#[derive(Debug)]
pub(crate) struct TestEnv {
    pub(crate) dir: TempDir,
    pub(crate) settings: Settings,
    pub(crate) host: FakeHost,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        Self::with_config("")
    }

    pub(crate) fn with_config(extra: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().display();

        let config = format!(
            "[paths]\n\
             project_dir = \"{root}/project\"\n\
             tftp_root = \"{root}/tftp\"\n\
             nfs_root = \"{root}/nfs\"\n\
             http_root = \"{root}/http\"\n\
             exports_file = \"{root}/etc/exports\"\n\
             fstab_file = \"{root}/etc/fstab\"\n\
             lock_dir = \"{root}/lock\"\n\
             \n\
             [network]\n\
             server_ip = \"192.168.1.10\"\n\
             subnet = \"192.168.1.0/24\"\n\
             \n\
             {extra}"
        );

        let settings = Settings::from_toml_str(&config).unwrap();

        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(&settings.exports_file, "").unwrap();
        fs::write(&settings.fstab_file, "").unwrap();

        Self {
            dir,
            settings,
            host: FakeHost::default(),
        }
    }

    /// Writes a directory tree standing for the content of an image
    pub(crate) fn tree(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.dir.path().join("trees").join(name);

        for (path, content) in files {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fs::create_dir_all(&root).unwrap();
        root
    }

    /// Writes an image file in the scratch directory, backed by a tree
    pub(crate) fn image_file(&self, file_name: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.tree(file_name, files);
        self.host.set_content(file_name, &root);

        let incoming = self.dir.path().join("incoming");
        fs::create_dir_all(&incoming).unwrap();

        let path = incoming.join(file_name);
        fs::write(&path, file_name).unwrap();
        path
    }

    /// An Ubuntu server ISO, as found on the release media
    pub(crate) fn ubuntu_server_iso(&self) -> PathBuf {
        self.image_file(
            "ubuntu-24.04-server.iso",
            &[
                (".disk/info", "Ubuntu 24.04 LTS Server amd64"),
                ("casper/vmlinuz", "kernel"),
                ("casper/initrd", "initrd"),
            ],
        )
    }

    /// Puts the boot files of an image in the TFTP tree
    pub(crate) fn extract_boot_files(&self, image: &BootImage) {
        let dir = bootfiles::boot_dir(&self.settings, image.kind, &image.name);
        fs::create_dir_all(&dir).unwrap();

        for rel in [&image.kernel_path, &image.initrd_path] {
            if let Some(name) = rel.rsplit('/').next().filter(|n| !n.is_empty()) {
                fs::write(dir.join(name), name).unwrap();
            }
        }
    }

    /// Every regular file below the scratch directory that isn't a backup or a lock, with its content
    pub(crate) fn snapshot(&self) -> Vec<(PathBuf, String)> {
        let mut files: Vec<_> = walkdir::WalkDir::new(self.dir.path())
            .sort_by_file_name()
            .into_iter()
            .map(Result::unwrap)
            .filter(|e| !e.file_type().is_dir())
            .filter(|e| {
                let name = e.file_name().to_string_lossy();
                !name.contains(".bak.") && !name.ends_with(".lock")
            })
            .map(|e| {
                let content = fs::read_to_string(e.path()).unwrap_or_default();
                (e.path().to_path_buf(), content)
            })
            .collect();

        files.sort();
        files
    }
}

/// The registration an Ubuntu server ISO ends up with
pub(crate) fn ubuntu_server_image(env: &TestEnv) -> BootImage {
    let registry = Registry::new(&env.settings);
    let name = "ubuntu-24.04-server";

    BootImage::new(
        ImageKind::Iso,
        name,
        &registry.image_path(ImageKind::Iso, name),
        Detection {
            distro: String::from("ubuntu-server"),
            version: String::from("24.04"),
            arch: Architecture::X86_64,
            release_name: String::from("unknown"),
            kernel_path: String::from("casper/vmlinuz"),
            initrd_path: String::from("casper/initrd"),
            boot_params: String::from(
                "boot=casper netboot=nfs nfsroot=@SERVER@:@NFS_ROOT@/@NAME@ ip=dhcp ---",
            ),
        },
        None,
    )
}
