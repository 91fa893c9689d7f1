use alloc::collections::BTreeSet;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use jiff::Timestamp;
use log::{debug, info};
use once_cell::sync::Lazy;
use probe::FilesystemKind;
use regex::Regex;
use types::{Architecture, ImageKind, PxeError};

use crate::{config::Settings, detect::Detection, mount::ImgType, textfile::write_atomic};

const SIDECAR_EXTENSION: &str = "info";

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+-]*$").expect("Invalid regex"));

/// Checks that a name can be used in paths, fstab and exports lines and menu sentinels
pub(crate) fn validate_name(name: &str) -> Result<(), PxeError> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(PxeError::InvalidSetting {
            key: String::from("name"),
            reason: format!(
                "{name:?} may only contain letters, digits, dots, dashes, underscores and plus signs"
            ),
        })
    }
}

/// What we know about how an IMG is laid out
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ImgDetails {
    pub(crate) img_type: ImgType,
    pub(crate) fs_type: Option<FilesystemKind>,
    pub(crate) part_offset: Option<u64>,
    pub(crate) part_size: Option<u64>,
}

/// A registered image and its metadata
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct BootImage {
    pub(crate) name: String,
    pub(crate) kind: ImageKind,
    pub(crate) source: PathBuf,
    pub(crate) distro: String,
    pub(crate) version: String,
    pub(crate) arch: Architecture,
    pub(crate) release_name: String,
    pub(crate) kernel_path: String,
    pub(crate) initrd_path: String,
    pub(crate) boot_params: String,
    pub(crate) img: Option<ImgDetails>,
    pub(crate) added: Option<Timestamp>,
}

impl BootImage {
    pub(crate) fn new(
        kind: ImageKind,
        name: &str,
        source: &Path,
        detection: Detection,
        img: Option<ImgDetails>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            source: source.to_path_buf(),
            distro: detection.distro,
            version: detection.version,
            arch: detection.arch,
            release_name: detection.release_name,
            kernel_path: detection.kernel_path,
            initrd_path: detection.initrd_path,
            boot_params: detection.boot_params,
            img,
            added: Some(Timestamp::now()),
        }
    }

    /// Replaces the detected metadata, keeping everything else
    pub(crate) fn update_detection(&mut self, detection: Detection) {
        self.distro = detection.distro;
        self.version = detection.version;
        self.arch = detection.arch;
        self.release_name = detection.release_name;
        self.kernel_path = detection.kernel_path;
        self.initrd_path = detection.initrd_path;
        self.boot_params = detection.boot_params;
    }

    pub(crate) fn has_kernel(&self) -> bool {
        !self.kernel_path.is_empty()
    }

    fn to_sidecar(&self) -> String {
        let mut fields = vec![
            ("DISTRO", self.distro.clone()),
            ("VERSION", self.version.clone()),
            ("ARCH", self.arch.to_string()),
            ("RELEASE_NAME", self.release_name.clone()),
            ("KERNEL_PATH", self.kernel_path.clone()),
            ("INITRD_PATH", self.initrd_path.clone()),
            ("BOOT_PARAMS", self.boot_params.clone()),
        ];

        if let Some(img) = &self.img {
            fields.push(("IMG_TYPE", img.img_type.to_string()));
            fields.push((
                "FS_TYPE",
                img.fs_type
                    .map_or_else(String::new, |fs| fs.mount_type().to_owned()),
            ));

            if let Some(offset) = img.part_offset {
                fields.push(("PART_OFFSET", offset.to_string()));
            }

            if let Some(size) = img.part_size {
                fields.push(("PART_SIZE", size.to_string()));
            }
        }

        if let Some(added) = &self.added {
            fields.push(("ADDED", added.to_string()));
        }

        fields
            .into_iter()
            .map(|(k, v)| format!("{k}=\"{}\"\n", escape(&v)))
            .collect()
    }

    fn from_sidecar(
        kind: ImageKind,
        name: &str,
        source: &Path,
        sidecar: &Path,
        content: &str,
    ) -> Result<Self, PxeError> {
        let mut image = Self::new(kind, name, source, Detection::unknown(), None);
        image.added = None;

        let mut img_type = None;
        let mut fs_type = None;
        let mut part_offset = None;
        let mut part_size = None;

        for (idx, line) in content.lines().enumerate() {
            let malformed = || PxeError::Sidecar {
                path: sidecar.to_path_buf(),
                line: idx + 1,
            };

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(malformed)?;
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(malformed)
                .and_then(|v| unescape(v).ok_or_else(malformed))?;

            match key {
                "DISTRO" => image.distro = value,
                "VERSION" => image.version = value,
                "ARCH" => image.arch = Architecture::normalize(&value),
                "RELEASE_NAME" => image.release_name = value,
                "KERNEL_PATH" => image.kernel_path = value,
                "INITRD_PATH" => image.initrd_path = value,
                "BOOT_PARAMS" => image.boot_params = value,
                "IMG_TYPE" => {
                    img_type = Some(value.parse::<ImgType>().map_err(|_e| malformed())?);
                }
                "FS_TYPE" => fs_type = FilesystemKind::from_mount_type(&value),
                "PART_OFFSET" => part_offset = Some(value.parse().map_err(|_e| malformed())?),
                "PART_SIZE" => part_size = Some(value.parse().map_err(|_e| malformed())?),
                "ADDED" => image.added = value.parse().ok(),
                other => debug!("Ignoring unknown key {other} in {}", sidecar.display()),
            }
        }

        if kind == ImageKind::Img {
            image.img = Some(ImgDetails {
                img_type: img_type.unwrap_or(ImgType::Filesystem),
                fs_type,
                part_offset,
                part_size,
            });
        }

        Ok(image)
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '\\' | '"' | '$' | '`' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }

    out
}

fn unescape(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                other => out.push(other),
            },
            '"' => return None,
            _ => out.push(c),
        }
    }

    Some(out)
}

/// A registration slot, whether its metadata could be read or not
#[derive(Debug)]
pub(crate) struct ScanEntry {
    pub(crate) kind: ImageKind,
    pub(crate) name: String,
    pub(crate) image: Result<BootImage, PxeError>,
}

/// The sidecar files next to the stored images
#[derive(Debug)]
pub(crate) struct Registry<'a> {
    settings: &'a Settings,
}

impl<'a> Registry<'a> {
    pub(crate) fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    pub(crate) fn image_path(&self, kind: ImageKind, name: &str) -> PathBuf {
        self.settings
            .artifacts_dir(kind)
            .join(format!("{name}.{}", kind.as_str()))
    }

    pub(crate) fn sidecar_path(&self, kind: ImageKind, name: &str) -> PathBuf {
        self.settings
            .artifacts_dir(kind)
            .join(format!("{name}.{SIDECAR_EXTENSION}"))
    }

    /// Returns whether anything is stored under that name and kind
    pub(crate) fn exists(&self, kind: ImageKind, name: &str) -> bool {
        self.image_path(kind, name).exists() || self.sidecar_path(kind, name).exists()
    }

    /// Lists the kinds under which that name is registered
    pub(crate) fn find(&self, name: &str) -> Vec<ImageKind> {
        ImageKind::ALL
            .into_iter()
            .filter(|k| self.exists(*k, name))
            .collect()
    }

    pub(crate) fn get(&self, kind: ImageKind, name: &str) -> Result<BootImage, PxeError> {
        let sidecar = self.sidecar_path(kind, name);

        let content = match fs::read_to_string(&sidecar) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PxeError::NotFound(sidecar))
            }
            Err(e) => return Err(e.into()),
        };

        BootImage::from_sidecar(
            kind,
            name,
            &self.image_path(kind, name),
            &sidecar,
            &content,
        )
    }

    /// Names registered under a kind, sorted
    pub(crate) fn names(&self, kind: ImageKind) -> Result<BTreeSet<String>, PxeError> {
        let dir = self.settings.artifacts_dir(kind);

        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = BTreeSet::new();
        for entry in entries {
            let path = entry?.path();

            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };

            if ext == kind.as_str() || ext == SIDECAR_EXTENSION {
                names.insert(stem.to_owned());
            }
        }

        Ok(names)
    }

    /// Re-reads every registration
    pub(crate) fn scan(&self) -> Result<Vec<ScanEntry>, PxeError> {
        let mut entries = Vec::new();

        for kind in ImageKind::ALL {
            for name in self.names(kind)? {
                let image = self.get(kind, &name);
                entries.push(ScanEntry { kind, name, image });
            }
        }

        Ok(entries)
    }

    /// Every image whose metadata is readable
    pub(crate) fn images(&self, kind: ImageKind) -> Result<Vec<BootImage>, PxeError> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.image.ok())
            .collect())
    }

    pub(crate) fn save(&self, image: &BootImage) -> Result<PathBuf, PxeError> {
        let path = self.sidecar_path(image.kind, &image.name);
        write_atomic(&path, &image.to_sidecar())?;

        debug!("Saved metadata to {}", path.display());

        Ok(path)
    }

    fn remove_if_exists(path: &Path) -> Result<bool, PxeError> {
        match fs::remove_file(path) {
            Ok(()) => {
                info!("Removed {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn delete_sidecar(&self, kind: ImageKind, name: &str) -> Result<bool, PxeError> {
        Self::remove_if_exists(&self.sidecar_path(kind, name))
    }

    pub(crate) fn delete_image(&self, kind: ImageKind, name: &str) -> Result<bool, PxeError> {
        Self::remove_if_exists(&self.image_path(kind, name))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use probe::FilesystemKind;
    use tempfile::TempDir;
    use test_log::test;
    use types::{Architecture, ImageKind, PxeError};

    use crate::{
        config::Settings,
        detect::Detection,
        mount::ImgType,
        registry::{escape, unescape, validate_name, BootImage, ImgDetails, Registry},
    };

    fn settings(dir: &TempDir) -> Settings {
        let root = dir.path().display();

        Settings::from_toml_str(&format!(
            r#"
            [paths]
            project_dir = "{root}/project"
            tftp_root = "{root}/tftp"
            nfs_root = "{root}/nfs"
            http_root = "{root}/http"

            [network]
            server_ip = "10.0.0.1"
            subnet = "10.0.0.0/24"
            "#
        ))
        .unwrap()
    }

    fn detection() -> Detection {
        Detection {
            distro: String::from("ubuntu-server"),
            version: String::from("24.04"),
            arch: Architecture::X86_64,
            release_name: String::from("Noble \"Numbat\""),
            kernel_path: String::from("casper/vmlinuz"),
            initrd_path: String::from("casper/initrd"),
            boot_params: String::from("nfsroot=@SERVER@:@NFS_ROOT@/@NAME@ $x"),
        }
    }

    #[test]
    fn test_escape() {
        let s = "a \"quoted\" $value with \\ and `ticks`";
        assert_eq!(unescape(&escape(s)).unwrap(), s);
        assert_eq!(unescape("bad\"quote"), None);
    }

    #[test]
    fn test_validate_name() {
        validate_name("ubuntu-24.04-server").unwrap();
        validate_name("rpi_os+lite").unwrap();
        validate_name("has space").unwrap_err();
        validate_name("../escape").unwrap_err();
        validate_name("").unwrap_err();
    }

    #[test]
    fn test_save_and_get_iso() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let registry = Registry::new(&settings);

        let path = registry.image_path(ImageKind::Iso, "ubuntu");
        let image = BootImage::new(ImageKind::Iso, "ubuntu", &path, detection(), None);
        registry.save(&image).unwrap();

        let content =
            fs::read_to_string(registry.sidecar_path(ImageKind::Iso, "ubuntu")).unwrap();
        assert!(content.contains("DISTRO=\"ubuntu-server\"\n"));
        assert!(content.contains("KERNEL_PATH=\"casper/vmlinuz\"\n"));

        assert_eq!(registry.get(ImageKind::Iso, "ubuntu").unwrap(), image);
    }

    #[test]
    fn test_img_details() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let registry = Registry::new(&settings);

        let path = registry.image_path(ImageKind::Img, "rpi");
        let image = BootImage::new(
            ImageKind::Img,
            "rpi",
            &path,
            detection(),
            Some(ImgDetails {
                img_type: ImgType::Partitioned,
                fs_type: Some(FilesystemKind::Ext),
                part_offset: Some(4_194_304),
                part_size: Some(1_048_576),
            }),
        );
        registry.save(&image).unwrap();

        let content = fs::read_to_string(registry.sidecar_path(ImageKind::Img, "rpi")).unwrap();
        assert!(content.contains("IMG_TYPE=\"partitioned\"\n"));
        assert!(content.contains("FS_TYPE=\"ext4\"\n"));
        assert!(content.contains("PART_OFFSET=\"4194304\"\n"));

        assert_eq!(registry.get(ImageKind::Img, "rpi").unwrap(), image);
    }

    #[test]
    fn test_malformed_sidecar() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let registry = Registry::new(&settings);

        let sidecar = registry.sidecar_path(ImageKind::Iso, "broken");
        fs::create_dir_all(sidecar.parent().unwrap()).unwrap();
        fs::write(&sidecar, "DISTRO=\"ubuntu\"\nthis is garbage\n").unwrap();

        assert!(matches!(
            registry.get(ImageKind::Iso, "broken"),
            Err(PxeError::Sidecar { line: 2, .. })
        ));
    }

    #[test]
    fn test_scan_and_find() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let registry = Registry::new(&settings);

        for kind in ImageKind::ALL {
            let path = registry.image_path(kind, "foo");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "data").unwrap();
            registry
                .save(&BootImage::new(kind, "foo", &path, detection(), None))
                .unwrap();
        }

        // Image stored without metadata
        fs::write(registry.image_path(ImageKind::Iso, "orphan"), "data").unwrap();

        let entries = registry.scan().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries
            .iter()
            .any(|e| e.name == "orphan" && matches!(e.image, Err(PxeError::NotFound(_)))));

        assert_eq!(
            registry.find("foo"),
            vec![ImageKind::Iso, ImageKind::Img]
        );
        assert_eq!(registry.find("orphan"), vec![ImageKind::Iso]);
        assert!(registry.find("nothing").is_empty());
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let registry = Registry::new(&settings);

        let path = registry.image_path(ImageKind::Iso, "foo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "data").unwrap();
        registry
            .save(&BootImage::new(ImageKind::Iso, "foo", &path, detection(), None))
            .unwrap();

        assert!(registry.delete_sidecar(ImageKind::Iso, "foo").unwrap());
        assert!(registry.delete_image(ImageKind::Iso, "foo").unwrap());
        assert!(!registry.delete_image(ImageKind::Iso, "foo").unwrap());
        assert!(!registry.exists(ImageKind::Iso, "foo"));
    }
}
