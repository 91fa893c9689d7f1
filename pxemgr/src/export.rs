use std::{
    fs, io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use types::{ImageKind, PxeError};
use walkdir::WalkDir;

use crate::{
    config::{HttpLinkMode, Settings},
    host::Host,
    journal::{Journal, Step},
    mount::MountStrategy,
    textfile::TextFile,
};

const EXPORT_OPTIONS: &str = "ro,sync,no_subtree_check,no_root_squash";

/// Path field of an fstab line, if it has one
fn fstab_target(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    line.split_whitespace().nth(1)
}

/// Path field of an exports line, if it has one
fn export_path(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    line.split_whitespace().next()
}

pub(crate) fn fstab_line(image: &Path, mnt: &Path, strategy: &MountStrategy) -> String {
    format!(
        "{} {} {} {} 0 0",
        image.display(),
        mnt.display(),
        strategy.fstab_type(),
        strategy.fstab_options()
    )
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Makes registered images reachable: NFS mount and export, fstab entry and HTTP link
#[derive(Debug)]
pub(crate) struct Exporter<'a, H: Host + ?Sized> {
    settings: &'a Settings,
    host: &'a H,
}

impl<'a, H: Host + ?Sized> Exporter<'a, H> {
    pub(crate) fn new(settings: &'a Settings, host: &'a H) -> Self {
        Self { settings, host }
    }

    pub(crate) fn mount_point(&self, kind: ImageKind, name: &str) -> PathBuf {
        self.settings.nfs_dir(kind).join(name)
    }

    pub(crate) fn http_link(&self, kind: ImageKind, name: &str) -> PathBuf {
        self.settings.http_dir(kind).join(name)
    }

    fn fstab(&self) -> TextFile<'a> {
        TextFile::new(&self.settings.fstab_file, &self.settings.lock_dir)
    }

    fn exports(&self) -> TextFile<'a> {
        TextFile::new(&self.settings.exports_file, &self.settings.lock_dir)
    }

    pub(crate) fn export_line(&self, mnt: &Path) -> String {
        format!("{} {}({EXPORT_OPTIONS})", mnt.display(), self.settings.subnet)
    }

    /// Replaces any line for that mount point by ours
    pub(crate) fn add_fstab(
        &self,
        image: &Path,
        mnt: &Path,
        strategy: &MountStrategy,
    ) -> Result<bool, PxeError> {
        let target = path_str(mnt);
        let line = fstab_line(image, mnt, strategy);

        let changed = self.fstab().edit_lines(|lines| {
            lines.retain(|l| fstab_target(l) != Some(target.as_str()));
            lines.push(line);
        })?;

        if changed {
            debug!("Added fstab entry for {}", mnt.display());
        }

        Ok(changed)
    }

    pub(crate) fn remove_fstab(&self, mnt: &Path) -> Result<bool, PxeError> {
        let target = path_str(mnt);

        self.fstab()
            .edit_lines(|lines| lines.retain(|l| fstab_target(l) != Some(target.as_str())))
    }

    pub(crate) fn add_export(&self, mnt: &Path) -> Result<bool, PxeError> {
        let target = path_str(mnt);
        let line = self.export_line(mnt);

        self.exports().edit_lines(|lines| {
            lines.retain(|l| export_path(l) != Some(target.as_str()));
            lines.push(line);
        })
    }

    pub(crate) fn remove_export(&self, mnt: &Path) -> Result<bool, PxeError> {
        let target = path_str(mnt);

        self.exports()
            .edit_lines(|lines| lines.retain(|l| export_path(l) != Some(target.as_str())))
    }

    fn count_matching(
        file: &TextFile<'_>,
        mnt: &Path,
        field: fn(&str) -> Option<&str>,
    ) -> Result<usize, PxeError> {
        let target = path_str(mnt);

        Ok(file
            .read()?
            .lines()
            .filter(|l| field(l) == Some(target.as_str()))
            .count())
    }

    pub(crate) fn fstab_count(&self, mnt: &Path) -> Result<usize, PxeError> {
        Self::count_matching(&self.fstab(), mnt, fstab_target)
    }

    pub(crate) fn export_count(&self, mnt: &Path) -> Result<usize, PxeError> {
        Self::count_matching(&self.exports(), mnt, export_path)
    }

    pub(crate) fn has_fstab(&self, mnt: &Path) -> Result<bool, PxeError> {
        Ok(self.fstab_count(mnt)? > 0)
    }

    pub(crate) fn has_export(&self, mnt: &Path) -> Result<bool, PxeError> {
        Ok(self.export_count(mnt)? > 0)
    }

    fn managed(&self, paths: Vec<PathBuf>) -> Vec<(ImageKind, String, PathBuf)> {
        paths
            .into_iter()
            .filter_map(|p| {
                ImageKind::ALL.into_iter().find_map(|kind| {
                    let rel = p.strip_prefix(self.settings.nfs_dir(kind)).ok()?;
                    let name = rel.to_str().filter(|n| !n.is_empty() && !n.contains('/'))?;
                    Some((kind, name.to_owned(), p.clone()))
                })
            })
            .collect()
    }

    /// fstab mount points living in our NFS tree
    pub(crate) fn fstab_entries(&self) -> Result<Vec<(ImageKind, String, PathBuf)>, PxeError> {
        let paths = self
            .fstab()
            .read()?
            .lines()
            .filter_map(fstab_target)
            .map(PathBuf::from)
            .collect();

        Ok(self.managed(paths))
    }

    /// Exported paths living in our NFS tree
    pub(crate) fn export_entries(&self) -> Result<Vec<(ImageKind, String, PathBuf)>, PxeError> {
        let paths = self
            .exports()
            .read()?
            .lines()
            .filter_map(export_path)
            .map(PathBuf::from)
            .collect();

        Ok(self.managed(paths))
    }

    /// Reloads the NFS exports, a failure only deserves a warning
    pub(crate) fn reload(&self) {
        if let Err(e) = self.host.reload_exports() {
            warn!("Couldn't reload the NFS exports: {e}");
        }
    }

    /// Persistent mount and NFS export of an image.
    ///
    /// Every completed step is recorded so that a later failure can undo it.
    pub(crate) fn register_nfs(
        &self,
        kind: ImageKind,
        name: &str,
        image: &Path,
        strategy: &MountStrategy,
        journal: &mut Journal,
    ) -> Result<(), PxeError> {
        let mnt = self.mount_point(kind, name);

        if !mnt.exists() {
            fs::create_dir_all(&mnt)?;
            journal.record(Step::CreatedDir(mnt.clone()));
        }

        self.add_fstab(image, &mnt, strategy)?;
        journal.record(Step::FstabLine(mnt.clone()));

        if self.host.is_mounted(&mnt)? {
            debug!("{} is already mounted", mnt.display());
        } else {
            self.host.mount(image, &mnt, strategy)?;
            journal.record(Step::Mounted(mnt.clone()));
        }

        self.add_export(&mnt)?;
        journal.record(Step::ExportLine(mnt.clone()));
        self.reload();

        info!("Exported {} over NFS", mnt.display());

        Ok(())
    }

    /// Exact inverse of [`Exporter::register_nfs`], tolerating missing pieces
    pub(crate) fn unregister_nfs(&self, kind: ImageKind, name: &str) -> Result<(), PxeError> {
        let mnt = self.mount_point(kind, name);

        if self.host.is_mounted(&mnt)? {
            self.host.unmount(&mnt)?;
            info!("Unmounted {}", mnt.display());
        }

        let fstab = self.remove_fstab(&mnt)?;
        let export = self.remove_export(&mnt)?;

        if export {
            self.reload();
        }

        if fstab || export {
            info!("Removed the NFS export of {}", mnt.display());
        }

        remove_empty_dir(&mnt);

        Ok(())
    }

    /// Publishes the mount point in the HTTP tree
    pub(crate) fn register_http(
        &self,
        kind: ImageKind,
        name: &str,
        journal: &mut Journal,
    ) -> Result<(), PxeError> {
        let link = self.http_link(kind, name);
        let target = self.mount_point(kind, name);

        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }

        match self.settings.http_link {
            HttpLinkMode::Symlink => {
                if fs::read_link(&link).is_ok_and(|t| t == target) {
                    debug!("{} already points to {}", link.display(), target.display());
                    journal.record(Step::HttpLink {
                        kind,
                        name: name.to_owned(),
                    });
                    return Ok(());
                }

                remove_any(&link)?;
                journal.record(Step::HttpLink {
                    kind,
                    name: name.to_owned(),
                });
                symlink(&target, &link)?;
            }
            HttpLinkMode::Copy => {
                remove_any(&link)?;
                journal.record(Step::HttpLink {
                    kind,
                    name: name.to_owned(),
                });
                copy_tree(&target, &link)?;
            }
        }

        info!("Published {} over HTTP", link.display());

        Ok(())
    }

    pub(crate) fn unregister_http(&self, kind: ImageKind, name: &str) -> Result<bool, PxeError> {
        let link = self.http_link(kind, name);
        let removed = remove_any(&link)?;

        if removed {
            info!("Removed {}", link.display());
        }

        Ok(removed)
    }

    pub(crate) fn has_http(&self, kind: ImageKind, name: &str) -> bool {
        fs::symlink_metadata(self.http_link(kind, name)).is_ok()
    }

    /// Names found in a per-kind directory
    pub(crate) fn dir_names(dir: &Path) -> Result<Vec<String>, PxeError> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }

        names.sort();
        Ok(names)
    }
}

pub(crate) fn remove_empty_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!("Leaving {} in place: {e}", dir.display());
        }
    }
}

/// Removes a file, symlink or directory tree, returns whether anything was there
pub(crate) fn remove_any(path: &Path) -> Result<bool, PxeError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }

    Ok(true)
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), PxeError> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| PxeError::Custom(e.to_string()))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    debug!("Copied {} to {}", source.display(), dest.display());

    Ok(())
}
