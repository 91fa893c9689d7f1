use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use log::{debug, info};
use types::{ImageKind, PxeError};

use crate::{config::Settings, registry::BootImage};

const MAX_SYMLINK_DEPTH: usize = 16;

/// Resolves a path relative to the root of an image, following symlinks
/// without ever leaving that root.
///
/// Returns `None` if the file doesn't exist.
pub(crate) fn resolve_in_root(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut pending: Vec<String> = rel
        .split('/')
        .filter(|c| !c.is_empty())
        .rev()
        .map(str::to_owned)
        .collect();
    let mut current = root.to_path_buf();
    let mut links = 0;

    while let Some(part) = pending.pop() {
        match part.as_str() {
            "." => continue,
            ".." => {
                if current != root {
                    current.pop();
                }
                continue;
            }
            _ => {}
        }

        let candidate = current.join(&part);
        let meta = fs::symlink_metadata(&candidate).ok()?;

        if !meta.file_type().is_symlink() {
            current = candidate;
            continue;
        }

        links += 1;
        if links > MAX_SYMLINK_DEPTH {
            debug!("Too many symlinks resolving {rel}");
            return None;
        }

        let target = fs::read_link(&candidate).ok()?;
        if target.is_absolute() {
            current = root.to_path_buf();
        }

        for comp in target.components().rev() {
            match comp {
                Component::Normal(c) => pending.push(c.to_string_lossy().into_owned()),
                Component::ParentDir => pending.push(String::from("..")),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
    }

    current.exists().then_some(current)
}

/// Returns whether a file exists in the image, symlinks included
pub(crate) fn exists_in_root(root: &Path, rel: &str) -> bool {
    resolve_in_root(root, rel).is_some_and(|p| p.is_file())
}

pub(crate) fn boot_dir(settings: &Settings, kind: ImageKind, name: &str) -> PathBuf {
    settings.kernels_dir(kind).join(name)
}

fn file_name(rel: &str) -> Option<&str> {
    rel.rsplit('/').find(|c| !c.is_empty())
}

/// Path of the extracted kernel, relative to the TFTP root
pub(crate) fn kernel_url(image: &BootImage) -> Option<String> {
    let name = file_name(&image.kernel_path)?;
    Some(format!("/kernels/{}/{}/{name}", image.kind, image.name))
}

/// Path of the extracted initrd, relative to the TFTP root
pub(crate) fn initrd_url(image: &BootImage) -> Option<String> {
    let name = file_name(&image.initrd_path)?;
    Some(format!("/kernels/{}/{}/{name}", image.kind, image.name))
}

fn expected_files(settings: &Settings, image: &BootImage) -> Vec<PathBuf> {
    let dir = boot_dir(settings, image.kind, &image.name);

    [&image.kernel_path, &image.initrd_path]
        .into_iter()
        .filter_map(|p| file_name(p))
        .map(|n| dir.join(n))
        .collect()
}

/// Copies the kernel and initrd out of a mounted image
///
/// Returns `false` if the image doesn't have any kernel to extract.
pub(crate) fn extract(
    settings: &Settings,
    image: &BootImage,
    root: &Path,
) -> Result<bool, PxeError> {
    if !image.has_kernel() {
        debug!("{} has no kernel, nothing to extract", image.name);
        return Ok(false);
    }

    let dir = boot_dir(settings, image.kind, &image.name);
    fs::create_dir_all(&dir)?;

    for rel in [&image.kernel_path, &image.initrd_path] {
        let Some(name) = file_name(rel) else {
            continue;
        };

        let source = resolve_in_root(root, rel).ok_or_else(|| {
            PxeError::NotFound(root.join(rel.trim_start_matches('/')))
        })?;

        let dest = dir.join(name);
        fs::copy(&source, &dest)?;

        debug!("Copied {} to {}", source.display(), dest.display());
    }

    info!("Extracted boot files to {}", dir.display());

    Ok(true)
}

/// Returns whether every boot file of the image is in the TFTP tree
pub(crate) fn present(settings: &Settings, image: &BootImage) -> bool {
    image.has_kernel() && expected_files(settings, image).iter().all(|p| p.is_file())
}

/// Deletes the extracted boot files, if any
pub(crate) fn remove(settings: &Settings, kind: ImageKind, name: &str) -> Result<bool, PxeError> {
    let dir = boot_dir(settings, kind, name);

    match fs::remove_dir_all(&dir) {
        Ok(()) => {
            info!("Removed boot files in {}", dir.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
