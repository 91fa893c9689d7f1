use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use log::{debug, info};
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use tempfile::NamedTempFile;
use types::PxeError;

const MAX_BACKUPS_PER_STAMP: u32 = 1000;

/// An exclusive advisory lock, released when dropped
#[derive(Debug)]
pub(crate) struct FileLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl FileLock {
    fn open(lock_dir: &Path, name: &str) -> Result<(File, PathBuf), PxeError> {
        fs::create_dir_all(lock_dir)?;

        let path = lock_dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        Ok((file, path))
    }

    /// Waits until the lock is ours
    pub(crate) fn acquire(lock_dir: &Path, name: &str) -> Result<Self, PxeError> {
        let (file, path) = Self::open(lock_dir, name)?;

        debug!("Waiting for lock {}", path.display());

        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| e)?;

        Ok(Self { _lock: lock, path })
    }

    /// Takes the lock, or fails right away if someone else holds it
    pub(crate) fn try_acquire(lock_dir: &Path, name: &str) -> Result<Self, PxeError> {
        let (file, path) = Self::open(lock_dir, name)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Took lock {}", path.display());
                Ok(Self { _lock: lock, path })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(PxeError::Locked(path)),
            Err((_, e)) => Err(e.into()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        debug!("Releasing lock {}", self.path.display());
    }
}

/// Writes a file by renaming a temporary sibling over it, keeping the original permissions
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<(), PxeError> {
    let dir = path
        .parent()
        .ok_or_else(|| PxeError::Custom(format!("{} has no parent", path.display())))?;

    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;

    match fs::metadata(path) {
        Ok(meta) => fs::set_permissions(tmp.path(), meta.permissions())?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    tmp.persist(path).map_err(|e| e.error)?;

    debug!("Wrote {}", path.display());

    Ok(())
}

/// Reads a text file, a missing file being empty
pub(crate) fn read_or_empty(path: &Path) -> Result<String, PxeError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

fn backup_timestamp() -> String {
    jiff::Zoned::now().strftime("%Y%m%d-%H%M%S").to_string()
}

/// Copies a file next to itself with a timestamped suffix.
///
/// Backups taken within the same second get a counter appended, an
/// existing backup is never overwritten.
pub(crate) fn backup(path: &Path) -> Result<Option<PathBuf>, PxeError> {
    if !path.exists() {
        return Ok(None);
    }

    let stamp = backup_timestamp();

    for n in 0..MAX_BACKUPS_PER_STAMP {
        let mut name = path.as_os_str().to_owned();
        if n == 0 {
            name.push(format!(".bak.{stamp}"));
        } else {
            name.push(format!(".bak.{stamp}.{n}"));
        }
        let dest = PathBuf::from(name);

        let mut out = match OpenOptions::new().write(true).create_new(true).open(&dest) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        };

        io::copy(&mut File::open(path)?, &mut out)?;
        info!("Backed up {} to {}", path.display(), dest.display());

        return Ok(Some(dest));
    }

    Err(PxeError::Custom(format!(
        "Too many backups of {} at {stamp}",
        path.display()
    )))
}

/// A shared text file we only modify under its lock
#[derive(Debug)]
pub(crate) struct TextFile<'a> {
    path: &'a Path,
    lock_dir: &'a Path,
    backup: bool,
}

impl<'a> TextFile<'a> {
    pub(crate) fn new(path: &'a Path, lock_dir: &'a Path) -> Self {
        Self {
            path,
            lock_dir,
            backup: false,
        }
    }

    pub(crate) fn with_backup(mut self) -> Self {
        self.backup = true;
        self
    }

    fn lock_name(&self) -> String {
        let name = self
            .path
            .file_name()
            .map_or_else(|| String::from("file"), |n| n.to_string_lossy().into_owned());

        format!("{name}.lock")
    }

    pub(crate) fn read(&self) -> Result<String, PxeError> {
        read_or_empty(self.path)
    }

    /// Runs a read-modify-write cycle, returns whether the file changed
    pub(crate) fn edit<F>(&self, f: F) -> Result<bool, PxeError>
    where
        F: FnOnce(&str) -> Result<String, PxeError>,
    {
        let _lock = FileLock::acquire(self.lock_dir, &self.lock_name())?;

        let existed = self.path.exists();
        let before = self.read()?;
        let after = f(&before)?;

        if before == after && (existed || after.is_empty()) {
            debug!("{} is unchanged", self.path.display());
            return Ok(false);
        }

        if self.backup {
            backup(self.path)?;
        }

        write_atomic(self.path, &after)?;
        Ok(true)
    }

    /// Same as [`TextFile::edit`], on the lines of the file
    pub(crate) fn edit_lines<F>(&self, f: F) -> Result<bool, PxeError>
    where
        F: FnOnce(&mut Vec<String>),
    {
        self.edit(|content| {
            let mut lines: Vec<String> = content.lines().map(str::to_owned).collect();
            f(&mut lines);

            let mut out = lines.join("\n");
            if !out.is_empty() {
                out.push('\n');
            }

            Ok(out)
        })
    }
}
