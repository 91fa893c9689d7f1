#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

extern crate alloc;

use alloc::fmt;
use core::str::FromStr;
use std::{
    io,
    path::{Path, PathBuf},
};

/// The kind of a boot image, which is also the namespace its derived resources live in.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, clap::ValueEnum)]
#[clap(rename_all = "lower")]
pub enum ImageKind {
    /// An ISO 9660 installation or live medium
    Iso,

    /// A raw disk or filesystem image
    Img,
}

impl ImageKind {
    /// All the kinds, in the order they are scanned.
    pub const ALL: [Self; 2] = [Self::Iso, Self::Img];

    /// Returns the file extension used for this kind, which doubles as its directory name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Iso => "iso",
            Self::Img => "img",
        }
    }

    /// Figures out the kind of an image from its file extension
    ///
    /// # Errors
    ///
    /// If the extension is missing or isn't one we support
    pub fn from_path(path: &Path) -> Result<Self, PxeError> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| Self::from_str(&ext.to_ascii_lowercase()).ok())
            .ok_or_else(|| PxeError::UnsupportedImage(path.to_path_buf()))
    }
}

impl FromStr for ImageKind {
    type Err = PxeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iso" => Ok(Self::Iso),
            "img" => Ok(Self::Img),
            _ => Err(PxeError::Custom(format!("Unknown image kind: {s}"))),
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Representation of the hardware architecture a boot image targets
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Architecture {
    /// Intel's X86-64 Architecture
    #[default]
    X86_64,

    /// Intel's 32-bit x86 Architecture
    I386,

    /// ARM's AARCH64 Architecture
    Arm64,
}

impl Architecture {
    /// Maps any of the spellings found on installation media to our canonical set.
    ///
    /// Unrecognized values map to [`Architecture::X86_64`].
    #[must_use]
    pub fn normalize(s: &str) -> Self {
        Self::recognize(s).unwrap_or_default()
    }

    /// Like [`Architecture::normalize`], but tells whether the value was recognized at all.
    #[must_use]
    pub fn recognize(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" | "x86-64" | "x64" => Self::X86_64,
            "i386" | "i486" | "i586" | "i686" | "x86" => Self::I386,
            "arm64" | "aarch64" => Self::Arm64,
            _ => return None,
        })
    }

    /// Returns the canonical name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::I386 => "i386",
            Self::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub enum PxeError {
    /// An error has occurred when accessing the local filesystem or files
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    /// An error has occurred when parsing JSON command output
    #[error("JSON Parsing Failure: {0}")]
    Json(#[from] serde_json::Error),

    /// An error has occurred when parsing TOML configuration files
    #[error("Configuration File Format Error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A system call failed
    #[error("System Call Failure: {0}")]
    Nix(#[from] nix::errno::Errno),

    /// One or more required configuration keys are missing
    #[error("Missing required configuration keys: {}", .0.join(", "))]
    MissingSettings(Vec<String>),

    /// A configuration key has an invalid value
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidSetting {
        /// The offending key
        key: String,

        /// What's wrong with it
        reason: String,
    },

    /// The operation requires root privileges
    #[error("This command must be run as root")]
    NotRoot,

    /// A file we were asked to work on doesn't exist
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file isn't an image type we support
    #[error("Unsupported image type: {}", .0.display())]
    UnsupportedImage(PathBuf),

    /// No image with that name is registered
    #[error("No image named {0} is registered")]
    NotRegistered(String),

    /// The name matches several images of different kinds
    #[error("Both an ISO and an IMG are named {0}, pass --kind to pick one")]
    Ambiguous(String),

    /// Making the content of an image available failed
    #[error("Couldn't mount {}: {reason}", .target.display())]
    Mount {
        /// Mount point
        target: PathBuf,

        /// Underlying failure
        reason: String,
    },

    /// An external command exited unsuccessfully
    #[error("Command `{command}` failed ({status}): {stderr}")]
    Command {
        /// Command line
        command: String,

        /// Exit status description
        status: String,

        /// What the command printed on its error output
        stderr: String,
    },

    /// An external command didn't complete in time and was killed
    #[error("Command `{command}` timed out after {secs}s")]
    CommandTimeout {
        /// Command line
        command: String,

        /// Timeout that expired
        secs: u64,
    },

    /// Another instance holds the lock
    #[error("{} is locked by another process", .0.display())]
    Locked(PathBuf),

    /// A metadata sidecar file is malformed
    #[error("Malformed metadata file {}, line {line}", .path.display())]
    Sidecar {
        /// Sidecar path
        path: PathBuf,

        /// Line number, starting at 1
        line: usize,
    },

    /// An unknown error occurred
    #[error("Error: {0}")]
    Custom(String),
}
