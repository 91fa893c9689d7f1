use std::path::PathBuf;

use log::debug;
use types::ImageKind;

/// A completed side effect of a registration
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Step {
    StoredImage(PathBuf),
    CreatedDir(PathBuf),
    BootFiles { kind: ImageKind, name: String },
    FstabLine(PathBuf),
    Mounted(PathBuf),
    ExportLine(PathBuf),
    HttpLink { kind: ImageKind, name: String },
    MenuEntry { kind: ImageKind, name: String },
    Sidecar { kind: ImageKind, name: String },
}

/// The steps completed so far, undone in reverse order if the operation fails
#[derive(Debug, Default)]
pub(crate) struct Journal {
    steps: Vec<Step>,
}

impl Journal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, step: Step) {
        debug!("Completed {step:?}");
        self.steps.push(step);
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    /// Hands out the steps, most recent first
    pub(crate) fn unwind(self) -> impl Iterator<Item = Step> {
        self.steps.into_iter().rev()
    }
}
