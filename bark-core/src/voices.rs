//! Speaker name → bundle resolution over a directory of `.npz` files.

use std::path::{Path, PathBuf};

use crate::bundle::{load_bundle, VoiceBundle, BUNDLE_EXTENSION};
use crate::error::{BarkError, Result};

#[derive(Debug, Clone)]
pub struct VoiceLibrary {
    dir: PathBuf,
}

impl VoiceLibrary {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a name or path refers to, if it exists.
    pub fn locate(&self, name_or_path: &str) -> Option<PathBuf> {
        let direct = Path::new(name_or_path);
        if direct.extension().and_then(|e| e.to_str()) == Some(BUNDLE_EXTENSION) {
            return direct.is_file().then(|| direct.to_path_buf());
        }
        let named = self.dir.join(format!("{name_or_path}.{BUNDLE_EXTENSION}"));
        named.is_file().then_some(named)
    }

    /// Accepts a `.npz` path or a speaker name such as `v2/en_speaker_6`.
    pub fn resolve(&self, name_or_path: &str) -> Result<VoiceBundle> {
        match self.locate(name_or_path) {
            Some(path) => load_bundle(path),
            None => Err(BarkError::Input(format!(
                "unknown voice `{name_or_path}` (looked in {})",
                self.dir.display()
            ))),
        }
    }

    /// Sorted speaker names directly under the directory or one level below.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.dir.is_dir() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                let Some(prefix) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                for inner in std::fs::read_dir(&path)? {
                    if let Some(stem) = bundle_stem(&inner?.path()) {
                        names.push(format!("{prefix}/{stem}"));
                    }
                }
            } else if let Some(stem) = bundle_stem(&path) {
                names.push(stem);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn bundle_stem(path: &Path) -> Option<String> {
    if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(BUNDLE_EXTENSION) {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str()).map(str::to_owned)
}
