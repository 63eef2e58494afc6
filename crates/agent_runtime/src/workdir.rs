//! Scoped per-workflow scratch directories.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A unique working directory under the OS temp root, removed on drop.
///
/// Every workflow gets a fresh one; removal on all exit paths is what keeps
/// retried workflows from observing stale artifacts.
#[derive(Debug)]
pub struct Workdir {
    dir: TempDir,
}

impl Workdir {
    /// Creates a fresh directory with the given prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(prefix: &str) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .tempdir()?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A path inside the workdir.
    #[must_use]
    pub fn join(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_on_drop() {
        let path;
        {
            let workdir = Workdir::create("automl-test").unwrap();
            path = workdir.path().to_path_buf();
            std::fs::write(workdir.join("scratch.bin"), b"x").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
