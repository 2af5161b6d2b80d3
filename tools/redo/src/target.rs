//! Target identity.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::paths;

/// A buildable path, identified by its location relative to the build root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    /// Absolute, normalized path on disk.
    path: PathBuf,
    /// Path relative to the build root, `/`-separated. Used as the state key.
    key: String,
}

impl Target {
    /// Identify the target at absolute `path` under build root `base`.
    pub fn new(base: &Path, path: &Path) -> Self {
        let path = paths::normalize(path);
        let key = paths::relpath(&path, base).to_string_lossy().into_owned();
        Self { path, key }
    }

    /// Identify a target from a path as typed by the user in `cwd`.
    pub fn from_arg(base: &Path, cwd: &Path, arg: impl AsRef<Path>) -> Self {
        Self::new(base, &paths::absolute(cwd, arg.as_ref()))
    }

    /// Reconstruct a target from a stored key.
    pub fn from_key(base: &Path, key: &str) -> Self {
        Self::new(base, &base.join(key))
    }

    /// Absolute path of the target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key relative to the build root.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Directory the target lives in; recipes run here.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("/"))
    }

    /// Whether anything exists at the target path.
    pub fn exists(&self) -> bool {
        self.path.symlink_metadata().is_ok()
    }

    /// Sibling path with `suffix` appended to the file name.
    pub fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Path as shown to the user, relative to `start_dir`.
    pub fn display_from(&self, start_dir: &Path) -> String {
        paths::relpath(&self.path, start_dir)
            .to_string_lossy()
            .into_owned()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_relative_to_base() {
        let base = Path::new("/proj");
        let t = Target::from_arg(base, Path::new("/proj/src"), "../out/./a.o");
        assert_eq!(t.path(), Path::new("/proj/out/a.o"));
        assert_eq!(t.key(), "out/a.o");
        assert_eq!(t.dir(), Path::new("/proj/out"));
        assert_eq!(Target::from_key(base, "out/a.o"), t);
    }

    #[test]
    fn display_relative_to_start_dir() {
        let t = Target::new(Path::new("/proj"), Path::new("/proj/out/a.o"));
        assert_eq!(t.display_from(Path::new("/proj/src")), "../out/a.o");
        assert_eq!(t.with_suffix(".redo.tmp"), PathBuf::from("/proj/out/a.o.redo.tmp"));
    }
}
