//! Lexical path helpers.
//!
//! Targets are compared by path, so every path that enters the engine is
//! made absolute and normalized without touching the filesystem.

use std::path::{Component, Path, PathBuf};

/// Join `path` onto `cwd` (if relative) and normalize the result.
pub fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&cwd.join(path))
    }
}

/// Lexically remove `.` components and fold `..` into its parent.
///
/// `..` at the root of an absolute path is dropped; leading `..` of a
/// relative path is preserved.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(comp),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Express absolute `path` relative to absolute directory `start`.
///
/// Returns `.` when the two are equal.
pub fn relpath(path: &Path, start: &Path) -> PathBuf {
    let path: Vec<_> = path.components().collect();
    let start: Vec<_> = start.components().collect();
    let common = path
        .iter()
        .zip(start.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..start.len() {
        rel.push("..");
    }
    for comp in &path[common..] {
        rel.push(comp.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// Deepest directory that contains every path in `paths`.
pub fn common_ancestor<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Option<PathBuf> {
    let mut iter = paths.into_iter();
    let mut common = iter.next()?.to_path_buf();
    for path in iter {
        while !path.starts_with(&common) {
            if !common.pop() {
                return None;
            }
        }
    }
    Some(common)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(normalize(Path::new("../a/./b")), PathBuf::from("../a/b"));
        assert_eq!(normalize(Path::new("a/b/../../..")), PathBuf::from(".."));
    }

    #[test]
    fn absolute_joins_relative_paths() {
        let cwd = Path::new("/work/src");
        assert_eq!(absolute(cwd, Path::new("../out/x.o")), PathBuf::from("/work/out/x.o"));
        assert_eq!(absolute(cwd, Path::new("/etc/./hosts")), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn relpath_walks_up_and_down() {
        assert_eq!(
            relpath(Path::new("/work/a/b.o"), Path::new("/work")),
            PathBuf::from("a/b.o")
        );
        assert_eq!(
            relpath(Path::new("/work/a/b.o"), Path::new("/work/c")),
            PathBuf::from("../a/b.o")
        );
        assert_eq!(relpath(Path::new("/work"), Path::new("/work")), PathBuf::from("."));
    }

    #[test]
    fn common_ancestor_of_siblings() {
        let dirs = [Path::new("/w/a/b"), Path::new("/w/a/c/d"), Path::new("/w/a")];
        assert_eq!(common_ancestor(dirs), Some(PathBuf::from("/w/a")));
        assert_eq!(
            common_ancestor([Path::new("/x/y"), Path::new("/z")]),
            Some(PathBuf::from("/"))
        );
        assert_eq!(common_ancestor(std::iter::empty::<&Path>()), None);
    }
}
