//! Do-file lookup.
//!
//! For a target `dir/foo.bar.c` the candidates are tried in this order:
//!
//! | do-file                  | `$1` (base)   | `$2` (ext) |
//! |--------------------------|---------------|------------|
//! | `dir/foo.bar.c.do`       | `foo.bar.c`   | ``         |
//! | `dir/default.bar.c.do`   | `foo`         | `.bar.c`   |
//! | `dir/default.c.do`       | `foo.bar`     | `.c`       |
//! | `dir/default.do`         | `foo.bar.c`   | ``         |
//!
//! The first one that exists wins.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::verbose::ddprintln;

/// One possible do-file for a target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Absolute path of the do-file.
    pub do_file: PathBuf,
    /// Target path with the matched extension removed, directory preserved.
    pub base_name: PathBuf,
    /// Extension the do-file matched, with its leading `.`, or empty.
    pub ext: String,
}

/// The do-file named exactly after `target` (`<target>.do`).
pub fn exact_do_file(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".do");
    PathBuf::from(name)
}

/// Iterator over the do-file candidates for one target, most specific first.
pub struct Candidates {
    target: PathBuf,
    dir: PathBuf,
    segments: Vec<String>,
    /// 0 = the exact `<target>.do`; `i >= 1` = `default` with `i` segments consumed.
    next: usize,
}

/// Enumerate the do-files that could build `target`.
pub fn candidates(target: &Path) -> Candidates {
    let dir = target.parent().map(Path::to_path_buf).unwrap_or_default();
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Candidates {
        target: target.to_path_buf(),
        dir,
        segments: file_name.split('.').map(str::to_string).collect(),
        next: 0,
    }
}

impl Iterator for Candidates {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        let i = self.next;
        if i > self.segments.len() {
            return None;
        }
        self.next += 1;

        if i == 0 {
            return Some(Candidate {
                do_file: exact_do_file(&self.target),
                base_name: self.target.clone(),
                ext: String::new(),
            });
        }

        let base = self.segments[..i].join(".");
        let rest = &self.segments[i..];
        let ext = if rest.is_empty() {
            String::new()
        } else {
            format!(".{}", rest.join("."))
        };
        Some(Candidate {
            do_file: self.dir.join(format!("default{ext}.do")),
            base_name: self.dir.join(base),
            ext,
        })
    }
}

/// Outcome of probing one candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// The do-file exists and will be used.
    Found,
    /// The do-file does not exist (yet).
    Absent,
}

/// Find the do-file for `target`, reporting every probe to `on_probe`.
///
/// Stops at the first candidate that exists. Returns `None` if none does.
pub fn find_do_file(
    target: &Path,
    mut on_probe: impl FnMut(&Candidate, Probe) -> Result<()>,
) -> Result<Option<Candidate>> {
    for candidate in candidates(target) {
        ddprintln!("{}: {} ?", target.display(), candidate.do_file.display());
        if candidate.do_file.is_file() {
            on_probe(&candidate, Probe::Found)?;
            return Ok(Some(candidate));
        }
        on_probe(&candidate, Probe::Absent)?;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(target: &str) -> Vec<(String, String, String)> {
        candidates(Path::new(target))
            .map(|c| {
                (
                    c.do_file.display().to_string(),
                    c.base_name.display().to_string(),
                    c.ext,
                )
            })
            .collect()
    }

    fn triple(a: &str, b: &str, c: &str) -> (String, String, String) {
        (a.into(), b.into(), c.into())
    }

    #[test]
    fn cascade_order_for_multi_extension_target() {
        assert_eq!(
            names("/p/foo.bar.c"),
            vec![
                triple("/p/foo.bar.c.do", "/p/foo.bar.c", ""),
                triple("/p/default.bar.c.do", "/p/foo", ".bar.c"),
                triple("/p/default.c.do", "/p/foo.bar", ".c"),
                triple("/p/default.do", "/p/foo.bar.c", ""),
            ]
        );
    }

    #[test]
    fn plain_name_has_two_candidates() {
        assert_eq!(
            names("/p/all"),
            vec![
                triple("/p/all.do", "/p/all", ""),
                triple("/p/default.do", "/p/all", ""),
            ]
        );
    }

    #[test]
    fn dotfile_target() {
        assert_eq!(
            names("/p/.hidden"),
            vec![
                triple("/p/.hidden.do", "/p/.hidden", ""),
                triple("/p/default.hidden.do", "/p/", ".hidden"),
                triple("/p/default.do", "/p/.hidden", ""),
            ]
        );
    }

    #[test]
    fn picks_first_existing_and_reports_probes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("default.c.do"), "").unwrap();
        std::fs::write(dir.path().join("default.do"), "").unwrap();
        let target = dir.path().join("a.b.c");

        let mut probes = Vec::new();
        let found = find_do_file(&target, |c, probe| {
            probes.push((c.do_file.file_name().unwrap().to_string_lossy().into_owned(), probe));
            Ok(())
        })
        .unwrap()
        .unwrap();

        assert_eq!(found.do_file, dir.path().join("default.c.do"));
        assert_eq!(found.base_name, dir.path().join("a.b"));
        assert_eq!(found.ext, ".c");
        assert_eq!(
            probes,
            vec![
                ("a.b.c.do".to_string(), Probe::Absent),
                ("default.b.c.do".to_string(), Probe::Absent),
                ("default.c.do".to_string(), Probe::Found),
            ]
        );
    }

    #[test]
    fn no_rule_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut absent = 0;
        let found = find_do_file(&dir.path().join("x.y"), |_, probe| {
            assert_eq!(probe, Probe::Absent);
            absent += 1;
            Ok(())
        })
        .unwrap();
        assert!(found.is_none());
        assert_eq!(absent, 3);
    }
}
