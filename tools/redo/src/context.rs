//! Build context shared down the redo process tree.
//!
//! The top-level process discovers the build root and fixes the settings.
//! Each recipe it runs gets them through `REDO_*` environment variables, so
//! a nested `redo-ifchange` rebuilds the same context with depth + 1. Inside
//! a process the context is an ordinary value passed by reference. Nothing
//! writes it back into this process's own environment.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::paths;
use crate::state::CONTROL_DIR;
use crate::target::Target;
use crate::verbose::ddprintln;

pub const ENV_BASE: &str = "REDO_BASE";
pub const ENV_STARTDIR: &str = "REDO_STARTDIR";
pub const ENV_DEPTH: &str = "REDO_DEPTH";
pub const ENV_TARGET: &str = "REDO_TARGET";
pub const ENV_DEBUG: &str = "REDO_DEBUG";
pub const ENV_VERBOSE: &str = "REDO_VERBOSE";
pub const ENV_SHUFFLE: &str = "REDO_SHUFFLE";
pub const ENV_REDO: &str = "REDO";

/// Names the executable answers to; the root links each into `.redo/bin`.
pub const TOOL_NAMES: [&str; 3] = ["redo", "redo-ifchange", "redo-ifcreate"];

/// Settings that may come from the command line.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flags {
    pub debug: u8,
    pub verbose: bool,
    pub shuffle: bool,
}

/// Everything a redo process inherits from the invocation that started the tree.
#[derive(Clone, Debug)]
pub struct BuildContext {
    /// Build root: owner of the `.redo` control directory.
    pub base: PathBuf,
    /// Directory the top-level `redo` was started in; messages are relative to it.
    pub start_dir: PathBuf,
    /// Recursion depth; 0 for the top-level process.
    pub depth: usize,
    /// Key of the target whose recipe started this process, if any.
    pub target: Option<String>,
    pub debug: u8,
    pub verbose: bool,
    pub shuffle: bool,
    /// The redo executable, so shims can point at it.
    pub exe: PathBuf,
}

impl BuildContext {
    /// Build the context for this process from its environment and flags.
    pub fn establish(cwd: &Path, targets: &[String], flags: Flags) -> Result<Self> {
        let exe = std::env::current_exe().context("failed to locate the redo executable")?;
        Self::from_vars(|name| std::env::var(name).ok(), cwd, targets, flags, exe)
    }

    fn from_vars(
        get: impl Fn(&str) -> Option<String>,
        cwd: &Path,
        targets: &[String],
        flags: Flags,
        exe: PathBuf,
    ) -> Result<Self> {
        let depth = match get(ENV_DEPTH).filter(|d| !d.trim().is_empty()) {
            Some(d) => d
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid {ENV_DEPTH} value: {d:?}"))?,
            None => 0,
        };
        let inherited_base = get(ENV_BASE).filter(|b| !b.is_empty());

        let ctx = match inherited_base {
            Some(base) if depth > 0 => {
                let env_debug = get(ENV_DEBUG)
                    .and_then(|d| d.trim().parse::<u8>().ok())
                    .unwrap_or(0);
                Self {
                    base: PathBuf::from(base),
                    start_dir: get(ENV_STARTDIR)
                        .filter(|s| !s.is_empty())
                        .map_or_else(|| cwd.to_path_buf(), PathBuf::from),
                    depth,
                    target: get(ENV_TARGET).filter(|t| !t.is_empty()),
                    debug: flags.debug.max(env_debug),
                    verbose: flags.verbose || is_set(get(ENV_VERBOSE)),
                    shuffle: flags.shuffle || is_set(get(ENV_SHUFFLE)),
                    exe: get(ENV_REDO).filter(|e| !e.is_empty()).map_or(exe, PathBuf::from),
                }
            }
            _ => Self {
                base: find_build_root(cwd, targets),
                start_dir: cwd.to_path_buf(),
                depth: 0,
                target: None,
                debug: flags.debug,
                verbose: flags.verbose,
                shuffle: flags.shuffle,
                exe,
            },
        };
        Ok(ctx)
    }

    /// Whether this is the top-level process of the tree.
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Directory of tool-name symlinks put first on every recipe's `PATH`.
    pub fn bin_dir(&self) -> PathBuf {
        self.base.join(CONTROL_DIR).join("bin")
    }

    /// The target whose recipe invoked this process, if any.
    pub fn calling_target(&self) -> Option<Target> {
        self.target
            .as_deref()
            .map(|key| Target::from_key(&self.base, key))
    }

    /// Pass the context to the recipe process building `target`.
    pub fn configure_child(&self, cmd: &mut Command, target: &Target) {
        cmd.env(ENV_BASE, &self.base)
            .env(ENV_STARTDIR, &self.start_dir)
            .env(ENV_DEPTH, (self.depth + 1).to_string())
            .env(ENV_TARGET, target.key())
            .env(ENV_DEBUG, self.debug.to_string())
            .env(ENV_VERBOSE, flag_value(self.verbose))
            .env(ENV_SHUFFLE, flag_value(self.shuffle))
            .env(ENV_REDO, &self.exe)
            .env("PATH", self.child_path());
    }

    /// `PATH` with the shim directory in front (once).
    fn child_path(&self) -> OsString {
        let bin = self.bin_dir();
        let existing = std::env::var_os("PATH").unwrap_or_default();
        let dirs = std::iter::once(bin.clone())
            .chain(std::env::split_paths(&existing).filter(|dir| *dir != bin));
        std::env::join_paths(dirs).unwrap_or(existing)
    }

    /// Point `.redo/bin/{redo,redo-ifchange,redo-ifcreate}` at this executable.
    ///
    /// Root-only. Recipes find the tools through these links no matter where
    /// the binary is installed.
    pub fn install_shims(&self) -> Result<()> {
        let bin = self.bin_dir();
        fs::create_dir_all(&bin).with_context(|| format!("failed to create {}", bin.display()))?;

        for name in TOOL_NAMES {
            let link = bin.join(name);
            if fs::read_link(&link).is_ok_and(|dest| dest == self.exe) {
                continue;
            }
            crate::state::remove_if_exists(&link)?;
            match std::os::unix::fs::symlink(&self.exe, &link) {
                Ok(()) => ddprintln!("linked {} -> {}", link.display(), self.exe.display()),
                // Another top-level run got there first.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to link {}", link.display()));
                }
            }
        }
        Ok(())
    }
}

/// Locate the build root for a top-level invocation.
///
/// Start from the deepest directory containing both `cwd` and every target's
/// directory, then walk upward to the nearest ancestor that already holds a
/// `.redo` control directory. Without one, the starting directory becomes
/// the root.
pub fn find_build_root(cwd: &Path, targets: &[String]) -> PathBuf {
    let target_dirs: Vec<PathBuf> = targets
        .iter()
        .map(|t| {
            let abs = paths::absolute(cwd, Path::new(t));
            abs.parent().map_or_else(|| abs.clone(), Path::to_path_buf)
        })
        .collect();
    let cwd = paths::normalize(cwd);
    let start = paths::common_ancestor(
        target_dirs
            .iter()
            .map(PathBuf::as_path)
            .chain(std::iter::once(cwd.as_path())),
    )
    .unwrap_or_else(|| cwd.clone());

    start
        .ancestors()
        .find(|dir| dir.join(CONTROL_DIR).is_dir())
        .map_or(start.clone(), Path::to_path_buf)
}

fn is_set(value: Option<String>) -> bool {
    value.is_some_and(|v| !v.is_empty() && v != "0")
}

fn flag_value(on: bool) -> &'static str {
    if on { "1" } else { "" }
}
