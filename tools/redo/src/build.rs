//! Single-target build.
//!
//! [`Builder::build_job`] is the body of one scheduled job: take the
//! target's lock, bring the target up to date, release the lock. The build
//! itself is:
//!
//! 1. An existing file that redo never generated and that has no
//!    `<target>.do` is a source file. It is stamped as-is.
//! 2. Otherwise the old edges are dropped, the target is marked generated,
//!    and the do-file cascade picks a recipe. Every probe is recorded as an
//!    edge, so creating a more specific do-file later dirties the target.
//! 3. The recipe writes to `<target>.redo.tmp`. It is renamed over the
//!    target only when the recipe succeeds, so a failed build leaves the
//!    previous output in place.

use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::Context;
use jobserver::Client;
use thiserror::Error;

use crate::context::BuildContext;
use crate::driver::Mode;
use crate::lock::TargetLock;
use crate::recipe_cmd::RecipeCommand;
use crate::resolve::{self, Probe};
use crate::signal;
use crate::state::{DepKind, StateStore, remove_if_exists};
use crate::target::Target;
use crate::verbose::{self, Timer, ddprintln, dprintln};

/// Job status for a target whose lock is held by another process.
pub const LOCKED_STATUS: i32 = 199;

/// Suffix of the file a recipe's output is collected in.
const TMP_SUFFIX: &str = ".redo.tmp";

/// Why a target could not be built.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No do-file in the cascade exists.
    #[error("no rule to make {target:?}")]
    NoRule {
        /// Target as shown to the user.
        target: String,
    },

    /// The recipe exited unsuccessfully.
    #[error("{target}: exit code {}", describe_exit(.code))]
    RecipeFailed {
        /// Target as shown to the user.
        target: String,
        /// Exit code, or `None` if the recipe was killed by a signal.
        code: Option<i32>,
    },

    /// The recipe succeeded, but an interrupt arrived before the commit.
    #[error("{target}: interrupted")]
    Interrupted {
        /// Target as shown to the user.
        target: String,
    },

    /// State, lock or filesystem failure around the recipe.
    #[error("{target}: {cause:#}")]
    Internal {
        /// Target as shown to the user.
        target: String,
        /// Underlying failure.
        cause: anyhow::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "(killed by signal)".to_string(), |c| c.to_string())
}

/// Identity of a regular file, used to tell a stale output from one the
/// recipe wrote itself.
#[derive(Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    ino: u64,
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
}

impl FileIdentity {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::symlink_metadata(path).ok()?;
        meta.is_file().then(|| Self {
            ino: meta.ino(),
            size: meta.len(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        })
    }
}

/// Builds targets on behalf of one redo process.
pub struct Builder {
    ctx: BuildContext,
    store: StateStore,
    client: Client,
}

impl Builder {
    pub fn new(ctx: BuildContext, store: StateStore, client: Client) -> Self {
        Self { ctx, store, client }
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// How `target` is named in messages.
    pub fn display_name(&self, target: &Target) -> String {
        target.display_from(&self.ctx.start_dir)
    }

    /// Job body: build `target` under its lock and return the job status.
    ///
    /// 0 on success, 1 on failure, [`LOCKED_STATUS`] if another process
    /// holds the lock.
    pub fn build_job(&self, target: &Target, mode: Mode) -> i32 {
        let mut lock = TargetLock::new(&self.store, target);
        if let Err(e) = lock.lock() {
            verbose::err(format_args!("{e:#}"));
            return 1;
        }
        if !lock.owned() {
            verbose::log_target(format_args!("{} (locked...)", self.display_name(target)));
            return LOCKED_STATUS;
        }

        let mut status = match self.build_locked(target, mode) {
            Ok(()) => 0,
            Err(e) => {
                verbose::err(&e);
                1
            }
        };
        if let Err(e) = lock.unlock() {
            verbose::err(format_args!("{e:#}"));
            status = 1;
        }
        status
    }

    /// In [`Mode::IfChange`], the target was found dirty before its lock was
    /// taken. Someone may have built it in between, so look again.
    fn build_locked(&self, target: &Target, mode: Mode) -> Result<(), BuildError> {
        if mode == Mode::IfChange {
            let dirty = self
                .store
                .is_dirty(target)
                .map_err(|cause| BuildError::Internal {
                    target: self.display_name(target),
                    cause,
                })?;
            if !dirty {
                dprintln!("{target}: built elsewhere meanwhile");
                return Ok(());
            }
        }
        self.build(target)
    }

    /// Bring `target` up to date unconditionally. The caller holds its lock.
    pub fn build(&self, target: &Target) -> Result<(), BuildError> {
        let name = self.display_name(target);
        let internal = |cause: anyhow::Error| BuildError::Internal {
            target: name.clone(),
            cause,
        };

        if target.exists()
            && !self.store.is_generated(target)
            && !resolve::exact_do_file(target.path()).exists()
        {
            dprintln!("{target}: source file");
            return self.store.stamp(target).map_err(internal);
        }

        self.store.unstamp(target).map_err(internal)?;
        self.store.mark_generated(target).map_err(internal)?;

        let base = self.store.base();
        let found = resolve::find_do_file(target.path(), |candidate, probe| {
            let kind = match probe {
                Probe::Found => DepKind::Matched,
                Probe::Absent => DepKind::Candidate,
            };
            self.store
                .add_dep(target, kind, &Target::new(base, &candidate.do_file))
        })
        .map_err(internal)?;
        let Some(recipe) = found else {
            return Err(BuildError::NoRule { target: name });
        };
        let do_file = Target::new(base, &recipe.do_file);
        self.store.stamp(&do_file).map_err(internal)?;

        let tmp = target.with_suffix(TMP_SUFFIX);
        remove_if_exists(&tmp).map_err(internal)?;
        let out = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))
            .map_err(internal)?;
        let prior = FileIdentity::of(target.path());

        // `$1` is the target's file name with the matched extension removed.
        let file_name = target
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base_arg = file_name
            .strip_suffix(recipe.ext.as_str())
            .unwrap_or(&file_name);

        ddprintln!("{target}: running {}", recipe.do_file.display());
        verbose::log_target(&name);
        let status = {
            let _timer = Timer::start(name.clone());
            RecipeCommand::new(&name)
                .echo(self.ctx.verbose)
                .script(&recipe.do_file, base_arg, &recipe.ext, &tmp)
                .working_dir(target.dir())
                .stdout_to(out)
                .context(&self.ctx, target)
                .jobserver(&self.client)
                .status()
        };
        // The recipe is over, and with it the claim on its token.
        if let Err(e) = remove_if_exists(&self.store.claim_path(target)) {
            dprintln!("{target}: {e:#}");
        }
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                self.discard(target, &tmp).map_err(internal)?;
                return Err(internal(e));
            }
        };

        if !status.success() {
            self.discard(target, &tmp).map_err(internal)?;
            return Err(BuildError::RecipeFailed {
                target: name,
                code: status.code(),
            });
        }
        if signal::interrupted() {
            self.discard(target, &tmp).map_err(internal)?;
            return Err(BuildError::Interrupted { target: name });
        }

        self.commit(target, &tmp, prior).map_err(internal)
    }

    /// Install a successful recipe's output and stamp the target.
    fn commit(&self, target: &Target, tmp: &Path, prior: Option<FileIdentity>) -> anyhow::Result<()> {
        let wrote_output = fs::metadata(tmp).is_ok_and(|m| m.len() > 0);
        if wrote_output {
            fs::rename(tmp, target.path()).with_context(|| {
                format!("failed to move {} to {}", tmp.display(), target.path().display())
            })?;
        } else {
            remove_if_exists(tmp)?;
            // An old output the recipe left untouched is stale; one it wrote
            // itself is the new output.
            if prior.is_some() && FileIdentity::of(target.path()) == prior {
                dprintln!("{target}: removing stale output");
                remove_if_exists(target.path())?;
            }
        }
        self.store.stamp(target)
    }

    /// Drop a failed recipe's output and forget the target's state.
    fn discard(&self, target: &Target, tmp: &Path) -> anyhow::Result<()> {
        remove_if_exists(tmp)?;
        self.store.unstamp(target)
    }
}
