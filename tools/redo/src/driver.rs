//! Multi-target driver: one job per named target, then collect the results.
//!
//! There is no whole-graph plan. Each target's recipe discovers its own
//! dependencies by running `redo-ifchange`, which comes back through here
//! in a child process.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use rand::seq::SliceRandom;

use crate::build::{Builder, LOCKED_STATUS};
use crate::jobs::JobServer;
use crate::lock::TargetLock;
use crate::signal;
use crate::state::DepKind;
use crate::target::Target;
use crate::verbose::{self, dprintln};

/// Exit status when a target someone else was building ended up unbuilt.
pub const FAILED_ELSEWHERE: i32 = 2;

/// Target built when `redo` is given none.
const DEFAULT_TARGET: &str = "all";

/// Which targets get rebuilt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// `redo`: every named target.
    Always,
    /// `redo-ifchange`: only targets that are out of date. Each is also
    /// recorded as a dependency of the calling target.
    IfChange,
}

/// Turn command-line arguments into targets.
///
/// A directory holding an `all.do` stands for its `all` target.
pub fn resolve_targets(base: &Path, cwd: &Path, args: &[String], mode: Mode) -> Vec<Target> {
    let defaulted;
    let args = if args.is_empty() && mode == Mode::Always {
        defaulted = [DEFAULT_TARGET.to_string()];
        &defaulted[..]
    } else {
        args
    };

    args.iter()
        .map(|arg| {
            let target = Target::from_arg(base, cwd, arg);
            if target.path().is_dir() && target.path().join("all.do").is_file() {
                Target::new(base, &target.path().join(DEFAULT_TARGET))
            } else {
                target
            }
        })
        .collect()
}

/// Build `args` and return the exit code for this invocation.
///
/// 0 if everything succeeded, 1 if any target failed here, or
/// [`FAILED_ELSEWHERE`] if a target built by another process failed.
pub fn run(
    builder: &Arc<Builder>,
    jobs: &mut JobServer,
    cwd: &Path,
    args: &[String],
    mode: Mode,
) -> Result<i32> {
    let ctx = builder.context();
    let store = builder.store();
    let mut targets = resolve_targets(&ctx.base, cwd, args, mode);
    if ctx.shuffle {
        targets.shuffle(&mut rand::thread_rng());
    }

    if mode == Mode::IfChange {
        if let Some(parent) = ctx.calling_target() {
            for target in &targets {
                store.add_dep(&parent, DepKind::Matched, target)?;
            }
        }
        let mut dirty = Vec::with_capacity(targets.len());
        for target in targets {
            if store.is_dirty(&target)? {
                dirty.push(target);
            } else {
                dprintln!("{target}: up to date");
            }
        }
        targets = dirty;
    }

    let (started, start_error) = start_all(targets, |target| {
        let job_builder = Arc::clone(builder);
        let job_target = target.clone();
        jobs.start_job(target.key(), move || job_builder.build_job(&job_target, mode))
    });
    // Jobs already running hold locks and tokens; see them out either way.
    let results = jobs.wait_all();
    if let Some(e) = start_error {
        return Err(e);
    }

    let mut retcode = 0;
    let mut locked = Vec::new();
    for (target, (_, status)) in started.into_iter().zip(results) {
        match status {
            0 => {}
            LOCKED_STATUS => locked.push(target),
            _ => retcode = retcode.max(1),
        }
    }

    for target in locked {
        if signal::interrupted() {
            break;
        }
        TargetLock::new(store, &target).wait(|| jobs.force_return_tokens());
        let name = builder.display_name(&target);
        verbose::log_target(format_args!("{name} (...unlocked!)"));
        if store.stamped(&target)?.is_none() {
            verbose::err(format_args!("{name}: failed in another thread"));
            retcode = retcode.max(FAILED_ELSEWHERE);
        }
    }

    Ok(retcode)
}

/// Start a job per target with `start`, in order, until one fails to start
/// or an interrupt arrives. Returns the targets that started and the
/// failure, if any.
fn start_all<F>(targets: Vec<Target>, mut start: F) -> (Vec<Target>, Option<anyhow::Error>)
where
    F: FnMut(&Target) -> Result<()>,
{
    let mut started = Vec::with_capacity(targets.len());
    for target in targets {
        if signal::interrupted() {
            break;
        }
        if let Err(e) = start(&target) {
            return (started, Some(e));
        }
        started.push(target);
    }
    (started, None)
}

/// `redo-ifcreate`: make the calling target depend on each argument not
/// existing.
pub fn if_create(builder: &Builder, cwd: &Path, args: &[String]) -> Result<i32> {
    let ctx = builder.context();
    let parent = ctx.calling_target();
    for arg in args {
        let target = Target::from_arg(&ctx.base, cwd, arg);
        if target.exists() {
            bail!("{}: error: exists", builder.display_name(&target));
        }
        if let Some(parent) = &parent {
            builder.store().add_dep(parent, DepKind::Candidate, &target)?;
        }
    }
    Ok(0)
}
