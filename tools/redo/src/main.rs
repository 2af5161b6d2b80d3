//! redo: an incremental build tool driven by `.do` shell scripts.
//!
//! One executable, three tools, picked by the name it is invoked under:
//!
//! - `redo <targets>`: rebuild the targets unconditionally.
//! - `redo-ifchange <targets>`: from inside a recipe, declare the targets as
//!   dependencies of the recipe's target and rebuild the out-of-date ones.
//! - `redo-ifcreate <files>`: declare that the recipe's target depends on the
//!   files *not* existing.
//!
//! Recipes nest: each `redo-ifchange` runs as a child process that inherits
//! the build context and the job token pool from its parent.

mod build;
mod cli;
mod context;
mod driver;
mod jobs;
mod lock;
mod paths;
mod recipe_cmd;
mod resolve;
mod signal;
mod state;
mod target;
mod verbose;

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use build::Builder;
use clap::Parser;
use context::{BuildContext, Flags};
use driver::Mode;
use jobs::JobServer;
use state::StateStore;
use verbose::dprintln;

/// Which tool this process acts as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tool {
    Redo,
    IfChange,
    IfCreate,
}

impl Tool {
    /// Pick the tool from the name the executable was invoked as.
    fn from_argv0(arg0: Option<&OsStr>) -> Self {
        let name = arg0
            .and_then(|a| Path::new(a).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match name.as_str() {
            "redo-ifchange" => Self::IfChange,
            "redo-ifcreate" => Self::IfCreate,
            _ => Self::Redo,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            verbose::err(format_args!("{e:#}"));
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let arg0 = std::env::args_os().next();
    let tool = Tool::from_argv0(arg0.as_deref());
    let cli = cli::Cli::parse();
    if !cli.jobs_valid() {
        bail!("invalid --jobs value: {}", cli.jobs);
    }
    signal::install()?;

    let cwd = std::env::current_dir().context("failed to determine current directory")?;
    let flags = Flags {
        debug: cli.debug,
        verbose: cli.verbose,
        shuffle: cli.shuffle,
    };
    let ctx = BuildContext::establish(&cwd, &cli.targets, flags)?;
    verbose::init(ctx.debug, ctx.verbose, ctx.depth);
    dprintln!(
        "{tool:?} at depth {} in {} (base {})",
        ctx.depth,
        cwd.display(),
        ctx.base.display()
    );

    let store = StateStore::open(&ctx.base)?;
    let claim = ctx.calling_target().map(|parent| store.claim_path(&parent));
    // Before anything else opens a file descriptor.
    let mut jobs = JobServer::setup(cli.jobs, claim.as_deref())?;

    if ctx.is_root() {
        lock::clear_all(&store)?;
        ctx.install_shims()?;
    }

    let builder = Arc::new(Builder::new(ctx, store, jobs.client().clone()));
    let result = match tool {
        Tool::Redo => driver::run(&builder, &mut jobs, &cwd, &cli.targets, Mode::Always),
        Tool::IfChange => driver::run(&builder, &mut jobs, &cwd, &cli.targets, Mode::IfChange),
        Tool::IfCreate => driver::if_create(&builder, &cwd, &cli.targets),
    };
    jobs.force_return_tokens();
    drop(jobs);

    if signal::interrupted() {
        return Ok(signal::INTERRUPTED_EXIT);
    }
    let code = result?;
    if code != 0 {
        verbose::err(format_args!("exiting: {code}"));
    }
    Ok(code)
}
