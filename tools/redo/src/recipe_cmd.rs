//! Typed builder for recipe (do-file) invocations.
//!
//! A recipe runs as `sh -e[v] <do-file> <base> <ext> <tmp>` in the target's
//! directory. Its stdout is the target's new content, and its environment
//! carries the build context plus the shared job token pool.

use std::ffi::OsStr;
use std::fs::File;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use jobserver::Client;

use crate::context::BuildContext;
use crate::target::Target;

/// Shell every recipe is interpreted by.
const SHELL: &str = "sh";

/// A typed builder for one recipe invocation.
pub struct RecipeCommand {
    cmd: Command,
    label: String,
    echo: bool,
}

impl RecipeCommand {
    /// Start a recipe invocation for the target named `label` in messages.
    pub fn new(label: &str) -> Self {
        Self {
            cmd: Command::new(SHELL),
            label: label.to_string(),
            echo: false,
        }
    }

    /// Echo each script line to stderr as it is read (`sh -v`).
    pub fn echo(&mut self, on: bool) -> &mut Self {
        self.echo = on;
        self
    }

    /// Set the do-file and its three positional arguments.
    ///
    /// Paths are relative to the working directory, so only file names are
    /// passed.
    pub fn script(&mut self, do_file: &Path, base: &str, ext: &str, tmp: &Path) -> &mut Self {
        // -e: the first failing command fails the recipe.
        self.cmd
            .arg(if self.echo { "-ev" } else { "-e" })
            .arg(file_name(do_file))
            .arg(base)
            .arg(ext)
            .arg(file_name(tmp));
        self
    }

    /// Run in `dir`.
    pub fn working_dir(&mut self, dir: &Path) -> &mut Self {
        self.cmd.current_dir(dir);
        self
    }

    /// Send the recipe's stdout into `file`.
    pub fn stdout_to(&mut self, file: File) -> &mut Self {
        self.cmd.stdout(Stdio::from(file));
        self
    }

    /// Hand the build context to the recipe, which builds `target`.
    pub fn context(&mut self, ctx: &BuildContext, target: &Target) -> &mut Self {
        ctx.configure_child(&mut self.cmd, target);
        self
    }

    /// Let nested redo processes draw from the shared job token pool.
    pub fn jobserver(&mut self, client: &Client) -> &mut Self {
        client.configure_make(&mut self.cmd);
        self
    }

    /// Run the recipe to completion.
    pub fn status(&mut self) -> Result<ExitStatus> {
        self.cmd
            .status()
            .with_context(|| format!("failed to run recipe for {}", self.label))
    }
}

fn file_name(path: &Path) -> &OsStr {
    path.file_name().unwrap_or(path.as_os_str())
}
