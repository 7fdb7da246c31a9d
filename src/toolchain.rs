//! The seam to the compiler and linker.
//!
//! Both are opaque external processes: arguments go into a response file, the exit code is
//! the only success signal and the output is handed back for logging.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::process::Command;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait Toolchain: Send + Sync {
    /// Runs `tool` with `arguments` in `working_directory` and waits for it to exit.
    fn run(&self, tool: &Path, working_directory: &Path, arguments: &str) -> Result<ToolOutput>;
}

/// Spawns tools as `<tool> @<response file>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalToolchain;

impl Toolchain for ExternalToolchain {
    fn run(&self, tool: &Path, working_directory: &Path, arguments: &str) -> Result<ToolOutput> {
        // Removed on drop, after the tool exited.
        let mut response = tempfile::Builder::new()
            .prefix("hotlink")
            .suffix(".rsp")
            .tempfile()
            .context("failed to create response file")?;
        response.write_all(arguments.as_bytes())?;
        response.flush()?;
        trace!("Response file {}: {}", response.path().display(), arguments);

        let mut command = Command::new(tool);
        command.arg(format!("@{}", response.path().display()));
        if working_directory.is_dir() {
            command.current_dir(working_directory);
        }
        let result = command.output().with_context(|| format!("failed to run {}", tool.display()))?;

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));
        let exit_code = result.status.code().unwrap_or(-1);
        debug!("{} exited with code {}", tool.display(), exit_code);
        Ok(ToolOutput { exit_code, output })
    }
}
