//! Configuration module.
//!
//! This module defines the command-line interface (CLI) using `clap`, and the `Settings`
//! that steer a patch cycle: toolchain overrides, extra options and linker compatibility.

use clap::{Args, Parser, Subcommand, ValueEnum};
use object::pe;
use std::path::{Path, PathBuf};

/// Live-patching engine for natively compiled x86_64 modules.
///
/// The library does the work; the binary exposes the object-file tooling
/// (inspection, symbol stripping, entry-point neutering) for diagnostics.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,

    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the symbols, relocations and directives of object files.
    Inspect {
        #[arg(required = true, num_args = 1..)]
        objects: Vec<PathBuf>,
    },
    /// Strip symbols from an object file in place. A `.bak` copy is kept next to it.
    Strip {
        object: PathBuf,
        #[arg(short, long = "symbol", required = true)]
        symbols: Vec<String>,
    },
    /// Replace the entry point of an image with a stub that returns success.
    DisableEntry { image: PathBuf },
}

/// How weak symbols found in static libraries are handed to the linker.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WeakSymbolPolicy {
    /// Emit `/INCLUDE:` for every weak library symbol so the linker resolves it
    /// the same way it did for the original module.
    #[default]
    ForceInclude,
    /// Leave weak symbol resolution to the linker.
    LinkerDefault,
}

/// The linker family, which decides how stripped symbols are neutralised.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkerFlavor {
    Msvc,
    Lld,
}

impl LinkerFlavor {
    /// Derives the flavour from the linker's file name.
    pub fn detect(linker: &Path) -> Self {
        let name = linker.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
        if name.contains("lld") {
            LinkerFlavor::Lld
        } else {
            LinkerFlavor::Msvc
        }
    }

    pub fn removal_strategy(self) -> SymbolRemovalStrategy {
        match self {
            LinkerFlavor::Msvc => SymbolRemovalStrategy::DebugSection,
            LinkerFlavor::Lld => SymbolRemovalStrategy::Absolute,
        }
    }
}

/// Where a stripped symbol is moved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolRemovalStrategy {
    /// The debug pseudo-section, ignored by the MSVC linker.
    DebugSection,
    /// The absolute pseudo-section. LLD rejects debug-section symbols.
    Absolute,
}

impl SymbolRemovalStrategy {
    pub fn section_number(self) -> i16 {
        match self {
            SymbolRemovalStrategy::DebugSection => pe::IMAGE_SYM_DEBUG as i16,
            SymbolRemovalStrategy::Absolute => pe::IMAGE_SYM_ABSOLUTE as i16,
        }
    }
}

/// Settings of a live module session.
#[derive(Args, Debug, Clone, Default)]
pub struct Settings {
    /// Compiler used instead of the one recorded in the build metadata
    #[arg(long)]
    pub compiler: Option<PathBuf>,

    /// Only use --compiler when the recorded compiler no longer exists
    #[arg(long)]
    pub compiler_fallback_only: bool,

    /// Extra options appended to every compiler invocation
    #[arg(long, default_value = "")]
    pub compiler_options: String,

    /// Linker used instead of the one recorded in the build metadata
    #[arg(long)]
    pub linker: Option<PathBuf>,

    /// Only use --linker when the recorded linker no longer exists
    #[arg(long)]
    pub linker_fallback_only: bool,

    /// Extra options appended to every link
    #[arg(long, default_value = "")]
    pub linker_options: String,

    /// Compile the parts of an amalgamated (unity) file separately once one of them changes
    #[arg(long)]
    pub split_amalgamations: bool,

    /// Treatment of weak symbols from static libraries
    #[arg(long, value_enum, default_value_t)]
    pub weak_symbols: WeakSymbolPolicy,

    /// Linker flavour, detected from the linker file name when not given
    #[arg(long, value_enum)]
    pub linker_flavor: Option<LinkerFlavor>,

    /// Refuse to install existing patches into processes attached later
    #[arg(long)]
    pub single_process: bool,
}

impl Settings {
    /// Resolves a tool path against an override that may only apply as a fallback.
    pub fn resolve_tool(recorded: &Path, override_path: Option<&Path>, fallback_only: bool) -> PathBuf {
        match override_path {
            Some(path) if !fallback_only || !recorded.exists() => path.to_path_buf(),
            _ => recorded.to_path_buf(),
        }
    }

    pub fn compiler_for(&self, recorded: &Path) -> PathBuf {
        Self::resolve_tool(recorded, self.compiler.as_deref(), self.compiler_fallback_only)
    }

    pub fn linker_for(&self, recorded: &Path) -> PathBuf {
        Self::resolve_tool(recorded, self.linker.as_deref(), self.linker_fallback_only)
    }

    pub fn removal_strategy(&self, linker: &Path) -> SymbolRemovalStrategy {
        self.linker_flavor.unwrap_or_else(|| LinkerFlavor::detect(linker)).removal_strategy()
    }

    pub fn install_patches_multi_process(&self) -> bool {
        !self.single_process
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flavor_from_linker_name() {
        assert_eq!(LinkerFlavor::detect(Path::new("C:/llvm/bin/lld-link.exe")), LinkerFlavor::Lld);
        assert_eq!(LinkerFlavor::detect(Path::new("C:/msvc/bin/link.exe")), LinkerFlavor::Msvc);
        assert_eq!(SymbolRemovalStrategy::DebugSection.section_number(), -2);
        assert_eq!(SymbolRemovalStrategy::Absolute.section_number(), -1);
    }

    #[test]
    fn tool_override_as_fallback() {
        let missing = Path::new("/definitely/not/here/cl.exe");
        let existing = std::env::current_exe().unwrap();
        let custom = Path::new("/opt/cl.exe");

        assert_eq!(Settings::resolve_tool(missing, Some(custom), true), custom);
        assert_eq!(Settings::resolve_tool(&existing, Some(custom), true), existing);
        assert_eq!(Settings::resolve_tool(&existing, Some(custom), false), custom);
        assert_eq!(Settings::resolve_tool(&existing, None, false), existing);
    }

    #[test]
    fn parses_cli() {
        let config = Config::parse_from([
            "hotlink",
            "--linker-flavor",
            "lld",
            "--weak-symbols",
            "linker-default",
            "strip",
            "a.obj",
            "--symbol",
            "g_x",
        ]);
        assert_eq!(config.settings.weak_symbols, WeakSymbolPolicy::LinkerDefault);
        assert_eq!(config.settings.removal_strategy(Path::new("link.exe")), SymbolRemovalStrategy::Absolute);
        assert!(matches!(config.command, Command::Strip { ref symbols, .. } if symbols == &["g_x"]));
    }
}
