//! Entry point for the hotlink command-line tool.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize logging from `--log-level` (or `RUST_LOG`).
//! 3. Run the requested object-file tool.
//!
//! Error handling is done via `anyhow`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hotlink::arch::x86_64::X86_64;
use hotlink::config::{Command, Config, Settings};
use hotlink::entry_point::disable_in_image;
use hotlink::image::Image;
use hotlink::object_cache::ObjectCache;
use hotlink::writer::{self, CoffRewriter};

fn inspect(objects: &[PathBuf]) -> Result<()> {
    let cache = ObjectCache::new();
    for (path, object) in cache.load_all(objects) {
        let object = object?;
        println!("{} (id {:08x})", path.display(), object.unique_id);
        for symbol in &object.symbols {
            let kind = match (symbol.is_undefined, symbol.is_function) {
                (true, _) => "undef",
                (false, true) => "func",
                (false, false) => "data",
            };
            let scope = if symbol.is_external { "extern" } else { "static" };
            let weak = if symbol.is_weak { " weak" } else { "" };
            println!("  #{:<5} {:<5} {:<6}{} {} +0x{:x}", symbol.index, kind, scope, weak, symbol.name, symbol.offset);
            for relocation in &symbol.relocations {
                println!(
                    "          +0x{:<4x} {:?} -> {} {:+}",
                    relocation.offset, relocation.kind, relocation.target, relocation.addend
                );
            }
        }
        for name in object.external_definitions() {
            println!("  extern {}", name);
        }
        for directive in &object.directives {
            println!("  directive {}", directive);
        }
    }
    Ok(())
}

fn strip(settings: &Settings, object: &Path, names: &[String]) -> Result<()> {
    let linker = settings.linker.clone().unwrap_or_else(|| PathBuf::from("link.exe"));
    let mut rewriter = CoffRewriter::open(object, settings.removal_strategy(&linker))?;
    let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
    let mut found = HashSet::new();
    for symbol in rewriter.symbols()? {
        if wanted.contains(symbol.name.as_str()) && symbol.section_number > 0 {
            rewriter.remove_symbol(symbol.index)?;
            found.insert(symbol.name);
        }
    }
    for name in names.iter().filter(|n| !found.contains(*n)) {
        warn!("No definition of {} in {}", name, object.display());
    }
    if found.is_empty() {
        bail!("nothing to strip from {}", object.display());
    }

    let backup = writer::backup(object)?;
    rewriter.save(object)?;
    info!("Stripped {} symbol(s) from {} (backup at {})", found.len(), object.display(), backup.display());
    Ok(())
}

fn disable_entry(path: &Path) -> Result<()> {
    let mut image = Image::open(path)?;
    match disable_in_image(&mut image, &X86_64)? {
        Some(saved) => {
            image.save(path)?;
            let bytes: Vec<String> = saved.original.iter().map(|b| format!("{:02x}", b)).collect();
            println!("Entry point at RVA 0x{:x} disabled, original bytes: {}", saved.rva, bytes.join(" "));
        }
        None => println!("{} has no entry point", path.display()),
    }
    Ok(())
}

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match &config.command {
        Command::Inspect { objects } => inspect(objects),
        Command::Strip { object, symbols } => strip(&config.settings, object, symbols),
        Command::DisableEntry { image } => disable_entry(image),
    }
}
