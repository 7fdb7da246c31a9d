//! Utility functions.

use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two.
pub fn align_up(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Aligns an address down to the previous multiple of `align`.
pub fn align_down(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

/// Lower-cased, forward-slash form of a path.
///
/// Build metadata records paths with whatever casing and separators the build system used,
/// so every path comparison and hash goes through this.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

/// Stable identifier of a translation unit, derived from its object path.
pub fn unique_id(path: &Path) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(normalize_path(path).as_bytes());
    let hash = hasher.finish();
    (hash ^ (hash >> 32)) as u32
}

/// Appends `suffix` to the file name: `a.obj` + `.bak` gives `a.obj.bak`.
pub fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Inserts `suffix` between the file stem and the extension: `a.dll` + `_42` gives `a_42.dll`.
pub fn insert_before_extension(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(file_name)
}

pub fn quoted(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

/// Splits a command line into tokens, keeping quoted runs together.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Checks whether a compiler or linker command line carries `option`, in either `/` or `-` form.
///
/// Options are matched as prefixes, so `Fd` matches `/Fd"x.pdb"`.
pub fn has_option(command_line: &str, option: &str) -> bool {
    split_command_line(command_line).iter().any(|token| {
        let token = token.trim_matches('"');
        (token.starts_with('/') || token.starts_with('-')) && token[1..].starts_with(option)
    })
}
