//! Search-dir resolver (C6): namespec → filesystem path.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::input::InputType;

/// Result of resolving a namespec or literal `:file` spec.
pub struct Resolution {
    pub path: PathBuf,
    pub ty: InputType,
}

fn candidate_exists(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let p = dir.join(file_name);
    p.is_file().then_some(p)
}

/// Expands `$ORIGIN` in an RPATH entry to the directory containing the
/// running executable (spec §4.2, grounded on `SearchDirs.cpp`).
pub fn expand_origin(rpath: &str) -> String {
    if !rpath.contains("$ORIGIN") {
        return rpath.to_string();
    }
    let origin = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));
    rpath.replace("$ORIGIN", &origin.to_string_lossy())
}

fn ld_library_path_dirs() -> Vec<PathBuf> {
    std::env::var_os("LD_LIBRARY_PATH")
        .map(|v| std::env::split_paths(&v).collect())
        .unwrap_or_default()
}

/// Searches `-L` dirs, then RPATH (with `$ORIGIN` expanded), then
/// `LD_LIBRARY_PATH`, for the first hit (spec §4.2).
fn search_dirs_for(config: &Config, file_name: &str) -> Option<PathBuf> {
    for dir in &config.search_dirs {
        if let Some(p) = candidate_exists(dir, file_name) {
            return Some(p);
        }
    }
    for rpath in &config.rpaths {
        let expanded = expand_origin(rpath);
        if let Some(p) = candidate_exists(Path::new(&expanded), file_name) {
            return Some(p);
        }
    }
    for dir in ld_library_path_dirs() {
        if let Some(p) = candidate_exists(&dir, file_name) {
            return Some(p);
        }
    }
    None
}

/// Resolves a `-l<name>` namespec, honoring `:` literal form and
/// static-vs-dynamic preference (spec §4.2).
pub fn resolve_namespec(config: &Config, spec: &str, prefer_static: bool) -> anyhow::Result<Resolution> {
    if let Some(literal) = spec.strip_prefix(':') {
        return search_dirs_for(config, literal)
            .map(|path| Resolution {
                path,
                ty: InputType::Archive,
            })
            .ok_or_else(|| anyhow::anyhow!("cannot find {literal}"));
    }

    if !prefer_static {
        let so_name = format!("lib{spec}.so");
        if let Some(path) = search_dirs_for(config, &so_name) {
            return Ok(Resolution {
                path,
                ty: InputType::DynObj,
            });
        }
    }

    let a_name = format!("lib{spec}.a");
    search_dirs_for(config, &a_name)
        .map(|path| Resolution {
            path,
            ty: InputType::Archive,
        })
        .ok_or_else(|| anyhow::anyhow!("cannot find -l{spec}"))
}

/// Resolves a plugin configuration file under
/// `<program dir>/../etc/ELD/Plugins/<plugin-name>/` as spec §4.2 requires,
/// in addition to any explicit `--plugin-config` path.
pub fn resolve_plugin_config(plugin_name: &str, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        if p.is_file() {
            return Some(p.to_path_buf());
        }
    }
    let program_dir = std::env::current_exe().ok()?.parent()?.to_path_buf();
    let candidate = program_dir
        .join("..")
        .join("etc/ELD/Plugins")
        .join(plugin_name);
    candidate.is_dir().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_expansion_uses_current_exe_dir() {
        let expanded = expand_origin("$ORIGIN/../lib");
        assert!(!expanded.contains("$ORIGIN"));
    }

    #[test]
    fn literal_spec_is_looked_up_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("exact.so"), b"").unwrap();
        let mut config = Config::default();
        config.search_dirs.push(dir.path().to_path_buf());
        let res = resolve_namespec(&config, ":exact.so", false).unwrap();
        assert_eq!(res.path, dir.path().join("exact.so"));
    }

    #[test]
    fn prefer_static_skips_dynamic_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libfoo.so"), b"").unwrap();
        std::fs::write(dir.path().join("libfoo.a"), b"").unwrap();
        let mut config = Config::default();
        config.search_dirs.push(dir.path().to_path_buf());
        let res = resolve_namespec(&config, "foo", true).unwrap();
        assert!(matches!(res.ty, InputType::Archive));
    }
}
