//! Filesystem resolution and content-addressed memory-mapped buffer reuse
//! (C3). Grounded on `fzakaria-uld`'s use of `memmap2` alongside `object`.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use memmap2::Mmap;

/// Backing bytes for one resolved path, created at most once per path
/// (invariant from spec §3).
pub enum MemoryArea {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl MemoryArea {
    pub fn data(&self) -> &[u8] {
        match self {
            MemoryArea::Mapped(m) => &m[..],
            MemoryArea::Owned(v) => &v[..],
        }
    }
}

/// Two-column table redirecting a lookup name to a content-hashed path, used
/// to replay a reproduce tarball (spec §4.2, §6 "Mapping INI file").
#[derive(Debug, Clone, Default)]
pub struct MappingFile {
    entries: HashMap<String, PathBuf>,
}

impl MappingFile {
    /// Parses `[category]` / `key=value` INI-style content.
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), PathBuf::from(value.trim()));
            }
        }
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading mapping file {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn lookup(&self, name: &str) -> Option<&Path> {
        self.entries.get(name).map(|p| p.as_path())
    }
}

/// Shared, read-mostly cache of [`MemoryArea`]s keyed by resolved path.
#[derive(Default)]
pub struct PathCache {
    areas: Mutex<HashMap<PathBuf, Arc<MemoryArea>>>,
    mapping: Option<MappingFile>,
}

impl PathCache {
    pub fn new(mapping: Option<MappingFile>) -> Self {
        Self {
            areas: Mutex::new(HashMap::new()),
            mapping,
        }
    }

    /// Resolves `name` through the mapping file (if any) before touching the
    /// real filesystem. A mapped file that is missing is a fatal error.
    pub fn resolve_mapped<'a>(&self, name: &'a str) -> Option<Result<PathBuf>> {
        self.mapping.as_ref().and_then(|m| {
            m.lookup(name).map(|p| {
                if p.is_file() {
                    Ok(p.to_path_buf())
                } else {
                    Err(anyhow::anyhow!(
                        "mapped file {} for {name} does not exist",
                        p.display()
                    ))
                }
            })
        })
    }

    /// Returns the cached [`MemoryArea`] for `path`, mmap'ing it on first
    /// access. Falls back to reading the file into an owned buffer when
    /// mmap fails (e.g. zero-length files).
    pub fn get(&self, path: &Path) -> Result<Arc<MemoryArea>> {
        let canon = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        let mut areas = self.areas.lock().unwrap();
        if let Some(area) = areas.get(&canon) {
            return Ok(area.clone());
        }

        let file = File::open(&canon).with_context(|| format!("opening {}", canon.display()))?;
        let area = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => MemoryArea::Mapped(mmap),
            Err(_) => MemoryArea::Owned(
                std::fs::read(&canon).with_context(|| format!("reading {}", canon.display()))?,
            ),
        };
        let area = Arc::new(area);
        areas.insert(canon, area.clone());
        Ok(area)
    }

    pub fn cached_count(&self) -> usize {
        self.areas.lock().unwrap().len()
    }
}
