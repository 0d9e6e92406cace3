//! `Input` (named reference) and `InputFile` (parsed contents) (C4).

use std::path::PathBuf;
use std::sync::Arc;

use crate::fragment::Section;
use crate::pathcache::MemoryArea;

/// Configuration-record snapshot copied onto an [`Input`] at creation time,
/// so that downstream code never consults a global builder state (spec §9,
/// "materialize attributes at point").
#[derive(Debug, Clone, Copy, Default)]
pub struct Attributes {
    pub static_link: bool,
    pub as_needed: bool,
    pub whole_archive: bool,
    pub just_symbols: bool,
    pub add_needed: bool,
    pub patch_base: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Archive,
    DynObj,
    Script,
    ArchiveMember,
    Object,
    Internal,
}

/// A named reference on the link line: one entry per `Input` per spec §3.
pub struct Input {
    pub file_name: String,
    pub resolved_path: Option<PathBuf>,
    pub ty: InputType,
    pub attributes: Attributes,
    pub input_file: Option<Arc<InputFile>>,
    pub ordinal: u32,
}

impl Input {
    pub fn new(file_name: impl Into<String>, ty: InputType, attributes: Attributes, ordinal: u32) -> Self {
        Self {
            file_name: file_name.into(),
            resolved_path: None,
            ty,
            attributes,
            input_file: None,
            ordinal,
        }
    }
}

/// The parsed contents of an [`Input`]. Object/DynamicLibrary/Executable
/// variants own the set of [`Section`]s produced by the reader (C7); the
/// symbol table itself lives in the shared name pool (C8), indexed by
/// `(input_ordinal, local_symbol_index)` to avoid the Symbol→InputFile→Input
/// back-pointer cycle flagged in spec §9.
pub enum InputFile {
    Object(ObjectFile),
    DynamicLibrary(ObjectFile),
    Executable(ObjectFile),
    Archive(ArchiveFile),
    ArchiveMember(ObjectFile),
    Script,
    Bitcode { bytes: Arc<MemoryArea> },
    Internal,
}

pub struct ObjectFile {
    pub sections: Vec<Section>,
    /// Plugin-supplied section-name rewrite used by the mapper (C10) when
    /// the plugin wants rule matching to see a different name than the
    /// section's real one.
    pub rule_match_names: Option<Vec<(usize, String)>>,
}

impl ObjectFile {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            rule_match_names: None,
        }
    }
}

impl Default for ObjectFile {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ArchiveFile {
    pub member_names: Vec<String>,
}

/// A `<value>\t<TYPE>\t<name>` symdef-file entry (spec §6 "Symdef file").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymDefType {
    NoType,
    Object,
    Func,
}

#[derive(Debug, Clone)]
pub struct SymDefEntry {
    pub value: u64,
    pub ty: SymDefType,
    pub name: String,
    /// `#<SYMDEFS...>` header selects PROVIDE (soft) vs force-resolve style.
    pub provide_only: bool,
}

/// Parses a symdef file's lines, honoring the `#<SYMDEFS...>` comment that
/// selects PROVIDE vs force-resolve semantics for every entry that follows.
pub fn parse_symdef_file(content: &str) -> Vec<SymDefEntry> {
    let mut provide_only = false;
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("#<SYMDEFS") {
            provide_only = line.contains("PROVIDE");
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, '\t');
        let (Some(value), Some(ty), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(value) = u64::from_str_radix(value.trim_start_matches("0x"), 16) else {
            continue;
        };
        let ty = match ty {
            "OBJECT" => SymDefType::Object,
            "FUNC" => SymDefType::Func,
            _ => SymDefType::NoType,
        };
        out.push(SymDefEntry {
            value,
            ty,
            name: name.trim().to_string(),
            provide_only,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symdef_parses_provide_and_force_entries() {
        let entries = parse_symdef_file(concat!(
            "#<SYMDEFS>#PROVIDE\n",
            "0x1000\tFUNC\tfoo\n",
            "#<SYMDEFS>\n",
            "0x2000\tOBJECT\tbar\n",
        ));
        assert_eq!(entries.len(), 2);
        assert!(entries[0].provide_only);
        assert_eq!(entries[0].value, 0x1000);
        assert!(!entries[1].provide_only);
        assert_eq!(entries[1].name, "bar");
    }
}
