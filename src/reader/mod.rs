//! ELF32/64-LE object reader (C7): turns raw bytes into the [`Section`]/
//! [`Fragment`]/[`Relocation`] model, via the `object` crate's read API the
//! way the teacher's `Linker::parse_files` consumes `object::File`.

pub mod archive;

use std::collections::HashMap;

use anyhow::{Context, Result};
use object::read::{
    Object, ObjectSection, ObjectSymbol, RelocationEncoding, RelocationKind as ObjRelocationKind,
    RelocationTarget as ObjRelocationTarget, SectionIndex, SymbolSection,
};
use object::SectionFlags;

use crate::fragment::{Fragment, Section, SectionKind};
use crate::input::ObjectFile;
use crate::reloc::{RelocKind, Relocation, RelocationTarget};
use crate::resolver::{Binding, Candidate, DefStrength, Kind, SymbolType, Visibility};

/// One symbol as read straight off the object file, before it is merged
/// into the process-wide name pool (C8). `local_index` lets a relocation
/// addressing a local symbol resolve without a name-pool round trip, since
/// local symbols never enter the pool (spec §4.3).
pub struct RawSymbol {
    pub name: String,
    pub candidate: Candidate,
    pub is_local: bool,
    pub local_index: usize,
}

pub struct ReadResult {
    pub object: ObjectFile,
    pub symbols: Vec<RawSymbol>,
}

/// Parses one relocatable/shared/executable ELF image (spec §4.3).
/// `origin_file` is stamped onto every section produced, so the section
/// mapper's (C10) file-side wildcards have something to match against.
pub fn read_object(bytes: &[u8], ordinal: u32, origin_file: &str) -> Result<ReadResult> {
    let file = object::File::parse(bytes).context("parsing ELF object")?;
    read_from(&file, ordinal, origin_file)
}

fn read_from(file: &object::File, ordinal: u32, origin_file: &str) -> Result<ReadResult> {
    let mut object = ObjectFile::new();
    let mut index_of: HashMap<SectionIndex, usize> = HashMap::new();

    for sec in file.sections() {
        let name = sec.name().unwrap_or("").to_string();
        let kind = classify_section_kind(&name, sec.kind());
        let mut out = Section::new(object.sections.len(), name, kind);
        out.origin_file = origin_file.to_string();
        out.flags = section_raw_flags(&sec);
        out.align = sec.align();
        out.size = sec.size();

        if kind == SectionKind::Bss {
            out.fragments.push(Fragment::Bss { size: sec.size() });
        } else if kind != SectionKind::Relocation {
            if let Ok(data) = sec.data() {
                if !data.is_empty() {
                    out.fragments.push(Fragment::Region(data.to_vec()));
                }
            }
        }

        index_of.insert(sec.index(), out.index);
        object.sections.push(out);
    }

    for sec in file.sections() {
        let Some(&owner_index) = index_of.get(&sec.index()) else {
            continue;
        };
        for (offset, reloc) in sec.relocations() {
            let Some(kind) = classify_reloc_kind(reloc.kind(), reloc.encoding(), reloc.size()) else {
                tracing::warn!(
                    section = %object.sections[owner_index].name,
                    "skipping relocation kind this core does not model: {:?}",
                    reloc.kind()
                );
                continue;
            };
            let target = match reloc.target() {
                ObjRelocationTarget::Symbol(sym_index) => {
                    let Ok(sym) = file.symbol_by_index(sym_index) else {
                        continue;
                    };
                    RelocationTarget::Symbol(sym.name().unwrap_or("").to_string())
                }
                ObjRelocationTarget::Section(sec_index) => {
                    let Ok(target_sec) = file.section_by_index(sec_index) else {
                        continue;
                    };
                    RelocationTarget::Section(
                        target_sec.name().unwrap_or("").to_string(),
                        0,
                    )
                }
                _ => continue,
            };
            object.sections[owner_index].relocations.push(Relocation {
                kind,
                offset_in_section: offset,
                target,
                addend: reloc.addend(),
                target_data: None,
            });
        }
    }

    let mut symbols = Vec::new();
    for (local_index, sym) in file.symbols().enumerate() {
        let name = sym.name().unwrap_or("").to_string();
        if name.is_empty() && !sym.is_definition() {
            continue;
        }
        let fragment_ref = match sym.section() {
            SymbolSection::Section(sec_index) => index_of.get(&sec_index).map(|&idx| {
                crate::fragment::FragmentRef {
                    fragment_index: idx,
                    offset: sym.address(),
                }
            }),
            _ => None,
        };

        let kind = if sym.is_undefined() {
            Kind::Undefined
        } else if sym.is_common() {
            Kind::Common
        } else {
            Kind::Define
        };
        let strength = if sym.is_weak() {
            DefStrength::Weak
        } else {
            DefStrength::Strong
        };
        let binding = if sym.is_local() {
            Binding::Local
        } else if sym.is_weak() {
            Binding::Weak
        } else if matches!(sym.section(), SymbolSection::Absolute) {
            Binding::Absolute
        } else {
            Binding::Global
        };
        let ty = match sym.kind() {
            object::SymbolKind::Text | object::SymbolKind::Label => SymbolType::Function,
            object::SymbolKind::Data => SymbolType::Object,
            object::SymbolKind::Section => SymbolType::Section,
            object::SymbolKind::File => SymbolType::File,
            object::SymbolKind::Tls => SymbolType::Tls,
            _ => SymbolType::NoType,
        };
        let visibility = elf_visibility(&sym);
        // For `SHN_COMMON` symbols ELF overloads `st_value` to carry the
        // required alignment rather than an address (spec §4.4 common-symbol
        // promotion); every other kind just gets the trivial alignment.
        let align = if kind == Kind::Common { sym.address().max(1) } else { 1 };

        symbols.push(RawSymbol {
            name,
            is_local: sym.is_local(),
            local_index,
            candidate: Candidate {
                kind,
                strength,
                binding,
                visibility,
                ty,
                size: sym.size(),
                align,
                value: sym.address(),
                fragment_ref,
                ordinal,
                bitcode: false,
            },
        });
    }

    Ok(ReadResult { object, symbols })
}

/// Sections a patch-base input (an executable used as the base image for a
/// later "patch" link) keeps; everything else is dropped so the mapper never
/// places its code/data bytes into the new output (spec §9 patch-base mode).
/// Symbol and dynamic-linking metadata survive because the patch link still
/// needs to resolve against the base image's exported symbols.
const PATCH_BASE_SECTION_WHITELIST: &[&str] = &[
    ".symtab",
    ".strtab",
    ".dynsym",
    ".dynstr",
    ".dynamic",
    ".gnu.version",
    ".gnu.version_d",
    ".gnu.version_r",
    ".hash",
    ".gnu.hash",
];

/// Discards every section of `object` not on [`PATCH_BASE_SECTION_WHITELIST`],
/// marking it [`SectionKind::Discard`] so the mapper (C10) drops it rather
/// than placing it in the output.
pub fn apply_patch_base_whitelist(object: &mut ObjectFile) {
    for section in &mut object.sections {
        if !PATCH_BASE_SECTION_WHITELIST.contains(&section.name.as_str()) {
            section.kind = SectionKind::Discard;
        }
    }
}

fn section_raw_flags(sec: &impl ObjectSection) -> u64 {
    match sec.flags() {
        SectionFlags::Elf { sh_flags } => sh_flags,
        _ => 0,
    }
}

/// Extracts `st_other & 0x3` (the ELF visibility field) from a symbol's raw
/// flags; the generic `object` API has no cross-format visibility accessor.
fn elf_visibility(sym: &impl ObjectSymbol) -> Visibility {
    match sym.flags() {
        object::SymbolFlags::Elf { st_info: _, st_other } => match st_other & 0x3 {
            1 => Visibility::Internal,
            2 => Visibility::Hidden,
            3 => Visibility::Protected,
            _ => Visibility::Default,
        },
        _ => Visibility::Default,
    }
}

/// Classifies a section by name first (the conventional GNU names the
/// mapper and layout engine special-case), falling back to the `object`
/// crate's generic [`object::SectionKind`].
fn classify_section_kind(name: &str, generic: object::SectionKind) -> SectionKind {
    if name == ".eh_frame" {
        return SectionKind::EhFrame;
    }
    if name == ".dynamic" {
        return SectionKind::Dynamic;
    }
    if name == ".dynsym" {
        return SectionKind::DynSym;
    }
    if name == ".symtab" {
        return SectionKind::SymTab;
    }
    if name == ".strtab" || name == ".dynstr" || name == ".shstrtab" {
        return SectionKind::StrTab;
    }
    if name.starts_with(".rel") {
        return SectionKind::Relocation;
    }
    if name.starts_with(".group") {
        return SectionKind::Group;
    }
    if name.starts_with(".gnu.version") {
        return SectionKind::Version;
    }
    match generic {
        object::SectionKind::UninitializedData | object::SectionKind::UninitializedTls => {
            SectionKind::Bss
        }
        object::SectionKind::ReadOnlyString | object::SectionKind::OtherString => {
            SectionKind::MergeString
        }
        object::SectionKind::Note => SectionKind::Note,
        object::SectionKind::Debug | object::SectionKind::DebugString => SectionKind::Ignore,
        object::SectionKind::Linker | object::SectionKind::Metadata => SectionKind::Ignore,
        _ => SectionKind::Regular,
    }
}

/// Maps the `object` crate's architecture-generic relocation taxonomy down
/// to the five kinds this core's [`crate::reloc::Relocator`] trait
/// understands (spec §4.8). Kinds this core has no arithmetic for are
/// reported and skipped rather than panicking mid-parse.
fn classify_reloc_kind(
    kind: ObjRelocationKind,
    _encoding: RelocationEncoding,
    size: u8,
) -> Option<RelocKind> {
    match (kind, size) {
        (ObjRelocationKind::Absolute, 64) => Some(RelocKind::Abs64),
        (ObjRelocationKind::Absolute, 32) => Some(RelocKind::Abs32Signed),
        (ObjRelocationKind::Relative, 32) => Some(RelocKind::Pc32),
        (ObjRelocationKind::PltRelative, 32) => Some(RelocKind::Plt32),
        (ObjRelocationKind::GotRelative, 32) => Some(RelocKind::GotPcRel32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal valid ELF64 relocatable object with one `.text`
    /// section and one global symbol defined in it, enough to exercise the
    /// reader without a real toolchain-produced fixture on disk.
    fn build_minimal_elf64() -> Vec<u8> {
        use object::write::{Object as WriteObject, SectionKind as WSectionKind, SymbolSection};
        use object::{Architecture, BinaryFormat, Endianness};

        let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), WSectionKind::Text);
        obj.append_section_data(text, &[0x90, 0x90, 0xc3], 1);
        obj.add_symbol(object::write::Symbol {
            name: b"main".to_vec(),
            value: 0,
            size: 3,
            kind: object::SymbolKind::Text,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: object::SymbolFlags::None,
        });
        obj.write().unwrap()
    }

    #[test]
    fn reads_section_and_defined_symbol_from_synthetic_object() {
        let bytes = build_minimal_elf64();
        let result = read_object(&bytes, 0, "synthetic.o").unwrap();
        assert!(result
            .object
            .sections
            .iter()
            .any(|s| s.name == ".text" && s.total_size() == 3));
        let main_sym = result
            .symbols
            .iter()
            .find(|s| s.name == "main")
            .expect("main symbol present");
        assert_eq!(main_sym.candidate.kind, Kind::Define);
        assert_eq!(main_sym.candidate.size, 3);
    }
}
