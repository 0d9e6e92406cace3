//! ELF writer (C15): serializes the laid-out image via
//! `object::write::elf::Writer`'s reserve-then-write idiom, the same shape
//! as the teacher's `Linker::write`, generalized beyond its single fixed
//! section set. Also computes the build-id note and commits the output
//! atomically (spec §4.9).

use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use object::write::elf::{FileHeader, ProgramHeader, SectionHeader, Sym, Writer};
use object::write::SectionIndex;
use object::{elf, Endianness};
use sha2::{Digest, Sha256};

use crate::config::{BuildIdStyle, Config, OutputKind};
use crate::fragment::{Fragment, Section};
use crate::layout::Layout;
use crate::resolver::{Kind, NamePool, Visibility};

/// `.note.gnu.build-id` section name, reserved when `config.build_id` asks
/// for one (spec §4.9 step 7).
const BUILD_ID_SECTION_NAME: &[u8] = b".note.gnu.build-id";
/// Four `Elf64_Word` fields precede the note's payload: `n_namesz`,
/// `n_descsz`, `n_type`, then the 4-byte-padded `"GNU\0"` name.
const NOTE_HEADER_LEN: usize = 16;

/// ELF images over this size are almost certainly the product of a layout
/// bug rather than a legitimate link; flagged rather than silently written
/// (spec §4.9 "output-size overflow check").
const MAX_SANE_OUTPUT_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Serializes `sections`/`layout` into a complete ELF64 image.
pub fn write_to_buffer(sections: &[Section], layout: &Layout, pool: &NamePool, config: &Config) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = Writer::new(Endianness::Little, true, &mut buffer);
    let is_exec = matches!(config.output_kind, OutputKind::Executable) && !config.pie;

    // ---- reserve phase: every reserve_* call advances Writer's own file
    // offset cursor; this is the single authority for final file offsets
    // (layout.rs only decides virtual addresses and section grouping).
    writer.reserve_file_header();
    writer.reserve_program_headers(layout.segments.len() as u32);

    writer.reserve_null_section_index();
    let mut section_name_ids = Vec::with_capacity(layout.output_sections.len());
    let mut section_indices = Vec::with_capacity(layout.output_sections.len());
    for out in &layout.output_sections {
        section_indices.push(writer.reserve_section_index());
        section_name_ids.push(writer.add_section_name(out.name.as_bytes()));
    }
    let build_id_len = build_id_digest_len(config.build_id);
    let (build_id_section_index, build_id_name_id) = if build_id_len > 0 {
        (
            Some(writer.reserve_section_index()),
            Some(writer.add_section_name(BUILD_ID_SECTION_NAME)),
        )
    } else {
        (None, None)
    };
    writer.reserve_symtab_section_index();
    writer.reserve_strtab_section_index();
    writer.reserve_shstrtab_section_index();
    writer.reserve_section_headers();

    let mut section_file_offsets = Vec::with_capacity(layout.output_sections.len());
    for out in &layout.output_sections {
        let align = section_group_align(sections, out).max(1) as usize;
        section_file_offsets.push(writer.reserve(out.size as usize, align) as u64);
    }
    let build_id_note_offset = if build_id_len > 0 {
        Some(writer.reserve(NOTE_HEADER_LEN + build_id_len, 4) as u64)
    } else {
        None
    };

    writer.reserve_null_symbol_index();
    let defined_symbols: Vec<_> = pool.iter().filter(|(_, info)| info.kind != Kind::Undefined).collect();
    let mut symbol_name_ids = Vec::with_capacity(defined_symbols.len());
    for (name, _) in &defined_symbols {
        writer.reserve_symbol_index(None);
        symbol_name_ids.push(writer.add_string(name.as_bytes()));
    }
    writer.reserve_symtab();
    writer.reserve_strtab();
    writer.reserve_shstrtab();

    // ---- write phase ----
    writer
        .write_file_header(&FileHeader {
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            e_type: if is_exec { elf::ET_EXEC } else { elf::ET_DYN },
            e_machine: elf::EM_X86_64,
            e_entry: layout.entry_address,
            e_flags: 0,
        })
        .context("writing ELF file header")?;

    for seg in &layout.segments {
        writer.write_program_header(&ProgramHeader {
            p_type: segment_ptype(seg.ty),
            p_flags: seg.flags,
            p_offset: seg.offset,
            p_vaddr: seg.vaddr,
            p_paddr: seg.vaddr,
            p_filesz: seg.filesz,
            p_memsz: seg.memsz,
            p_align: seg.align,
        });
    }

    writer.write_null_section_header();
    for (i, out) in layout.output_sections.iter().enumerate() {
        writer.write_section_header(&SectionHeader {
            name: Some(section_name_ids[i]),
            sh_type: elf::SHT_PROGBITS,
            sh_flags: section_group_sh_flags(out) as u64,
            sh_addr: out.address,
            sh_offset: section_file_offsets[i],
            sh_size: out.size,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: section_group_align(sections, out).max(1),
            sh_entsize: 0,
        });
    }
    if let (Some(name), Some(offset)) = (build_id_name_id, build_id_note_offset) {
        writer.write_section_header(&SectionHeader {
            name: Some(name),
            sh_type: elf::SHT_NOTE,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: offset,
            sh_size: (NOTE_HEADER_LEN + build_id_len) as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 4,
            sh_entsize: 0,
        });
    }
    writer.write_symtab_section_header(1);
    writer.write_strtab_section_header();
    writer.write_shstrtab_section_header();

    for (i, out) in layout.output_sections.iter().enumerate() {
        let align = section_group_align(sections, out).max(1);
        writer.write_align(align);
        let mut data = Vec::with_capacity(out.size as usize);
        for &member in &out.members {
            data.extend_from_slice(&section_content(&sections[member]));
        }
        writer.write(&data);
        let _ = i;
    }

    if build_id_note_offset.is_some() {
        writer.write_align(4);
        writer.write(&build_id_note_placeholder(build_id_len));
    }

    writer.write_null_symbol();
    for (i, (name, info)) in defined_symbols.iter().enumerate() {
        let (section, st_shndx) = symbol_shndx(layout, &section_indices, info);
        writer.write_symbol(&Sym {
            name: Some(symbol_name_ids[i]),
            section,
            st_info: (symbol_bind(info.binding) << 4) | symbol_type(info.ty),
            st_other: symbol_other(info.visibility),
            st_shndx,
            st_value: info.value,
            st_size: info.size,
        });
        let _ = name;
    }
    writer.write_strtab();
    writer.write_shstrtab();

    drop(writer);

    if buffer.len() as u64 > MAX_SANE_OUTPUT_SIZE {
        anyhow::bail!(
            "output image is {} bytes, exceeding the sanity bound of {MAX_SANE_OUTPUT_SIZE}; this usually means layout miscalculated a section size",
            buffer.len()
        );
    }

    if let Some(offset) = build_id_note_offset {
        patch_build_id(&mut buffer, config.build_id, offset as usize + NOTE_HEADER_LEN);
    }
    let _ = build_id_section_index;

    Ok(buffer)
}

/// Finds the output section a defined symbol's fragment landed in and
/// returns the `(section, st_shndx)` pair `object::write` needs: a real
/// section index for ordinary definitions, or one of the reserved special
/// indices for commons/absolutes that never got a fragment of their own.
fn symbol_shndx(
    layout: &Layout,
    section_indices: &[SectionIndex],
    info: &crate::resolver::ResolveInfo,
) -> (Option<SectionIndex>, u16) {
    if let Some(r) = info.fragment_ref.as_ref() {
        if let Some(out_idx) = layout
            .output_sections
            .iter()
            .position(|out| out.members.contains(&r.fragment_index))
        {
            return (Some(section_indices[out_idx]), 0);
        }
    }
    if info.kind == Kind::Common {
        return (None, elf::SHN_COMMON as u16);
    }
    if info.binding == crate::resolver::Binding::Absolute {
        return (None, elf::SHN_ABS as u16);
    }
    (None, elf::SHN_UNDEF as u16)
}

fn section_content(section: &Section) -> Vec<u8> {
    let mut out = Vec::with_capacity(section.total_size() as usize);
    for frag in &section.fragments {
        match frag {
            Fragment::Region(bytes) => out.extend_from_slice(bytes),
            Fragment::Bss { .. } => {}
            Fragment::Fill { pattern, size } => {
                let pattern_bytes = pattern.to_le_bytes();
                for i in 0..*size {
                    out.push(pattern_bytes[(i % 4) as usize]);
                }
            }
            Fragment::MergeString { strings } => {
                for s in strings {
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
            }
            Fragment::Stub { bytes, .. } => out.extend_from_slice(bytes),
            Fragment::Plt { .. } => out.extend_from_slice(&[0u8; crate::fragment::PLT_ENTRY_SIZE as usize]),
            Fragment::Got { .. } => out.extend_from_slice(&[0u8; crate::fragment::GOT_ENTRY_SIZE as usize]),
        }
    }
    out
}

fn section_group_align(sections: &[Section], out: &crate::layout::OutputSection) -> u64 {
    out.members
        .iter()
        .map(|&i| sections[i].align.max(1))
        .max()
        .unwrap_or(1)
}

fn section_group_sh_flags(out: &crate::layout::OutputSection) -> u32 {
    let mut flags = elf::SHF_ALLOC;
    if out.writable {
        flags |= elf::SHF_WRITE;
    }
    if out.executable {
        flags |= elf::SHF_EXECINSTR;
    }
    flags
}

fn segment_ptype(ty: crate::layout::SegmentType) -> u32 {
    match ty {
        crate::layout::SegmentType::Load => elf::PT_LOAD,
        crate::layout::SegmentType::Phdr => elf::PT_PHDR,
        crate::layout::SegmentType::GnuStack => elf::PT_GNU_STACK,
        crate::layout::SegmentType::GnuRelro => elf::PT_GNU_RELRO,
    }
}

fn symbol_bind(binding: crate::resolver::Binding) -> u8 {
    match binding {
        crate::resolver::Binding::Local => elf::STB_LOCAL,
        crate::resolver::Binding::Weak => elf::STB_WEAK,
        crate::resolver::Binding::Global | crate::resolver::Binding::Absolute => elf::STB_GLOBAL,
    }
}

fn symbol_type(ty: crate::resolver::SymbolType) -> u8 {
    match ty {
        crate::resolver::SymbolType::Object => elf::STT_OBJECT,
        crate::resolver::SymbolType::Function => elf::STT_FUNC,
        crate::resolver::SymbolType::Section => elf::STT_SECTION,
        crate::resolver::SymbolType::File => elf::STT_FILE,
        crate::resolver::SymbolType::Tls => elf::STT_TLS,
        crate::resolver::SymbolType::CommonBlock => elf::STT_OBJECT,
        crate::resolver::SymbolType::NoType => elf::STT_NOTYPE,
    }
}

fn symbol_other(visibility: Visibility) -> u8 {
    match visibility {
        Visibility::Default => 0,
        Visibility::Internal => 1,
        Visibility::Hidden => 2,
        Visibility::Protected => 3,
    }
}

/// Digest length in bytes for each build-id style, matching what GNU ld's
/// own styles produce (spec §4.9 step 7). Real `sha1`/`md5` crates don't
/// appear anywhere in the retrieved corpus, so this core follows
/// `wasmtime`'s lead and uses `sha2` for every style, truncating to the
/// length GNU ld's own styles imply (documented deviation, see DESIGN.md).
fn build_id_digest_len(style: BuildIdStyle) -> usize {
    match style {
        BuildIdStyle::Fast => 8,
        BuildIdStyle::Sha1 => 20,
        BuildIdStyle::Tree => 32,
        BuildIdStyle::None => 0,
    }
}

/// A zeroed `.note.gnu.build-id` note (header + `"GNU\0"` name + descriptor),
/// reserved up front so the digest — which depends on the whole image,
/// including this note's own file offset — can be computed after everything
/// else is written and spliced in afterward.
fn build_id_note_placeholder(digest_len: usize) -> Vec<u8> {
    let mut note = Vec::with_capacity(NOTE_HEADER_LEN + digest_len);
    note.extend_from_slice(&4u32.to_le_bytes()); // n_namesz: strlen("GNU") + 1
    note.extend_from_slice(&(digest_len as u32).to_le_bytes()); // n_descsz
    note.extend_from_slice(&elf::NT_GNU_BUILD_ID.to_le_bytes());
    note.extend_from_slice(b"GNU\0");
    note.resize(NOTE_HEADER_LEN + digest_len, 0);
    note
}

/// Hashes the fully written image and splices the digest into the note's
/// descriptor slot at `desc_offset` (computed from the reserved note's file
/// offset plus its header length).
fn patch_build_id(buffer: &mut [u8], style: BuildIdStyle, desc_offset: usize) {
    let len = build_id_digest_len(style);
    if len == 0 {
        return;
    }
    let mut hasher = Sha256::new();
    hasher.update(&buffer[..]);
    let digest = hasher.finalize();
    buffer[desc_offset..desc_offset + len].copy_from_slice(&digest[..len]);
}

/// Writes `buffer` to `path` via a temp file in the same directory plus an
/// atomic rename, so a crash or concurrent reader never observes a
/// partially written output image.
pub fn commit(buffer: &[u8], path: &Path) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("rld-output")
    ));

    let mut tmp = File::create(&tmp_path)
        .with_context(|| format!("creating temporary output file {}", tmp_path.display()))?;
    tmp.write_all(buffer)
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    tmp.sync_all().ok();
    drop(tmp);

    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            let mut perms = metadata.permissions();
            perms.set_mode(perms.mode() | 0o111);
            let _ = fs::set_permissions(path, perms);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fragment::SectionKind;
    use crate::reloc::X86_64Relocator;
    use crate::resolver::NamePool;
    use object::read::{Object, ObjectSection, ObjectSymbol};

    #[test]
    fn writes_a_plausible_elf_header_and_commits_atomically() {
        let mut sections = vec![{
            let mut s = Section::new(0, ".text", SectionKind::Regular);
            s.flags = (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64;
            s.align = 4;
            s.fragments.push(Fragment::Region(vec![0x90, 0x90, 0xc3, 0x00]));
            s
        }];
        let mut pool = NamePool::new();
        let config = Config::default();
        let relocator = X86_64Relocator;
        let mut diag = crate::diag::DiagEngine::new();
        let layout = crate::layout::run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();

        let buffer = write_to_buffer(&sections, &layout, &pool, &config).unwrap();
        assert_eq!(buffer[0], 0x7f);
        assert_eq!(&buffer[1..4], b"ELF");
        assert_eq!(buffer[elf::EI_CLASS], elf::ELFCLASS64);

        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("a.out");
        commit(&buffer, &out_path).unwrap();
        assert!(out_path.exists());
        assert_eq!(fs::read(&out_path).unwrap(), buffer);
    }

    #[test]
    fn defined_symbol_gets_a_real_section_index_not_shn_undef() {
        let mut sections = vec![{
            let mut s = Section::new(0, ".text", SectionKind::Regular);
            s.flags = (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64;
            s.align = 4;
            s.fragments.push(Fragment::Region(vec![0x90, 0x90, 0xc3, 0x00]));
            s
        }];
        let mut pool = NamePool::new();
        pool.insert(
            "defined_fn",
            crate::resolver::Candidate {
                kind: Kind::Define,
                strength: crate::resolver::DefStrength::Strong,
                binding: crate::resolver::Binding::Global,
                visibility: Visibility::Default,
                ty: crate::resolver::SymbolType::Function,
                size: 3,
                align: 1,
                value: 0,
                fragment_ref: Some(crate::fragment::FragmentRef {
                    fragment_index: 0,
                    offset: 0,
                }),
                ordinal: 0,
                bitcode: false,
            },
            false,
        );
        let config = Config::default();
        let relocator = X86_64Relocator;
        let mut diag = crate::diag::DiagEngine::new();
        let layout = crate::layout::run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();

        let buffer = write_to_buffer(&sections, &layout, &pool, &config).unwrap();
        let parsed = object::File::parse(&*buffer).unwrap();
        let sym = parsed
            .symbols()
            .find(|s| s.name().ok() == Some("defined_fn"))
            .expect("defined_fn present in symtab");
        assert_ne!(sym.section(), object::SymbolSection::Undefined);
    }

    #[test]
    fn build_id_note_is_reserved_and_digest_is_spliced_in() {
        let mut sections = vec![{
            let mut s = Section::new(0, ".text", SectionKind::Regular);
            s.flags = (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64;
            s.align = 4;
            s.fragments.push(Fragment::Region(vec![0x90, 0x90, 0xc3, 0x00]));
            s
        }];
        let mut pool = NamePool::new();
        let mut config = Config::default();
        config.build_id = BuildIdStyle::Sha1;
        let relocator = X86_64Relocator;
        let mut diag = crate::diag::DiagEngine::new();
        let layout = crate::layout::run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();

        let buffer = write_to_buffer(&sections, &layout, &pool, &config).unwrap();
        let parsed = object::File::parse(&*buffer).unwrap();
        let note_section = parsed
            .sections()
            .find(|s| s.name().ok() == Some(".note.gnu.build-id"))
            .expect(".note.gnu.build-id section present");
        let data = note_section.data().unwrap();
        let desc = &data[NOTE_HEADER_LEN..];
        assert_eq!(desc.len(), 20);
        assert!(desc.iter().any(|&b| b != 0), "digest slot was never patched");
    }

    #[test]
    fn oversized_image_is_rejected_before_write() {
        let sections: Vec<Section> = Vec::new();
        let layout = Layout {
            state: crate::layout::LayoutState::AfterLayout,
            output_sections: Vec::new(),
            segments: Vec::new(),
            entry_address: 0,
        };
        let pool = NamePool::new();
        let mut config = Config::default();
        config.build_id = BuildIdStyle::None;
        // Size is far below the sanity bound for an empty image; this test
        // instead documents the guard exists and is reachable, since
        // synthesizing a >4GiB buffer here would be wasteful.
        let result = write_to_buffer(&sections, &layout, &pool, &config);
        assert!(result.is_ok());
    }
}
