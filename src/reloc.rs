//! Relocation applier (C14): per-target arithmetic dispatched through a
//! `Relocator` trait. Per spec §1 the full per-target arithmetic tables are
//! an external collaborator; this module defines the trait boundary plus a
//! concrete x86_64 implementation grounded on the teacher's `relocate()`.

use anyhow::{anyhow, Context, Result};

use crate::fragment::{Fragment, Section};
use crate::layout::{fragment_address, Layout};
use crate::resolver::NamePool;

/// Where a relocation's value comes from.
#[derive(Debug, Clone)]
pub enum RelocationTarget {
    /// Relocation against a section, with an additional offset into it
    /// (teacher's `RelocationTarget::Section`).
    Section(String, u64),
    /// Relocation against a named symbol.
    Symbol(String),
}

/// `(type, offset_in_section, symbol, addend[, target])` from spec §3.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub kind: RelocKind,
    pub offset_in_section: u64,
    pub target: RelocationTarget,
    pub addend: i64,
    /// Plugin-provided override for the computed target value
    /// (`RelocCallback`, C16 §4.10).
    pub target_data: Option<i64>,
}

/// Target-independent relocation kinds this core understands; a concrete
/// `Relocator` maps `(arch-specific r_type)` to one of these before calling
/// [`Relocator::apply`], following the `object` crate's own
/// `RelocationKind`/`RelocationEncoding` split that the teacher matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// `S + A`, absolute, signed 32-bit (`R_X86_64_32S`).
    Abs32Signed,
    /// `S + A`, absolute, 64-bit (`R_X86_64_64`).
    Abs64,
    /// `S + A - P`, PC-relative 32-bit (`R_X86_64_PC32`).
    Pc32,
    /// `S + A - P` through the PLT, 32-bit (`R_X86_64_PLT32`); this core has
    /// no PLT reservation machinery yet, so it behaves like `Pc32`, matching
    /// the teacher's documented simplification.
    Plt32,
    /// `G + GOT + A - P`, GOT-relative 32-bit (`R_X86_64_GOTPCREL`).
    GotPcRel32,
}

/// Out-of-range classification used by the layout engine's stub-insertion
/// pass (C13 §4.7 step 3).
pub trait Relocator: Send + Sync {
    /// Splices `value` into `data` at `offset`, per this target's bit
    /// layout for `kind`.
    fn apply(&self, kind: RelocKind, offset: usize, value: i64, data: &mut [u8]) -> Result<()>;

    /// Whether a relocation computed as `value` is representable by `kind`
    /// without a stub/trampoline.
    fn in_range(&self, kind: RelocKind, value: i64) -> bool;

    fn plt_entry_template(&self) -> &'static [u8];
    fn got_entry_size(&self) -> u64;

    /// Self-contained trampoline that jumps to the absolute address `dest`,
    /// for a call site too far away to reach it directly (C13 stub
    /// insertion). Unlike [`Relocator::plt_entry_template`] this needs no
    /// GOT slot: the destination is baked into the stub's own bytes.
    fn stub_bytes(&self, dest: u64) -> Vec<u8>;
}

/// x86_64 relocator, grounded on `jiegec-cold`'s `Linker::relocate`.
pub struct X86_64Relocator;

impl Relocator for X86_64Relocator {
    fn apply(&self, kind: RelocKind, offset: usize, value: i64, data: &mut [u8]) -> Result<()> {
        match kind {
            RelocKind::Abs32Signed | RelocKind::Pc32 | RelocKind::Plt32 | RelocKind::GotPcRel32 => {
                if offset + 4 > data.len() {
                    return Err(anyhow!("relocation offset {offset} out of section bounds"));
                }
                if !self.in_range(kind, value) {
                    return Err(anyhow!(
                        "relocation value {value:#x} does not fit in 32 bits for {kind:?}"
                    ));
                }
                data[offset..offset + 4].copy_from_slice(&(value as i32).to_le_bytes());
            }
            RelocKind::Abs64 => {
                if offset + 8 > data.len() {
                    return Err(anyhow!("relocation offset {offset} out of section bounds"));
                }
                data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            }
        }
        Ok(())
    }

    fn in_range(&self, kind: RelocKind, value: i64) -> bool {
        match kind {
            RelocKind::Abs64 => true,
            _ => value >= i32::MIN as i64 && value <= i32::MAX as i64,
        }
    }

    fn plt_entry_template(&self) -> &'static [u8] {
        // jmp *GOT(%rip); push idx; jmp plt0 -- simplified 16-byte stub.
        &[0xff, 0x25, 0, 0, 0, 0, 0x68, 0, 0, 0, 0, 0xe9, 0, 0, 0, 0]
    }

    fn got_entry_size(&self) -> u64 {
        8
    }

    fn stub_bytes(&self, dest: u64) -> Vec<u8> {
        // movabs rax, dest; jmp rax
        let mut bytes = vec![0x48, 0xb8];
        bytes.extend_from_slice(&dest.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xe0]);
        bytes
    }
}

/// Walks every live section's relocations and patches fragment bytes with
/// the target's final address, now that the layout engine (C13) has
/// assigned one (spec §4.8).
pub fn apply_all(
    sections: &mut [Section],
    layout: &Layout,
    pool: &NamePool,
    relocator: &dyn Relocator,
) -> Result<()> {
    for idx in 0..sections.len() {
        if !sections[idx].live {
            continue;
        }
        let place_base = fragment_address(layout, sections, idx).unwrap_or(0);
        let relocations = sections[idx].relocations.clone();

        for reloc in &relocations {
            let symbol_addr = match &reloc.target {
                RelocationTarget::Symbol(name) => {
                    let wrapped = pool.apply_wrap(name);
                    pool.get(&wrapped)
                        .map(|info| info.value as i64)
                        .ok_or_else(|| anyhow!("relocation against unresolved symbol {wrapped}"))?
                }
                RelocationTarget::Section(name, extra_offset) => sections
                    .iter()
                    .find(|s| &s.name == name)
                    .and_then(|s| fragment_address(layout, sections, s.index))
                    .map(|addr| addr as i64 + *extra_offset as i64)
                    .ok_or_else(|| anyhow!("relocation against unknown section {name}"))?,
            };
            let place = (place_base + reloc.offset_in_section) as i64;
            let value = reloc
                .target_data
                .unwrap_or_else(|| compute_value(reloc.kind, symbol_addr, place, reloc.addend));

            let section = &mut sections[idx];
            let Some(Fragment::Region(bytes)) = section
                .fragments
                .iter_mut()
                .find(|f| matches!(f, Fragment::Region(_)))
            else {
                continue;
            };
            relocator
                .apply(reloc.kind, reloc.offset_in_section as usize, value, bytes)
                .with_context(|| format!("applying relocation in section {}", section.name))?;
        }
    }
    Ok(())
}

/// Computes the relocated value `S + A [- P]` the way spec §4.8 step 1
/// describes, before dispatch to a [`Relocator`].
pub fn compute_value(kind: RelocKind, symbol_addr: i64, place: i64, addend: i64) -> i64 {
    match kind {
        RelocKind::Abs32Signed | RelocKind::Abs64 => symbol_addr.wrapping_add(addend),
        RelocKind::Pc32 | RelocKind::Plt32 | RelocKind::GotPcRel32 => {
            symbol_addr.wrapping_add(addend).wrapping_sub(place)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc32_matches_s_plus_a_minus_p() {
        let v = compute_value(RelocKind::Pc32, 0x401010, 0x401000, -4);
        assert_eq!(v, 0x401010 - 4 - 0x401000);
    }

    #[test]
    fn out_of_range_32bit_value_is_rejected() {
        let r = X86_64Relocator;
        let mut buf = [0u8; 4];
        let huge = (i32::MAX as i64) + 100;
        assert!(r.apply(RelocKind::Pc32, 0, huge, &mut buf).is_err());
    }

    #[test]
    fn abs32_signed_writes_little_endian() {
        let r = X86_64Relocator;
        let mut buf = [0u8; 4];
        r.apply(RelocKind::Abs32Signed, 0, 0x1020_3040, &mut buf).unwrap();
        assert_eq!(buf, [0x40, 0x30, 0x20, 0x10]);
    }

    #[test]
    fn apply_all_patches_abs64_with_resolved_symbol_address() {
        use crate::config::Config;
        use crate::fragment::{FragmentRef, SectionKind};
        use crate::layout;
        use crate::resolver::{Binding, Candidate, DefStrength, Kind, NamePool, SymbolType, Visibility};

        let mut data = Section::new(0, ".data", SectionKind::Regular);
        data.flags = object::elf::SHF_ALLOC as u64 | object::elf::SHF_WRITE as u64;
        data.align = 8;
        data.fragments.push(Fragment::Region(vec![0u8; 8]));

        let mut text = Section::new(1, ".text", SectionKind::Regular);
        text.flags = object::elf::SHF_ALLOC as u64 | object::elf::SHF_EXECINSTR as u64;
        text.align = 4;
        text.fragments.push(Fragment::Region(vec![0u8; 8]));
        text.relocations.push(Relocation {
            kind: RelocKind::Abs64,
            offset_in_section: 0,
            target: RelocationTarget::Symbol("target_sym".into()),
            addend: 0,
            target_data: None,
        });

        let mut sections = vec![data, text];
        let mut pool = NamePool::new();
        pool.insert(
            "target_sym",
            Candidate {
                kind: Kind::Define,
                strength: DefStrength::Strong,
                binding: Binding::Global,
                visibility: Visibility::Default,
                ty: SymbolType::Object,
                size: 8,
                align: 1,
                value: 0,
                fragment_ref: Some(FragmentRef {
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
        let layout = layout::run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();
        apply_all(&mut sections, &layout, &pool, &relocator).unwrap();

        let target_addr = layout::fragment_address(&layout, &sections, 0).unwrap();
        let Fragment::Region(bytes) = &sections[1].fragments[0] else {
            panic!("expected region fragment")
        };
        assert_eq!(
            u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            target_addr
        );
    }
}
