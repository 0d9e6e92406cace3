//! Layout engine (C13): assigns section offsets/addresses, synthesizes
//! segments, and evaluates script expressions, advancing through the state
//! machine the plugin host (C16) observes at each boundary (spec §4.7).

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::config::{Config, OrphanHandling};
use crate::diag::{DiagArg, DiagEngine};
use crate::fragment::{Fragment, Section};
use crate::mapper::SectionMapper;
use crate::reloc::{compute_value, RelocationTarget, Relocator};
use crate::resolver::NamePool;
use crate::script::{Assignment, EvalContext, Expr, ScriptFile, Stmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutState {
    Unknown,
    Initializing,
    BeforeLayout,
    CreatingSections,
    CreatingSegments,
    AfterLayout,
}

/// One output section: a concatenation of live input-section fragments
/// under a single name, address, and file offset (spec §3).
pub struct OutputSection {
    pub name: String,
    pub address: u64,
    pub offset: u64,
    pub size: u64,
    pub writable: bool,
    pub executable: bool,
    pub alloc: bool,
    /// Indices into the input `sections` slice this output section holds,
    /// in final placement order.
    pub members: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    Load,
    Phdr,
    GnuStack,
    GnuRelro,
}

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub struct Segment {
    pub ty: SegmentType,
    pub flags: u32,
    pub vaddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
    pub output_sections: Vec<usize>,
}

pub struct Layout {
    pub state: LayoutState,
    pub output_sections: Vec<OutputSection>,
    pub segments: Vec<Segment>,
    pub entry_address: u64,
}

const DEFAULT_IMAGE_BASE_EXEC: u64 = 0x40_0000;
const DEFAULT_IMAGE_BASE_PIC: u64 = 0;
/// Bound on stub-insertion re-layout passes (spec §4.7 step 3 "to fixpoint"):
/// a real target converges in one or two passes; this guards against a
/// pathological relocator/script combination that never stabilizes.
const MAX_STUB_PASSES: usize = 8;

/// Runs the full layout pipeline: section grouping, address assignment,
/// segment synthesis, stub insertion to fixpoint, and symbol finalization.
pub fn run(
    sections: &mut [Section],
    script: Option<&ScriptFile>,
    config: &Config,
    pool: &mut NamePool,
    relocator: &dyn Relocator,
    diag: &mut DiagEngine,
) -> Result<Layout> {
    tracing::debug!(state = ?LayoutState::Initializing, "layout starting");
    tracing::debug!(state = ?LayoutState::BeforeLayout, "grouping input sections");

    let mut groups = group_sections(sections, script, config, diag)?;
    tracing::debug!(state = ?LayoutState::CreatingSections, "assigning addresses");

    let base = config
        .image_base
        .unwrap_or(if config.is_position_independent() {
            DEFAULT_IMAGE_BASE_PIC
        } else {
            DEFAULT_IMAGE_BASE_EXEC
        });

    for pass in 0..MAX_STUB_PASSES {
        assign_addresses(&mut groups, sections, base, config);
        finalize_symbols(&groups, sections, pool, script);
        let inserted = insert_stubs(&mut groups, sections, pool, relocator)?;
        if !inserted {
            break;
        }
        if pass == MAX_STUB_PASSES - 1 {
            return Err(anyhow!(
                "layout did not converge after {MAX_STUB_PASSES} stub-insertion passes"
            ));
        }
    }

    tracing::debug!(state = ?LayoutState::CreatingSegments, "synthesizing segments");
    let segments = synthesize_segments(&groups, config);

    let state = LayoutState::AfterLayout;

    let entry_address = pool
        .get(&config.entry)
        .and_then(|info| info.fragment_ref)
        .and_then(|r| {
            groups.iter().find_map(|g| {
                g.members
                    .iter()
                    .position(|&idx| idx == r.fragment_index)
                    .map(|_| g.address + fragment_offset_in_group(g, sections, r.fragment_index) + r.offset)
            })
        })
        .unwrap_or(base);

    Ok(Layout {
        state,
        output_sections: groups,
        segments,
        entry_address,
    })
}

/// Resolves the final address of a fragment's owning input section, for
/// callers outside this module (the relocation applier, C14) that need the
/// same address space layout computed here without recomputing it.
pub fn fragment_address(layout: &Layout, sections: &[Section], fragment_index: usize) -> Option<u64> {
    layout.output_sections.iter().find_map(|g| {
        g.members
            .contains(&fragment_index)
            .then(|| g.address + fragment_offset_in_group(g, sections, fragment_index))
    })
}

fn fragment_offset_in_group(group: &OutputSection, sections: &[Section], fragment_index: usize) -> u64 {
    let mut offset = 0u64;
    for &idx in &group.members {
        if idx == fragment_index {
            return offset;
        }
        offset += sections[idx].total_size();
    }
    offset
}

/// Groups live input sections into output sections, via the script's rule
/// table when one is present and falling back to name-based orphan
/// collapsing otherwise (spec §4.5/§6).
fn group_sections(
    sections: &[Section],
    script: Option<&ScriptFile>,
    config: &Config,
    diag: &mut DiagEngine,
) -> Result<Vec<OutputSection>> {
    let mut order: Vec<String> = Vec::new();
    let mut members: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut mapper = SectionMapper::new();

    let descs = script.map(|s| s.output_sections()).unwrap_or_default();

    for sec in sections {
        if !sec.live || !sec.contributes_bytes() || !sec.is_alloc() {
            continue;
        }
        let placed = mapper.place(&descs, &sec.origin_file, sec);
        let name = if let Some((output_index, _)) = placed {
            descs[output_index].name.clone()
        } else {
            match mapper.handle_orphan(sec, config.orphan_handling) {
                Some(name) => {
                    match config.orphan_handling {
                        OrphanHandling::Warn => diag.warn(
                            "orphan section %0 placed into %1",
                            vec![DiagArg::Str(sec.name.clone()), DiagArg::Str(name.clone())],
                        ),
                        OrphanHandling::Error => diag.error(
                            "orphan section %0 has no matching rule",
                            vec![DiagArg::Str(sec.name.clone())],
                        ),
                        OrphanHandling::Place | OrphanHandling::Discard => {}
                    }
                    name
                }
                None => continue,
            }
        };
        if !members.contains_key(&name) {
            order.push(name.clone());
        }
        members.entry(name).or_default().push(sec.index);
    }

    Ok(order
        .into_iter()
        .map(|name| {
            let member_indices = members.remove(&name).unwrap_or_default();
            let writable = member_indices.iter().any(|&i| sections[i].is_writable());
            let executable = member_indices.iter().any(|&i| sections[i].is_executable());
            OutputSection {
                name,
                address: 0,
                offset: 0,
                size: 0,
                writable,
                executable,
                alloc: true,
                members: member_indices,
            }
        })
        .collect())
}

/// Assigns file offsets and virtual addresses to every output section,
/// page-aligning at the start of each distinct R/W/X permission group the
/// way segment synthesis will later need (spec §4.7 step 2).
fn assign_addresses(groups: &mut [OutputSection], sections: &[Section], base: u64, config: &Config) {
    let page = config.z.max_page_size.max(1);
    let mut addr = base;
    let mut offset = 0u64;
    let mut last_perms = None;

    for group in groups.iter_mut() {
        let perms = (group.writable, group.executable);
        if last_perms != Some(perms) {
            addr = align_up(addr, page);
            offset = align_up(offset, page);
            last_perms = Some(perms);
        }

        let align = group
            .members
            .iter()
            .map(|&i| sections[i].align.max(1))
            .max()
            .unwrap_or(1);
        addr = align_up(addr, align);
        offset = align_up(offset, align);

        group.address = addr;
        group.offset = offset;

        let mut size = 0u64;
        for &idx in &group.members {
            size += sections[idx].total_size();
        }
        group.size = size;

        addr += size;
        offset += size;
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        (value + align - 1) & !(align - 1)
    }
}

/// Writes each symbol's final address back into the name pool, and
/// evaluates top-level/inner script assignments against a running `.`
/// cursor (spec §4.7 step 5).
fn finalize_symbols(
    groups: &[OutputSection],
    sections: &[Section],
    pool: &mut NamePool,
    script: Option<&ScriptFile>,
) {
    let group_base = |fragment_index: usize| -> Option<u64> {
        groups.iter().find_map(|g| {
            g.members
                .iter()
                .find(|&&i| i == fragment_index)
                .map(|_| g.address + fragment_offset_in_group(g, sections, fragment_index))
        })
    };

    let names: Vec<String> = pool.iter().map(|(name, _)| name.clone()).collect();
    for name in names {
        let Some(info) = pool.get(&name) else { continue };
        let Some(fragment_ref) = info.fragment_ref else {
            continue;
        };
        if let Some(base) = group_base(fragment_ref.fragment_index) {
            if let Some(info) = pool.get_mut(&name) {
                info.value = base + fragment_ref.offset;
            }
        }
    }

    if let Some(script) = script {
        let mut ctx = EvalContext::default();
        for group in groups {
            ctx.section_addrs.insert(group.name.clone(), group.address);
            ctx.section_load_addrs
                .insert(group.name.clone(), group.address);
            ctx.section_sizes.insert(group.name.clone(), group.size);
        }
        for (name, info) in pool.iter() {
            ctx.symbols.insert(name.clone(), info.value);
        }

        apply_assignments(&script.statements, &mut ctx, pool);
    }
}

fn apply_assignments(statements: &[Stmt], ctx: &mut EvalContext, pool: &mut NamePool) {
    for stmt in statements {
        match stmt {
            Stmt::Assignment(a) => apply_one(a, ctx, pool),
            Stmt::Sections(descs) => {
                for desc in descs {
                    if let Some(addr) = ctx.section_addrs.get(&desc.name) {
                        ctx.dot = *addr;
                    }
                    for a in &desc.inner_assignments {
                        apply_one(a, ctx, pool);
                    }
                }
            }
            _ => {}
        }
    }
}

fn apply_one(a: &Assignment, ctx: &mut EvalContext, pool: &mut NamePool) {
    let Ok(value) = ctx.eval(&a.expr) else {
        return;
    };
    if a.provide && pool.get(&a.name).map(|i| i.kind != crate::resolver::Kind::Undefined).unwrap_or(false) {
        // PROVIDE only takes effect when nothing else already defines the
        // symbol (spec §6 PROVIDE semantics).
        return;
    }
    ctx.symbols.insert(a.name.clone(), value);
    if let Some(info) = pool.get_mut(&a.name) {
        info.value = value;
        if a.hidden {
            info.visibility = crate::resolver::Visibility::Hidden;
        }
    }
}

/// Checks every relocation against the now-assigned addresses; any target
/// out of the relocator's representable range gets a trampoline [`Fragment`]
/// appended to its section, which changes that section's size and forces
/// another [`assign_addresses`] pass (spec §4.7 step 3). The relocation
/// itself is redirected to the stub via `target_data` so the applier (C14)
/// actually lands on it instead of recomputing the original out-of-range
/// value.
fn insert_stubs(
    groups: &mut [OutputSection],
    sections: &mut [Section],
    pool: &NamePool,
    relocator: &dyn Relocator,
) -> Result<bool> {
    let address_of = |groups: &[OutputSection], sections: &[Section], fragment_index: usize| -> Option<u64> {
        groups.iter().find_map(|g| {
            g.members
                .iter()
                .find(|&&i| i == fragment_index)
                .map(|_| g.address + fragment_offset_in_group(g, sections, fragment_index))
        })
    };

    let resolve_target = |sections: &[Section], target: &RelocationTarget| -> Option<i64> {
        match target {
            RelocationTarget::Symbol(name) => {
                let wrapped = pool.apply_wrap(name);
                pool.get(&wrapped).map(|info| info.value as i64)
            }
            RelocationTarget::Section(name, extra_offset) => sections
                .iter()
                .find(|s| &s.name == name)
                .and_then(|s| address_of(groups, sections, s.index))
                .map(|addr| addr as i64 + *extra_offset as i64),
        }
    };

    // (section_index, relocation_index, absolute destination, label)
    let mut to_stub: Vec<(usize, usize, i64, String)> = Vec::new();
    for (idx, sec) in sections.iter().enumerate() {
        if !sec.live {
            continue;
        }
        let Some(section_addr) = address_of(groups, sections, idx) else {
            continue;
        };
        for (reloc_index, reloc) in sec.relocations.iter().enumerate() {
            if reloc.target_data.is_some() {
                // Already redirected to a stub in an earlier pass.
                continue;
            }
            let Some(target_addr) = resolve_target(sections, &reloc.target) else {
                // Unresolved; the relocation applier reports this later.
                continue;
            };
            let place = (section_addr + reloc.offset_in_section) as i64;
            let value = compute_value(reloc.kind, target_addr, place, reloc.addend);
            if relocator.in_range(reloc.kind, value) {
                continue;
            }
            let label = match &reloc.target {
                RelocationTarget::Symbol(name) => name.clone(),
                RelocationTarget::Section(name, _) => name.clone(),
            };
            // The stub unconditionally jumps to S+A: the same absolute
            // destination a direct (in-range) relocation would land on.
            to_stub.push((idx, reloc_index, target_addr.wrapping_add(reloc.addend), label));
        }
    }

    if to_stub.is_empty() {
        return Ok(false);
    }

    for (idx, reloc_index, dest, label) in to_stub {
        let stub_offset = sections[idx].total_size();
        sections[idx].fragments.push(Fragment::Stub {
            bytes: relocator.stub_bytes(dest as u64),
            target_symbol: label,
        });
        let Some(section_addr) = address_of(groups, sections, idx) else {
            continue;
        };
        let stub_addr = (section_addr + stub_offset) as i64;
        let reloc = &mut sections[idx].relocations[reloc_index];
        let call_site = (section_addr + reloc.offset_in_section) as i64;
        // Addend is already folded into `dest` above; the hop to the stub
        // itself must land exactly on its first byte.
        reloc.target_data = Some(compute_value(reloc.kind, stub_addr, call_site, 0));
    }
    Ok(true)
}

fn synthesize_segments(groups: &[OutputSection], config: &Config) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current: Option<Segment> = None;

    for (index, group) in groups.iter().enumerate() {
        if !group.alloc {
            continue;
        }
        let flags = PF_R
            | if group.writable { PF_W } else { 0 }
            | if group.executable { PF_X } else { 0 };

        match &mut current {
            Some(seg) if seg.flags == flags => {
                seg.filesz += group.size;
                seg.memsz += group.size;
                seg.output_sections.push(index);
            }
            _ => {
                if let Some(seg) = current.take() {
                    segments.push(seg);
                }
                current = Some(Segment {
                    ty: SegmentType::Load,
                    flags,
                    vaddr: group.address,
                    offset: group.offset,
                    filesz: group.size,
                    memsz: group.size,
                    align: config.z.max_page_size,
                    output_sections: vec![index],
                });
            }
        }
    }
    if let Some(seg) = current.take() {
        segments.push(seg);
    }

    if config.z.execstack {
        segments.push(Segment {
            ty: SegmentType::GnuStack,
            flags: PF_R | PF_W | PF_X,
            vaddr: 0,
            offset: 0,
            filesz: 0,
            memsz: 0,
            align: 1,
            output_sections: Vec::new(),
        });
    } else {
        segments.push(Segment {
            ty: SegmentType::GnuStack,
            flags: PF_R | PF_W,
            vaddr: 0,
            offset: 0,
            filesz: 0,
            memsz: 0,
            align: 1,
            output_sections: Vec::new(),
        });
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::SectionKind;
    use crate::diag::DiagEngine;
    use crate::reloc::X86_64Relocator;

    fn alloc_section(index: usize, name: &str, size: u64, flags: u64) -> Section {
        let mut s = Section::new(index, name, SectionKind::Regular);
        s.flags = flags | object::elf::SHF_ALLOC as u64;
        s.fragments.push(Fragment::Region(vec![0u8; size as usize]));
        s.align = 4;
        s
    }

    #[test]
    fn groups_by_default_orphan_names_and_assigns_increasing_addresses() {
        let mut sections = vec![
            alloc_section(0, ".text", 16, object::elf::SHF_EXECINSTR as u64),
            alloc_section(1, ".data", 8, object::elf::SHF_WRITE as u64),
        ];
        let mut pool = NamePool::new();
        let config = Config::default();
        let relocator = X86_64Relocator;
        let mut diag = DiagEngine::new();
        let layout = run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();
        assert_eq!(layout.output_sections.len(), 2);
        assert!(layout.output_sections[1].address > layout.output_sections[0].address);
    }

    #[test]
    fn same_permission_groups_merge_into_one_load_segment() {
        let mut sections = vec![
            alloc_section(0, ".text", 16, object::elf::SHF_EXECINSTR as u64),
            alloc_section(1, ".text.cold", 16, object::elf::SHF_EXECINSTR as u64),
        ];
        let mut pool = NamePool::new();
        let config = Config::default();
        let relocator = X86_64Relocator;
        let mut diag = DiagEngine::new();
        let layout = run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();
        let load_segments = layout
            .segments
            .iter()
            .filter(|s| s.ty == SegmentType::Load)
            .count();
        assert_eq!(load_segments, 1);
    }

    #[test]
    fn dead_sections_are_excluded_from_layout() {
        let mut sections = vec![alloc_section(0, ".text", 16, object::elf::SHF_EXECINSTR as u64)];
        sections[0].live = false;
        let mut pool = NamePool::new();
        let config = Config::default();
        let relocator = X86_64Relocator;
        let mut diag = DiagEngine::new();
        let layout = run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();
        assert!(layout.output_sections.is_empty());
    }

    #[test]
    fn warn_orphan_handling_reports_but_still_places_section() {
        let mut sections = vec![alloc_section(0, ".weird", 4, 0)];
        let mut pool = NamePool::new();
        let mut config = Config::default();
        config.orphan_handling = OrphanHandling::Warn;
        let relocator = X86_64Relocator;
        let mut diag = DiagEngine::new();
        let layout = run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();
        assert_eq!(layout.output_sections.len(), 1);
        assert_eq!(diag.warning_count(), 1);
    }

    #[test]
    fn error_orphan_handling_reports_and_aborts() {
        let mut sections = vec![alloc_section(0, ".weird", 4, 0)];
        let mut pool = NamePool::new();
        let mut config = Config::default();
        config.orphan_handling = OrphanHandling::Error;
        let relocator = X86_64Relocator;
        let mut diag = DiagEngine::new();
        let layout = run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();
        assert_eq!(layout.output_sections.len(), 1);
        assert_eq!(diag.error_count(), 1);
        assert!(diag.should_abort());
    }

    #[test]
    fn out_of_range_relocation_gets_a_working_stub() {
        use crate::reloc::{apply_all, RelocKind, Relocation, RelocationTarget};
        use crate::resolver::{Binding, Candidate, DefStrength, Kind, SymbolType, Visibility};

        let mut text = alloc_section(0, ".text", 16, object::elf::SHF_EXECINSTR as u64);
        text.relocations.push(Relocation {
            kind: RelocKind::Pc32,
            offset_in_section: 0,
            target: RelocationTarget::Symbol("far_away".into()),
            addend: 0,
            target_data: None,
        });
        let mut sections = vec![text];

        let mut pool = NamePool::new();
        pool.insert(
            "far_away",
            Candidate {
                kind: Kind::Define,
                strength: DefStrength::Strong,
                binding: Binding::Global,
                visibility: Visibility::Default,
                ty: SymbolType::Function,
                size: 0,
                align: 1,
                value: 0x7fff_ffff_0000,
                fragment_ref: None,
                ordinal: 0,
                bitcode: false,
            },
            false,
        );

        let config = Config::default();
        let relocator = X86_64Relocator;
        let mut diag = DiagEngine::new();
        let layout = run(&mut sections, None, &config, &mut pool, &relocator, &mut diag).unwrap();
        apply_all(&mut sections, &layout, &pool, &relocator).unwrap();

        assert!(sections[0].relocations[0].target_data.is_some());
        let Some(Fragment::Stub { bytes, .. }) = sections[0]
            .fragments
            .iter()
            .find(|f| matches!(f, Fragment::Stub { .. }))
        else {
            panic!("expected a stub fragment to have been inserted");
        };
        assert_eq!(&bytes[0..2], &[0x48, 0xb8]);
        let dest = u64::from_le_bytes(bytes[2..10].try_into().unwrap());
        assert_eq!(dest, 0x7fff_ffff_0000);

        // The call-site relocation now resolves in range, landing on the
        // stub rather than the unreachable far address.
        let Fragment::Region(call_site_bytes) = &sections[0].fragments[0] else {
            panic!("expected a region fragment")
        };
        let patched = i32::from_le_bytes(call_site_bytes[0..4].try_into().unwrap());
        assert!(relocator.in_range(RelocKind::Pc32, patched as i64));
    }
}
