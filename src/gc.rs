//! Reachability-based section garbage collector (C12), run when
//! `--gc-sections` is set (spec §4.6).
//!
//! Roots are seeded from the entry symbol, `--undefined` references, `KEEP`
//! rules (C9/C10), and exported dynamic symbols; reachability then follows
//! each live section's relocations to whatever they target.

use std::collections::{HashSet, VecDeque};

use crate::fragment::{FragmentRef, Section};
use crate::reloc::RelocationTarget;
use crate::resolver::NamePool;

/// Marks every [`Section`] reachable from the given roots as live, leaving
/// everything else `live = false` for the layout engine (C13) to drop.
/// Sections with `matched_rule` pointing at a `KEEP` rule are always live
/// regardless of reachability.
pub fn collect(
    sections: &mut [Section],
    pool: &NamePool,
    entry_symbol: &str,
    extra_undefs: &[String],
    export_dynamic_symbols: &[String],
    kept_sections: &HashSet<usize>,
) {
    let mut live = vec![false; sections.len()];
    let mut queue = VecDeque::new();

    let mut seed = |name: &str, queue: &mut VecDeque<usize>, live: &mut [bool]| {
        if let Some(info) = pool.get(name) {
            if let Some(r) = info.fragment_ref {
                mark(r.fragment_index, live, queue);
            }
        }
    };

    seed(entry_symbol, &mut queue, &mut live);
    for name in extra_undefs.iter().chain(export_dynamic_symbols) {
        seed(name, &mut queue, &mut live);
    }
    for &idx in kept_sections {
        mark(idx, &mut live, &mut queue);
    }

    while let Some(idx) = queue.pop_front() {
        let Some(section) = sections.get(idx) else {
            continue;
        };
        for reloc in &section.relocations {
            match &reloc.target {
                RelocationTarget::Symbol(name) => seed(name, &mut queue, &mut live),
                RelocationTarget::Section(name, _) => {
                    if let Some(target_idx) =
                        sections.iter().position(|s| &s.name == name)
                    {
                        mark(target_idx, &mut live, &mut queue);
                    }
                }
            }
        }
    }

    for (section, is_live) in sections.iter_mut().zip(live) {
        section.live = is_live || kept_sections.contains(&section.index);
    }
}

fn mark(index: usize, live: &mut [bool], queue: &mut VecDeque<usize>) {
    if let Some(slot) = live.get_mut(index) {
        if !*slot {
            *slot = true;
            queue.push_back(index);
        }
    }
}

/// Convenience used by the layout engine (C13) to look up a target's owning
/// fragment rather than its raw index, when a root is expressed as a
/// [`FragmentRef`] directly (e.g. a plugin-pinned section).
pub fn mark_fragment_ref(r: FragmentRef, sections: &mut [Section], live_out: &mut HashSet<usize>) {
    live_out.insert(r.fragment_index);
    if let Some(s) = sections.get_mut(r.fragment_index) {
        s.live = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::SectionKind;
    use crate::reloc::{RelocKind, Relocation};
    use crate::resolver::{Binding, Candidate, DefStrength, Kind, SymbolType, Visibility};

    fn section_with_ref_to(index: usize, name: &str, target_sym: Option<&str>) -> Section {
        let mut s = Section::new(index, name, SectionKind::Regular);
        if let Some(target) = target_sym {
            s.relocations.push(Relocation {
                kind: RelocKind::Abs64,
                offset_in_section: 0,
                target: RelocationTarget::Symbol(target.to_string()),
                addend: 0,
                target_data: None,
            });
        }
        s
    }

    fn define(name: &str, pool: &mut NamePool, fragment_index: usize) {
        pool.insert(
            name,
            Candidate {
                kind: Kind::Define,
                strength: DefStrength::Strong,
                binding: Binding::Global,
                visibility: Visibility::Default,
                ty: SymbolType::Function,
                size: 0,
                align: 1,
                value: 0,
                fragment_ref: Some(FragmentRef {
                    fragment_index,
                    offset: 0,
                }),
                ordinal: 0,
                bitcode: false,
            },
            false,
        );
    }

    #[test]
    fn unreachable_section_is_dropped() {
        let mut pool = NamePool::new();
        define("_start", &mut pool, 0);
        define("used", &mut pool, 1);
        define("dead", &mut pool, 2);

        let mut sections = vec![
            section_with_ref_to(0, ".text._start", Some("used")),
            section_with_ref_to(1, ".text.used", None),
            section_with_ref_to(2, ".text.dead", None),
        ];

        collect(&mut sections, &pool, "_start", &[], &[], &HashSet::new());

        assert!(sections[0].live);
        assert!(sections[1].live);
        assert!(!sections[2].live);
    }

    #[test]
    fn keep_rule_overrides_reachability() {
        let mut pool = NamePool::new();
        define("_start", &mut pool, 0);
        define("dead", &mut pool, 1);

        let mut sections = vec![
            section_with_ref_to(0, ".text._start", None),
            section_with_ref_to(1, ".init_array", None),
        ];
        let mut kept = HashSet::new();
        kept.insert(1);

        collect(&mut sections, &pool, "_start", &[], &[], &kept);

        assert!(sections[1].live);
    }

    #[test]
    fn chain_of_references_stays_live() {
        let mut pool = NamePool::new();
        define("_start", &mut pool, 0);
        define("helper_a", &mut pool, 1);
        define("helper_b", &mut pool, 2);

        let mut sections = vec![
            section_with_ref_to(0, ".text._start", Some("helper_a")),
            section_with_ref_to(1, ".text.helper_a", Some("helper_b")),
            section_with_ref_to(2, ".text.helper_b", None),
        ];

        collect(&mut sections, &pool, "_start", &[], &[], &HashSet::new());

        assert!(sections.iter().all(|s| s.live));
    }
}
