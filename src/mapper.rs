//! Section mapper (C10): assigns every input [`Section`] to an output
//! section name by the first-match rule algorithm of spec §4.5, falling
//! back to orphan handling (spec §6) for anything no rule claims.

use std::collections::HashMap;

use crate::config::OrphanHandling;
use crate::fragment::{Section, SectionKind};
use crate::script::{OutputSectionDesc, Rule};

/// Matches `(rule, file_name)` pairs to their last verdict: re-evaluating a
/// wildcard rule against the same archive member hundreds of times (spec
/// §4.5 "memoized per (rule, file)") is wasted work once the file side of
/// the match is settled.
#[derive(Default)]
pub struct SectionMapper {
    file_cache: HashMap<(usize, usize, String), bool>,
}

impl SectionMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn file_matches(&mut self, output_index: usize, rule_index: usize, rule: &Rule, file_name: &str) -> bool {
        let key = (output_index, rule_index, file_name.to_string());
        if let Some(cached) = self.file_cache.get(&key) {
            return *cached;
        }
        let excluded = rule.exclude_file.iter().any(|p| p.is_match(file_name));
        let included = match &rule.file_pattern {
            Some(p) => p.is_match(file_name),
            // A bare `*(.text)` rule (no file pattern) matches every file.
            None => true,
        };
        let result = included && !excluded;
        self.file_cache.insert(key, result);
        result
    }

    /// Returns the first output section (in script order) whose rule list
    /// claims `(file_name, section)`, plus which rule matched.
    pub fn place(
        &mut self,
        descs: &[&OutputSectionDesc],
        file_name: &str,
        section: &Section,
    ) -> Option<(usize, usize)> {
        if matches!(section.kind, SectionKind::Discard) {
            return None;
        }
        for (output_index, desc) in descs.iter().enumerate() {
            for (rule_index, rule) in desc.rules.iter().enumerate() {
                if !self.file_matches(output_index, rule_index, rule, file_name) {
                    continue;
                }
                if rule
                    .section_patterns
                    .iter()
                    .any(|p| p.is_match(&section.name))
                {
                    return Some((output_index, rule_index));
                }
            }
        }
        None
    }

    /// Applies orphan handling (spec §6) to a section no rule claimed.
    /// Returns the synthesized output-section name to place it under, or
    /// `None` if it should be discarded entirely.
    pub fn handle_orphan(
        &self,
        section: &Section,
        orphan_handling: OrphanHandling,
    ) -> Option<String> {
        match orphan_handling {
            OrphanHandling::Discard => None,
            OrphanHandling::Error | OrphanHandling::Warn | OrphanHandling::Place => {
                Some(default_output_name(section))
            }
        }
    }
}

/// GNU ld collapses unmatched input sections into an output section named
/// after the section itself, stripping any `.text.foo` → `.text` numeric or
/// dotted suffix convention it recognizes (spec §4.5 orphan rule).
fn default_output_name(section: &Section) -> String {
    const KNOWN_PREFIXES: &[&str] = &[
        ".text", ".data", ".rodata", ".bss", ".tdata", ".tbss", ".init_array", ".fini_array",
    ];
    for prefix in KNOWN_PREFIXES {
        if &section.name == prefix || section.name.starts_with(&format!("{prefix}.")) {
            return (*prefix).to_string();
        }
    }
    section.name.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_script;

    fn section(name: &str) -> Section {
        Section::new(0, name, SectionKind::Regular)
    }

    #[test]
    fn first_matching_rule_wins() {
        let script = parse_script(
            r#"
            SECTIONS {
                .text : { *(.text*) }
                .rodata : { *(.rodata*) }
            }
        "#,
        )
        .unwrap();
        let descs = script.output_sections();
        let mut mapper = SectionMapper::new();
        let hit = mapper.place(&descs, "a.o", &section(".text.foo")).unwrap();
        assert_eq!(hit.0, 0);
    }

    #[test]
    fn exclude_file_removes_a_candidate_file() {
        let script = parse_script(
            r#"
            SECTIONS {
                .ctors : {
                    EXCLUDE_FILE(*crtend.o) *(.ctors)
                }
            }
        "#,
        )
        .unwrap();
        let descs = script.output_sections();
        let mut mapper = SectionMapper::new();
        assert!(mapper.place(&descs, "a.o", &section(".ctors")).is_some());
        assert!(mapper
            .place(&descs, "crtend.o", &section(".ctors"))
            .is_none());
    }

    #[test]
    fn unmatched_section_is_orphan() {
        let script = parse_script("SECTIONS { .text : { *(.text*) } }").unwrap();
        let descs = script.output_sections();
        let mut mapper = SectionMapper::new();
        assert!(mapper.place(&descs, "a.o", &section(".data")).is_none());
    }

    #[test]
    fn orphan_handling_discard_drops_section() {
        let mapper = SectionMapper::new();
        assert_eq!(
            mapper.handle_orphan(&section(".comment"), OrphanHandling::Discard),
            None
        );
        assert_eq!(
            mapper.handle_orphan(&section(".comment"), OrphanHandling::Place),
            Some(".comment".to_string())
        );
    }

    #[test]
    fn orphan_default_name_collapses_numbered_suffix() {
        let mapper = SectionMapper::new();
        assert_eq!(
            mapper.handle_orphan(&section(".text.cold"), OrphanHandling::Place),
            Some(".text".to_string())
        );
    }

    #[test]
    fn same_rule_index_in_different_output_sections_does_not_collide() {
        let script = parse_script(
            r#"
            SECTIONS {
                .text : { EXCLUDE_FILE(*crtend.o) *(.text*) }
                .data : { *(.data*) }
            }
        "#,
        )
        .unwrap();
        let descs = script.output_sections();
        let mut mapper = SectionMapper::new();
        // Settles rule 0 of `.text` (excluded) for crtend.o first.
        assert!(mapper
            .place(&descs, "crtend.o", &section(".text.foo"))
            .is_none());
        // Rule 0 of `.data` has no exclude at all; a cache keyed only on
        // rule_index would wrongly reuse the `.text` verdict here.
        assert_eq!(
            mapper.place(&descs, "crtend.o", &section(".data.foo")).unwrap().0,
            1
        );
    }

    #[test]
    fn discard_kind_section_is_never_placed() {
        let script = parse_script("SECTIONS { .debug : { *(.debug*) } }").unwrap();
        let descs = script.output_sections();
        let mut mapper = SectionMapper::new();
        let mut s = section(".debug_info");
        s.kind = SectionKind::Discard;
        assert!(mapper.place(&descs, "a.o", &s).is_none());
    }
}
