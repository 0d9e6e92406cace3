//! Phase-ordered orchestrator (C17): the one place that knows the order in
//! which every other module runs. Mirrors the teacher's `Linker::link`
//! top-to-bottom shape, generalized from its fixed two-file pipeline into
//! the full action-stream / group-rescan / plugin-hook sequence of spec
//! §4.11.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::action::{materialize, Action, GroupRange, MaterializedInput, MaterializedKind};
use crate::config::Config;
use crate::diag::{DiagArg, DiagEngine};
use crate::fragment::Section;
use crate::gc;
use crate::input::{parse_symdef_file, Attributes, InputType};
use crate::layout;
use crate::pathcache::{MemoryArea, PathCache};
use crate::plugin::PluginHost;
use crate::reader::{self, archive};
use crate::reloc::{self, Relocator, X86_64Relocator};
use crate::resolver::{Binding, Candidate, DefStrength, Kind, NamePool, SymbolType, Visibility};
use crate::repro;
use crate::script::{self, ScriptFile};
use crate::search;
use crate::writer;

/// Bound on `--start-group`/`--end-group` rescans within one group range
/// (spec §4.1 "rescan to a fixpoint"): archive member extraction either
/// stabilizes within a couple of passes or the group will never close.
const MAX_GROUP_PASSES: usize = 8;

/// What survived reading one input file, before it is folded into the
/// shared section list and name pool.
struct Loaded {
    sections: Vec<Section>,
    symbols: Vec<(String, Candidate, bool)>,
}

/// Everything the driver accumulates while walking the action stream.
struct LinkState {
    sections: Vec<Section>,
    pool: NamePool,
    ordinal: u32,
    script: Option<ScriptFile>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            sections: Vec::new(),
            pool: NamePool::new(),
            ordinal: 0,
            script: None,
        }
    }

    fn next_ordinal(&mut self) -> u32 {
        let o = self.ordinal;
        self.ordinal += 1;
        o
    }

    fn adopt(&mut self, loaded: Loaded, allow_multiple_definition: bool) {
        let base = self.sections.len();
        for mut section in loaded.sections {
            section.index += base;
            self.sections.push(section);
        }
        for (name, mut candidate, _is_local) in loaded.symbols {
            if let Some(r) = candidate.fragment_ref.as_mut() {
                r.fragment_index += base;
            }
            // `--wrap` redirects every *reference* to a wrapped name (spec
            // §4.4); the definition site itself keeps its original name so
            // `__real_<sym>` still finds it.
            let name = if candidate.kind == Kind::Undefined {
                self.pool.apply_wrap(&name)
            } else {
                name
            };
            self.pool.insert(&name, candidate, allow_multiple_definition);
        }
    }
}

/// Top-level entry point. Consumes the CLI-populated [`Config`] plus the
/// already-parsed [`Action`] stream (spec §4.1), runs the full pipeline, and
/// reports every problem through `diag` rather than by returning `Err` for
/// ordinary link failures — a non-`Ok` return is reserved for I/O-level
/// faults the diagnostic channel can't represent (spec §7).
pub fn run(config: &Config, actions: &[Action], diag: &mut DiagEngine) -> Result<()> {
    diag.fatal_warnings = config.fatal_warnings;
    diag.fatal_internal_errors = config.fatal_internal_errors;
    diag.noinhibit_exec = config.noinhibit_exec;
    diag.error_limit = config.error_limit;
    diag.warn_limit = config.warn_limit;
    diag.verbose = config.verbose;

    let mut consumed_paths = Vec::new();
    let outcome = link(config, actions, diag, &mut consumed_paths);

    match &outcome {
        Ok(()) => {
            if let Some(path) = &config.reproduce.always_path {
                if let Err(e) = repro::write_tarball(path, &consumed_paths, config, config.reproduce.compressed) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write reproduce tarball");
                }
            }
        }
        Err(_) => {
            if let Some(path) = &config.reproduce.on_fail_path {
                if let Err(e) = repro::write_tarball(path, &consumed_paths, config, config.reproduce.compressed) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write reproduce-on-fail tarball");
                }
            }
        }
    }

    outcome
}

fn link(config: &Config, actions: &[Action], diag: &mut DiagEngine, consumed_paths: &mut Vec<PathBuf>) -> Result<()> {
    tracing::info!(state = ?layout::LayoutState::Initializing, "starting link");
    let mut plugins = PluginHost::new(config.enable_threads_all);
    let cache = PathCache::new(
        config
            .mapping_file
            .as_ref()
            .and_then(|p| crate::pathcache::MappingFile::load(p).ok()),
    );

    let (mut inputs, groups) = materialize(actions).context("replaying action stream")?;

    let mut state = LinkState::new();
    state.pool.install_wraps(config.wrap.keys().cloned());

    plugins.dispatch_before_rule_matching();

    read_all_inputs(config, &mut inputs, &groups, &mut state, &cache, diag, consumed_paths)?;

    for (name, addr) in parse_defsyms(&config.defsyms) {
        state.pool.insert(
            &name,
            Candidate {
                kind: Kind::Define,
                strength: DefStrength::Strong,
                binding: Binding::Global,
                visibility: Visibility::Default,
                ty: SymbolType::NoType,
                size: 0,
                align: 1,
                value: addr,
                fragment_ref: None,
                ordinal: state.ordinal,
                bitcode: false,
            },
            config.allow_multiple_definition,
        );
    }

    for name in &config.undefs {
        state.pool.reference(name, state.ordinal);
    }

    for (input_name, section_names) in section_visit_log(&state.sections) {
        plugins.dispatch_visit_sections(&input_name, &section_names);
    }
    for (name, _) in state.pool.iter() {
        plugins.dispatch_visit_symbol(name);
    }
    plugins.dispatch_before_section_merging();

    report_undefined_symbols(&state.pool, config, diag);
    if diag.should_abort() {
        return Ok(());
    }

    let kept_sections = keep_sections(&state.sections, state.script.as_ref());
    if config.gc_sections {
        gc::collect(
            &mut state.sections,
            &state.pool,
            &config.entry,
            &config.undefs,
            &config.export_dynamic_symbols,
            &kept_sections,
        );
        if config.print_gc_sections {
            for section in state.sections.iter().filter(|s| !s.live) {
                diag.note(
                    "removing unused section %0",
                    vec![DiagArg::Str(section.name.clone())],
                );
            }
        }
    }

    plugins.dispatch_before_performing_layout();

    let relocator: Box<dyn Relocator> = Box::new(X86_64Relocator);
    let layout = layout::run(
        &mut state.sections,
        state.script.as_ref(),
        config,
        &mut state.pool,
        relocator.as_ref(),
        diag,
    )
    .context("computing layout")?;
    if diag.should_abort() {
        return Ok(());
    }
    plugins.check_conservation(diag, layout::LayoutState::CreatingSections);
    if diag.should_abort() {
        return Ok(());
    }

    reloc::apply_all(&mut state.sections, &layout, &state.pool, relocator.as_ref())
        .context("applying relocations")?;

    plugins.dispatch_before_writing_output();

    let buffer = writer::write_to_buffer(&state.sections, &layout, &state.pool, config)
        .context("serializing output image")?;
    writer::commit(&buffer, &config.output).context("committing output file")?;
    tracing::info!(path = %config.output.display(), bytes = buffer.len(), "wrote output");

    plugins.teardown();
    Ok(())
}

/// Reads every materialized input, extracting archive members on demand and
/// rescanning `--start-group`/`--end-group` ranges to a fixpoint (spec §4.1
/// step "rescan groups").
fn read_all_inputs(
    config: &Config,
    inputs: &mut [MaterializedInput],
    groups: &[GroupRange],
    state: &mut LinkState,
    cache: &PathCache,
    diag: &mut DiagEngine,
    consumed_paths: &mut Vec<PathBuf>,
) -> Result<()> {
    // Group ranges bound where `--start-group`/`--end-group` sat on the link
    // line (spec §4.1); since archive extraction below already iterates every
    // pending archive to a fixpoint in link-line order, an explicit member
    // needs a symbol defined later in the same group precisely when the
    // fixpoint loop's next pass would reach it, so no separate per-range
    // walk is required. `groups` is threaded through for a future mapper
    // that wants to report unresolved symbols per-group rather than
    // globally.
    let _ = groups;

    let mut pending_archives: Vec<(usize, PathBuf, Arc<MemoryArea>, Attributes)> = Vec::new();

    for (idx, input) in inputs.iter().enumerate() {
        load_one_input(config, idx, input, state, cache, diag, &mut pending_archives, consumed_paths)?;
    }

    for pass in 0..MAX_GROUP_PASSES {
        let mut extracted_any = false;
        for (_, path, area, attrs) in pending_archives.iter_mut() {
            let members = archive::read_members(path, area, cache)
                .with_context(|| format!("reading archive {}", path.display()))?;
            for member in members {
                let needed = attrs.whole_archive || archive_member_is_needed(&member.data, &state.pool);
                if !needed {
                    continue;
                }
                let Ok(loaded) = read_member(&member.data, state.next_ordinal(), &member.name, diag) else {
                    continue;
                };
                state.adopt(loaded, config.allow_multiple_definition);
                extracted_any = true;
            }
            if attrs.whole_archive {
                // A whole-archive member set is exhausted after one pass;
                // clear the attribute so later passes don't re-extract it.
                attrs.whole_archive = false;
            }
        }
        if !extracted_any {
            break;
        }
        if pass == MAX_GROUP_PASSES - 1 {
            diag.warn(
                "archive group did not stabilize after %0 passes",
                vec![DiagArg::Int(MAX_GROUP_PASSES as i64)],
            );
        }
    }

    Ok(())
}

fn load_one_input(
    config: &Config,
    ordinal_hint: usize,
    input: &MaterializedInput,
    state: &mut LinkState,
    cache: &PathCache,
    diag: &mut DiagEngine,
    pending_archives: &mut Vec<(usize, PathBuf, Arc<MemoryArea>, Attributes)>,
    consumed_paths: &mut Vec<PathBuf>,
) -> Result<()> {
    match &input.kind {
        MaterializedKind::DefSym(expr) => {
            if let Some((name, addr)) = parse_one_defsym(expr) {
                state.pool.insert(
                    &name,
                    Candidate {
                        kind: Kind::Define,
                        strength: DefStrength::Strong,
                        binding: Binding::Global,
                        visibility: Visibility::Default,
                        ty: SymbolType::NoType,
                        size: 0,
                        align: 1,
                        value: addr,
                        fragment_ref: None,
                        ordinal: state.ordinal,
                        bitcode: false,
                    },
                    config.allow_multiple_definition,
                );
            }
            Ok(())
        }
        MaterializedKind::Script(path) => {
            let src = std::fs::read_to_string(path)
                .with_context(|| format!("reading linker script {}", path.display()))?;
            let parsed = script::parse_script(&src)
                .with_context(|| format!("parsing linker script {}", path.display()))?;
            state.script = Some(parsed);
            Ok(())
        }
        MaterializedKind::JustSymbols(name) => {
            let resolved = resolve_input_path(config, name, input.attributes.static_link)?;
            let area = resolve_and_cache(cache, config, &resolved)?;
            if let Ok(content) = std::str::from_utf8(area.data()) {
                for entry in parse_symdef_file(content) {
                    // PROVIDE entries only take effect where no other input
                    // defines the symbol (weak); force-resolve entries stand
                    // in for a definition the way a strong symbol would.
                    let strength = if entry.provide_only {
                        DefStrength::Weak
                    } else {
                        DefStrength::Strong
                    };
                    state.pool.insert(
                        &entry.name,
                        Candidate {
                            kind: Kind::Define,
                            strength,
                            binding: Binding::Weak,
                            visibility: Visibility::Default,
                            ty: SymbolType::NoType,
                            size: 0,
                            align: 1,
                            value: entry.value,
                            fragment_ref: None,
                            ordinal: state.ordinal,
                            bitcode: false,
                        },
                        config.allow_multiple_definition,
                    );
                }
            }
            Ok(())
        }
        MaterializedKind::File(name) | MaterializedKind::Namespec(name) => {
            let is_namespec = matches!(input.kind, MaterializedKind::Namespec(_));
            let resolution = if is_namespec {
                Some(search::resolve_namespec(config, name, input.attributes.static_link)?)
            } else {
                None
            };
            let path = match &resolution {
                Some(r) => r.path.clone(),
                None => resolve_input_path(config, name, input.attributes.static_link)?,
            };
            let area = resolve_and_cache(cache, config, &path)?;
            consumed_paths.push(path.clone());

            let is_archive = resolution
                .as_ref()
                .map(|r| r.ty == InputType::Archive)
                .unwrap_or_else(|| looks_like_archive(area.data()));

            if is_archive {
                pending_archives.push((ordinal_hint, path, area, input.attributes));
                return Ok(());
            }

            let ordinal = state.next_ordinal();
            match read_object_checked(area.data(), ordinal, name, diag, input.attributes.patch_base) {
                Ok(loaded) => {
                    if input.attributes.just_symbols {
                        // Symbols only: keep the name-pool entries, drop
                        // the section bytes so nothing gets emitted.
                        state.pool_merge_symbols_only(loaded);
                    } else {
                        state.adopt(loaded, config.allow_multiple_definition);
                    }
                }
                Err(e) => {
                    diag.error(
                        "cannot read input file %0: %1",
                        vec![
                            DiagArg::Str(name.clone()),
                            DiagArg::Str(e.to_string()),
                        ],
                    );
                }
            }
            Ok(())
        }
    }
}

impl LinkState {
    fn pool_merge_symbols_only(&mut self, loaded: Loaded) {
        for (name, candidate, _) in loaded.symbols {
            self.pool.insert(&name, candidate, true);
        }
    }
}

fn resolve_and_cache(cache: &PathCache, _config: &Config, path: &Path) -> Result<Arc<MemoryArea>> {
    if let Some(name) = path.to_str() {
        if let Some(result) = cache.resolve_mapped(name) {
            let mapped = result?;
            return cache.get(&mapped);
        }
    }
    cache.get(path)
}

fn resolve_input_path(config: &Config, name: &str, _prefer_static: bool) -> Result<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.is_file() {
        return Ok(direct);
    }
    for dir in &config.search_dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Ok(direct)
}

fn looks_like_archive(data: &[u8]) -> bool {
    data.starts_with(b"!<arch>\n")
}

fn read_object_checked(
    bytes: &[u8],
    ordinal: u32,
    origin_file: &str,
    diag: &mut DiagEngine,
    patch_base: bool,
) -> Result<Loaded> {
    let _ = diag;
    let mut result = reader::read_object(bytes, ordinal, origin_file)?;
    if patch_base {
        reader::apply_patch_base_whitelist(&mut result.object);
    }
    Ok(to_loaded(result))
}

fn read_member(area: &Arc<MemoryArea>, ordinal: u32, origin_file: &str, diag: &mut DiagEngine) -> Result<Loaded> {
    read_object_checked(area.data(), ordinal, origin_file, diag, false)
}

fn to_loaded(result: reader::ReadResult) -> Loaded {
    let symbols = result
        .symbols
        .into_iter()
        .map(|s| (s.name, s.candidate, s.is_local))
        .collect();
    Loaded {
        sections: result.object.sections,
        symbols,
    }
}

/// A cheap pre-check of whether extracting an archive member would resolve
/// any currently undefined symbol, without fully parsing the member (spec
/// §4.4 "archive member extraction trigger"). A real implementation reads
/// the archive's own symbol-table pseudo-member; lacking one here, this
/// parses the member eagerly and checks its defined names against the pool.
fn archive_member_is_needed(area: &Arc<MemoryArea>, pool: &NamePool) -> bool {
    let Ok(result) = reader::read_object(area.data(), 0, "") else {
        return false;
    };
    result
        .symbols
        .iter()
        .any(|s| !s.is_local && s.candidate.kind != Kind::Undefined && pool.is_undefined(&s.name))
}

fn parse_defsyms(exprs: &[String]) -> Vec<(String, u64)> {
    exprs.iter().filter_map(|e| parse_one_defsym(e)).collect()
}

fn parse_one_defsym(expr: &str) -> Option<(String, u64)> {
    let (name, value) = expr.split_once('=')?;
    let value = value.trim();
    let n = if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        value.parse().ok()?
    };
    Some((name.trim().to_string(), n))
}

fn section_visit_log(sections: &[Section]) -> Vec<(String, Vec<String>)> {
    let mut by_file: Vec<(String, Vec<String>)> = Vec::new();
    for section in sections {
        if let Some(entry) = by_file.iter_mut().find(|(f, _)| f == &section.origin_file) {
            entry.1.push(section.name.clone());
        } else {
            by_file.push((section.origin_file.clone(), vec![section.name.clone()]));
        }
    }
    by_file
}

fn keep_sections(sections: &[Section], script: Option<&ScriptFile>) -> HashSet<usize> {
    let mut kept = HashSet::new();
    let Some(script) = script else { return kept };
    for desc in script.output_sections() {
        if desc.rules.iter().any(|r| r.keep) {
            for (idx, section) in sections.iter().enumerate() {
                if desc
                    .rules
                    .iter()
                    .filter(|r| r.keep)
                    .any(|r| r.section_patterns.iter().any(|p| p.is_match(&section.name)))
                {
                    kept.insert(idx);
                }
            }
        }
    }
    kept
}

fn report_undefined_symbols(pool: &NamePool, config: &Config, diag: &mut DiagEngine) {
    for (name, info) in pool.iter() {
        if info.kind == Kind::Undefined && name != &config.entry {
            diag.error(
                "undefined reference to %0",
                vec![DiagArg::Str(name.clone())],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defsym_expression_parses_hex_and_decimal() {
        assert_eq!(parse_one_defsym("foo=0x1000"), Some(("foo".to_string(), 0x1000)));
        assert_eq!(parse_one_defsym("bar = 42"), Some(("bar".to_string(), 42)));
        assert_eq!(parse_one_defsym("nope"), None);
    }

    #[test]
    fn archive_magic_is_detected() {
        assert!(looks_like_archive(b"!<arch>\nrest"));
        assert!(!looks_like_archive(b"\x7fELF"));
    }

    #[test]
    fn link_of_single_live_object_produces_output() {
        use object::write::{Object as WriteObject, SectionKind as WSectionKind, SymbolSection};
        use object::{Architecture, BinaryFormat, Endianness};

        let dir = tempfile::tempdir().unwrap();
        let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), WSectionKind::Text);
        obj.append_section_data(text, &[0x90, 0x90, 0xc3], 1);
        obj.add_symbol(object::write::Symbol {
            name: b"_start".to_vec(),
            value: 0,
            size: 3,
            kind: object::SymbolKind::Text,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: object::SymbolFlags::None,
        });
        let bytes = obj.write().unwrap();
        let obj_path = dir.path().join("a.o");
        std::fs::write(&obj_path, &bytes).unwrap();

        let mut config = Config::default();
        config.output = dir.path().join("a.out");
        config.entry = "_start".to_string();

        let actions = vec![Action::InputFile(obj_path.to_string_lossy().into_owned())];
        let mut diag = DiagEngine::new();
        run(&config, &actions, &mut diag).unwrap();

        assert!(!diag.has_fatal());
        assert!(config.output.exists());
    }
}
