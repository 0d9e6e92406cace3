//! Command-line surface (ambient, out of scope per spec §1 but still
//! required to exist as a thin shell): `clap`-derived flags that merely
//! populate a [`Config`] and an [`Action`] stream. No link logic lives
//! here.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;

use crate::action::Action;
use crate::config::{BuildIdStyle, ColorMode, Config, OrphanHandling, OutputKind, ReproduceOptions, TraceFlags, ZOptions};

/// `ELDFLAGS` is whitespace-split and prepended to the real argv (spec §6
/// Environment).
pub fn eldflags_prefix() -> Vec<String> {
    std::env::var("ELDFLAGS")
        .ok()
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Mirrors spec §6's CLI surface grouping. Fields double as both `Config`
/// sources and, for file/library/group flags, raw materials for the
/// [`Action`] stream built by [`Cli::into_actions_and_config`].
#[derive(Parser, Debug)]
#[command(name = "rld", about = "multi-target ELF linker core", version)]
pub struct Cli {
    #[arg(short = 'o')]
    pub output: Option<PathBuf>,
    #[arg(long = "Map", num_args = 0..=1, default_missing_value = "")]
    pub map: Option<String>,
    #[arg(long = "build-id", num_args = 0..=1, default_missing_value = "")]
    pub build_id: Option<String>,

    #[arg(short = 'l')]
    pub libs: Vec<String>,
    #[arg(short = 'L')]
    pub search_dirs: Vec<PathBuf>,
    #[arg(short = 'T')]
    pub scripts: Vec<PathBuf>,
    #[arg(short = 'R')]
    pub rpaths: Vec<String>,
    #[arg(long = "whole-archive")]
    pub whole_archive: bool,
    #[arg(long = "no-whole-archive")]
    pub no_whole_archive: bool,
    #[arg(long = "start-group")]
    pub start_group: bool,
    #[arg(long = "end-group")]
    pub end_group: bool,
    #[arg(short = 'B', long = "Bstatic")]
    pub bstatic: bool,
    #[arg(long = "Bdynamic")]
    pub bdynamic: bool,
    #[arg(long = "as-needed")]
    pub as_needed: bool,
    #[arg(long = "no-as-needed")]
    pub no_as_needed: bool,
    #[arg(long = "exclude-libs")]
    pub exclude_libs: Vec<String>,
    #[arg(long = "sysroot")]
    pub sysroot: Option<PathBuf>,

    #[arg(long = "shared")]
    pub shared: bool,
    #[arg(long = "pie")]
    pub pie: bool,
    #[arg(long = "no-pie")]
    pub no_pie: bool,
    #[arg(short = 'r', long = "relocatable")]
    pub relocatable: bool,
    #[arg(long = "static")]
    pub static_: bool,

    #[arg(short = 'e')]
    pub entry: Option<String>,
    #[arg(short = 'u')]
    pub undefined: Vec<String>,
    #[arg(long = "defsym")]
    pub defsym: Vec<String>,
    #[arg(long = "wrap")]
    pub wrap: Vec<String>,
    #[arg(long = "export-dynamic")]
    pub export_dynamic: bool,
    #[arg(long = "export-dynamic-symbol")]
    pub export_dynamic_symbol: Vec<String>,
    #[arg(long = "version-script")]
    pub version_script: Option<PathBuf>,
    #[arg(long = "dynamic-list")]
    pub dynamic_list: Option<PathBuf>,
    #[arg(long = "allow-multiple-definition")]
    pub allow_multiple_definition: bool,

    #[arg(short = 'z')]
    pub z_opts: Vec<String>,
    #[arg(long = "image-base")]
    pub image_base: Option<String>,
    #[arg(long = "section-start")]
    pub section_start: Vec<String>,
    #[arg(long = "no-align-segments")]
    pub no_align_segments: bool,
    #[arg(long = "orphan-handling")]
    pub orphan_handling: Option<String>,
    #[arg(long = "rosegment")]
    pub rosegment: bool,

    #[arg(long = "gc-sections")]
    pub gc_sections: bool,
    #[arg(long = "print-gc-sections")]
    pub print_gc_sections: bool,
    #[arg(long = "gc-cref")]
    pub gc_cref: bool,
    #[arg(long = "no-merge-strings")]
    pub no_merge_strings: bool,

    #[arg(long = "trace", num_args = 0..=1, default_missing_value = "")]
    pub trace: Option<String>,
    #[arg(short = 'y')]
    pub trace_symbol: Vec<String>,
    #[arg(long = "verbose", num_args = 0..=1, default_missing_value = "1")]
    pub verbose: Option<u32>,
    #[arg(long = "error-limit")]
    pub error_limit: Option<usize>,
    #[arg(long = "warn-limit")]
    pub warn_limit: Option<usize>,
    #[arg(long = "fatal-warnings")]
    pub fatal_warnings: bool,
    #[arg(long = "noinhibit-exec")]
    pub noinhibit_exec: bool,
    #[arg(long = "color", default_value = "auto")]
    pub color: String,

    #[arg(long = "threads")]
    pub threads: bool,
    #[arg(long = "no-threads")]
    pub no_threads: bool,
    #[arg(long = "thread-count")]
    pub thread_count: Option<usize>,
    #[arg(long = "enable-threads")]
    pub enable_threads: Option<String>,

    #[arg(long = "reproduce")]
    pub reproduce: Option<PathBuf>,
    #[arg(long = "reproduce-on-fail")]
    pub reproduce_on_fail: Option<PathBuf>,
    #[arg(long = "reproduce-compressed")]
    pub reproduce_compressed: Option<PathBuf>,
    #[arg(long = "mapping-file")]
    pub mapping_file: Option<PathBuf>,

    #[arg(long = "plugin-config")]
    pub plugin_config: Vec<PathBuf>,
    #[arg(long = "no-default-plugins")]
    pub no_default_plugins: bool,

    #[arg(long = "emit-relocs")]
    pub emit_relocs: bool,
    #[arg(long = "strip-debug")]
    pub strip_debug: bool,
    #[arg(long = "strip-all")]
    pub strip_all: bool,
    #[arg(long = "discard-all")]
    pub discard_all: bool,
    #[arg(long = "discard-locals")]
    pub discard_locals: bool,

    /// Object files, in link-line position; this is the bulk of the action
    /// stream's `InputFile`/`Namespec` entries once interleaved with the
    /// positional-order-sensitive flags above (spec §4.1).
    pub inputs: Vec<String>,
}

impl Cli {
    /// Builds from `std::env::args()` with `ELDFLAGS` prepended (spec §6).
    pub fn parse_with_env() -> Self {
        let mut argv = vec![std::env::args().next().unwrap_or_default()];
        argv.extend(eldflags_prefix());
        argv.extend(std::env::args().skip(1));
        Cli::parse_from(argv)
    }

    /// Populates a [`Config`] record. The CLI never drives link logic
    /// directly; everything here is a field copy or a small parse (spec
    /// §1 "flags merely populate a configuration record").
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = Config::default();

        config.output_kind = if self.shared {
            OutputKind::SharedObject
        } else if self.relocatable {
            OutputKind::Relocatable
        } else {
            OutputKind::Executable
        };
        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        config.pie = self.pie && !self.no_pie;
        if let Some(entry) = &self.entry {
            config.entry = entry.clone();
        }
        config.search_dirs = self.search_dirs.clone();
        config.sysroot = self.sysroot.clone();
        config.rpaths = self.rpaths.clone();

        for z in &self.z_opts {
            apply_z_option(&mut config.z, z);
        }
        if let Some(base) = &self.image_base {
            config.image_base = Some(parse_number(base)?);
        }
        for entry in &self.section_start {
            if let Some((name, addr)) = entry.split_once('=') {
                config.section_start.insert(name.to_string(), parse_number(addr)?);
            }
        }
        config.align_segments = !self.no_align_segments;
        config.rosegment = self.rosegment;
        config.orphan_handling = match self.orphan_handling.as_deref() {
            Some("warn") => OrphanHandling::Warn,
            Some("error") => OrphanHandling::Error,
            Some("discard") => OrphanHandling::Discard,
            _ => OrphanHandling::Place,
        };

        config.gc_sections = self.gc_sections;
        config.print_gc_sections = self.print_gc_sections;
        config.gc_cref = self.gc_cref;
        config.merge_strings = !self.no_merge_strings;

        config.undefs = self.undefined.clone();
        config.defsyms = self.defsym.clone();
        config.wrap = self
            .wrap
            .iter()
            .map(|s| (s.clone(), format!("__wrap_{s}")))
            .collect::<BTreeMap<_, _>>();
        config.export_dynamic = self.export_dynamic;
        config.export_dynamic_symbols = self.export_dynamic_symbol.clone();
        config.version_script = self.version_script.clone();
        config.dynamic_list = self.dynamic_list.clone();
        config.allow_multiple_definition = self.allow_multiple_definition;

        if let Some(trace) = &self.trace {
            config.trace = parse_trace_categories(trace);
        }
        config.trace_symbols = self.trace_symbol.clone();
        config.verbose = self.verbose.unwrap_or(0);
        config.error_limit = self.error_limit;
        config.warn_limit = self.warn_limit;
        config.fatal_warnings = self.fatal_warnings;
        config.noinhibit_exec = self.noinhibit_exec;
        config.color = match self.color.as_str() {
            _ if std::env::var("TERM").as_deref() == Ok("dumb") => ColorMode::Never,
            "never" => ColorMode::Never,
            "always" => ColorMode::Always,
            _ => ColorMode::Auto,
        };

        config.threads = !self.no_threads;
        config.thread_count = self.thread_count;
        config.enable_threads_all = self.enable_threads.as_deref() == Some("all");

        config.reproduce = ReproduceOptions {
            on_fail_path: self
                .reproduce_on_fail
                .clone()
                .or_else(|| std::env::var("ELD_REPRODUCE_CREATE_TAR").ok().map(PathBuf::from)),
            always_path: self.reproduce.clone().or_else(|| self.reproduce_compressed.clone()),
            compressed: self.reproduce_compressed.is_some(),
        };
        config.mapping_file = self.mapping_file.clone();

        config.plugin_configs = self.plugin_config.clone();
        config.no_default_plugins = self.no_default_plugins;

        config.emit_relocs = self.emit_relocs;
        config.strip_debug = self.strip_debug;
        config.strip_all = self.strip_all;
        config.discard_all = self.discard_all;
        config.discard_locals = self.discard_locals;

        if let Some(build_id) = &self.build_id {
            config.build_id = match build_id.as_str() {
                "" | "fast" | "uuid" => BuildIdStyle::Fast,
                "md5" | "sha1" => BuildIdStyle::Sha1,
                "tree" => BuildIdStyle::Tree,
                _ => BuildIdStyle::Fast,
            };
        }
        if let Some(map) = &self.map {
            config.map_file = Some(if map.is_empty() {
                config.output.with_extension("map")
            } else {
                PathBuf::from(map)
            });
        }

        Ok(config)
    }

    /// Replays the link-line's stateful flags into an [`Action`] stream
    /// (spec §4.1). The real CLI surface interleaves `-l`/`--start-group`/
    /// `-Bstatic` etc. by argv position; `clap`'s derive API collapses
    /// repeated flags into `Vec`s and loses that interleaving, so a
    /// from-argv rebuild is used here instead of deriving actions from the
    /// already-parsed `Cli` fields.
    pub fn actions_from_argv(argv: &[String]) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut iter = argv.iter().skip(1).peekable();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--start-group" => actions.push(Action::StartGroup),
                "--end-group" => actions.push(Action::EndGroup),
                "--whole-archive" => actions.push(Action::WholeArchive),
                "--no-whole-archive" => actions.push(Action::NoWholeArchive),
                "--as-needed" => actions.push(Action::AsNeeded),
                "--no-as-needed" => actions.push(Action::NoAsNeeded),
                "-Bstatic" | "-static" => actions.push(Action::BStatic),
                "-Bdynamic" => actions.push(Action::BDynamic),
                "--add-needed" => actions.push(Action::AddNeeded),
                "--no-add-needed" => actions.push(Action::NoAddNeeded),
                "--defsym" => {
                    if let Some(expr) = iter.next() {
                        actions.push(Action::DefSym(expr.clone()));
                    }
                }
                "-T" => {
                    if let Some(path) = iter.next() {
                        actions.push(Action::Script(PathBuf::from(path), ));
                    }
                }
                "--format" => {
                    if let Some(fmt) = iter.next() {
                        actions.push(Action::InputFormat(fmt.clone()));
                    }
                }
                "--just-symbols" => {
                    if let Some(path) = iter.next() {
                        actions.push(Action::JustSymbols(path.clone()));
                    }
                }
                s if s.starts_with("-l") && s.len() > 2 => {
                    actions.push(Action::Namespec(s.trim_start_matches("-l").to_string()));
                }
                s if s.starts_with("-L") || s.starts_with("-o") || s.starts_with('-') => {
                    // Other recognized flags are handled by the `clap`
                    // parse above; skip a possible separate-argument form.
                    if matches!(s, "-o" | "-L" | "-R" | "-e" | "-u" | "-z" | "-y") {
                        iter.next();
                    }
                }
                other => actions.push(Action::InputFile(other.to_string())),
            }
        }
        actions
    }
}

fn parse_number(s: &str) -> anyhow::Result<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Ok(u64::from_str_radix(hex, 16)?)
    } else {
        Ok(s.parse()?)
    }
}

fn apply_z_option(z: &mut ZOptions, opt: &str) {
    match opt {
        "relro" => z.relro = true,
        "norelro" => z.relro = false,
        "now" => z.now = true,
        "lazy" => z.now = false,
        "execstack" => z.execstack = true,
        "noexecstack" => z.execstack = false,
        _ => {
            if let Some(v) = opt.strip_prefix("max-page-size=") {
                if let Ok(n) = parse_number(v) {
                    z.max_page_size = n;
                }
            } else if let Some(v) = opt.strip_prefix("common-page-size=") {
                if let Ok(n) = parse_number(v) {
                    z.common_page_size = n;
                }
            }
        }
    }
}

fn parse_trace_categories(spec: &str) -> TraceFlags {
    if spec.is_empty() {
        return TraceFlags::all();
    }
    let mut flags = TraceFlags::empty();
    for cat in spec.split(',') {
        flags |= match cat {
            "symbol" => TraceFlags::SYMBOL,
            "reloc" => TraceFlags::RELOC,
            "section" => TraceFlags::SECTION,
            "merge-strings" => TraceFlags::MERGE_STRINGS,
            "lto" => TraceFlags::LTO,
            "linker-script" => TraceFlags::LINKER_SCRIPT,
            _ => TraceFlags::empty(),
        };
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_output_kind_and_entry() {
        let cli = Cli::parse_from(["rld", "-shared", "-e", "foo", "a.o"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.output_kind, OutputKind::SharedObject);
        assert_eq!(config.entry, "foo");
    }

    #[test]
    fn z_options_accumulate_onto_default() {
        let cli = Cli::parse_from(["rld", "-z", "now", "-z", "max-page-size=0x2000", "a.o"]);
        let config = cli.to_config().unwrap();
        assert!(config.z.now);
        assert_eq!(config.z.max_page_size, 0x2000);
    }

    #[test]
    fn actions_from_argv_tracks_group_and_namespec() {
        let argv: Vec<String> = ["rld", "--start-group", "-la", "-lb", "--end-group"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let actions = Cli::actions_from_argv(&argv);
        assert!(matches!(actions[0], Action::StartGroup));
        assert!(matches!(&actions[1], Action::Namespec(n) if n == "a"));
        assert!(matches!(&actions[2], Action::Namespec(n) if n == "b"));
        assert!(matches!(actions[3], Action::EndGroup));
    }

    #[test]
    fn pie_flag_sets_position_independent_executable() {
        let cli = Cli::parse_from(["rld", "--pie", "a.o"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.output_kind, OutputKind::Executable);
        assert!(config.pie);
        assert!(config.is_position_independent());
    }

    #[test]
    fn trace_without_category_enables_all() {
        let cli = Cli::parse_from(["rld", "--trace", "a.o"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.trace, TraceFlags::all());
    }
}
