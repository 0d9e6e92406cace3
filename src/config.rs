//! Immutable-after-setup link configuration (C2).

use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Executable,
    SharedObject,
    Relocatable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanHandling {
    Place,
    Warn,
    Error,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildIdStyle {
    None,
    Fast,
    Sha1,
    Tree,
}

#[derive(Debug, Clone, Copy)]
pub struct HashStyle {
    pub sysv: bool,
    pub gnu: bool,
}

impl Default for HashStyle {
    fn default() -> Self {
        Self {
            sysv: true,
            gnu: true,
        }
    }
}

/// `-z` options (§6 Layout group).
#[derive(Debug, Clone)]
pub struct ZOptions {
    pub max_page_size: u64,
    pub common_page_size: u64,
    pub relro: bool,
    pub now: bool,
    pub execstack: bool,
}

impl Default for ZOptions {
    fn default() -> Self {
        Self {
            max_page_size: 0x1000,
            common_page_size: 0x1000,
            relro: false,
            now: false,
            execstack: false,
        }
    }
}

bitflags::bitflags! {
    /// `--trace[=cat]` categories (§6 Diagnostics/trace group).
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TraceFlags: u32 {
        const SYMBOL         = 1 << 0;
        const RELOC          = 1 << 1;
        const SECTION        = 1 << 2;
        const MERGE_STRINGS  = 1 << 3;
        const LTO            = 1 << 4;
        const LINKER_SCRIPT  = 1 << 5;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReproduceOptions {
    pub on_fail_path: Option<PathBuf>,
    pub always_path: Option<PathBuf>,
    pub compressed: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub output: PathBuf,
    pub output_kind: OutputKind,
    /// Position-independent executable: an `Executable` output that should
    /// still get the PIC image base and an `ET_DYN` file type, distinct from
    /// `OutputKind::SharedObject` (spec §6 `--pie`).
    pub pie: bool,
    pub entry: String,
    pub search_dirs: Vec<PathBuf>,
    pub sysroot: Option<PathBuf>,
    pub rpaths: Vec<String>,
    pub z: ZOptions,
    pub image_base: Option<u64>,
    pub section_start: BTreeMap<String, u64>,
    pub orphan_handling: OrphanHandling,
    pub rosegment: bool,
    pub align_segments: bool,

    pub gc_sections: bool,
    pub print_gc_sections: bool,
    pub gc_cref: bool,
    pub merge_strings: bool,

    pub hash_style: HashStyle,
    pub build_id: BuildIdStyle,

    pub undefs: Vec<String>,
    pub defsyms: Vec<String>,
    pub wrap: BTreeMap<String, String>,
    pub export_dynamic: bool,
    pub export_dynamic_symbols: Vec<String>,
    pub version_script: Option<PathBuf>,
    pub dynamic_list: Option<PathBuf>,
    pub extern_list: Vec<String>,
    pub allow_multiple_definition: bool,

    pub trace: TraceFlags,
    pub trace_symbols: Vec<String>,
    pub verbose: u32,
    pub error_limit: Option<usize>,
    pub warn_limit: Option<usize>,
    pub fatal_warnings: bool,
    pub fatal_internal_errors: bool,
    pub noinhibit_exec: bool,
    pub warn_mismatch: bool,
    pub color: ColorMode,

    pub threads: bool,
    pub thread_count: Option<usize>,
    pub enable_threads_all: bool,

    pub reproduce: ReproduceOptions,
    pub mapping_file: Option<PathBuf>,
    pub dump_mapping_file: bool,
    pub dump_response_file: bool,

    pub plugin_configs: Vec<PathBuf>,
    pub no_default_plugins: bool,

    pub emit_relocs: bool,
    pub strip_debug: bool,
    pub strip_all: bool,
    pub discard_all: bool,
    pub discard_locals: bool,

    pub map_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Auto,
    Never,
    Always,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: PathBuf::from("a.out"),
            output_kind: OutputKind::Executable,
            pie: false,
            entry: "_start".to_string(),
            search_dirs: Vec::new(),
            sysroot: None,
            rpaths: Vec::new(),
            z: ZOptions::default(),
            image_base: None,
            section_start: BTreeMap::new(),
            orphan_handling: OrphanHandling::Place,
            rosegment: false,
            align_segments: true,
            gc_sections: false,
            print_gc_sections: false,
            gc_cref: false,
            merge_strings: true,
            hash_style: HashStyle::default(),
            build_id: BuildIdStyle::None,
            undefs: Vec::new(),
            defsyms: Vec::new(),
            wrap: BTreeMap::new(),
            export_dynamic: false,
            export_dynamic_symbols: Vec::new(),
            version_script: None,
            dynamic_list: None,
            extern_list: Vec::new(),
            allow_multiple_definition: false,
            trace: TraceFlags::empty(),
            trace_symbols: Vec::new(),
            verbose: 0,
            error_limit: None,
            warn_limit: None,
            fatal_warnings: false,
            fatal_internal_errors: false,
            noinhibit_exec: false,
            warn_mismatch: false,
            color: ColorMode::Auto,
            threads: true,
            thread_count: None,
            enable_threads_all: false,
            reproduce: ReproduceOptions::default(),
            mapping_file: None,
            dump_mapping_file: false,
            dump_response_file: false,
            plugin_configs: Vec::new(),
            no_default_plugins: false,
            emit_relocs: false,
            strip_debug: false,
            strip_all: false,
            discard_all: false,
            discard_locals: false,
            map_file: None,
        }
    }
}

impl Config {
    pub fn is_shared(&self) -> bool {
        self.output_kind == OutputKind::SharedObject
    }

    pub fn is_relocatable(&self) -> bool {
        self.output_kind == OutputKind::Relocatable
    }

    /// Whether the output image should use a PIC base address and `ET_DYN`
    /// file type: true for both `--shared` and `--pie` executables.
    pub fn is_position_independent(&self) -> bool {
        self.is_shared() || self.pie
    }
}
