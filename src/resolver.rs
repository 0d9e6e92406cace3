//! Symbol resolver / name pool (C8): three-way resolution over
//! undefined/define/common candidates, per spec §4.4's insertion table.

use std::collections::BTreeMap;

use crate::fragment::FragmentRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Binding {
    Local,
    Weak,
    Global,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Protected,
    Internal,
    Hidden,
}

impl Visibility {
    /// Visibility combines as the most restrictive of the inputs that
    /// defined or referenced the symbol (spec §4.4).
    fn most_restrictive(self, other: Visibility) -> Visibility {
        fn rank(v: Visibility) -> u8 {
            match v {
                Visibility::Default => 0,
                Visibility::Protected => 1,
                Visibility::Internal => 2,
                Visibility::Hidden => 3,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    NoType,
    Object,
    Function,
    Section,
    File,
    CommonBlock,
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Undefined,
    Define,
    Common,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefStrength {
    Weak,
    Strong,
}

/// `LDSymbol` + `ResolveInfo` from spec §3, minus the InputFile back-pointer
/// (resolved via `origin_ordinal`/`origin_local_index` per spec §9 instead).
#[derive(Debug, Clone)]
pub struct ResolveInfo {
    pub name: String,
    pub binding: Binding,
    pub visibility: Visibility,
    pub ty: SymbolType,
    pub kind: Kind,
    pub strength: DefStrength,
    pub size: u64,
    /// Required alignment; only meaningful for `Kind::Common` entries, where
    /// spec §4.4's common/common and common/weak-define promotion takes the
    /// max of both size and align across merges.
    pub align: u64,
    pub value: u64,
    pub fragment_ref: Option<FragmentRef>,
    pub origin_ordinal: Option<u32>,
    pub bitcode: bool,
    pub should_ignore: bool,
    pub should_preserve: bool,
}

impl ResolveInfo {
    fn new_undef(name: &str, ordinal: u32) -> Self {
        Self {
            name: name.to_string(),
            binding: Binding::Global,
            visibility: Visibility::Default,
            ty: SymbolType::NoType,
            kind: Kind::Undefined,
            strength: DefStrength::Strong,
            size: 0,
            align: 1,
            value: 0,
            fragment_ref: None,
            origin_ordinal: Some(ordinal),
            bitcode: false,
            should_ignore: false,
            should_preserve: false,
        }
    }
}

/// A resolution candidate presented to the pool for one symbol name.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub kind: Kind,
    pub strength: DefStrength,
    pub binding: Binding,
    pub visibility: Visibility,
    pub ty: SymbolType,
    pub size: u64,
    /// Required alignment; only meaningful for `Kind::Common` candidates.
    pub align: u64,
    pub value: u64,
    pub fragment_ref: Option<FragmentRef>,
    pub ordinal: u32,
    pub bitcode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `C` installed, replacing whatever was there.
    Installed,
    /// Existing entry `E` kept (possibly with size/align promoted).
    Kept,
    /// Both `E` and `C` are strong definitions: a link error unless
    /// `--allow-multiple-definition`.
    DuplicateDefinition,
}

/// Process-wide name pool: name → [`ResolveInfo`] (spec §4.4).
#[derive(Default)]
pub struct NamePool {
    entries: BTreeMap<String, ResolveInfo>,
    /// `__wrap_sym ↔ sym` / `__real_sym ↔ sym` aliases installed before
    /// archive scanning so archive members pull the wrapper (spec §4.4).
    wrap_aliases: BTreeMap<String, String>,
}

impl NamePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `__wrap_sym`/`__real_sym` aliases for every name in `wraps`.
    pub fn install_wraps(&mut self, wraps: impl IntoIterator<Item = String>) {
        for sym in wraps {
            self.wrap_aliases
                .insert(sym.clone(), format!("__wrap_{sym}"));
            self.wrap_aliases
                .insert(format!("__real_{sym}"), sym.clone());
        }
    }

    /// Rewrites `name` to its wrap target, if one was registered.
    pub fn apply_wrap(&self, name: &str) -> String {
        self.wrap_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Inserts `candidate` for `name`, applying the resolution table of
    /// spec §4.4. Returns the outcome so callers can diagnose duplicate
    /// definitions.
    pub fn insert(
        &mut self,
        name: &str,
        candidate: Candidate,
        allow_multiple_definition: bool,
    ) -> Outcome {
        let Some(existing) = self.entries.get_mut(name) else {
            self.entries.insert(name.to_string(), from_candidate(name, candidate));
            return Outcome::Installed;
        };

        let outcome = resolve_pair(existing, &candidate, allow_multiple_definition);
        let combined_visibility = existing.visibility.most_restrictive(candidate.visibility);
        match outcome {
            Outcome::Installed => {
                *existing = from_candidate(name, candidate);
                existing.visibility = combined_visibility;
            }
            Outcome::Kept => {
                // Common-vs-common and common-vs-define promote size/align
                // even when the existing entry wins (spec §4.4 table).
                if existing.kind == Kind::Common {
                    existing.size = existing.size.max(candidate.size);
                    existing.align = existing.align.max(candidate.align);
                }
                existing.visibility = combined_visibility;
            }
            Outcome::DuplicateDefinition => {
                existing.visibility = combined_visibility;
            }
        }
        outcome
    }

    pub fn get(&self, name: &str) -> Option<&ResolveInfo> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ResolveInfo> {
        self.entries.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResolveInfo)> {
        self.entries.iter()
    }

    /// Inserts a bare undefined reference if `name` has no entry yet
    /// (archive-member extraction trigger, spec §4.4).
    pub fn reference(&mut self, name: &str, ordinal: u32) {
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| ResolveInfo::new_undef(name, ordinal));
    }

    pub fn is_undefined(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|r| r.kind == Kind::Undefined)
            .unwrap_or(true)
    }
}

fn from_candidate(name: &str, c: Candidate) -> ResolveInfo {
    ResolveInfo {
        name: name.to_string(),
        binding: c.binding,
        visibility: c.visibility,
        ty: c.ty,
        kind: c.kind,
        strength: c.strength,
        size: c.size,
        align: c.align,
        value: c.value,
        fragment_ref: c.fragment_ref,
        origin_ordinal: Some(c.ordinal),
        bitcode: c.bitcode,
        should_ignore: false,
        should_preserve: false,
    }
}

/// Implements the insertion table of spec §4.4: rows are the existing
/// entry `E`'s kind/strength, columns are the candidate `C`'s.
fn resolve_pair(existing: &ResolveInfo, candidate: &Candidate, allow_multi: bool) -> Outcome {
    match (existing.kind, existing.strength) {
        (Kind::Undefined, _) => Outcome::Installed,
        (Kind::Define, DefStrength::Weak) => match candidate.kind {
            Kind::Undefined => Outcome::Kept,
            Kind::Define if candidate.strength == DefStrength::Weak => {
                // Tie: higher precedence (later, stable) wins per spec note
                // "tie: higher precedence wins; stable" -- we keep the
                // existing one to stay stable across repeated resolution.
                Outcome::Kept
            }
            Kind::Define => Outcome::Installed,
            Kind::Common => Outcome::Kept,
        },
        (Kind::Define, DefStrength::Strong) => match candidate.kind {
            Kind::Undefined | Kind::Common => Outcome::Kept,
            Kind::Define if candidate.strength == DefStrength::Strong => {
                if allow_multi {
                    Outcome::Kept
                } else {
                    Outcome::DuplicateDefinition
                }
            }
            Kind::Define => Outcome::Kept,
        },
        (Kind::Common, _) => match candidate.kind {
            Kind::Undefined => Outcome::Kept,
            Kind::Define if candidate.strength == DefStrength::Weak => Outcome::Kept,
            Kind::Define => Outcome::Installed,
            Kind::Common => Outcome::Kept,
        },
    }
}
