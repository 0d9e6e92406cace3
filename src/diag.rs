//! Severity-tagged diagnostic engine (C1).
//!
//! Subsystems never panic or raise control-flow exceptions for link-level
//! problems; they report a [`Diagnostic`] to a [`DiagEngine`] and keep going
//! until the next phase boundary, which inspects [`DiagEngine::should_abort`].

use std::fmt;

/// Severity of a single diagnostic, ordered from least to most serious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    CriticalWarning,
    Error,
    InternalError,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::CriticalWarning => "warning",
            Severity::Error => "error",
            Severity::InternalError => "internal error",
            Severity::Fatal => "fatal error",
        };
        write!(f, "{s}")
    }
}

/// One substitution argument for a diagnostic's format string.
#[derive(Debug, Clone)]
pub enum DiagArg {
    Int(i64),
    UInt(u64),
    Str(String),
    Bool(bool),
}

impl fmt::Display for DiagArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagArg::Int(v) => write!(f, "{v}"),
            DiagArg::UInt(v) => write!(f, "{v}"),
            DiagArg::Str(v) => write!(f, "{v}"),
            DiagArg::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A single formatted diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub template: &'static str,
    pub args: Vec<DiagArg>,
    /// Name of the plugin that raised this diagnostic, if any.
    pub plugin: Option<String>,
}

impl Diagnostic {
    /// Substitutes `%0`, `%1`, ... placeholders in `template` with `args`.
    pub fn format(&self) -> String {
        let mut out = String::new();
        let mut chars = self.template.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '%' {
                if let Some(d) = chars.peek().copied() {
                    if d.is_ascii_digit() {
                        chars.next();
                        let idx = d.to_digit(10).unwrap() as usize;
                        if let Some(arg) = self.args.get(idx) {
                            out.push_str(&arg.to_string());
                        } else {
                            out.push('%');
                            out.push(d);
                        }
                        continue;
                    }
                }
            }
            out.push(c);
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(plugin) = &self.plugin {
            write!(f, "{plugin}:")?;
        }
        write!(f, "{}: {}", self.severity, self.format())
    }
}

/// Counters and thresholds driving the severity-promotion rules of spec §7.
#[derive(Debug)]
pub struct DiagEngine {
    pub fatal_warnings: bool,
    pub fatal_internal_errors: bool,
    pub noinhibit_exec: bool,
    pub error_limit: Option<usize>,
    pub warn_limit: Option<usize>,
    pub verbose: u32,

    messages: Vec<Diagnostic>,
    warning_count: usize,
    error_count: usize,
    fatal_count: usize,
    suppressed_errors: usize,
    suppressed_warnings: usize,
}

impl Default for DiagEngine {
    fn default() -> Self {
        Self {
            fatal_warnings: false,
            fatal_internal_errors: false,
            noinhibit_exec: false,
            error_limit: None,
            warn_limit: None,
            verbose: 0,
            messages: Vec::new(),
            warning_count: 0,
            error_count: 0,
            fatal_count: 0,
            suppressed_errors: 0,
            suppressed_warnings: 0,
        }
    }
}

impl DiagEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports a diagnostic, applying the promotion rules of spec §7.
    pub fn report(&mut self, severity: Severity, template: &'static str, args: Vec<DiagArg>) {
        self.report_from(None, severity, template, args);
    }

    pub fn report_from(
        &mut self,
        plugin: Option<String>,
        mut severity: Severity,
        template: &'static str,
        args: Vec<DiagArg>,
    ) {
        if severity == Severity::Warning && self.fatal_warnings {
            severity = Severity::Fatal;
        }
        if severity == Severity::InternalError && self.fatal_internal_errors {
            severity = Severity::Fatal;
        }

        match severity {
            Severity::Warning | Severity::CriticalWarning => {
                if let Some(limit) = self.warn_limit {
                    if self.warning_count >= limit {
                        self.suppressed_warnings += 1;
                        return;
                    }
                }
                self.warning_count += 1;
            }
            Severity::Error | Severity::InternalError => {
                if let Some(limit) = self.error_limit {
                    if self.error_count >= limit {
                        self.suppressed_errors += 1;
                        return;
                    }
                }
                self.error_count += 1;
            }
            Severity::Fatal => self.fatal_count += 1,
            Severity::Note => {}
        }

        self.messages.push(Diagnostic {
            severity,
            template,
            args,
            plugin,
        });
    }

    pub fn note(&mut self, template: &'static str, args: Vec<DiagArg>) {
        self.report(Severity::Note, template, args);
    }

    pub fn warn(&mut self, template: &'static str, args: Vec<DiagArg>) {
        self.report(Severity::Warning, template, args);
    }

    pub fn error(&mut self, template: &'static str, args: Vec<DiagArg>) {
        self.report(Severity::Error, template, args);
    }

    pub fn fatal(&mut self, template: &'static str, args: Vec<DiagArg>) {
        self.report(Severity::Fatal, template, args);
    }

    pub fn has_fatal(&self) -> bool {
        self.fatal_count > 0
    }

    /// Whether the driver should stop at the next phase boundary.
    pub fn should_abort(&self) -> bool {
        if self.has_fatal() {
            return true;
        }
        if self.noinhibit_exec {
            return false;
        }
        self.error_count > 0
    }

    pub fn messages(&self) -> &[Diagnostic] {
        &self.messages
    }

    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Exit-code contract of spec §8: 0 iff no fatal and no uncaught error.
    pub fn exit_code(&self) -> i32 {
        if self.has_fatal() {
            return 1;
        }
        if self.error_count > 0 && !self.noinhibit_exec {
            return 1;
        }
        0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} warning(s) ({} suppressed), {} error(s) ({} suppressed), {} fatal",
            self.warning_count,
            self.suppressed_warnings,
            self.error_count,
            self.suppressed_errors,
            self.fatal_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_substitutes_positional_args() {
        let d = Diagnostic {
            severity: Severity::Error,
            template: "undefined symbol %0 referenced from %1",
            args: vec![
                DiagArg::Str("puts".into()),
                DiagArg::Str("hello.o".into()),
            ],
            plugin: None,
        };
        assert_eq!(
            d.format(),
            "undefined symbol puts referenced from hello.o"
        );
    }

    #[test]
    fn fatal_warnings_promotes_and_blocks_exec() {
        let mut eng = DiagEngine::new();
        eng.fatal_warnings = true;
        eng.warn("orphan section %0 placed", vec![DiagArg::Str(".weird".into())]);
        assert!(eng.has_fatal());
        assert_eq!(eng.exit_code(), 1);
    }

    #[test]
    fn error_limit_suppresses_excess_messages() {
        let mut eng = DiagEngine::new();
        eng.error_limit = Some(1);
        eng.error("bad %0", vec![DiagArg::Int(1)]);
        eng.error("bad %0", vec![DiagArg::Int(2)]);
        assert_eq!(eng.messages().len(), 1);
        assert_eq!(eng.error_count(), 1);
    }

    #[test]
    fn noinhibit_exec_allows_errors_through() {
        let mut eng = DiagEngine::new();
        eng.noinhibit_exec = true;
        eng.error("missing symbol %0", vec![DiagArg::Str("x".into())]);
        assert_eq!(eng.exit_code(), 0);
        assert!(!eng.should_abort());
    }
}
