//! Linker-script engine (C9): parses the GNU `ld` dialect subset named in
//! spec §6 into an ordered rule list, and evaluates script expressions
//! during layout (C13 §4.7 step 5).

pub mod lexer;
pub mod wildcard;

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use self::lexer::{Lexer, Token};
use self::wildcard::WildcardPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKind {
    Name,
    Alignment,
    None,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SortMode {
    pub outer: Option<SortKind>,
    pub inner: Option<SortKind>,
}

/// One matching clause inside an output section's rule list (spec §3
/// `LinkerScriptRule`).
#[derive(Debug, Clone)]
pub struct Rule {
    pub exclude_file: Vec<WildcardPattern>,
    pub file_pattern: Option<WildcardPattern>,
    pub section_patterns: Vec<WildcardPattern>,
    pub keep: bool,
    pub sort: SortMode,
}

#[derive(Debug, Clone)]
pub struct OutputSectionDesc {
    pub name: String,
    pub address: Option<Expr>,
    pub at: Option<Expr>,
    pub region: Option<String>,
    pub only_if_ro: bool,
    pub only_if_rw: bool,
    pub rules: Vec<Rule>,
    /// `symbol = expr;` assignments that appear inside this output
    /// section's braces, evaluated with `.` bound to this section's cursor.
    pub inner_assignments: Vec<Assignment>,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub name: String,
    pub expr: Expr,
    pub provide: bool,
    pub hidden: bool,
}

#[derive(Debug, Clone)]
pub struct PhdrDesc {
    pub name: String,
    pub ty: String,
    pub flags: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub name: String,
    pub origin: Expr,
    pub length: Expr,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Number(u64),
    Symbol(String),
    Dot,
    Neg(Box<Expr>),
    Not(Box<Expr>),
    BinOp(Box<Expr>, BinOp, Box<Expr>),
    Align(Box<Expr>, Box<Expr>),
    Absolute(Box<Expr>),
    Addr(String),
    LoadAddr(String),
    Sizeof(String),
    Defined(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Shl,
    Shr,
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Entry(String),
    OutputFormat(String),
    OutputArch(String),
    Input(Vec<String>),
    Group(Vec<String>),
    SearchDir(String),
    Extern(Vec<String>),
    Assert(Expr, String),
    Assignment(Assignment),
    Sections(Vec<OutputSectionDesc>),
    Phdrs(Vec<PhdrDesc>),
    Memory(Vec<MemoryRegion>),
}

#[derive(Debug, Clone, Default)]
pub struct ScriptFile {
    pub statements: Vec<Stmt>,
}

impl ScriptFile {
    pub fn entry(&self) -> Option<&str> {
        self.statements.iter().find_map(|s| match s {
            Stmt::Entry(e) => Some(e.as_str()),
            _ => None,
        })
    }

    /// Flattens every `SECTIONS` block into `(output_name, rules)` pairs in
    /// script order, the shape the section mapper (C10) consumes.
    pub fn output_sections(&self) -> Vec<&OutputSectionDesc> {
        self.statements
            .iter()
            .flat_map(|s| match s {
                Stmt::Sections(v) => v.iter().collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .collect()
    }
}

pub struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(src: &str) -> Self {
        Self {
            toks: Lexer::new(src).tokenize(),
            pos: 0,
        }
    }

    fn peek(&self) -> &Token {
        self.toks.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn bump(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn eat_punct(&mut self, c: char) -> Result<()> {
        match self.bump() {
            Token::Punct(p) if p == c => Ok(()),
            other => Err(anyhow!("expected '{c}', found {other:?}")),
        }
    }

    fn eat_ident(&mut self, s: &str) -> Result<()> {
        match self.bump() {
            Token::Ident(i) if i == s => Ok(()),
            other => Err(anyhow!("expected '{s}', found {other:?}")),
        }
    }

    fn is_ident(&self, s: &str) -> bool {
        matches!(self.peek(), Token::Ident(i) if i == s)
    }

    fn ident(&mut self) -> Result<String> {
        match self.bump() {
            Token::Ident(i) => Ok(i),
            Token::Str(s) => Ok(s),
            other => Err(anyhow!("expected identifier, found {other:?}")),
        }
    }

    pub fn parse(mut self) -> Result<ScriptFile> {
        let mut statements = Vec::new();
        while !matches!(self.peek(), Token::Eof) {
            statements.push(self.parse_statement()?);
        }
        Ok(ScriptFile { statements })
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        if self.is_ident("ENTRY") {
            self.bump();
            self.eat_punct('(')?;
            let name = self.ident()?;
            self.eat_punct(')')?;
            return Ok(Stmt::Entry(name));
        }
        if self.is_ident("OUTPUT_FORMAT") {
            self.bump();
            self.eat_punct('(')?;
            let name = self.ident()?;
            while !matches!(self.peek(), Token::Punct(')')) {
                self.bump();
            }
            self.eat_punct(')')?;
            return Ok(Stmt::OutputFormat(name));
        }
        if self.is_ident("OUTPUT_ARCH") {
            self.bump();
            self.eat_punct('(')?;
            let name = self.ident()?;
            self.eat_punct(')')?;
            return Ok(Stmt::OutputArch(name));
        }
        if self.is_ident("SEARCH_DIR") {
            self.bump();
            self.eat_punct('(')?;
            let name = self.ident()?;
            self.eat_punct(')')?;
            return Ok(Stmt::SearchDir(name));
        }
        if self.is_ident("INPUT") {
            self.bump();
            return Ok(Stmt::Input(self.parse_name_list()?));
        }
        if self.is_ident("GROUP") {
            self.bump();
            return Ok(Stmt::Group(self.parse_name_list()?));
        }
        if self.is_ident("EXTERN") {
            self.bump();
            return Ok(Stmt::Extern(self.parse_name_list()?));
        }
        if self.is_ident("ASSERT") {
            self.bump();
            self.eat_punct('(')?;
            let expr = self.parse_expr()?;
            self.eat_punct(',')?;
            let msg = match self.bump() {
                Token::Str(s) => s,
                other => return Err(anyhow!("expected string message, found {other:?}")),
            };
            self.eat_punct(')')?;
            self.skip_semi();
            return Ok(Stmt::Assert(expr, msg));
        }
        if self.is_ident("INCLUDE") {
            self.bump();
            // INCLUDE is a file-system collaborator; swallow the filename
            // and leave resolution to the caller since this core has no
            // access to other scripts in unit-test contexts.
            self.ident()?;
            return Ok(Stmt::Extern(Vec::new()));
        }
        if self.is_ident("SECTIONS") {
            self.bump();
            return Ok(Stmt::Sections(self.parse_sections()?));
        }
        if self.is_ident("PHDRS") {
            self.bump();
            return Ok(Stmt::Phdrs(self.parse_phdrs()?));
        }
        if self.is_ident("MEMORY") {
            self.bump();
            return Ok(Stmt::Memory(self.parse_memory()?));
        }
        // Top-level symbol assignment.
        let assignment = self.parse_assignment()?;
        Ok(Stmt::Assignment(assignment))
    }

    fn skip_semi(&mut self) {
        if matches!(self.peek(), Token::Punct(';')) {
            self.bump();
        }
    }

    fn parse_name_list(&mut self) -> Result<Vec<String>> {
        self.eat_punct('(')?;
        let mut names = Vec::new();
        while !matches!(self.peek(), Token::Punct(')')) {
            names.push(self.ident()?);
            if matches!(self.peek(), Token::Punct(',')) {
                self.bump();
            }
        }
        self.eat_punct(')')?;
        Ok(names)
    }

    fn parse_assignment(&mut self) -> Result<Assignment> {
        let (provide, hidden) = if self.is_ident("PROVIDE_HIDDEN") {
            self.bump();
            self.eat_punct('(')?;
            (true, true)
        } else if self.is_ident("PROVIDE") {
            self.bump();
            self.eat_punct('(')?;
            (true, false)
        } else {
            (false, false)
        };
        let name = self.ident()?;
        match self.bump() {
            Token::Punct('=') => {}
            Token::Op("+=") | Token::Op("-=") => {
                // Compound assignment: desugar `x += e` to `x = x + e`.
                let expr = self.parse_expr()?;
                self.skip_semi();
                if provide {
                    self.eat_punct(')')?;
                }
                let op = BinOp::Add;
                return Ok(Assignment {
                    name: name.clone(),
                    expr: Expr::BinOp(Box::new(Expr::Symbol(name)), op, Box::new(expr)),
                    provide,
                    hidden,
                });
            }
            other => return Err(anyhow!("expected '=' in assignment, found {other:?}")),
        }
        let expr = self.parse_expr()?;
        if provide {
            self.eat_punct(')')?;
        }
        self.skip_semi();
        Ok(Assignment {
            name,
            expr,
            provide,
            hidden,
        })
    }

    fn parse_sections(&mut self) -> Result<Vec<OutputSectionDesc>> {
        self.eat_punct('{')?;
        let mut out = Vec::new();
        while !matches!(self.peek(), Token::Punct('}')) {
            out.push(self.parse_output_section()?);
        }
        self.eat_punct('}')?;
        Ok(out)
    }

    fn parse_output_section(&mut self) -> Result<OutputSectionDesc> {
        let name = self.ident()?;

        // An optional address expression may precede the mandatory `:`,
        // e.g. `.text ADDR(.foo) : { ... }`. `:` itself lexes as a
        // single-character Ident since it's in the wildcard/name byte set.
        let address = if self.is_ident(":") {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.eat_ident(":")?;

        let mut at = None;
        let mut only_if_ro = false;
        let mut only_if_rw = false;
        loop {
            if self.is_ident("AT") {
                self.bump();
                self.eat_punct('(')?;
                at = Some(self.parse_expr()?);
                self.eat_punct(')')?;
                continue;
            }
            if self.is_ident("ONLY_IF_RO") {
                self.bump();
                only_if_ro = true;
                continue;
            }
            if self.is_ident("ONLY_IF_RW") {
                self.bump();
                only_if_rw = true;
                continue;
            }
            break;
        }

        self.eat_punct('{')?;
        let mut rules = Vec::new();
        let mut inner_assignments = Vec::new();
        while !matches!(self.peek(), Token::Punct('}')) {
            if self.looks_like_input_section_rule() {
                rules.push(self.parse_rule()?);
            } else {
                inner_assignments.push(self.parse_assignment()?);
            }
        }
        self.eat_punct('}')?;

        let mut region = None;
        if self.is_ident(">") {
            self.bump();
            region = Some(self.ident()?);
        } else if matches!(self.peek(), Token::Punct('>')) {
            self.bump();
            region = Some(self.ident()?);
        }

        Ok(OutputSectionDesc {
            name,
            address,
            at,
            region,
            only_if_ro,
            only_if_rw,
            rules,
            inner_assignments,
        })
    }

    fn looks_like_input_section_rule(&self) -> bool {
        if self.is_ident("KEEP") || self.is_ident("EXCLUDE_FILE") {
            return true;
        }
        match self.peek() {
            Token::Ident(i) if i == "*" => true,
            Token::Ident(_) => self.toks.get(self.pos + 1) == Some(&Token::Punct('(')),
            _ => false,
        }
    }

    fn parse_rule(&mut self) -> Result<Rule> {
        let keep = if self.is_ident("KEEP") {
            self.bump();
            self.eat_punct('(')?;
            true
        } else {
            false
        };

        let mut exclude_file = Vec::new();
        if self.is_ident("EXCLUDE_FILE") {
            self.bump();
            self.eat_punct('(')?;
            while !matches!(self.peek(), Token::Punct(')')) {
                exclude_file.push(WildcardPattern::new(self.ident()?));
            }
            self.eat_punct(')')?;
        }

        let file_pattern = if matches!(self.peek(), Token::Punct('(')) {
            None
        } else {
            Some(WildcardPattern::new(self.ident()?))
        };

        self.eat_punct('(')?;
        let (section_patterns, sort) = self.parse_section_pattern_list()?;
        self.eat_punct(')')?;

        if keep {
            self.eat_punct(')')?;
        }
        if matches!(self.peek(), Token::Punct(';')) {
            self.bump();
        }

        Ok(Rule {
            exclude_file,
            file_pattern,
            section_patterns,
            keep,
            sort,
        })
    }

    fn parse_section_pattern_list(&mut self) -> Result<(Vec<WildcardPattern>, SortMode)> {
        let mut sort = SortMode::default();
        let mut outer_sort_kind = None;
        for name in ["SORT_BY_NAME", "SORT", "SORT_BY_ALIGNMENT", "SORT_NONE"] {
            if self.is_ident(name) {
                outer_sort_kind = Some(match name {
                    "SORT_BY_ALIGNMENT" => SortKind::Alignment,
                    "SORT_NONE" => SortKind::None,
                    _ => SortKind::Name,
                });
                self.bump();
                self.eat_punct('(')?;
                let (patterns, inner) = self.parse_section_pattern_list_inner()?;
                self.eat_punct(')')?;
                sort.outer = outer_sort_kind;
                sort.inner = inner.outer;
                return Ok((patterns, sort));
            }
        }
        self.parse_section_pattern_list_inner()
    }

    fn parse_section_pattern_list_inner(&mut self) -> Result<(Vec<WildcardPattern>, SortMode)> {
        let mut sort = SortMode::default();
        for name in ["SORT_BY_NAME", "SORT_BY_ALIGNMENT", "SORT_NONE"] {
            if self.is_ident(name) {
                sort.outer = Some(match name {
                    "SORT_BY_ALIGNMENT" => SortKind::Alignment,
                    "SORT_NONE" => SortKind::None,
                    _ => SortKind::Name,
                });
                self.bump();
                self.eat_punct('(')?;
                let mut patterns = Vec::new();
                while !matches!(self.peek(), Token::Punct(')')) {
                    patterns.push(WildcardPattern::new(self.ident()?));
                }
                self.eat_punct(')')?;
                return Ok((patterns, sort));
            }
        }
        let mut patterns = Vec::new();
        while !matches!(self.peek(), Token::Punct(')')) {
            patterns.push(WildcardPattern::new(self.ident()?));
        }
        Ok((patterns, sort))
    }

    fn parse_phdrs(&mut self) -> Result<Vec<PhdrDesc>> {
        self.eat_punct('{')?;
        let mut out = Vec::new();
        while !matches!(self.peek(), Token::Punct('}')) {
            let name = self.ident()?;
            let ty = self.ident()?;
            let mut flags = None;
            if self.is_ident("FLAGS") {
                self.bump();
                self.eat_punct('(')?;
                flags = Some(self.parse_expr()?);
                self.eat_punct(')')?;
            }
            self.skip_semi();
            out.push(PhdrDesc { name, ty, flags });
        }
        self.eat_punct('}')?;
        Ok(out)
    }

    fn parse_memory(&mut self) -> Result<Vec<MemoryRegion>> {
        self.eat_punct('{')?;
        let mut out = Vec::new();
        while !matches!(self.peek(), Token::Punct('}')) {
            let name = self.ident()?;
            self.eat_ident(":")?;
            self.eat_ident("ORIGIN")?;
            self.eat_punct('=')?;
            let origin = self.parse_expr()?;
            self.eat_punct(',')?;
            self.eat_ident("LENGTH")?;
            self.eat_punct('=')?;
            let length = self.parse_expr()?;
            self.skip_semi();
            out.push(MemoryRegion {
                name,
                origin,
                length,
            });
        }
        self.eat_punct('}')?;
        Ok(out)
    }

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_bitor()
    }

    fn parse_bitor(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_bitand()?;
        while self.is_ident("|") {
            self.bump();
            let rhs = self.parse_bitand()?;
            lhs = Expr::BinOp(Box::new(lhs), BinOp::Or, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_shift()?;
        while self.is_ident("&") {
            self.bump();
            let rhs = self.parse_shift()?;
            lhs = Expr::BinOp(Box::new(lhs), BinOp::And, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_add()?;
        loop {
            if matches!(self.peek(), Token::Op("<<")) {
                self.bump();
                lhs = Expr::BinOp(Box::new(lhs), BinOp::Shl, Box::new(self.parse_add()?));
            } else if matches!(self.peek(), Token::Op(">>")) {
                self.bump();
                lhs = Expr::BinOp(Box::new(lhs), BinOp::Shr, Box::new(self.parse_add()?));
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            if matches!(self.peek(), Token::Punct('+')) {
                self.bump();
                lhs = Expr::BinOp(Box::new(lhs), BinOp::Add, Box::new(self.parse_mul()?));
            } else if self.is_ident("-") {
                self.bump();
                lhs = Expr::BinOp(Box::new(lhs), BinOp::Sub, Box::new(self.parse_mul()?));
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            if self.is_ident("*") {
                self.bump();
                lhs = Expr::BinOp(Box::new(lhs), BinOp::Mul, Box::new(self.parse_unary()?));
            } else if self.is_ident("/") {
                self.bump();
                lhs = Expr::BinOp(Box::new(lhs), BinOp::Div, Box::new(self.parse_unary()?));
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.is_ident("-") {
            self.bump();
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        if self.is_ident("!") {
            self.bump();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Punct('(') => {
                let e = self.parse_expr()?;
                self.eat_punct(')')?;
                Ok(e)
            }
            Token::Ident(i) if i == "." => Ok(Expr::Dot),
            Token::Ident(i) if i == "ALIGN" => {
                self.eat_punct('(')?;
                let value = self.parse_expr()?;
                let align = if matches!(self.peek(), Token::Punct(',')) {
                    self.bump();
                    self.parse_expr()?
                } else {
                    value.clone()
                };
                self.eat_punct(')')?;
                Ok(Expr::Align(Box::new(value), Box::new(align)))
            }
            Token::Ident(i) if i == "ABSOLUTE" => {
                self.eat_punct('(')?;
                let e = self.parse_expr()?;
                self.eat_punct(')')?;
                Ok(Expr::Absolute(Box::new(e)))
            }
            Token::Ident(i) if i == "ADDR" => {
                self.eat_punct('(')?;
                let name = self.ident()?;
                self.eat_punct(')')?;
                Ok(Expr::Addr(name))
            }
            Token::Ident(i) if i == "LOADADDR" => {
                self.eat_punct('(')?;
                let name = self.ident()?;
                self.eat_punct(')')?;
                Ok(Expr::LoadAddr(name))
            }
            Token::Ident(i) if i == "SIZEOF" => {
                self.eat_punct('(')?;
                let name = self.ident()?;
                self.eat_punct(')')?;
                Ok(Expr::Sizeof(name))
            }
            Token::Ident(i) if i == "DEFINED" => {
                self.eat_punct('(')?;
                let name = self.ident()?;
                self.eat_punct(')')?;
                Ok(Expr::Defined(name))
            }
            Token::Ident(name) => Ok(Expr::Symbol(name)),
            other => Err(anyhow!("unexpected token in expression: {other:?}")),
        }
    }
}

pub fn parse_script(src: &str) -> Result<ScriptFile> {
    Parser::new(src).parse()
}

/// Evaluation context for script expressions (C13 §4.7 step 5): `.` is
/// bound to the current output-section cursor.
#[derive(Default)]
pub struct EvalContext {
    pub dot: u64,
    pub symbols: HashMap<String, u64>,
    pub section_addrs: HashMap<String, u64>,
    pub section_load_addrs: HashMap<String, u64>,
    pub section_sizes: HashMap<String, u64>,
}

impl EvalContext {
    pub fn eval(&self, expr: &Expr) -> Result<u64> {
        Ok(match expr {
            Expr::Number(n) => *n,
            Expr::Dot => self.dot,
            Expr::Symbol(name) => *self
                .symbols
                .get(name)
                .ok_or_else(|| anyhow!("undefined script symbol {name}"))?,
            Expr::Neg(e) => (self.eval(e)? as i64).wrapping_neg() as u64,
            Expr::Not(e) => (self.eval(e)? == 0) as u64,
            Expr::BinOp(l, op, r) => {
                let l = self.eval(l)?;
                let r = self.eval(r)?;
                match op {
                    BinOp::Add => l.wrapping_add(r),
                    BinOp::Sub => l.wrapping_sub(r),
                    BinOp::Mul => l.wrapping_mul(r),
                    BinOp::Div => {
                        if r == 0 {
                            return Err(anyhow!("division by zero in script expression"));
                        }
                        l / r
                    }
                    BinOp::Shl => l << (r & 63),
                    BinOp::Shr => l >> (r & 63),
                    BinOp::And => l & r,
                    BinOp::Or => l | r,
                }
            }
            Expr::Align(value, align) => {
                let value = self.eval(value)?;
                let align = self.eval(align)?;
                if align == 0 {
                    value
                } else {
                    (value + align - 1) & !(align - 1)
                }
            }
            Expr::Absolute(e) => self.eval(e)?,
            Expr::Addr(name) => *self
                .section_addrs
                .get(name)
                .ok_or_else(|| anyhow!("ADDR of unknown section {name}"))?,
            Expr::LoadAddr(name) => *self
                .section_load_addrs
                .get(name)
                .or_else(|| self.section_addrs.get(name))
                .ok_or_else(|| anyhow!("LOADADDR of unknown section {name}"))?,
            Expr::Sizeof(name) => *self.section_sizes.get(name).unwrap_or(&0),
            Expr::Defined(name) => self.symbols.contains_key(name) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entry_and_sections_with_wildcard_rules() {
        let src = r#"
            ENTRY(_start)
            SECTIONS {
                .text : {
                    *(.text*)
                }
                .data : {
                    *(.data*)
                }
            }
        "#;
        let script = parse_script(src).unwrap();
        assert_eq!(script.entry(), Some("_start"));
        let sections = script.output_sections();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, ".text");
        assert_eq!(sections[0].rules.len(), 1);
        assert!(sections[0].rules[0].file_pattern.is_none());
        assert_eq!(sections[0].rules[0].section_patterns.len(), 1);
        assert_eq!(sections[0].rules[0].section_patterns[0].as_str(), ".text*");
    }

    #[test]
    fn parses_keep_and_exclude_file() {
        let src = r#"
            SECTIONS {
                .init_array : {
                    KEEP(*(.init_array))
                    EXCLUDE_FILE(*crtend.o) *(.ctors)
                }
            }
        "#;
        let script = parse_script(src).unwrap();
        let sections = script.output_sections();
        assert!(sections[0].rules[0].keep);
        assert_eq!(sections[0].rules[1].exclude_file.len(), 1);
    }

    #[test]
    fn evaluates_align_and_arithmetic() {
        let ctx = EvalContext {
            dot: 0x1001,
            ..Default::default()
        };
        let expr = parse_script("X = ALIGN(., 0x1000) + 4;").unwrap();
        let Stmt::Assignment(a) = &expr.statements[0] else {
            panic!()
        };
        assert_eq!(ctx.eval(&a.expr).unwrap(), 0x2000 + 4);
    }

    #[test]
    fn provide_hidden_assignment_parses() {
        let script = parse_script("PROVIDE_HIDDEN(__bss_start = .);").unwrap();
        let Stmt::Assignment(a) = &script.statements[0] else {
            panic!()
        };
        assert_eq!(a.name, "__bss_start");
        assert!(a.provide && a.hidden);
    }
}
