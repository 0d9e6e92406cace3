//! Hand-rolled lexer for the GNU `ld` linker-script subset named in spec §6.

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(u64),
    Str(String),
    Punct(char),
    /// Two-character operators that don't fit the single-`Punct` case.
    Op(&'static str),
    Eof,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_byte() {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'/') if self.src.get(self.pos + 1) == Some(&b'*') => {
                    self.pos += 2;
                    while self.pos < self.src.len()
                        && !(self.src[self.pos] == b'*' && self.src.get(self.pos + 1) == Some(&b'/'))
                    {
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(self.src.len());
                }
                _ => break,
            }
        }
    }

    /// Identifier characters for this dialect: a linker-script "name" is far
    /// more permissive than a C identifier (`.text.foo`, `*crtbegin?.o`).
    fn is_ident_byte(b: u8) -> bool {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'_' | b'.' | b'$' | b'/' | b'\\' | b'-' | b'*' | b'?' | b'[' | b']' | b'!' | b'^' | b':' | b'~'
            )
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_trivia();
        let Some(b) = self.peek_byte() else {
            return Token::Eof;
        };

        if b == b'"' {
            self.pos += 1;
            let start = self.pos;
            while self.peek_byte().is_some_and(|c| c != b'"') {
                self.pos += 1;
            }
            let s = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
            self.pos += 1;
            return Token::Str(s);
        }

        if b.is_ascii_digit() {
            let start = self.pos;
            if b == b'0' && self.src.get(self.pos + 1).copied() == Some(b'x') {
                self.pos += 2;
                while self.peek_byte().is_some_and(|c| c.is_ascii_hexdigit()) {
                    self.pos += 1;
                }
                let text = std::str::from_utf8(&self.src[start + 2..self.pos]).unwrap();
                return Token::Number(u64::from_str_radix(text, 16).unwrap_or(0));
            }
            while self.peek_byte().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            let mut value: u64 = std::str::from_utf8(&self.src[start..self.pos])
                .unwrap()
                .parse()
                .unwrap_or(0);
            match self.peek_byte() {
                Some(b'K') | Some(b'k') => {
                    value *= 1024;
                    self.pos += 1;
                }
                Some(b'M') | Some(b'm') => {
                    value *= 1024 * 1024;
                    self.pos += 1;
                }
                _ => {}
            }
            return Token::Number(value);
        }

        // Two-char operators.
        if let Some(&next) = self.src.get(self.pos + 1) {
            let two: &'static str = match (b, next) {
                (b'=', b'=') => "==",
                (b'!', b'=') => "!=",
                (b'<', b'=') => "<=",
                (b'>', b'=') => ">=",
                (b'<', b'<') => "<<",
                (b'>', b'>') => ">>",
                (b'&', b'&') => "&&",
                (b'|', b'|') => "||",
                (b'+', b'=') => "+=",
                (b'-', b'=') => "-=",
                _ => "",
            };
            if !two.is_empty() {
                self.pos += 2;
                return Token::Op(two);
            }
        }

        // `* / - ~ ! : ^` are deliberately left out of this punctuation set:
        // in linker-script syntax they double as wildcard/name characters
        // (`*(.text*)`, `crtbegin?.o`, `__start-foo`), so they lex as part
        // of an `Ident` and the expression parser recognizes the
        // single-character idents `"*"`, `"/"`, `"-"`, `"~"`, `"!"` as
        // operators from context instead.
        if matches!(b, b'(' | b')' | b'{' | b'}' | b';' | b',' | b'=' | b'+' | b'&' | b'|' | b'<' | b'>') {
            self.pos += 1;
            return Token::Punct(b as char);
        }

        if Self::is_ident_byte(b) {
            let start = self.pos;
            while self.peek_byte().is_some_and(Self::is_ident_byte) {
                self.pos += 1;
            }
            let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
            return Token::Ident(text);
        }

        // Unknown byte: skip it rather than abort the whole parse.
        self.pos += 1;
        self.next_token()
    }

    pub fn tokenize(mut self) -> Vec<Token> {
        let mut out = Vec::new();
        loop {
            let t = self.next_token();
            let done = t == Token::Eof;
            out.push(t);
            if done {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_assignment_and_wildcard_rule() {
        let toks = Lexer::new("*(.text*) . = ALIGN(16);").tokenize();
        assert_eq!(
            toks,
            vec![
                Token::Ident("*".into()),
                Token::Punct('('),
                Token::Ident(".text*".into()),
                Token::Punct(')'),
                Token::Ident(".".into()),
                Token::Punct('='),
                Token::Ident("ALIGN".into()),
                Token::Punct('('),
                Token::Number(16),
                Token::Punct(')'),
                Token::Punct(';'),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn hex_and_suffixed_numbers() {
        let toks = Lexer::new("0x1000 4K 2M").tokenize();
        assert_eq!(
            toks,
            vec![
                Token::Number(0x1000),
                Token::Number(4096),
                Token::Number(2 * 1024 * 1024),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn skips_block_comments() {
        let toks = Lexer::new("/* comment */ ENTRY").tokenize();
        assert_eq!(toks, vec![Token::Ident("ENTRY".into()), Token::Eof]);
    }
}
