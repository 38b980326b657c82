//! Tokenizer for the permissive script dialect.
//!
//! The whole source is tokenized up front; the parser then works over the
//! token buffer with cheap save/restore backtracking. Every token records
//! whether a line terminator preceded it, which is what automatic semicolon
//! insertion and the restricted productions consult.

use super::ParseError;

/// Contents of a template-literal token. Embedded `${}` expressions are kept
/// as source ranges and parsed separately.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateToken {
    /// Cooked text chunks between expression holes; always `holes + 1` long.
    pub quasis: Vec<String>,
    /// Byte ranges of the embedded expressions, excluding the `${` / `}`.
    pub expr_spans: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier or keyword (the parser decides which).
    Ident(String),
    /// Numeric literal, folded to a double.
    Num(f64),
    /// BigInt literal without the trailing `n`.
    BigInt(String),
    /// String literal, cooked.
    Str(String),
    /// Template literal.
    Template(TemplateToken),
    /// Regular-expression literal.
    Regex { pattern: String, flags: String },
    /// Operator or punctuator.
    Punct(&'static str),
    /// End of input.
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub start: u32,
    pub end: u32,
    /// A line terminator (or a comment containing one) appeared before this
    /// token.
    pub newline_before: bool,
}

impl Token {
    pub fn is_punct(&self, p: &str) -> bool {
        matches!(&self.kind, TokenKind::Punct(s) if *s == p)
    }

    pub fn is_ident(&self, word: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(s) if s == word)
    }
}

/// Words after which a `/` starts a regular expression rather than division.
const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "do", "else",
    "case", "yield", "await",
];

/// Multi-character punctuators, longest first so maximal munch works.
const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==", "!=",
    "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=",
    "**", "<<", ">>", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*", "/", "%",
    "&", "|", "^", "!", "~", "?", ":", "=", ".", "@",
];

pub struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    newline_pending: bool,
    /// Kind of the last emitted token, for the regex/divide decision.
    last_significant: Option<TokenKind>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            newline_pending: false,
            last_significant: None,
        }
    }

    /// Tokenize the entire source.
    pub fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = matches!(token.kind, TokenKind::Eof);
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn err(&self, message: impl Into<String>, offset: usize) -> ParseError {
        ParseError::at(self.src, message, offset as u32)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(0x0b) | Some(0x0c) => self.pos += 1,
                Some(b'\n') => {
                    self.newline_pending = true;
                    self.pos += 1;
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    let mut closed = false;
                    while self.pos < self.bytes.len() {
                        if self.bytes[self.pos] == b'\n' {
                            self.newline_pending = true;
                        }
                        if self.bytes[self.pos] == b'*' && self.peek_at(1) == Some(b'/') {
                            self.pos += 2;
                            closed = true;
                            break;
                        }
                        self.pos += 1;
                    }
                    if !closed {
                        return Err(self.err("Unterminated comment", start));
                    }
                }
                // Non-ASCII whitespace (U+2028/U+2029 count as line terminators).
                Some(c) if c >= 0x80 => {
                    let rest = &self.src[self.pos..];
                    let ch = rest.chars().next().unwrap_or('\u{0}');
                    if ch == '\u{2028}' || ch == '\u{2029}' {
                        self.newline_pending = true;
                        self.pos += ch.len_utf8();
                    } else if ch.is_whitespace() {
                        self.pos += ch.len_utf8();
                    } else {
                        return Ok(());
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn regex_allowed(&self) -> bool {
        match &self.last_significant {
            None => true,
            Some(TokenKind::Punct(p)) => !matches!(*p, ")" | "]"),
            Some(TokenKind::Ident(word)) => REGEX_PRECEDING_KEYWORDS.contains(&word.as_str()),
            _ => false,
        }
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        self.skip_trivia()?;
        let newline_before = std::mem::take(&mut self.newline_pending);
        let start = self.pos;

        let kind = match self.peek() {
            None => TokenKind::Eof,
            Some(c) if c == b'_' || c == b'$' || c.is_ascii_alphabetic() || c >= 0x80 => {
                self.lex_word()?
            }
            Some(b'#') => {
                // Private class member name; folded into the identifier.
                self.pos += 1;
                match self.lex_word()? {
                    TokenKind::Ident(name) => TokenKind::Ident(format!("#{name}")),
                    _ => return Err(self.err("Invalid private name", start)),
                }
            }
            Some(c) if c.is_ascii_digit() => self.lex_number()?,
            Some(b'.') if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                self.lex_number()?
            }
            Some(b'"') | Some(b'\'') => self.lex_string()?,
            Some(b'`') => self.lex_template()?,
            Some(b'/') if self.regex_allowed() => self.lex_regex()?,
            Some(_) => self.lex_punct()?,
        };

        if !matches!(kind, TokenKind::Eof) {
            self.last_significant = Some(kind.clone());
        }
        Ok(Token {
            kind,
            start: start as u32,
            end: self.pos as u32,
            newline_before,
        })
    }

    fn lex_word(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'_' || c == b'$' || c.is_ascii_alphanumeric() {
                self.pos += 1;
            } else if c >= 0x80 {
                let ch = self.src[self.pos..].chars().next().unwrap_or('\u{0}');
                if ch.is_alphanumeric() {
                    self.pos += ch.len_utf8();
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.err(
                format!(
                    "Unexpected character '{}'",
                    self.src[start..].chars().next().unwrap_or('\u{0}')
                ),
                start,
            ));
        }
        Ok(TokenKind::Ident(self.src[start..self.pos].to_string()))
    }

    fn lex_number(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        let radix = if self.peek() == Some(b'0') {
            match self.peek_at(1) {
                Some(b'x') | Some(b'X') => 16,
                Some(b'o') | Some(b'O') => 8,
                Some(b'b') | Some(b'B') => 2,
                _ => 10,
            }
        } else {
            10
        };

        if radix != 10 {
            self.pos += 2;
            let digits_start = self.pos;
            while let Some(c) = self.peek() {
                let ok = c == b'_'
                    || match radix {
                        16 => c.is_ascii_hexdigit(),
                        8 => (b'0'..=b'7').contains(&c),
                        _ => c == b'0' || c == b'1',
                    };
                if ok {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            if self.pos == digits_start {
                return Err(self.err("Invalid numeric literal", start));
            }
            let digits: String = self.src[digits_start..self.pos]
                .chars()
                .filter(|c| *c != '_')
                .collect();
            if self.peek() == Some(b'n') {
                self.pos += 1;
                return Ok(TokenKind::BigInt(self.src[start..self.pos - 1].to_string()));
            }
            let value = u128::from_str_radix(&digits, radix)
                .map_err(|_| self.err("Invalid numeric literal", start))?;
            return Ok(TokenKind::Num(value as f64));
        }

        let mut saw_dot = false;
        let mut saw_exp = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' | b'_' => self.pos += 1,
                b'.' if !saw_dot && !saw_exp => {
                    saw_dot = true;
                    self.pos += 1;
                }
                b'e' | b'E' if !saw_exp => {
                    saw_exp = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        if self.peek() == Some(b'n') {
            if saw_dot || saw_exp {
                return Err(self.err("Invalid BigInt literal", start));
            }
            let digits = self.src[start..self.pos].replace('_', "");
            self.pos += 1;
            return Ok(TokenKind::BigInt(digits));
        }
        let text: String = self.src[start..self.pos]
            .chars()
            .filter(|c| *c != '_')
            .collect();
        text.parse::<f64>()
            .map(TokenKind::Num)
            .map_err(|_| self.err("Invalid numeric literal", start))
    }

    fn lex_escape(&mut self, out: &mut String) -> Result<(), ParseError> {
        let esc_start = self.pos;
        self.pos += 1; // consume the backslash
        let Some(c) = self.peek() else {
            return Err(self.err("Unterminated escape sequence", esc_start));
        };
        self.pos += 1;
        match c {
            b'n' => out.push('\n'),
            b't' => out.push('\t'),
            b'r' => out.push('\r'),
            b'b' => out.push('\u{8}'),
            b'f' => out.push('\u{c}'),
            b'v' => out.push('\u{b}'),
            b'0' if !self.peek().is_some_and(|c| c.is_ascii_digit()) => out.push('\u{0}'),
            b'\n' => {} // line continuation
            b'\r' => {
                if self.peek() == Some(b'\n') {
                    self.pos += 1;
                }
            }
            b'x' => {
                let hex = self
                    .src
                    .get(self.pos..self.pos + 2)
                    .ok_or_else(|| self.err("Invalid \\x escape", esc_start))?;
                let value =
                    u8::from_str_radix(hex, 16).map_err(|_| self.err("Invalid \\x escape", esc_start))?;
                out.push(value as char);
                self.pos += 2;
            }
            b'u' => {
                if self.peek() == Some(b'{') {
                    self.pos += 1;
                    let close = self.src[self.pos..]
                        .find('}')
                        .ok_or_else(|| self.err("Invalid \\u escape", esc_start))?;
                    let hex = &self.src[self.pos..self.pos + close];
                    let value = u32::from_str_radix(hex, 16)
                        .map_err(|_| self.err("Invalid \\u escape", esc_start))?;
                    out.push(
                        char::from_u32(value)
                            .ok_or_else(|| self.err("Invalid \\u escape", esc_start))?,
                    );
                    self.pos += close + 1;
                } else {
                    let hex = self
                        .src
                        .get(self.pos..self.pos + 4)
                        .ok_or_else(|| self.err("Invalid \\u escape", esc_start))?;
                    let value = u32::from_str_radix(hex, 16)
                        .map_err(|_| self.err("Invalid \\u escape", esc_start))?;
                    out.push(
                        char::from_u32(value)
                            .ok_or_else(|| self.err("Invalid \\u escape", esc_start))?,
                    );
                    self.pos += 4;
                }
            }
            other if other < 0x80 => out.push(other as char),
            _ => {
                // Escaped multibyte char: keep it verbatim.
                self.pos -= 1;
                let ch = self.src[self.pos..].chars().next().unwrap_or('\u{0}');
                out.push(ch);
                self.pos += ch.len_utf8();
            }
        }
        Ok(())
    }

    fn lex_string(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        let quote = self.bytes[self.pos];
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.err("Unterminated string literal", start)),
                Some(b'\\') => self.lex_escape(&mut value)?,
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(TokenKind::Str(value));
                }
                Some(c) if c < 0x80 => {
                    value.push(c as char);
                    self.pos += 1;
                }
                Some(_) => {
                    let ch = self.src[self.pos..].chars().next().unwrap_or('\u{0}');
                    value.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
    }

    /// Scan the expression inside `${ ... }`, returning the byte range of its
    /// source. Braces are balanced, skipping over nested strings, templates
    /// and comments so a `}` inside them does not close the hole.
    fn scan_template_expr(&mut self) -> Result<(u32, u32), ParseError> {
        let expr_start = self.pos;
        let mut depth = 1usize;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'{' => {
                    depth += 1;
                    self.pos += 1;
                }
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let span = (expr_start as u32, self.pos as u32);
                        self.pos += 1;
                        return Ok(span);
                    }
                    self.pos += 1;
                }
                b'"' | b'\'' => {
                    self.lex_string()?;
                }
                b'`' => {
                    self.lex_template()?;
                }
                b'/' if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                b'/' if self.peek_at(1) == Some(b'*') => {
                    self.pos += 2;
                    while self.pos < self.bytes.len() {
                        if self.bytes[self.pos] == b'*' && self.peek_at(1) == Some(b'/') {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => self.pos += 1,
            }
        }
        Err(self.err("Unterminated template expression", expr_start))
    }

    fn lex_template(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        self.pos += 1; // opening backtick
        let mut quasis = Vec::new();
        let mut expr_spans = Vec::new();
        let mut current = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err("Unterminated template literal", start)),
                Some(b'`') => {
                    self.pos += 1;
                    quasis.push(current);
                    return Ok(TokenKind::Template(TemplateToken { quasis, expr_spans }));
                }
                Some(b'\\') => self.lex_escape(&mut current)?,
                Some(b'$') if self.peek_at(1) == Some(b'{') => {
                    self.pos += 2;
                    quasis.push(std::mem::take(&mut current));
                    expr_spans.push(self.scan_template_expr()?);
                }
                Some(c) if c < 0x80 => {
                    current.push(c as char);
                    self.pos += 1;
                }
                Some(_) => {
                    let ch = self.src[self.pos..].chars().next().unwrap_or('\u{0}');
                    current.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
    }

    fn lex_regex(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        self.pos += 1; // opening slash
        let mut in_class = false;
        let pattern_start = self.pos;
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    return Err(self.err("Unterminated regular expression", start))
                }
                Some(b'\\') => {
                    self.pos += 2;
                }
                Some(b'[') => {
                    in_class = true;
                    self.pos += 1;
                }
                Some(b']') => {
                    in_class = false;
                    self.pos += 1;
                }
                Some(b'/') if !in_class => break,
                Some(c) if c < 0x80 => self.pos += 1,
                Some(_) => {
                    let ch = self.src[self.pos..].chars().next().unwrap_or('\u{0}');
                    self.pos += ch.len_utf8();
                }
            }
        }
        let pattern = self.src[pattern_start..self.pos].to_string();
        self.pos += 1; // closing slash
        let flags_start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphabetic() {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(TokenKind::Regex {
            pattern,
            flags: self.src[flags_start..self.pos].to_string(),
        })
    }

    fn lex_punct(&mut self) -> Result<TokenKind, ParseError> {
        let rest = &self.src[self.pos..];
        for p in PUNCTUATORS {
            if rest.starts_with(p) {
                // `?.` followed by a digit is `?` then `.5` (conditional).
                if *p == "?."
                    && rest.as_bytes().get(2).is_some_and(|c| c.is_ascii_digit())
                {
                    continue;
                }
                self.pos += p.len();
                return Ok(TokenKind::Punct(p));
            }
        }
        Err(self.err(
            format!(
                "Unexpected character '{}'",
                rest.chars().next().unwrap_or('\u{0}')
            ),
            self.pos,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_idents_numbers_and_puncts() {
        let tokens = kinds("const x = 40 + 2;");
        assert_eq!(tokens[0], TokenKind::Ident("const".into()));
        assert_eq!(tokens[1], TokenKind::Ident("x".into()));
        assert_eq!(tokens[2], TokenKind::Punct("="));
        assert_eq!(tokens[3], TokenKind::Num(40.0));
        assert_eq!(tokens[4], TokenKind::Punct("+"));
        assert_eq!(tokens[5], TokenKind::Num(2.0));
    }

    #[test]
    fn distinguishes_regex_from_division() {
        let tokens = kinds("a / b");
        assert!(matches!(tokens[1], TokenKind::Punct("/")));

        let tokens = kinds("x = /ab+c/gi");
        assert!(matches!(
            &tokens[2],
            TokenKind::Regex { pattern, flags } if pattern == "ab+c" && flags == "gi"
        ));
    }

    #[test]
    fn lexes_templates_with_holes() {
        let tokens = kinds("`a ${1 + 2} b`");
        match &tokens[0] {
            TokenKind::Template(t) => {
                assert_eq!(t.quasis, vec!["a ".to_string(), " b".to_string()]);
                assert_eq!(t.expr_spans.len(), 1);
            }
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn tracks_newlines_for_asi() {
        let tokens = Lexer::new("a\nb").tokenize().unwrap();
        assert!(!tokens[0].newline_before);
        assert!(tokens[1].newline_before);
    }

    #[test]
    fn lexes_numeric_variants() {
        assert_eq!(kinds("0xFF")[0], TokenKind::Num(255.0));
        assert_eq!(kinds("0b101")[0], TokenKind::Num(5.0));
        assert_eq!(kinds("1_000")[0], TokenKind::Num(1000.0));
        assert_eq!(kinds("1e3")[0], TokenKind::Num(1000.0));
        assert_eq!(kinds(".5")[0], TokenKind::Num(0.5));
        assert_eq!(kinds("42n")[0], TokenKind::BigInt("42".into()));
    }

    #[test]
    fn string_escapes_are_cooked() {
        assert_eq!(
            kinds(r#"'a\nbA'"#)[0],
            TokenKind::Str("a\nbA".into())
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(Lexer::new("'abc").tokenize().is_err());
    }
}
