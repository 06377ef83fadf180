//! On-demand lexer over a byte buffer.
//!
//! The lexer produces one token per call to [`Lexer::next_token`], tracking
//! line and column positions for diagnostics. Whitespace and comments
//! (`// ...` to end of line, `/* ... */` blocks) are skipped; newlines carry
//! no significance of their own. Malformed input is reported as a
//! [`TokenKind::Error`] token rather than by failing, so the compiler can
//! turn it into a diagnostic and keep going.

use crate::{
    error::DiagnosticKind,
    token::{Token, TokenKind},
};

pub(crate) struct Lexer<'src> {
    src: &'src [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'src> Lexer<'src> {
    pub(crate) fn new(source: &'src str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Scans and returns the next token. Returns `TokenKind::Eof` forever
    /// once the input is exhausted.
    pub(crate) fn next_token(&mut self) -> Token {
        let trivia = self.skip_trivia();

        let line = self.line;
        let column = self.column;
        let make = |kind| Token::new(kind, line, column);

        if let Err(error) = trivia {
            return make(error);
        }

        let Some(byte) = self.peek() else {
            return make(TokenKind::Eof);
        };

        match byte {
            b'(' => self.single(make, TokenKind::LParen),
            b')' => self.single(make, TokenKind::RParen),
            b'[' => self.single(make, TokenKind::LBracket),
            b']' => self.single(make, TokenKind::RBracket),
            b'{' => self.single(make, TokenKind::LBrace),
            b'}' => self.single(make, TokenKind::RBrace),
            b',' => self.single(make, TokenKind::Comma),
            b':' => self.single(make, TokenKind::Colon),
            b'+' => self.single(make, TokenKind::Plus),
            b'*' => self.single(make, TokenKind::Star),
            b'%' => self.single(make, TokenKind::Percent),
            b'/' => self.single(make, TokenKind::Slash),
            b'-' => {
                self.bump();
                if self.eat(b'>') {
                    make(TokenKind::Arrow)
                } else {
                    make(TokenKind::Minus)
                }
            }
            b'.' => {
                self.bump();
                if self.eat(b'.') {
                    make(TokenKind::DotDot)
                } else {
                    make(TokenKind::Dot)
                }
            }
            b'=' => {
                self.bump();
                if self.eat(b'=') {
                    make(TokenKind::EqEq)
                } else {
                    make(TokenKind::Eq)
                }
            }
            b'!' => {
                self.bump();
                if self.eat(b'=') {
                    make(TokenKind::BangEq)
                } else {
                    make(TokenKind::Error(DiagnosticKind::UnexpectedToken, "unexpected character '!'".into()))
                }
            }
            b'<' => {
                self.bump();
                if self.eat(b'=') {
                    make(TokenKind::LessEq)
                } else {
                    make(TokenKind::Less)
                }
            }
            b'>' => {
                self.bump();
                if self.eat(b'=') {
                    make(TokenKind::GreaterEq)
                } else {
                    make(TokenKind::Greater)
                }
            }
            b'"' | b'\'' => make(self.string(byte)),
            b'0'..=b'9' => make(self.number()),
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => make(self.identifier()),
            other => {
                self.bump();
                if other.is_ascii() {
                    make(TokenKind::Error(
                        DiagnosticKind::UnexpectedToken,
                        format!("unexpected character '{}'", other as char).into(),
                    ))
                } else {
                    // Skip the remaining continuation bytes of the UTF-8
                    // sequence so the next token starts on a char boundary.
                    while self.peek().is_some_and(|b| b & 0xC0 == 0x80) {
                        self.bump();
                    }
                    make(TokenKind::Error(
                        DiagnosticKind::UnexpectedToken,
                        "unexpected non-ASCII character".into(),
                    ))
                }
            }
        }
    }

    fn single(&mut self, make: impl FnOnce(TokenKind) -> Token, kind: TokenKind) -> Token {
        self.bump();
        make(kind)
    }

    /// Skips whitespace and both comment forms.
    ///
    /// An unterminated block comment is returned as an error so the compiler
    /// can report it at the comment's position instead of a bare EOF.
    fn skip_trivia(&mut self) -> Result<(), TokenKind> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while self.peek().is_some_and(|b| b != b'\n') {
                        self.bump();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => {
                                return Err(TokenKind::Error(
                                    DiagnosticKind::UnterminatedComment,
                                    "unterminated block comment".into(),
                                ));
                            }
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            _ => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Scans a string literal. The opening quote has not been consumed yet.
    ///
    /// Supports `\n \r \t \\ \" \' \0` and `\xHH` escapes. Both quote styles
    /// are accepted; a literal must close with the quote it opened with.
    fn string(&mut self, quote: u8) -> TokenKind {
        self.bump();
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    return TokenKind::Error(
                        DiagnosticKind::UnterminatedString,
                        "unterminated string literal".into(),
                    );
                }
                Some(b) if b == quote => {
                    self.bump();
                    return TokenKind::Str(text.into());
                }
                Some(b'\\') => {
                    self.bump();
                    let Some(escape) = self.peek() else {
                        return TokenKind::Error(
                            DiagnosticKind::UnterminatedString,
                            "unterminated string literal".into(),
                        );
                    };
                    self.bump();
                    match escape {
                        b'n' => text.push('\n'),
                        b'r' => text.push('\r'),
                        b't' => text.push('\t'),
                        b'0' => text.push('\0'),
                        b'\\' => text.push('\\'),
                        b'"' => text.push('"'),
                        b'\'' => text.push('\''),
                        b'x' => {
                            let hi = self.peek().and_then(hex_digit);
                            if hi.is_some() {
                                self.bump();
                            }
                            let lo = self.peek().and_then(hex_digit);
                            if lo.is_some() {
                                self.bump();
                            }
                            match (hi, lo) {
                                (Some(hi), Some(lo)) => {
                                    let byte = hi * 16 + lo;
                                    if byte.is_ascii() {
                                        text.push(byte as char);
                                    } else {
                                        return TokenKind::Error(
                                            DiagnosticKind::InvalidEscape,
                                            "\\x escape must be an ASCII byte (00-7F)".into(),
                                        );
                                    }
                                }
                                _ => {
                                    return TokenKind::Error(
                                        DiagnosticKind::InvalidEscape,
                                        "\\x escape requires two hex digits".into(),
                                    );
                                }
                            }
                        }
                        other => {
                            return TokenKind::Error(
                                DiagnosticKind::InvalidEscape,
                                format!("invalid escape sequence '\\{}'", other as char).into(),
                            );
                        }
                    }
                }
                Some(_) => {
                    // Copy the whole UTF-8 sequence through unchanged.
                    let start = self.pos;
                    self.bump();
                    while self.peek().is_some_and(|b| b & 0xC0 == 0x80) {
                        self.bump();
                    }
                    // Safe slicing: start and pos are both char boundaries.
                    text.push_str(std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("\u{fffd}"));
                }
            }
        }
    }

    /// Scans an integer or float literal.
    ///
    /// Integers: decimal, `0x` hex, `0b` binary. Floats: decimal digits with
    /// a fractional part and/or an `e`/`E` exponent. A `.` is only treated as
    /// a decimal point when followed by a digit, so `1..10` lexes as
    /// `1` `..` `10` and `xs.len` style member access is unaffected.
    fn number(&mut self) -> TokenKind {
        if self.peek() == Some(b'0') {
            match self.peek_at(1) {
                Some(b'x' | b'X') => return self.radix_literal(16, "hex"),
                Some(b'b' | b'B') => return self.radix_literal(2, "binary"),
                _ => {}
            }
        }

        let start = self.pos;
        let mut is_float = false;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.bump();
            }
        }
        if let Some(b'e' | b'E') = self.peek() {
            let mut lookahead = 1;
            if let Some(b'+' | b'-') = self.peek_at(1) {
                lookahead = 2;
            }
            if self.peek_at(lookahead).is_some_and(|b| b.is_ascii_digit()) {
                is_float = true;
                for _ in 0..=lookahead {
                    self.bump();
                }
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.bump();
                }
            }
        }

        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("ASCII digits");
        if is_float {
            match text.parse::<f64>() {
                Ok(value) => TokenKind::Float(value),
                Err(_) => TokenKind::Error(
                    DiagnosticKind::InvalidNumber,
                    format!("invalid float literal '{text}'").into(),
                ),
            }
        } else {
            match text.parse::<i64>() {
                Ok(value) => TokenKind::Int(value),
                Err(_) => TokenKind::Error(
                    DiagnosticKind::InvalidNumber,
                    format!("integer literal '{text}' out of range").into(),
                ),
            }
        }
    }

    /// Scans a `0x`/`0b` prefixed integer literal; the prefix is still unread.
    fn radix_literal(&mut self, radix: u32, what: &str) -> TokenKind {
        let start = self.pos;
        self.bump(); // 0
        self.bump(); // x / b
        let digits_start = self.pos;
        while self
            .peek()
            .is_some_and(|b| (b as char).is_digit(radix) || b == b'_')
        {
            self.bump();
        }
        if self.pos == digits_start {
            return TokenKind::Error(
                DiagnosticKind::InvalidNumber,
                format!("missing digits in {what} literal").into(),
            );
        }
        let text = std::str::from_utf8(&self.src[digits_start..self.pos]).expect("ASCII digits");
        let digits: String = text.chars().filter(|&c| c != '_').collect();
        match i64::from_str_radix(&digits, radix) {
            Ok(value) => TokenKind::Int(value),
            Err(_) => {
                let full = std::str::from_utf8(&self.src[start..self.pos]).expect("ASCII digits");
                TokenKind::Error(
                    DiagnosticKind::InvalidNumber,
                    format!("integer literal '{full}' out of range").into(),
                )
            }
        }
    }

    fn identifier(&mut self) -> TokenKind {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b == b'_' || b.is_ascii_alphanumeric())
        {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("ASCII identifier");
        TokenKind::keyword(text).unwrap_or_else(|| TokenKind::Ident(text.into()))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    /// Consumes the next byte if it matches.
    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) {
        if let Some(byte) = self.peek() {
            self.pos += 1;
            if byte == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::Eof;
            out.push(token.kind);
            if done {
                return out;
            }
        }
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("let x fn forage for"),
            vec![
                TokenKind::Let,
                TokenKind::Ident("x".into()),
                TokenKind::Fn,
                TokenKind::Ident("forage".into()),
                TokenKind::For,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(
            kinds("0 42 0xFF 0b1010 2.5 1e3 1.5e-2"),
            vec![
                TokenKind::Int(0),
                TokenKind::Int(42),
                TokenKind::Int(255),
                TokenKind::Int(10),
                TokenKind::Float(2.5),
                TokenKind::Float(1000.0),
                TokenKind::Float(0.015),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn range_is_not_a_decimal_point() {
        assert_eq!(
            kinds("1..10"),
            vec![TokenKind::Int(1), TokenKind::DotDot, TokenKind::Int(10), TokenKind::Eof]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#""a\n\t\x41""#),
            vec![TokenKind::Str("a\n\tA".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn single_quoted_strings() {
        assert_eq!(
            kinds(r"'it\'s'"),
            vec![TokenKind::Str("it's".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let first = &kinds("\"abc")[0];
        assert!(matches!(
            first,
            TokenKind::Error(DiagnosticKind::UnterminatedString, msg) if msg.contains("unterminated")
        ));
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("1 // line\n/* block\nstill */ 2"),
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            kinds("== != <= >= -> .. = < >"),
            vec![
                TokenKind::EqEq,
                TokenKind::BangEq,
                TokenKind::LessEq,
                TokenKind::GreaterEq,
                TokenKind::Arrow,
                TokenKind::DotDot,
                TokenKind::Eq,
                TokenKind::Less,
                TokenKind::Greater,
                TokenKind::Eof,
            ]
        );
    }

    /// Re-emitting a token stream with minimal whitespace must produce an
    /// equivalent stream (modulo positions).
    #[test]
    fn roundtrip_through_display() {
        let source = r#"
            fn describe(v)
                match v
                case 0 then return "zero"
                case n if n < 0 then return "neg"
                case _ then return "pos"
                end
            end
            let xs = [1, 2.5, 0xFF]
            for i in 1 to len(xs) do
                print(xs[i - 1] .. 3, describe(-3), {"k": true}.k)
            end
        "#;
        let original = kinds(source);
        let emitted: Vec<String> = original[..original.len() - 1] // drop Eof
            .iter()
            .map(ToString::to_string)
            .collect();
        let reparsed = kinds(&emitted.join(" "));
        assert_eq!(original, reparsed);
    }

    #[test]
    fn positions_track_lines_and_columns() {
        let mut lexer = Lexer::new("let\n  x");
        let first = lexer.next_token();
        assert_eq!((first.line, first.column), (1, 1));
        let second = lexer.next_token();
        assert_eq!((second.line, second.column), (2, 3));
    }
}
