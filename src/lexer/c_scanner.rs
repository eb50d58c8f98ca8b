use super::token::{IntSuffix, Token, TokenKind};
use crate::error::{Error, Result};
use crate::parser::Location;

/// Scanner for the restricted C dialect
///
/// Comments are dropped. A `#` that opens a line captures the whole
/// preprocessor line (continuations included) as one [`TokenKind::Directive`].
pub struct CScanner {
    /// Source code as character vector
    source: Vec<char>,
    /// Accumulated tokens
    tokens: Vec<Token>,
    /// Start position of current token
    start: usize,
    /// Current position in source
    current: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// Current column number (1-indexed)
    column: usize,
    /// Line of the current token start
    start_line: usize,
    /// Column of the current token start
    start_column: usize,
    /// Only whitespace seen since the last newline
    at_line_start: bool,
}

impl CScanner {
    /// Creates a new scanner from source code
    pub fn new(source: &str) -> Self {
        CScanner {
            source: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            start_line: 1,
            start_column: 1,
            at_line_start: true,
        }
    }

    /// Scans all tokens from source code and returns them as a vector
    pub fn scan_tokens(&mut self) -> Result<Vec<Token>> {
        while !self.is_at_end() {
            self.start = self.current;
            self.start_line = self.line;
            self.start_column = self.column;
            self.scan_token()?;
        }

        self.tokens.push(Token::new(
            TokenKind::Eof,
            String::new(),
            self.line,
            self.column,
        ));

        tracing::debug!(count = self.tokens.len(), "scanned tokens");
        Ok(std::mem::take(&mut self.tokens))
    }

    fn scan_token(&mut self) -> Result<()> {
        let c = self.advance();

        match c {
            '\n' => {
                self.newline();
                return Ok(());
            }
            ' ' | '\r' | '\t' | '\x0c' | '\x0b' => return Ok(()),
            '\\' if self.peek() == '\n' || (self.peek() == '\r' && self.peek_next() == '\n') => {
                // stray line continuation outside a directive
                if self.peek() == '\r' {
                    self.advance();
                }
                self.advance();
                self.newline();
                return Ok(());
            }
            '#' if self.at_line_start => {
                self.scan_directive();
                return Ok(());
            }
            '/' if self.peek() == '/' => {
                self.skip_line_comment();
                return Ok(());
            }
            '/' if self.peek() == '*' => {
                self.advance();
                return self.skip_block_comment();
            }
            _ => {}
        }

        self.at_line_start = false;

        match c {
            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),
            '{' => self.add_token(TokenKind::LeftBrace),
            '}' => self.add_token(TokenKind::RightBrace),
            '[' => self.add_token(TokenKind::LeftBracket),
            ']' => self.add_token(TokenKind::RightBracket),
            ',' => self.add_token(TokenKind::Comma),
            ';' => self.add_token(TokenKind::Semicolon),
            '?' => self.add_token(TokenKind::Question),
            ':' => self.add_token(TokenKind::Colon),
            '~' => self.add_token(TokenKind::Tilde),

            '+' => {
                let kind = if self.match_char('+') {
                    TokenKind::PlusPlus
                } else if self.match_char('=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                };
                self.add_token(kind);
            }
            '-' => {
                let kind = if self.match_char('-') {
                    TokenKind::MinusMinus
                } else if self.match_char('=') {
                    TokenKind::MinusAssign
                } else if self.match_char('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                };
                self.add_token(kind);
            }
            '*' => self.add_with_assign(TokenKind::Star, TokenKind::StarAssign),
            '/' => self.add_with_assign(TokenKind::Slash, TokenKind::SlashAssign),
            '%' => self.add_with_assign(TokenKind::Percent, TokenKind::PercentAssign),
            '^' => self.add_with_assign(TokenKind::Caret, TokenKind::CaretAssign),
            '=' => self.add_with_assign(TokenKind::Assign, TokenKind::EqEq),
            '!' => self.add_with_assign(TokenKind::Bang, TokenKind::NotEq),
            '&' => {
                let kind = if self.match_char('&') {
                    TokenKind::AmpAmp
                } else if self.match_char('=') {
                    TokenKind::AmpAssign
                } else {
                    TokenKind::Amp
                };
                self.add_token(kind);
            }
            '|' => {
                let kind = if self.match_char('|') {
                    TokenKind::PipePipe
                } else if self.match_char('=') {
                    TokenKind::PipeAssign
                } else {
                    TokenKind::Pipe
                };
                self.add_token(kind);
            }
            '<' => {
                let kind = if self.match_char('<') {
                    if self.match_char('=') {
                        TokenKind::ShlAssign
                    } else {
                        TokenKind::Shl
                    }
                } else if self.match_char('=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                };
                self.add_token(kind);
            }
            '>' => {
                let kind = if self.match_char('>') {
                    if self.match_char('=') {
                        TokenKind::ShrAssign
                    } else {
                        TokenKind::Shr
                    }
                } else if self.match_char('=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                };
                self.add_token(kind);
            }
            '.' => {
                if self.peek().is_ascii_digit() {
                    return Err(self.error("floating-point literals are not supported"));
                }
                if self.peek() == '.' && self.peek_next() == '.' {
                    self.advance();
                    self.advance();
                    self.add_token(TokenKind::Ellipsis);
                } else {
                    self.add_token(TokenKind::Dot);
                }
            }

            '"' => self.scan_string()?,
            '\'' => self.scan_char()?,

            c if c.is_ascii_digit() => self.scan_number()?,
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => self.scan_identifier(),

            _ => {
                return Err(self.error(format!("unexpected character '{}'", c.escape_default())));
            }
        }

        Ok(())
    }

    fn newline(&mut self) {
        self.line += 1;
        self.column = 1;
        self.at_line_start = true;
    }

    fn skip_line_comment(&mut self) {
        while !self.is_at_end() && self.peek() != '\n' {
            self.advance();
        }
    }

    fn skip_block_comment(&mut self) -> Result<()> {
        loop {
            if self.is_at_end() {
                return Err(self.error("unterminated block comment"));
            }
            let c = self.advance();
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else if c == '*' && self.peek() == '/' {
                self.advance();
                return Ok(());
            }
        }
    }

    /// Capture a preprocessor line verbatim, joining `\` continuations
    fn scan_directive(&mut self) {
        let mut text = String::new();
        let mut in_string = false;
        while !self.is_at_end() {
            let c = self.peek();
            if c == '\n' {
                break;
            }
            if c == '\\' && (self.peek_next() == '\n' || self.peek_next() == '\r') {
                self.advance();
                if self.peek() == '\r' {
                    self.advance();
                }
                if self.peek() == '\n' {
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                }
                text.push(' ');
                continue;
            }
            if c == '"' {
                in_string = !in_string;
            }
            if !in_string && c == '/' && self.peek_next() == '/' {
                self.skip_line_comment();
                break;
            }
            if !in_string && c == '/' && self.peek_next() == '*' {
                self.advance();
                self.advance();
                while !self.is_at_end() && !(self.peek() == '*' && self.peek_next() == '/') {
                    if self.advance() == '\n' {
                        self.line += 1;
                        self.column = 1;
                    }
                }
                if !self.is_at_end() {
                    self.advance();
                    self.advance();
                }
                text.push(' ');
                continue;
            }
            text.push(self.advance());
        }
        let text = text.trim().to_string();
        self.add_token(TokenKind::Directive(text));
        self.at_line_start = false;
    }

    fn scan_escape(&mut self) -> Result<u8> {
        if self.is_at_end() {
            return Err(self.error("unterminated escape sequence"));
        }
        let escaped = self.advance();
        let value = match escaped {
            'n' => b'\n',
            't' => b'\t',
            'r' => b'\r',
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0c,
            'v' => 0x0b,
            '\\' => b'\\',
            '\'' => b'\'',
            '"' => b'"',
            '?' => b'?',
            'x' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while let Some(d) = self.peek().to_digit(16) {
                    self.advance();
                    value = (value << 4) | d;
                    digits += 1;
                    if digits > 2 {
                        return Err(self.error("hex escape sequence out of range"));
                    }
                }
                if digits == 0 {
                    return Err(self.error("\\x used with no following hex digits"));
                }
                value as u8
            }
            '0'..='7' => {
                let mut value = escaped.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match self.peek().to_digit(8) {
                        Some(d) => {
                            self.advance();
                            value = (value << 3) | d;
                        }
                        None => break,
                    }
                }
                if value > 0xff {
                    return Err(self.error("octal escape sequence out of range"));
                }
                value as u8
            }
            other => {
                return Err(self.error(format!(
                    "invalid escape sequence \\{}",
                    other.escape_default()
                )));
            }
        };
        Ok(value)
    }

    fn scan_string(&mut self) -> Result<()> {
        let mut bytes = Vec::new();

        while !self.is_at_end() && self.peek() != '"' {
            match self.peek() {
                '\n' => return Err(self.error("unterminated string literal")),
                '\\' => {
                    self.advance();
                    let b = self.scan_escape()?;
                    bytes.push(b);
                }
                _ => {
                    let c = self.advance();
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }

        if self.is_at_end() {
            return Err(self.error("unterminated string literal"));
        }

        self.advance(); // Closing "

        let value = String::from_utf8_lossy(&bytes).into_owned();
        self.add_token(TokenKind::String(value));
        Ok(())
    }

    fn scan_char(&mut self) -> Result<()> {
        if self.is_at_end() || self.peek() == '\n' {
            return Err(self.error("unterminated character literal"));
        }
        let value = match self.advance() {
            '\\' => self.scan_escape()?,
            '\'' => return Err(self.error("empty character literal")),
            c if c.is_ascii() => c as u8,
            c => {
                return Err(self.error(format!(
                    "character literal '{}' does not fit in a byte",
                    c
                )))
            }
        };
        if !self.match_char('\'') {
            return Err(self.error("unterminated character literal"));
        }
        self.add_token(TokenKind::Char(value));
        Ok(())
    }

    fn scan_number(&mut self) -> Result<()> {
        let first = self.source[self.start];
        let (radix, non_decimal) = if first == '0' && matches!(self.peek(), 'x' | 'X') {
            self.advance();
            (16, true)
        } else if first == '0' && matches!(self.peek(), 'b' | 'B') {
            self.advance();
            (2, true)
        } else if first == '0' && self.peek().is_ascii_digit() {
            (8, true)
        } else {
            (10, false)
        };

        let digits_start = if radix == 16 || radix == 2 {
            self.current
        } else {
            self.start
        };
        while self.peek().is_ascii_alphanumeric() && !matches!(self.peek(), 'u' | 'U' | 'l' | 'L')
        {
            if self.peek().is_digit(radix) {
                self.advance();
            } else if radix == 10 && matches!(self.peek(), 'e' | 'E') {
                return Err(self.error("floating-point literals are not supported"));
            } else {
                self.advance();
                return Err(self.error("invalid digit in integer literal"));
            }
        }
        if self.peek() == '.' && radix != 16 {
            return Err(self.error("floating-point literals are not supported"));
        }

        let digits: String = self.source[digits_start..self.current].iter().collect();
        if digits.is_empty() {
            return Err(self.error("integer literal has no digits"));
        }

        let mut suffix = IntSuffix::default();
        loop {
            match self.peek() {
                'u' | 'U' if !suffix.unsigned => {
                    self.advance();
                    suffix.unsigned = true;
                }
                'l' | 'L' if !suffix.long => {
                    let l = self.advance();
                    self.match_char(l);
                    suffix.long = true;
                }
                _ => break,
            }
        }
        if self.peek().is_ascii_alphanumeric() || self.peek() == '_' {
            self.advance();
            return Err(self.error("invalid suffix on integer literal"));
        }

        let value = u64::from_str_radix(&digits, radix)
            .map_err(|_| self.error("integer literal is too large"))?;

        self.add_token(TokenKind::Integer {
            value,
            suffix,
            non_decimal,
        });
        Ok(())
    }

    fn scan_identifier(&mut self) {
        while self.peek().is_ascii_alphanumeric() || self.peek() == '_' || self.peek() == '$' {
            self.advance();
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        let kind = TokenKind::keyword(&text).unwrap_or(TokenKind::Identifier(text));
        self.add_token(kind);
    }

    fn error(&self, message: impl Into<String>) -> Error {
        let end = self.current.min(self.source.len());
        let lexeme: String = self.source[self.start..end].iter().collect();
        Error::syntax(
            Location::new(self.start_line, self.start_column),
            lexeme,
            message,
        )
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            self.column += 1;
            true
        }
    }

    fn add_with_assign(&mut self, plain: TokenKind, with_eq: TokenKind) {
        let kind = if self.match_char('=') { with_eq } else { plain };
        self.add_token(kind);
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.source[self.start..self.current].iter().collect();
        self.tokens.push(Token::new(
            kind,
            lexeme,
            self.start_line,
            self.start_column,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        CScanner::new(source)
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_simple_statement() {
        let tokens = kinds("x += 1;");
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[0], TokenKind::Identifier("x".to_string()));
        assert_eq!(tokens[1], TokenKind::PlusAssign);
        assert!(matches!(tokens[2], TokenKind::Integer { value: 1, .. }));
        assert_eq!(tokens[3], TokenKind::Semicolon);
        assert_eq!(tokens[4], TokenKind::Eof);
    }

    #[test]
    fn test_directive_with_continuation() {
        let tokens = kinds("#define FOO \\\n  (1 << 3)\nint x;");
        assert_eq!(tokens[0], TokenKind::Directive("define FOO    (1 << 3)".to_string()));
        assert_eq!(tokens[1], TokenKind::Int);
    }

    #[test]
    fn test_hash_mid_line_is_error() {
        assert!(CScanner::new("int x = #3;").scan_tokens().is_err());
    }

    #[test]
    fn test_comments_skipped() {
        let tokens = kinds("// line\n/* block\n comment */ return;");
        assert_eq!(tokens[0], TokenKind::Return);
        assert_eq!(tokens[1], TokenKind::Semicolon);
    }

    #[test]
    fn test_locations_point_at_token_start() {
        let tokens = CScanner::new("int\n  foo;").scan_tokens().unwrap();
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn test_integer_forms() {
        let tokens = kinds("0x1F 010 0b101 42ULL");
        let values: Vec<u64> = tokens
            .iter()
            .filter_map(|t| match t {
                TokenKind::Integer { value, .. } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![31, 8, 5, 42]);
        assert!(matches!(
            tokens[3],
            TokenKind::Integer {
                suffix: IntSuffix {
                    unsigned: true,
                    long: true
                },
                ..
            }
        ));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = kinds(r#""%d\n" 'a' '\0'"#);
        assert_eq!(tokens[0], TokenKind::String("%d\n".to_string()));
        assert_eq!(tokens[1], TokenKind::Char(b'a'));
        assert_eq!(tokens[2], TokenKind::Char(0));
    }

    #[test]
    fn test_unterminated_string_is_syntax_error() {
        let err = CScanner::new("char *s = \"oops;\n").scan_tokens().unwrap_err();
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn test_unterminated_block_comment() {
        assert!(CScanner::new("/* never closed").scan_tokens().is_err());
    }

    #[test]
    fn test_float_rejected() {
        let err = CScanner::new("x = 1.5;").scan_tokens().unwrap_err();
        assert!(err.to_string().contains("floating-point"));
    }

    #[test]
    fn test_integer_overflow_rejected() {
        assert!(CScanner::new("0x1ffffffffffffffff").scan_tokens().is_err());
    }

    #[test]
    fn test_ellipsis_and_arrow() {
        let tokens = kinds("a->b ...");
        assert_eq!(tokens[1], TokenKind::Arrow);
        assert_eq!(tokens[3], TokenKind::Ellipsis);
    }
}
