use crate::parser::Location;
use serde::{Deserialize, Serialize};

/// A single token from the source code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// The type of token
    pub kind: TokenKind,
    /// Original text of the token
    pub lexeme: String,
    /// Line number where token appears (1-indexed)
    pub line: usize,
    /// Column number where token starts (1-indexed)
    pub column: usize,
}

impl Token {
    /// Creates a new token with the given properties
    pub fn new(kind: TokenKind, lexeme: String, line: usize, column: usize) -> Self {
        Token {
            kind,
            lexeme,
            line,
            column,
        }
    }

    /// Source location of the token start
    pub fn location(&self) -> Location {
        Location::new(self.line, self.column)
    }
}

/// Integer literal suffix flags (`u`, `l`, `ll` in any combination)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntSuffix {
    /// `u`/`U` present
    pub unsigned: bool,
    /// `l`/`L` or `ll`/`LL` present
    pub long: bool,
}

/// All possible token types in the C dialect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenKind {
    // Literals
    /// Integer literal (decimal, hex, octal or binary)
    Integer {
        /// Literal value
        value: u64,
        /// Suffix flags
        suffix: IntSuffix,
        /// Literal was written in hex, octal or binary
        non_decimal: bool,
    },
    /// Character literal, already unescaped
    Char(u8),
    /// String literal, already unescaped
    String(String),

    /// Identifier (including typedef names and macro-call names such as `SEC`)
    Identifier(String),

    /// Preprocessor line, kept as opaque text (without the leading `#`)
    Directive(String),

    // Keywords
    /// `struct`
    Struct,
    /// `union`
    Union,
    /// `enum`
    Enum,
    /// `typedef`
    Typedef,
    /// `if`
    If,
    /// `else`
    Else,
    /// `for`
    For,
    /// `while`
    While,
    /// `do`
    Do,
    /// `return`
    Return,
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `switch` (recognized so it can be rejected precisely)
    Switch,
    /// `goto` (recognized so it can be rejected precisely)
    Goto,
    /// `sizeof`
    Sizeof,
    /// `const`
    Const,
    /// `volatile`
    Volatile,
    /// `static`
    Static,
    /// `extern`
    Extern,
    /// `inline`
    Inline,
    /// `register`
    Register,
    /// `void`
    Void,
    /// `char`
    CharKw,
    /// `short`
    Short,
    /// `int`
    Int,
    /// `long`
    Long,
    /// `signed`
    Signed,
    /// `unsigned`
    Unsigned,
    /// `_Bool`
    Bool,

    // Operators
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `++`
    PlusPlus,
    /// `--`
    MinusMinus,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `&`
    Amp,
    /// `|`
    Pipe,
    /// `^`
    Caret,
    /// `~`
    Tilde,
    /// `!`
    Bang,
    /// `&&`
    AmpAmp,
    /// `||`
    PipePipe,
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    LtEq,
    /// `>=`
    GtEq,
    /// `=`
    Assign,
    /// `+=`
    PlusAssign,
    /// `-=`
    MinusAssign,
    /// `*=`
    StarAssign,
    /// `/=`
    SlashAssign,
    /// `%=`
    PercentAssign,
    /// `<<=`
    ShlAssign,
    /// `>>=`
    ShrAssign,
    /// `&=`
    AmpAssign,
    /// `|=`
    PipeAssign,
    /// `^=`
    CaretAssign,
    /// `?`
    Question,
    /// `:`
    Colon,
    /// `->`
    Arrow,
    /// `.`
    Dot,
    /// `...`
    Ellipsis,

    // Delimiters
    /// Left parenthesis (
    LeftParen,
    /// Right parenthesis )
    RightParen,
    /// Left brace {
    LeftBrace,
    /// Right brace }
    RightBrace,
    /// Left bracket [
    LeftBracket,
    /// Right bracket ]
    RightBracket,
    /// Comma delimiter
    Comma,
    /// Semicolon delimiter
    Semicolon,

    // Special
    /// End of file marker
    Eof,
}

impl TokenKind {
    /// Check if token is a keyword
    pub fn is_keyword(&self) -> bool {
        matches!(
            self,
            TokenKind::Struct
                | TokenKind::Union
                | TokenKind::Enum
                | TokenKind::Typedef
                | TokenKind::If
                | TokenKind::Else
                | TokenKind::For
                | TokenKind::While
                | TokenKind::Do
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Switch
                | TokenKind::Goto
                | TokenKind::Sizeof
                | TokenKind::Const
                | TokenKind::Volatile
                | TokenKind::Static
                | TokenKind::Extern
                | TokenKind::Inline
                | TokenKind::Register
                | TokenKind::Void
                | TokenKind::CharKw
                | TokenKind::Short
                | TokenKind::Int
                | TokenKind::Long
                | TokenKind::Signed
                | TokenKind::Unsigned
                | TokenKind::Bool
        )
    }

    /// Get keyword from string
    pub fn keyword(s: &str) -> Option<TokenKind> {
        let kind = match s {
            "struct" => TokenKind::Struct,
            "union" => TokenKind::Union,
            "enum" => TokenKind::Enum,
            "typedef" => TokenKind::Typedef,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "while" => TokenKind::While,
            "do" => TokenKind::Do,
            "return" => TokenKind::Return,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "switch" => TokenKind::Switch,
            "goto" => TokenKind::Goto,
            "sizeof" => TokenKind::Sizeof,
            "const" => TokenKind::Const,
            "volatile" => TokenKind::Volatile,
            "static" => TokenKind::Static,
            "extern" => TokenKind::Extern,
            "inline" | "__inline" | "__inline__" => TokenKind::Inline,
            "register" => TokenKind::Register,
            "void" => TokenKind::Void,
            "char" => TokenKind::CharKw,
            "short" => TokenKind::Short,
            "int" => TokenKind::Int,
            "long" => TokenKind::Long,
            "signed" => TokenKind::Signed,
            "unsigned" => TokenKind::Unsigned,
            "_Bool" => TokenKind::Bool,
            _ => return None,
        };
        Some(kind)
    }

    /// Keywords that can start a declaration
    pub fn starts_declaration(&self) -> bool {
        matches!(
            self,
            TokenKind::Struct
                | TokenKind::Union
                | TokenKind::Enum
                | TokenKind::Const
                | TokenKind::Volatile
                | TokenKind::Static
                | TokenKind::Extern
                | TokenKind::Inline
                | TokenKind::Register
                | TokenKind::Void
                | TokenKind::CharKw
                | TokenKind::Short
                | TokenKind::Int
                | TokenKind::Long
                | TokenKind::Signed
                | TokenKind::Unsigned
                | TokenKind::Bool
        )
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TokenKind::Integer { value, .. } => write!(f, "{}", value),
            TokenKind::Char(c) => write!(f, "'{}'", (*c as char).escape_default()),
            TokenKind::String(s) => write!(f, "\"{}\"", s.escape_default()),
            TokenKind::Identifier(id) => write!(f, "{}", id),
            TokenKind::Directive(text) => write!(f, "#{}", text),
            TokenKind::Eof => write!(f, "end of file"),
            _ => write!(f, "{:?}", self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_detection() {
        assert_eq!(TokenKind::keyword("if"), Some(TokenKind::If));
        assert_eq!(TokenKind::keyword("__inline"), Some(TokenKind::Inline));
        assert_eq!(TokenKind::keyword("SEC"), None);
        assert_eq!(TokenKind::keyword("u64"), None);
    }

    #[test]
    fn test_is_keyword() {
        assert!(TokenKind::While.is_keyword());
        assert!(TokenKind::Unsigned.is_keyword());
        assert!(!TokenKind::Identifier("bpf_printk".to_string()).is_keyword());
        assert!(!TokenKind::Semicolon.is_keyword());
    }
}
