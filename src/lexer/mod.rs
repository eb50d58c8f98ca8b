//! Lexical analysis for the restricted C dialect
//!
//! Converts source text into a stream of tokens. Preprocessor lines survive as
//! opaque directive tokens; everything else is ordinary C tokens.

mod c_scanner;
mod token;

pub use c_scanner::CScanner;
pub use token::{IntSuffix, Token, TokenKind};
