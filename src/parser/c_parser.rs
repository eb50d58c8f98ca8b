use super::ast::{
    AttrValue, BinaryOp, Designator, EntryWrapper, EnumDef, Expr, ExprKind, FieldDecl,
    FunctionDef, FunctionProto, GlobalDecl, InitItem, Initializer, Item, LocalDecl, Location,
    MacroBody, MacroDef, MapAttribute, Param, Precedence, Qualifiers, Section, Stmt, StmtKind,
    StructDef, TranslationUnit, TypeExpr, UnaryOp,
};
use crate::error::{Error, Result};
use crate::lexer::{CScanner, Token, TokenKind};
use std::collections::HashSet;

/// Identifiers that act as declaration qualifiers and carry no type meaning
const INLINE_QUALIFIERS: &[&str] = &[
    "__always_inline",
    "__noinline",
    "__weak",
    "__hidden",
    "__maybe_unused",
    "__unused",
    "__inline",
    "__inline__",
    "__section_unused",
];

/// Deepest nesting the recursive descent accepts before giving up
pub const MAX_NESTING: usize = 128;

/// Base type plus qualifiers of one declaration
struct DeclSpec {
    ty: TypeExpr,
    qualifiers: Qualifiers,
    section: Option<Section>,
}

/// Function part of a declarator
struct FnSuffix {
    params: Vec<Param>,
    variadic: bool,
    wrapper: Option<EntryWrapper>,
}

/// Parsed declarator
struct Declarator {
    name: String,
    ty: TypeExpr,
    loc: Location,
    function: Option<FnSuffix>,
}

/// Recursive-descent parser for the restricted C dialect
pub struct CParser {
    tokens: Vec<Token>,
    current: usize,
    /// Typedef names and `#define` type aliases seen so far
    type_names: HashSet<String>,
    /// Struct and enum definitions met inside another declaration
    pending: Vec<Item>,
    anon_counter: usize,
    /// Current nesting of statements, expressions and initializers
    depth: usize,
}

impl CParser {
    /// Creates a new parser over a token stream ending in `Eof`
    pub fn new(tokens: Vec<Token>) -> Self {
        CParser {
            tokens,
            current: 0,
            type_names: HashSet::new(),
            pending: Vec::new(),
            anon_counter: 0,
            depth: 0,
        }
    }

    /// Parses the tokens into a translation unit
    pub fn parse(&mut self) -> Result<TranslationUnit> {
        if self.tokens.is_empty() {
            self.tokens
                .push(Token::new(TokenKind::Eof, String::new(), 1, 1));
        }

        let mut items = Vec::new();
        while !self.is_at_end() {
            let parsed = self.parse_external()?;
            items.append(&mut self.pending);
            items.extend(parsed);
        }

        tracing::debug!(items = items.len(), "parsed translation unit");
        Ok(TranslationUnit { items })
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    fn parse_external(&mut self) -> Result<Vec<Item>> {
        let tok = self.peek().clone();
        match &tok.kind {
            TokenKind::Directive(text) => {
                self.advance();
                return Ok(vec![self.parse_directive(text, tok.location())]);
            }
            TokenKind::Semicolon => {
                self.advance();
                return Ok(Vec::new());
            }
            TokenKind::Typedef => return self.parse_typedef(),
            TokenKind::RightBrace => {
                return Err(self.syntax_error(
                    "unexpected `}`\n\nHelp: braces are unbalanced, this `}` closes nothing",
                ));
            }
            _ => {}
        }

        let spec = self.parse_decl_specifiers(true)?;
        if self.match_kind(&TokenKind::Semicolon) {
            // bare struct/enum definition, already queued
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        loop {
            let decl = self.parse_declarator(spec.ty.clone(), true)?;
            let trailing = self.parse_section_opt()?;
            self.skip_attributes()?;
            let section = trailing.or_else(|| spec.section.clone());

            match decl.function {
                Some(suffix) => {
                    if self.check(&TokenKind::LeftBrace) {
                        let body = self.parse_block()?;
                        items.push(Item::Function(FunctionDef {
                            name: decl.name,
                            ret: decl.ty,
                            params: suffix.params,
                            body,
                            qualifiers: spec.qualifiers,
                            section,
                            wrapper: suffix.wrapper,
                            loc: decl.loc,
                        }));
                        return Ok(items);
                    }
                    items.push(Item::Prototype(FunctionProto {
                        name: decl.name,
                        ret: decl.ty,
                        params: suffix.params,
                        variadic: suffix.variadic,
                        loc: decl.loc,
                    }));
                }
                None => {
                    let init = if self.match_kind(&TokenKind::Assign) {
                        Some(self.parse_initializer()?)
                    } else {
                        None
                    };
                    items.push(Item::Global(GlobalDecl {
                        name: decl.name,
                        ty: decl.ty,
                        qualifiers: spec.qualifiers,
                        section,
                        init,
                        loc: decl.loc,
                    }));
                }
            }

            if self.match_kind(&TokenKind::Comma) {
                continue;
            }
            self.consume(TokenKind::Semicolon, "`;` after declaration")?;
            return Ok(items);
        }
    }

    fn parse_directive(&mut self, text: &str, loc: Location) -> Item {
        let trimmed = text.trim_start();
        if let Some(rest) = trimmed.strip_prefix("define") {
            if rest.starts_with(char::is_whitespace) {
                if let Some(def) = self.parse_define(rest.trim_start(), loc) {
                    return Item::Define(def);
                }
            }
        }
        Item::Directive {
            text: text.to_string(),
            loc,
        }
    }

    /// Interpret an object-like `#define` body as a type or an expression
    fn parse_define(&mut self, rest: &str, loc: Location) -> Option<MacroDef> {
        let name_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        let after = &rest[name_len..];
        let name = name.to_string();

        if after.starts_with('(') {
            return Some(MacroDef {
                name,
                body: MacroBody::Opaque(after.to_string()),
                loc,
            });
        }

        let body_text = after.trim();
        let body = self
            .parse_macro_body(body_text, loc)
            .unwrap_or_else(|| MacroBody::Opaque(body_text.to_string()));
        if matches!(body, MacroBody::Type(_)) {
            self.type_names.insert(name.clone());
        }
        Some(MacroDef { name, body, loc })
    }

    fn parse_macro_body(&self, body: &str, loc: Location) -> Option<MacroBody> {
        if body.is_empty() {
            return None;
        }
        let mut tokens = CScanner::new(body).scan_tokens().ok()?;
        for token in &mut tokens {
            token.line += loc.line.saturating_sub(1);
        }

        let mut sub = CParser::new(tokens.clone());
        sub.type_names = self.type_names.clone();
        if sub.is_type_start(0) {
            if let Ok(ty) = sub.parse_type_name() {
                if sub.is_at_end() {
                    return Some(MacroBody::Type(ty));
                }
            }
        }

        let mut sub = CParser::new(tokens);
        sub.type_names = self.type_names.clone();
        match sub.parse_expression() {
            Ok(expr) if sub.is_at_end() => Some(MacroBody::Expr(expr)),
            _ => None,
        }
    }

    fn parse_typedef(&mut self) -> Result<Vec<Item>> {
        self.advance();
        let spec = self.parse_decl_specifiers(false)?;
        let mut items = Vec::new();
        loop {
            let decl = self.parse_declarator(spec.ty.clone(), false)?;
            self.skip_attributes()?;
            self.type_names.insert(decl.name.clone());
            items.push(Item::Typedef {
                name: decl.name,
                ty: decl.ty,
                loc: decl.loc,
            });
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Semicolon, "`;` after typedef")?;
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    /// Parse storage, qualifiers, `SEC(...)` and the base type
    fn parse_decl_specifiers(&mut self, top_level: bool) -> Result<DeclSpec> {
        let mut qualifiers = Qualifiers::default();
        let mut section = None;
        let mut base: Option<TypeExpr> = None;

        let mut saw_char = false;
        let mut saw_short = false;
        let mut saw_int = false;
        let mut saw_void = false;
        let mut saw_bool = false;
        let mut long_count = 0u8;
        let mut signedness: Option<bool> = None;

        loop {
            let tok = self.peek().clone();
            let keyword_seen =
                saw_char || saw_short || saw_int || saw_void || saw_bool || long_count > 0;
            match &tok.kind {
                TokenKind::Const => qualifiers.is_const = true,
                TokenKind::Volatile => qualifiers.is_volatile = true,
                TokenKind::Static => qualifiers.is_static = true,
                TokenKind::Extern => qualifiers.is_extern = true,
                TokenKind::Inline => qualifiers.is_inline = true,
                TokenKind::Register => {}
                TokenKind::Void => saw_void = true,
                TokenKind::CharKw => saw_char = true,
                TokenKind::Short => saw_short = true,
                TokenKind::Int => saw_int = true,
                TokenKind::Long => long_count += 1,
                TokenKind::Signed => signedness = Some(true),
                TokenKind::Unsigned => signedness = Some(false),
                TokenKind::Bool => saw_bool = true,
                TokenKind::Struct | TokenKind::Union if base.is_none() && !keyword_seen => {
                    base = Some(self.parse_struct_specifier()?);
                    continue;
                }
                TokenKind::Enum if base.is_none() && !keyword_seen => {
                    base = Some(self.parse_enum_specifier()?);
                    continue;
                }
                TokenKind::Identifier(name) => {
                    if name == "SEC" {
                        section = Some(self.parse_section()?);
                        continue;
                    }
                    if name == "__attribute__" || name == "__attribute" {
                        self.skip_attributes()?;
                        continue;
                    }
                    if INLINE_QUALIFIERS.contains(&name.as_str()) {
                        qualifiers.is_inline = true;
                        self.advance();
                        continue;
                    }
                    if base.is_some() || keyword_seen || signedness.is_some() {
                        break;
                    }
                    if let Some(ty) = TypeExpr::builtin(name) {
                        base = Some(ty);
                    } else if self.type_names.contains(name)
                        || (top_level && EntryWrapper::from_macro(name).is_none())
                        || matches!(self.peek_at(1).kind, TokenKind::Identifier(_))
                    {
                        base = Some(TypeExpr::Named(name.clone()));
                    } else {
                        break;
                    }
                }
                _ => break,
            }
            self.advance();
        }

        let ty = if let Some(ty) = base {
            ty
        } else if saw_void {
            TypeExpr::Void
        } else if saw_bool {
            TypeExpr::Bool
        } else if saw_char {
            TypeExpr::int(8, signedness.unwrap_or(true))
        } else if saw_short {
            TypeExpr::int(16, signedness.unwrap_or(true))
        } else if long_count > 0 {
            TypeExpr::int(64, signedness.unwrap_or(true))
        } else if saw_int || signedness.is_some() {
            TypeExpr::int(32, signedness.unwrap_or(true))
        } else {
            return Err(self.expected_error(
                "a type",
                Some("Declarations start with a type such as `int`, `u64` or `struct name`."),
            ));
        };

        Ok(DeclSpec {
            ty,
            qualifiers,
            section,
        })
    }

    fn parse_struct_specifier(&mut self) -> Result<TypeExpr> {
        let keyword = self.advance();
        let is_union = keyword.kind == TokenKind::Union;
        self.skip_attributes()?;

        let tag = match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Some(name)
            }
            _ => None,
        };

        if !self.check(&TokenKind::LeftBrace) {
            return match tag {
                Some(tag) => Ok(TypeExpr::Struct(tag)),
                None => Err(self.expected_error("a struct tag or `{`", None)),
            };
        }

        let anonymous = tag.is_none();
        let name = match tag {
            Some(tag) => tag,
            None => {
                let name = format!("anon.{}", self.anon_counter);
                self.anon_counter += 1;
                name
            }
        };
        let (fields, attributes) = self.parse_struct_body()?;
        self.skip_attributes()?;

        self.pending.push(Item::Struct(StructDef {
            name: name.clone(),
            anonymous,
            is_union,
            fields,
            attributes,
            loc: keyword.location(),
        }));
        Ok(TypeExpr::Struct(name))
    }

    fn parse_struct_body(&mut self) -> Result<(Vec<FieldDecl>, Vec<MapAttribute>)> {
        self.consume(TokenKind::LeftBrace, "`{`")?;
        let mut fields = Vec::new();
        let mut attributes = Vec::new();

        while !self.check(&TokenKind::RightBrace) {
            if self.is_at_end() {
                return Err(self.syntax_error(
                    "unterminated struct definition\n\nHelp: missing closing `}`",
                ));
            }
            let tok = self.peek().clone();
            match &tok.kind {
                TokenKind::Directive(_) | TokenKind::Semicolon => {
                    self.advance();
                    continue;
                }
                TokenKind::Identifier(name)
                    if self.peek_at(1).kind == TokenKind::LeftParen
                        && !self.type_names.contains(name)
                        && TypeExpr::builtin(name).is_none()
                        && name != "__attribute__" =>
                {
                    attributes.push(self.parse_map_attribute()?);
                    continue;
                }
                _ => {}
            }

            let spec = self.parse_decl_specifiers(false)?;
            if self.match_kind(&TokenKind::Semicolon) {
                // anonymous nested struct/union: members are flattened later
                fields.push(FieldDecl {
                    name: String::new(),
                    ty: spec.ty,
                    loc: tok.location(),
                });
                continue;
            }
            loop {
                let decl = self.parse_declarator(spec.ty.clone(), false)?;
                if self.match_kind(&TokenKind::Colon) {
                    // bit-field width is not modeled
                    self.parse_conditional()?;
                }
                self.skip_attributes()?;
                fields.push(FieldDecl {
                    name: decl.name,
                    ty: decl.ty,
                    loc: decl.loc,
                });
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::Semicolon, "`;` after struct member")?;
        }
        self.advance();
        Ok((fields, attributes))
    }

    /// `__uint(key, value);` style member
    fn parse_map_attribute(&mut self) -> Result<MapAttribute> {
        let macro_tok = self.advance();
        let macro_name = macro_tok.lexeme.clone();
        self.consume(TokenKind::LeftParen, "`(`")?;
        let (key, _) = self.consume_identifier("an attribute name")?;

        let value = if self.match_kind(&TokenKind::Comma) {
            self.parse_attr_value()?
        } else {
            AttrValue::Raw(String::new())
        };
        self.consume(TokenKind::RightParen, "`)` after attribute value")?;
        self.match_kind(&TokenKind::Semicolon);

        Ok(MapAttribute {
            macro_name,
            key,
            value,
            loc: macro_tok.location(),
        })
    }

    fn parse_attr_value(&mut self) -> Result<AttrValue> {
        let save = self.current;
        let pending = self.pending.len();

        if self.is_type_start(0) {
            if let Ok(ty) = self.parse_type_name() {
                if self.check(&TokenKind::RightParen) {
                    return Ok(AttrValue::Type(ty));
                }
            }
            self.current = save;
            self.pending.truncate(pending);
        }

        if let Ok(expr) = self.parse_assignment() {
            if self.check(&TokenKind::RightParen) {
                return Ok(AttrValue::Expr(expr));
            }
        }
        self.current = save;
        self.pending.truncate(pending);

        // keep anything else verbatim up to the closing `)`
        let mut depth = 0usize;
        let mut parts = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::Eof => {
                    return Err(self.syntax_error("unterminated attribute, missing `)`"));
                }
                TokenKind::RightParen if depth == 0 => break,
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => depth -= 1,
                _ => {}
            }
            parts.push(self.advance().lexeme);
        }
        Ok(AttrValue::Raw(parts.join(" ")))
    }

    fn parse_enum_specifier(&mut self) -> Result<TypeExpr> {
        let keyword = self.advance();
        self.skip_attributes()?;
        let name = match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Some(name)
            }
            _ => None,
        };

        if self.match_kind(&TokenKind::LeftBrace) {
            let mut variants = Vec::new();
            while !self.check(&TokenKind::RightBrace) {
                let (variant, _) = self.consume_identifier("an enumerator")?;
                let value = if self.match_kind(&TokenKind::Assign) {
                    Some(self.parse_conditional()?)
                } else {
                    None
                };
                variants.push((variant, value));
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RightBrace, "`}` to close the enum")?;
            self.pending.push(Item::Enum(EnumDef {
                name,
                variants,
                loc: keyword.location(),
            }));
        } else if name.is_none() {
            return Err(self.expected_error("an enum tag or `{`", None));
        }

        Ok(TypeExpr::int(32, true))
    }

    fn parse_declarator(&mut self, base: TypeExpr, allow_function: bool) -> Result<Declarator> {
        let ty = self.parse_pointers(base);
        self.skip_attributes()?;

        let name_tok = self.peek().clone();
        let name = match &name_tok.kind {
            TokenKind::Identifier(name) => name.clone(),
            TokenKind::LeftParen => {
                return Err(self.syntax_error(
                    "parenthesized declarators (function pointers) are not supported",
                ));
            }
            _ => return Err(self.expected_error("a declarator name", None)),
        };
        self.advance();

        if let Some(wrapper) = EntryWrapper::from_macro(&name) {
            if allow_function && self.check(&TokenKind::LeftParen) {
                self.advance();
                let (fn_name, fn_loc) = self.consume_identifier("the entry function name")?;
                let mut params = Vec::new();
                while self.match_kind(&TokenKind::Comma) {
                    params.push(self.parse_param()?);
                }
                self.consume(TokenKind::RightParen, "`)` to close the entry macro")?;
                return Ok(Declarator {
                    name: fn_name,
                    ty,
                    loc: fn_loc,
                    function: Some(FnSuffix {
                        params,
                        variadic: false,
                        wrapper: Some(wrapper),
                    }),
                });
            }
        }

        if self.check(&TokenKind::LeftParen) {
            if !allow_function {
                return Err(self.syntax_error("function declarators are not allowed here"));
            }
            let (params, variadic) = self.parse_param_list()?;
            return Ok(Declarator {
                name,
                ty,
                loc: name_tok.location(),
                function: Some(FnSuffix {
                    params,
                    variadic,
                    wrapper: None,
                }),
            });
        }

        let ty = self.parse_array_suffixes(ty)?;
        Ok(Declarator {
            name,
            ty,
            loc: name_tok.location(),
            function: None,
        })
    }

    fn parse_pointers(&mut self, base: TypeExpr) -> TypeExpr {
        let mut ty = base;
        while self.match_kind(&TokenKind::Star) {
            ty = TypeExpr::Pointer(Box::new(ty));
            while matches!(
                self.peek().kind,
                TokenKind::Const | TokenKind::Volatile | TokenKind::Register
            ) {
                self.advance();
            }
        }
        ty
    }

    fn parse_array_suffixes(&mut self, ty: TypeExpr) -> Result<TypeExpr> {
        let mut dims = Vec::new();
        while self.match_kind(&TokenKind::LeftBracket) {
            if self.match_kind(&TokenKind::RightBracket) {
                dims.push(None);
            } else {
                let len = self.parse_conditional()?;
                self.consume(TokenKind::RightBracket, "`]`")?;
                dims.push(Some(Box::new(len)));
            }
        }
        let mut ty = ty;
        for dim in dims.into_iter().rev() {
            ty = TypeExpr::Array(Box::new(ty), dim);
        }
        Ok(ty)
    }

    fn parse_param_list(&mut self) -> Result<(Vec<Param>, bool)> {
        self.consume(TokenKind::LeftParen, "`(`")?;
        let mut params = Vec::new();
        let mut variadic = false;

        if self.match_kind(&TokenKind::RightParen) {
            return Ok((params, false));
        }
        if self.check(&TokenKind::Void) && self.peek_at(1).kind == TokenKind::RightParen {
            self.advance();
            self.advance();
            return Ok((params, false));
        }

        loop {
            if self.match_kind(&TokenKind::Ellipsis) {
                variadic = true;
                break;
            }
            params.push(self.parse_param()?);
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightParen, "`)` to close the parameter list")?;
        Ok((params, variadic))
    }

    fn parse_param(&mut self) -> Result<Param> {
        let loc = self.peek().location();
        let spec = self.parse_decl_specifiers(false)?;
        let ty = self.parse_pointers(spec.ty);
        self.skip_attributes()?;

        let (name, loc) = match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                let loc = self.advance().location();
                (Some(name), loc)
            }
            _ => (None, loc),
        };
        let ty = match self.parse_array_suffixes(ty)? {
            // arrays decay to pointers in parameter position
            TypeExpr::Array(inner, _) => TypeExpr::Pointer(inner),
            other => other,
        };
        Ok(Param { name, ty, loc })
    }

    /// Type name as used in casts, `sizeof` and attribute values
    fn parse_type_name(&mut self) -> Result<TypeExpr> {
        let spec = self.parse_decl_specifiers(false)?;
        let ty = self.parse_pointers(spec.ty);
        self.parse_array_suffixes(ty)
    }

    fn parse_initializer(&mut self) -> Result<Initializer> {
        if !self.check(&TokenKind::LeftBrace) {
            return Ok(Initializer::Expr(self.parse_assignment()?));
        }
        let loc = self.advance().location();
        let mut items = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            let designator = if self.match_kind(&TokenKind::Dot) {
                let (field, _) = self.consume_identifier("a field name")?;
                self.consume(TokenKind::Assign, "`=` after designator")?;
                Some(Designator::Field(field))
            } else if self.match_kind(&TokenKind::LeftBracket) {
                let index = self.parse_conditional()?;
                self.consume(TokenKind::RightBracket, "`]`")?;
                self.consume(TokenKind::Assign, "`=` after designator")?;
                Some(Designator::Index(index))
            } else {
                None
            };
            let value = self.nested(Self::parse_initializer)?;
            items.push(InitItem { designator, value });
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "`}` to close the initializer list")?;
        Ok(Initializer::List { items, loc })
    }

    fn parse_section_opt(&mut self) -> Result<Option<Section>> {
        match &self.peek().kind {
            TokenKind::Identifier(name) if name == "SEC" => Ok(Some(self.parse_section()?)),
            _ => Ok(None),
        }
    }

    /// `SEC("name")`
    fn parse_section(&mut self) -> Result<Section> {
        let loc = self.advance().location();
        self.consume(TokenKind::LeftParen, "`(` after SEC")?;

        let mut name = match &self.peek().kind {
            TokenKind::String(s) => s.clone(),
            _ => {
                return Err(self.expected_error(
                    "a string literal section name",
                    Some("Sections are written as SEC(\"kprobe/do_sys_open\")."),
                ));
            }
        };
        self.advance();
        while let TokenKind::String(more) = &self.peek().kind {
            name.push_str(more);
            self.advance();
        }
        if name.is_empty() {
            return Err(Error::syntax(loc, "SEC", "empty section name"));
        }
        self.consume(TokenKind::RightParen, "`)` to close SEC")?;
        Ok(Section { name, loc })
    }

    fn skip_attributes(&mut self) -> Result<()> {
        while let TokenKind::Identifier(name) = &self.peek().kind {
            if name != "__attribute__" && name != "__attribute" {
                break;
            }
            self.advance();
            self.consume(TokenKind::LeftParen, "`(` after __attribute__")?;
            let mut depth = 1usize;
            while depth > 0 {
                match self.advance().kind {
                    TokenKind::LeftParen => depth += 1,
                    TokenKind::RightParen => depth -= 1,
                    TokenKind::Eof => {
                        return Err(self.syntax_error("unterminated __attribute__"));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        let open = self.consume(TokenKind::LeftBrace, "`{`")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            if self.is_at_end() {
                return Err(Error::syntax(
                    open.location(),
                    "{",
                    "unbalanced braces: this `{` is never closed",
                ));
            }
            stmts.push(self.nested(Self::parse_statement)?);
        }
        self.advance();
        Ok(stmts)
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        let tok = self.peek().clone();
        let loc = tok.location();

        let kind = match &tok.kind {
            TokenKind::LeftBrace => StmtKind::Block(self.parse_block()?),
            TokenKind::Semicolon | TokenKind::Directive(_) => {
                self.advance();
                StmtKind::Empty
            }
            TokenKind::If => {
                self.advance();
                self.consume(TokenKind::LeftParen, "`(` after `if`")?;
                let cond = self.parse_expression()?;
                self.consume(TokenKind::RightParen, "`)` after the condition")?;
                let then_branch = Box::new(self.nested(Self::parse_statement)?);
                let else_branch = if self.match_kind(&TokenKind::Else) {
                    Some(Box::new(self.nested(Self::parse_statement)?))
                } else {
                    None
                };
                StmtKind::If {
                    cond,
                    then_branch,
                    else_branch,
                }
            }
            TokenKind::While => {
                self.advance();
                self.consume(TokenKind::LeftParen, "`(` after `while`")?;
                let cond = self.parse_expression()?;
                self.consume(TokenKind::RightParen, "`)` after the condition")?;
                let body = Box::new(self.nested(Self::parse_statement)?);
                StmtKind::While { cond, body }
            }
            TokenKind::Do => {
                self.advance();
                let body = Box::new(self.nested(Self::parse_statement)?);
                self.consume(TokenKind::While, "`while` after a do body")?;
                self.consume(TokenKind::LeftParen, "`(` after `while`")?;
                let cond = self.parse_expression()?;
                self.consume(TokenKind::RightParen, "`)` after the condition")?;
                self.consume(TokenKind::Semicolon, "`;` after do/while")?;
                StmtKind::DoWhile { body, cond }
            }
            TokenKind::For => self.parse_for()?,
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.consume(TokenKind::Semicolon, "`;` after return")?;
                StmtKind::Return(value)
            }
            TokenKind::Break => {
                self.advance();
                self.consume(TokenKind::Semicolon, "`;` after break")?;
                StmtKind::Break
            }
            TokenKind::Continue => {
                self.advance();
                self.consume(TokenKind::Semicolon, "`;` after continue")?;
                StmtKind::Continue
            }
            TokenKind::Switch => {
                return Err(self.syntax_error(
                    "`switch` statements are not supported\n\nHelp: use an if/else chain",
                ));
            }
            TokenKind::Goto => {
                return Err(self.syntax_error("`goto` is not supported"));
            }
            TokenKind::Typedef => {
                return Err(self.syntax_error("typedefs are only allowed at file scope"));
            }
            _ if self.is_decl_start() => StmtKind::Decl(self.parse_local_decl()?),
            _ => {
                let expr = self.parse_expression()?;
                self.consume(TokenKind::Semicolon, "`;` after expression")?;
                StmtKind::Expr(expr)
            }
        };

        Ok(Stmt { kind, loc })
    }

    fn parse_for(&mut self) -> Result<StmtKind> {
        self.advance();
        self.consume(TokenKind::LeftParen, "`(` after `for`")?;

        let init = if self.match_kind(&TokenKind::Semicolon) {
            None
        } else {
            let loc = self.peek().location();
            let kind = if self.is_decl_start() {
                StmtKind::Decl(self.parse_local_decl()?)
            } else {
                let expr = self.parse_expression()?;
                self.consume(TokenKind::Semicolon, "`;` after the for initializer")?;
                StmtKind::Expr(expr)
            };
            Some(Box::new(Stmt { kind, loc }))
        };

        let cond = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume(TokenKind::Semicolon, "`;` after the for condition")?;

        let step = if self.check(&TokenKind::RightParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume(TokenKind::RightParen, "`)` to close the for header")?;

        let body = Box::new(self.nested(Self::parse_statement)?);
        Ok(StmtKind::For {
            init,
            cond,
            step,
            body,
        })
    }

    fn parse_local_decl(&mut self) -> Result<Vec<LocalDecl>> {
        let spec = self.parse_decl_specifiers(false)?;
        let mut decls = Vec::new();
        if self.match_kind(&TokenKind::Semicolon) {
            return Ok(decls);
        }
        loop {
            let decl = self.parse_declarator(spec.ty.clone(), false)?;
            self.skip_attributes()?;
            let init = if self.match_kind(&TokenKind::Assign) {
                Some(self.parse_initializer()?)
            } else {
                None
            };
            decls.push(LocalDecl {
                name: decl.name,
                ty: decl.ty,
                qualifiers: spec.qualifiers,
                init,
                loc: decl.loc,
            });
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Semicolon, "`;` after declaration")?;
        Ok(decls)
    }

    fn is_decl_start(&self) -> bool {
        let tok = self.peek();
        if tok.kind.starts_declaration() {
            return true;
        }
        match &tok.kind {
            TokenKind::Identifier(name) => {
                TypeExpr::builtin(name).is_some()
                    || self.type_names.contains(name)
                    || INLINE_QUALIFIERS.contains(&name.as_str())
                    || matches!(self.peek_at(1).kind, TokenKind::Identifier(_))
            }
            _ => false,
        }
    }

    /// Token at `offset` begins a type name (casts, sizeof)
    fn is_type_start(&self, offset: usize) -> bool {
        let tok = self.peek_at(offset);
        if tok.kind.starts_declaration() {
            return true;
        }
        match &tok.kind {
            TokenKind::Identifier(name) => {
                TypeExpr::builtin(name).is_some() || self.type_names.contains(name)
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Full expression including the comma operator
    pub(crate) fn parse_expression(&mut self) -> Result<Expr> {
        let mut expr = self.parse_assignment()?;
        while self.match_kind(&TokenKind::Comma) {
            let rhs = self.parse_assignment()?;
            let loc = expr.loc;
            expr = Expr::new(ExprKind::Comma(Box::new(expr), Box::new(rhs)), loc);
        }
        Ok(expr)
    }

    fn parse_assignment(&mut self) -> Result<Expr> {
        let target = self.parse_conditional()?;
        let op = match self.peek().kind {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinaryOp::Add),
            TokenKind::MinusAssign => Some(BinaryOp::Sub),
            TokenKind::StarAssign => Some(BinaryOp::Mul),
            TokenKind::SlashAssign => Some(BinaryOp::Div),
            TokenKind::PercentAssign => Some(BinaryOp::Mod),
            TokenKind::ShlAssign => Some(BinaryOp::Shl),
            TokenKind::ShrAssign => Some(BinaryOp::Shr),
            TokenKind::AmpAssign => Some(BinaryOp::BitAnd),
            TokenKind::PipeAssign => Some(BinaryOp::BitOr),
            TokenKind::CaretAssign => Some(BinaryOp::BitXor),
            _ => return Ok(target),
        };
        self.advance();
        let value = self.nested(Self::parse_assignment)?;
        let loc = target.loc;
        Ok(Expr::new(
            ExprKind::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            loc,
        ))
    }

    fn parse_conditional(&mut self) -> Result<Expr> {
        let cond = self.parse_binary(Precedence::LogicalOr as u8)?;
        if !self.match_kind(&TokenKind::Question) {
            return Ok(cond);
        }
        let then_expr = self.nested(Self::parse_expression)?;
        self.consume(TokenKind::Colon, "`:` in conditional expression")?;
        let else_expr = self.nested(Self::parse_conditional)?;
        let loc = cond.loc;
        Ok(Expr::new(
            ExprKind::Conditional {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            loc,
        ))
    }

    /// Precedence climbing over the binary operators
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.binary_op() {
                Some(op) if op.precedence() as u8 >= min_prec => op,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_binary(op.precedence() as u8 + 1)?;
            let loc = lhs.loc;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                loc,
            );
        }
        Ok(lhs)
    }

    fn binary_op(&self) -> Option<BinaryOp> {
        let op = match self.peek().kind {
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Sub,
            TokenKind::Star => BinaryOp::Mul,
            TokenKind::Slash => BinaryOp::Div,
            TokenKind::Percent => BinaryOp::Mod,
            TokenKind::Shl => BinaryOp::Shl,
            TokenKind::Shr => BinaryOp::Shr,
            TokenKind::Amp => BinaryOp::BitAnd,
            TokenKind::Pipe => BinaryOp::BitOr,
            TokenKind::Caret => BinaryOp::BitXor,
            TokenKind::EqEq => BinaryOp::Eq,
            TokenKind::NotEq => BinaryOp::Ne,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::LtEq => BinaryOp::Le,
            TokenKind::GtEq => BinaryOp::Ge,
            TokenKind::AmpAmp => BinaryOp::LogicalAnd,
            TokenKind::PipePipe => BinaryOp::LogicalOr,
            _ => return None,
        };
        Some(op)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let tok = self.peek().clone();
        let loc = tok.location();

        let op = match tok.kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Star => Some(UnaryOp::Deref),
            TokenKind::Amp => Some(UnaryOp::AddrOf),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.nested(Self::parse_unary)?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            ));
        }

        match tok.kind {
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                self.advance();
                let target = self.nested(Self::parse_unary)?;
                Ok(Expr::new(
                    ExprKind::IncDec {
                        target: Box::new(target),
                        increment: tok.kind == TokenKind::PlusPlus,
                        prefix: true,
                    },
                    loc,
                ))
            }
            TokenKind::Sizeof => {
                self.advance();
                if self.check(&TokenKind::LeftParen) && self.is_type_start(1) {
                    self.advance();
                    let ty = self.parse_type_name()?;
                    self.consume(TokenKind::RightParen, "`)` after sizeof type")?;
                    Ok(Expr::new(ExprKind::SizeofType(ty), loc))
                } else {
                    let operand = self.nested(Self::parse_unary)?;
                    Ok(Expr::new(ExprKind::SizeofExpr(Box::new(operand)), loc))
                }
            }
            TokenKind::LeftParen if self.is_type_start(1) => {
                self.advance();
                let ty = self.parse_type_name()?;
                self.consume(TokenKind::RightParen, "`)` after cast type")?;
                if self.check(&TokenKind::LeftBrace) {
                    return Err(self.syntax_error("compound literals are not supported"));
                }
                let expr = self.nested(Self::parse_unary)?;
                Ok(Expr::new(
                    ExprKind::Cast {
                        ty,
                        expr: Box::new(expr),
                    },
                    loc,
                ))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let loc = expr.loc;
            match self.peek().kind {
                TokenKind::LeftParen => {
                    let callee = match &expr.kind {
                        ExprKind::Ident(name) => name.clone(),
                        _ => {
                            return Err(
                                self.syntax_error("only direct calls by function name are supported")
                            );
                        }
                    };
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RightParen) {
                        loop {
                            args.push(self.nested(Self::parse_assignment)?);
                            if !self.match_kind(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.consume(TokenKind::RightParen, "`)` to close the argument list")?;
                    expr = Expr::new(ExprKind::Call { callee, args }, loc);
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.nested(Self::parse_expression)?;
                    self.consume(TokenKind::RightBracket, "`]`")?;
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        loc,
                    );
                }
                TokenKind::Dot | TokenKind::Arrow => {
                    let arrow = self.advance().kind == TokenKind::Arrow;
                    let (field, _) = self.consume_identifier("a member name")?;
                    expr = Expr::new(
                        ExprKind::Member {
                            base: Box::new(expr),
                            field,
                            arrow,
                        },
                        loc,
                    );
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let increment = self.advance().kind == TokenKind::PlusPlus;
                    expr = Expr::new(
                        ExprKind::IncDec {
                            target: Box::new(expr),
                            increment,
                            prefix: false,
                        },
                        loc,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let tok = self.peek().clone();
        let loc = tok.location();
        let kind = match tok.kind {
            TokenKind::Integer {
                value,
                suffix,
                non_decimal,
            } => {
                self.advance();
                ExprKind::IntLiteral {
                    value,
                    unsigned: suffix.unsigned,
                    long: suffix.long,
                    non_decimal,
                }
            }
            TokenKind::Char(c) => {
                self.advance();
                ExprKind::CharLiteral(c)
            }
            TokenKind::String(s) => {
                self.advance();
                let mut value = s;
                while let TokenKind::String(more) = &self.peek().kind {
                    value.push_str(more);
                    self.advance();
                }
                ExprKind::StringLiteral(value)
            }
            TokenKind::Identifier(name) => {
                self.advance();
                ExprKind::Ident(name)
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.nested(Self::parse_expression)?;
                self.consume(TokenKind::RightParen, "`)` to close the parenthesized expression")?;
                return Ok(inner);
            }
            _ => return Err(self.expected_error("an expression", None)),
        };
        Ok(Expr::new(kind, loc))
    }

    // ------------------------------------------------------------------
    // Helper methods
    // ------------------------------------------------------------------

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.current + offset).min(self.tokens.len().saturating_sub(1));
        &self.tokens[idx]
    }

    fn advance(&mut self) -> Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.tokens[self.current.saturating_sub(1)].clone()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        if self.is_at_end() {
            return false;
        }
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn match_kind(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            let hint = match kind {
                TokenKind::RightBrace => Some("Braces are unbalanced: a `{` is never closed."),
                TokenKind::RightParen => Some("Missing closing `)` for an earlier `(`."),
                TokenKind::Semicolon => Some("Statements and declarations end with `;`."),
                _ => None,
            };
            Err(self.expected_error(what, hint))
        }
    }

    fn consume_identifier(&mut self, what: &str) -> Result<(String, Location)> {
        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                let loc = self.advance().location();
                Ok((name, loc))
            }
            _ => Err(self.expected_error(what, None)),
        }
    }

    /// Get a human-readable name for a token kind
    fn token_kind_name(kind: &TokenKind) -> String {
        match kind {
            TokenKind::Integer { .. } => "integer".to_string(),
            TokenKind::String(_) => "string".to_string(),
            TokenKind::Char(_) => "character literal".to_string(),
            TokenKind::Identifier(name) => format!("identifier `{}`", name),
            TokenKind::Directive(_) => "preprocessor directive".to_string(),
            TokenKind::Eof => "end of file".to_string(),
            TokenKind::LeftBrace => "`{`".to_string(),
            TokenKind::RightBrace => "`}`".to_string(),
            TokenKind::LeftParen => "`(`".to_string(),
            TokenKind::RightParen => "`)`".to_string(),
            TokenKind::Semicolon => "`;`".to_string(),
            other => format!("{:?}", other),
        }
    }

    /// Run `parse` one nesting level deeper
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.syntax_error(format!(
                "nesting too deep; at most {} levels are supported",
                MAX_NESTING
            )));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// Helper to create a syntax error at current position
    fn syntax_error(&self, message: impl Into<String>) -> Error {
        let token = self.peek();
        Error::syntax(token.location(), token.lexeme.clone(), message)
    }

    /// Helper to create a syntax error with expected/got pattern
    fn expected_error(&self, expected: &str, hint: Option<&str>) -> Error {
        let token = self.peek();
        let mut message = format!(
            "Expected {}, found {}",
            expected,
            Self::token_kind_name(&token.kind)
        );
        if let Some(hint) = hint {
            message.push_str("\n\nHelp: ");
            message.push_str(hint);
        }
        Error::syntax(token.location(), token.lexeme.clone(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<TranslationUnit> {
        let tokens = CScanner::new(source).scan_tokens()?;
        CParser::new(tokens).parse()
    }

    fn functions(unit: &TranslationUnit) -> Vec<&FunctionDef> {
        unit.items
            .iter()
            .filter_map(|item| match item {
                Item::Function(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_map_declaration() {
        let unit = parse(
            r#"
            struct {
                __uint(type, BPF_MAP_TYPE_HASH);
                __uint(max_entries, 1 << 24);
                __type(key, u64);
                __type(value, u64);
            } last SEC(".maps");
            "#,
        )
        .unwrap();

        let def = unit
            .items
            .iter()
            .find_map(|item| match item {
                Item::Struct(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert!(def.anonymous);
        assert_eq!(def.attributes.len(), 4);
        assert_eq!(def.attributes[2].key, "key");
        assert_eq!(def.attributes[2].value, AttrValue::Type(TypeExpr::int(64, false)));

        let global = unit
            .items
            .iter()
            .find_map(|item| match item {
                Item::Global(g) => Some(g),
                _ => None,
            })
            .unwrap();
        assert_eq!(global.name, "last");
        assert_eq!(global.section.as_ref().unwrap().name, ".maps");
        assert_eq!(global.ty, TypeExpr::Struct(def.name.clone()));
    }

    #[test]
    fn test_section_before_and_after() {
        let unit = parse(
            r#"
            SEC("tp/syscalls/sys_enter_execve")
            int handle(void *ctx) { return 0; }
            char LICENSE[] SEC("license") = "GPL";
            "#,
        )
        .unwrap();
        let funcs = functions(&unit);
        assert_eq!(
            funcs[0].section.as_ref().unwrap().name,
            "tp/syscalls/sys_enter_execve"
        );
        let license = unit.items.iter().find_map(|item| match item {
            Item::Global(g) => Some(g),
            _ => None,
        });
        assert_eq!(license.unwrap().section.as_ref().unwrap().name, "license");
    }

    #[test]
    fn test_entry_wrapper_macro() {
        let unit = parse(
            r#"
            SEC("kprobe/blk_account_io_start")
            int BPF_KPROBE(trace_req_start, struct request *req)
            {
                u64 len = req->__data_len;
                return 0;
            }
            "#,
        )
        .unwrap();
        let f = functions(&unit)[0];
        assert_eq!(f.name, "trace_req_start");
        assert_eq!(f.wrapper, Some(EntryWrapper::Kprobe));
        assert_eq!(f.params.len(), 1);
        assert_eq!(
            f.params[0].ty,
            TypeExpr::Pointer(Box::new(TypeExpr::Struct("request".to_string())))
        );
    }

    #[test]
    fn test_define_forms() {
        let unit = parse("#define u64 unsigned long long\n#define TASK_COMM_LEN 16\n#include <vmlinux.h>\n")
            .unwrap();
        assert!(matches!(
            &unit.items[0],
            Item::Define(MacroDef { body: MacroBody::Type(TypeExpr::Int { bits: 64, signed: false }), .. })
        ));
        assert!(matches!(
            &unit.items[1],
            Item::Define(MacroDef { body: MacroBody::Expr(_), .. })
        ));
        assert!(matches!(&unit.items[2], Item::Directive { .. }));
    }

    #[test]
    fn test_define_alias_enables_declarations() {
        let unit = parse(
            "#define counter_t unsigned int\nint f(void) { counter_t c = 0; return c; }",
        )
        .unwrap();
        let f = functions(&unit)[0];
        assert!(matches!(f.body[0].kind, StmtKind::Decl(_)));
    }

    #[test]
    fn test_precedence() {
        let unit = parse("int f(void) { return 1 + 2 * 3 << 1; }").unwrap();
        let f = functions(&unit)[0];
        match &f.body[0].kind {
            StmtKind::Return(Some(Expr {
                kind: ExprKind::Binary { op, .. },
                ..
            })) => assert_eq!(*op, BinaryOp::Shl),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_statements() {
        let unit = parse(
            r#"
            int f(int n) {
                int i, sum = 0;
                for (i = 0; i < 10; i++) { if (i == n) continue; sum += i; }
                while (sum > 100) sum--;
                do { sum++; } while (sum < 3);
                return sum ? sum : -1;
            }
            "#,
        )
        .unwrap();
        let f = functions(&unit)[0];
        assert_eq!(f.body.len(), 5);
        assert!(matches!(f.body[1].kind, StmtKind::For { .. }));
        assert!(matches!(f.body[3].kind, StmtKind::DoWhile { .. }));
    }

    #[test]
    fn test_switch_rejected() {
        let err = parse("int f(int x) { switch (x) { } return 0; }").unwrap_err();
        assert!(err.to_string().contains("switch"));
    }

    #[test]
    fn test_unbalanced_braces() {
        assert!(parse("int f(void) { if (1) { return 0; }").is_err());
        assert!(parse("int f(void) { return 0; } }").is_err());
    }

    #[test]
    fn test_bad_section_literal() {
        let err = parse("SEC(kprobe) int f(void *ctx) { return 0; }").unwrap_err();
        assert!(err.to_string().contains("string literal"));
        assert!(parse("SEC(\"\") int f(void *ctx) { return 0; }").is_err());
    }

    #[test]
    fn test_designated_initializer() {
        let unit = parse("struct cfg c = { .a = 1, [2] = 3, {} };").unwrap();
        match &unit.items[0] {
            Item::Global(GlobalDecl {
                init: Some(Initializer::List { items, .. }),
                ..
            }) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].designator, Some(Designator::Field("a".to_string())));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_volatile_global_and_cast() {
        let unit = parse(
            "volatile __u64 prev_time = 0;\nint f(void) { return (int)sizeof(struct event); }",
        )
        .unwrap();
        match &unit.items[0] {
            Item::Global(g) => {
                assert!(g.qualifiers.is_volatile);
                assert_eq!(g.ty, TypeExpr::int(64, false));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let depth = 50_000;
        let parens = format!(
            "int f(void) {{ return {}1{}; }}",
            "(".repeat(depth),
            ")".repeat(depth)
        );
        let blocks = format!("int f(void) {{ {}{} return 0; }}", "{".repeat(depth), "}".repeat(depth));
        let unary = format!("int f(void) {{ return {}1; }}", "-".repeat(depth));
        let init = format!("int x = {}1{};", "{".repeat(depth), "}".repeat(depth));
        for source in [parens, blocks, unary, init] {
            match parse(&source) {
                Err(Error::SyntaxError { message, .. }) => assert!(message.contains("nesting too deep")),
                other => panic!("expected a syntax error, got {:?}", other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_nesting_below_limit_parses() {
        let depth = MAX_NESTING / 4;
        let source = format!(
            "int f(void) {{ {}return {}1{};{} }}",
            "{".repeat(depth),
            "(".repeat(depth),
            ")".repeat(depth),
            "}".repeat(depth)
        );
        assert!(parse(&source).is_ok());
    }
}
