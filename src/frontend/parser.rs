//! Parser for the IR text format.
//!
//! A recursive descent parser building functions directly into their arenas.
//! Values must be defined before use; the verifier checks the rest.

use crate::frontend::lexer::Lexer;
use crate::frontend::token::{Token, TokenKind};
use crate::ir::function::{BlockId, Func, Module, ValueId};
use crate::ir::ops::{BinOp, CmpPred, FuncRole, LoopRole, OpKind, PipelineInfo, PipelineRef};
use crate::ir::types::{ElemType, Type};
use crate::utils::errors::{ParseError, ParseErrorKind, PipelinerError};
use crate::utils::location::Span;
use std::collections::HashMap;

type PResult<T> = Result<T, PipelinerError>;

/// One entry of a `[...]` attribute list.
#[derive(Debug, Clone, PartialEq)]
enum Attr {
    Int(i64),
    Word(String),
    Symbol(String),
    Pair(String, Box<Attr>),
}

/// A parser for the IR text format.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    previous: Token,
    /// Visible value names, one map per enclosing region
    scopes: Vec<HashMap<String, ValueId>>,
}

impl<'a> Parser<'a> {
    pub fn new(mut lexer: Lexer<'a>) -> PResult<Self> {
        let first_token = lexer.next_token()?;
        Ok(Self {
            lexer,
            current: first_token.clone(),
            previous: first_token,
            scopes: vec![HashMap::new()],
        })
    }

    /// Parse a complete module.
    pub fn parse_module(&mut self) -> PResult<Module> {
        let mut module = Module::new();
        while !self.is_at_end() {
            let func = self.parse_func()?;
            if module.contains(&func.name) {
                return Err(ParseError::new(
                    ParseErrorKind::DuplicateDefinition,
                    format!("Function @{} defined twice", func.name),
                    self.previous.span,
                )
                .into());
            }
            module.add(func);
        }
        Ok(module)
    }

    fn parse_func(&mut self) -> PResult<Func> {
        if !(self.check(TokenKind::Identifier) && self.current.lexeme == "func") {
            return Err(self.unexpected("Expected 'func'", &["func"]));
        }
        self.advance()?;
        let name = self.consume(TokenKind::SymbolName, "Expected function name")?.name().to_string();
        self.scopes = vec![HashMap::new()];

        self.consume(TokenKind::LeftParen, "Expected '(' after function name")?;
        let params = self.parse_typed_names()?;
        self.consume(TokenKind::RightParen, "Expected ')' after parameters")?;
        self.consume(TokenKind::Arrow, "Expected '->' after parameters")?;
        self.consume(TokenKind::LeftParen, "Expected '(' before result types")?;
        let result_types = if self.check(TokenKind::RightParen) {
            Vec::new()
        } else {
            self.parse_type_list()?
        };
        self.consume(TokenKind::RightParen, "Expected ')' after result types")?;

        let param_types: Vec<Type> = params.iter().map(|(_, ty)| *ty).collect();
        let mut func = Func::new(name, &param_types, result_types);
        let entry = func.entry();
        self.bind_args(&func, entry, &params)?;

        if self.match_token(TokenKind::LeftBracket)? {
            let attrs = self.parse_attrs()?;
            self.apply_func_attrs(&mut func, attrs)?;
        }

        self.consume(TokenKind::LeftBrace, "Expected '{' before function body")?;
        self.parse_ops(&mut func, entry)?;
        self.consume(TokenKind::RightBrace, "Expected '}' after function body")?;
        Ok(func)
    }

    /// `%a: ty, %b: ty` (possibly empty).
    fn parse_typed_names(&mut self) -> PResult<Vec<(Token, Type)>> {
        let mut names = Vec::new();
        if !self.check(TokenKind::ValueName) {
            return Ok(names);
        }
        loop {
            let name = self.consume(TokenKind::ValueName, "Expected value name")?.clone();
            self.consume(TokenKind::Colon, "Expected ':' after value name")?;
            let ty = self.parse_type()?;
            names.push((name, ty));
            if !self.match_token(TokenKind::Comma)? {
                return Ok(names);
            }
        }
    }

    fn bind_args(&mut self, func: &Func, block: BlockId, names: &[(Token, Type)]) -> PResult<()> {
        for ((token, _), &value) in names.iter().zip(&func.block(block).args) {
            self.define(token, value)?;
        }
        Ok(())
    }

    fn define(&mut self, token: &Token, value: ValueId) -> PResult<()> {
        // a name stays reserved while any region that binds it is open
        if self.scopes.iter().any(|scope| scope.contains_key(token.name())) {
            return Err(ParseError::new(
                ParseErrorKind::DuplicateDefinition,
                format!("Value {} defined twice", token.lexeme),
                token.span,
            )
            .into());
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(token.name().to_string(), value);
        }
        Ok(())
    }

    fn lookup(&self, token: &Token) -> PResult<ValueId> {
        let found = self.scopes.iter().rev().find_map(|scope| scope.get(token.name()));
        found.copied().ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::UndefinedValue,
                format!("Use of undefined value {}", token.lexeme),
                token.span,
            )
            .into()
        })
    }

    fn parse_type_list(&mut self) -> PResult<Vec<Type>> {
        let mut types = vec![self.parse_type()?];
        while self.match_token(TokenKind::Comma)? {
            types.push(self.parse_type()?);
        }
        Ok(types)
    }

    fn parse_type(&mut self) -> PResult<Type> {
        let token = self.consume(TokenKind::Identifier, "Expected a type")?.clone();
        let ty = match token.lexeme.as_str() {
            "index" => Type::Index,
            "i1" => Type::Bool,
            "vector" => {
                self.consume(TokenKind::Less, "Expected '<' after 'vector'")?;
                let lanes = self.consume(TokenKind::Integer, "Expected lane count")?.clone();
                let elem = self.consume(TokenKind::Identifier, "Expected 'x' and element type")?.clone();
                let lanes: u32 = lanes.lexeme.parse().map_err(|_| self.type_error(&lanes))?;
                let elem = elem
                    .lexeme
                    .strip_prefix('x')
                    .and_then(ElemType::from_name)
                    .ok_or_else(|| self.type_error(&elem))?;
                self.consume(TokenKind::Greater, "Expected '>' after vector type")?;
                if lanes == 0 {
                    return Err(self.type_error(&token));
                }
                Type::vector(lanes, elem)
            }
            "buffer" => {
                self.consume(TokenKind::Less, "Expected '<' after 'buffer'")?;
                let elem = self.consume(TokenKind::Identifier, "Expected element type")?.clone();
                let elem = ElemType::from_name(&elem.lexeme).ok_or_else(|| self.type_error(&elem))?;
                self.consume(TokenKind::Greater, "Expected '>' after buffer type")?;
                Type::Buffer(elem)
            }
            other => match ElemType::from_name(other) {
                Some(elem) => Type::Scalar(elem),
                None => return Err(self.type_error(&token)),
            },
        };
        Ok(ty)
    }

    fn type_error(&self, token: &Token) -> PipelinerError {
        ParseError::new(
            ParseErrorKind::ExpectedType,
            format!("Invalid type '{}'", token.lexeme),
            token.span,
        )
        .into()
    }

    /// Attribute list after the opening `[`, consuming the closing `]`.
    fn parse_attrs(&mut self) -> PResult<Vec<Attr>> {
        let mut attrs = Vec::new();
        if self.match_token(TokenKind::RightBracket)? {
            return Ok(attrs);
        }
        loop {
            let attr = self.parse_attr_value()?;
            let attr = match attr {
                Attr::Word(key) if self.match_token(TokenKind::Equal)? => {
                    Attr::Pair(key, Box::new(self.parse_attr_value()?))
                }
                other => other,
            };
            attrs.push(attr);
            if !self.match_token(TokenKind::Comma)? {
                break;
            }
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after attributes")?;
        Ok(attrs)
    }

    fn parse_attr_value(&mut self) -> PResult<Attr> {
        let token = self.current.clone();
        let attr = match token.kind {
            TokenKind::Integer => Attr::Int(token.lexeme.parse().map_err(|_| {
                ParseError::new(ParseErrorKind::UnexpectedToken, "Invalid integer", token.span)
            })?),
            TokenKind::Identifier => Attr::Word(token.lexeme.clone()),
            TokenKind::SymbolName => Attr::Symbol(token.name().to_string()),
            _ => return Err(self.unexpected("Expected attribute", &["integer", "identifier", "@symbol"])),
        };
        self.advance()?;
        Ok(attr)
    }

    fn apply_func_attrs(&mut self, func: &mut Func, attrs: Vec<Attr>) -> PResult<()> {
        let span = self.previous.span;
        let mut pairs = HashMap::new();
        for attr in attrs {
            match attr {
                Attr::Word(role) => {
                    func.role = FuncRole::from_name(&role).ok_or_else(|| {
                        ParseError::new(ParseErrorKind::UnknownOperation, format!("Unknown role '{}'", role), span)
                    })?;
                }
                Attr::Pair(key, value) => {
                    pairs.insert(key, *value);
                }
                other => return Err(attr_error(&format!("Unexpected function attribute {:?}", other), span)),
            }
        }
        if !pairs.is_empty() {
            let get = |key: &str| -> PResult<i64> {
                match pairs.get(key) {
                    Some(Attr::Int(n)) if *n >= 0 => Ok(*n),
                    _ => Err(attr_error(&format!("Missing or invalid '{}'", key), span)),
                }
            };
            func.info = Some(PipelineInfo {
                ii: get("ii")? as u32,
                stage_count: get("stages")? as u32,
                res_mii: get("res_mii")? as u32,
                rec_mii: get("rec_mii")? as u32,
                prologue_ops: get("prologue_ops")? as usize,
                epilogue_ops: get("epilogue_ops")? as usize,
            });
        }
        Ok(())
    }

    fn parse_ops(&mut self, func: &mut Func, block: BlockId) -> PResult<()> {
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            self.parse_op(func, block)?;
        }
        Ok(())
    }

    fn parse_op(&mut self, func: &mut Func, block: BlockId) -> PResult<()> {
        let mut result_names = Vec::new();
        if self.check(TokenKind::ValueName) {
            loop {
                result_names.push(self.consume(TokenKind::ValueName, "Expected result name")?.clone());
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
            self.consume(TokenKind::Equal, "Expected '=' after result names")?;
        }

        let name = self.consume(TokenKind::Identifier, "Expected operation name")?.clone();
        let attrs = if self.match_token(TokenKind::LeftBracket)? {
            self.parse_attrs()?
        } else {
            Vec::new()
        };
        let kind = build_kind(&name, attrs)?;

        self.consume(TokenKind::LeftParen, "Expected '(' before operands")?;
        let mut operands = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let token = self.consume(TokenKind::ValueName, "Expected operand")?.clone();
                operands.push(self.lookup(&token)?);
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after operands")?;

        let result_types = if self.match_token(TokenKind::Colon)? {
            self.parse_type_list()?
        } else {
            Vec::new()
        };
        if result_types.len() != result_names.len() {
            return Err(ParseError::new(
                ParseErrorKind::UnexpectedToken,
                format!(
                    "'{}' names {} results but lists {} types",
                    name.lexeme,
                    result_names.len(),
                    result_types.len()
                ),
                name.span,
            )
            .into());
        }

        let mut regions = Vec::new();
        while self.match_token(TokenKind::LeftBrace)? {
            regions.push(self.parse_region(func)?);
        }

        let op = func.append_op(block, kind, operands, &result_types, regions);
        for (token, &value) in result_names.iter().zip(&func.op(op).results) {
            self.define(token, value)?;
        }
        Ok(())
    }

    /// Region body after the opening `{`, consuming the closing `}`.
    fn parse_region(&mut self, func: &mut Func) -> PResult<BlockId> {
        let args = if self.match_token(TokenKind::Caret)? {
            self.consume(TokenKind::LeftParen, "Expected '(' after '^'")?;
            let args = self.parse_typed_names()?;
            self.consume(TokenKind::RightParen, "Expected ')' after region arguments")?;
            self.consume(TokenKind::Colon, "Expected ':' after region header")?;
            args
        } else {
            Vec::new()
        };
        let arg_types: Vec<Type> = args.iter().map(|(_, ty)| *ty).collect();
        let block = func.new_block(&arg_types);
        self.scopes.push(HashMap::new());
        self.bind_args(func, block, &args)?;
        self.parse_ops(func, block)?;
        self.scopes.pop();
        self.consume(TokenKind::RightBrace, "Expected '}' after region")?;
        Ok(block)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn is_at_end(&self) -> bool {
        self.current.kind == TokenKind::Eof
    }

    fn advance(&mut self) -> PResult<&Token> {
        let next = self.lexer.next_token()?;
        self.previous = std::mem::replace(&mut self.current, next);
        Ok(&self.previous)
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> PResult<&Token> {
        if self.check(kind) {
            self.advance()
        } else {
            Err(self.unexpected(message, &[kind.describe()]))
        }
    }

    fn match_token(&mut self, kind: TokenKind) -> PResult<bool> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn unexpected(&self, message: &str, expected: &[&str]) -> PipelinerError {
        let kind = if self.is_at_end() {
            ParseErrorKind::UnexpectedEof
        } else {
            ParseErrorKind::ExpectedToken
        };
        ParseError {
            message: message.to_string(),
            span: self.current.span,
            kind,
            expected: expected.iter().map(|s| s.to_string()).collect(),
            found: Some(self.current.lexeme.clone()),
        }
        .into()
    }
}

fn attr_error(message: &str, span: Span) -> PipelinerError {
    ParseError::new(ParseErrorKind::UnknownOperation, message, span).into()
}

/// Map an op name and its attributes to an `OpKind`.
fn build_kind(name: &Token, attrs: Vec<Attr>) -> PResult<OpKind> {
    let span = name.span;
    let bad = |what: &str| attr_error(&format!("Invalid attributes for '{}': {}", name.lexeme, what), span);
    let kind = match (name.lexeme.as_str(), attrs.as_slice()) {
        ("const", [Attr::Int(c)]) => OpKind::Const(*c),
        ("const", _) => return Err(bad("expected [value]")),
        ("cmp", [Attr::Word(p)]) => OpKind::Cmp(CmpPred::from_name(p).ok_or_else(|| bad("unknown predicate"))?),
        ("cmp", _) => return Err(bad("expected [predicate]")),
        ("reduce", [Attr::Word(op)]) => {
            let op = BinOp::from_name(op).filter(|op| op.is_reduction()).ok_or_else(|| bad("unknown reduction"))?;
            OpKind::Reduce(op)
        }
        ("reduce", _) => return Err(bad("expected [operator]")),
        ("slice", [Attr::Int(offset)]) if *offset >= 0 => OpKind::Slice(*offset as u32),
        ("slice", _) => return Err(bad("expected [offset]")),
        ("call", [Attr::Symbol(callee)]) => OpKind::Call(callee.clone()),
        ("call", _) => return Err(bad("expected [@callee]")),
        ("for", [Attr::Word(role), rest @ ..]) => {
            let role = match role.as_str() {
                "main" => LoopRole::Main,
                "tail" => LoopRole::Tail,
                _ => return Err(bad("unknown loop role")),
            };
            let pipeline = if rest.is_empty() {
                None
            } else {
                Some(pipeline_ref(rest).ok_or_else(|| bad("incomplete pipeline reference"))?)
            };
            OpKind::For { role, pipeline }
        }
        ("for", []) => OpKind::For { role: LoopRole::Main, pipeline: None },
        ("for", _) => return Err(bad("expected [role, ...]")),
        (other, []) => match other {
            "fma" => OpKind::Fma,
            "broadcast" => OpKind::Broadcast,
            "concat" => OpKind::Concat,
            "copy" => OpKind::Copy,
            "load" => OpKind::Load,
            "store" => OpKind::Store,
            "do_while" => OpKind::DoWhile,
            "if" => OpKind::If,
            "yield" => OpKind::Yield,
            "condition" => OpKind::Condition,
            "return" => OpKind::Return,
            _ => match BinOp::from_name(other) {
                Some(op) => OpKind::Binary(op),
                None => {
                    return Err(ParseError::new(
                        ParseErrorKind::UnknownOperation,
                        format!("Unknown operation '{}'", other),
                        span,
                    )
                    .into())
                }
            },
        },
        (_, _) => return Err(bad("operation takes no attributes")),
    };
    Ok(kind)
}

fn pipeline_ref(pairs: &[Attr]) -> Option<PipelineRef> {
    let mut symbols = HashMap::new();
    let mut ints = HashMap::new();
    for attr in pairs {
        match attr {
            Attr::Pair(key, value) => match value.as_ref() {
                Attr::Symbol(s) => {
                    symbols.insert(key.as_str(), s.clone());
                }
                Attr::Int(n) if *n >= 0 => {
                    ints.insert(key.as_str(), *n);
                }
                _ => return None,
            },
            _ => return None,
        }
    }
    Some(PipelineRef {
        prologue: symbols.remove("prologue")?,
        steady: symbols.remove("steady")?,
        epilogue: symbols.remove("epilogue")?,
        stage_count: *ints.get("stages")? as u32,
        ii: *ints.get("ii")? as u32,
        num_live_ins: *ints.get("live_ins")? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::printer::print_module;

    fn parse(source: &str) -> PResult<Module> {
        let lexer = Lexer::new(source);
        let mut parser = Parser::new(lexer)?;
        parser.parse_module()
    }

    const SUM: &str = r#"
        // running sum of a buffer
        func @sum(%buf: buffer<i32>, %n: index) -> (i32) {
          %lb = const[0]() : index
          %step = const[1]() : index
          %zero = const[0]() : i32
          %r = for[main](%lb, %n, %step, %zero) : i32 {
            ^(%i: index, %acc: i32):
            %x = load(%buf, %i) : i32
            %s = add(%acc, %x) : i32
            yield(%s)
          }
          return(%r)
        }
    "#;

    #[test]
    fn test_parse_loop() {
        let module = parse(SUM).unwrap();
        let func = module.get("sum").unwrap();
        assert_eq!(func.params().len(), 2);
        assert_eq!(func.op_count(), 6);
    }

    #[test]
    fn test_print_parse_fixed_point() {
        let printed = print_module(&parse(SUM).unwrap());
        let reprinted = print_module(&parse(&printed).unwrap());
        assert_eq!(printed, reprinted);
    }

    #[test]
    fn test_pipelined_for_attrs() {
        let source = r#"
            func @f(%n: index) -> () {
              %lb = const[0]() : index
              %st = const[1]() : index
              for[main, prologue=@k_prologue, steady=@k_steady, epilogue=@k_epilogue, stages=3, ii=2, live_ins=0](%lb, %n, %st) {
                ^(%i: index):
                yield()
              }
              return()
            }
        "#;
        let module = parse(source).unwrap();
        let func = module.get("f").unwrap();
        let for_op = func.block(func.entry()).ops[2];
        match &func.op(for_op).kind {
            OpKind::For { pipeline: Some(p), .. } => {
                assert_eq!(p.steady, "k_steady");
                assert_eq!(p.stage_count, 3);
                assert_eq!(p.ii, 2);
            }
            other => panic!("expected pipelined for, got {:?}", other),
        }
    }

    #[test]
    fn test_func_role_and_info() {
        let source = "func @k() -> () [epilogue, ii=1, stages=2, res_mii=1, rec_mii=0, prologue_ops=3, epilogue_ops=3] { return() }";
        let module = parse(source).unwrap();
        let func = module.get("k").unwrap();
        assert_eq!(func.role, FuncRole::Epilogue);
        assert_eq!(func.info.unwrap().stage_count, 2);
    }

    #[test]
    fn test_undefined_value() {
        let err = parse("func @f() -> () { return(%x) }").unwrap_err();
        match err {
            PipelinerError::Parse(e) => assert_eq!(e.kind, ParseErrorKind::UndefinedValue),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_sibling_regions_reuse_names() {
        let source = r#"
            func @twice(%n: index) -> () {
              %lb = const[0]() : index
              %st = const[1]() : index
              for[main](%lb, %n, %st) {
                ^(%i: index):
                %j = add(%i, %i) : index
                yield()
              }
              for[main](%lb, %n, %st) {
                ^(%i: index):
                %j = add(%i, %st) : index
                yield()
              }
              return()
            }
        "#;
        let module = parse(source).unwrap();
        let func = module.get("twice").unwrap();
        let loops: Vec<_> = func.block(func.entry()).ops[2..4].to_vec();
        let ivs: Vec<_> = loops.iter().map(|&op| func.block(func.op(op).regions[0]).args[0]).collect();
        assert_ne!(ivs[0], ivs[1]);
    }

    #[test]
    fn test_region_values_do_not_escape() {
        let escaping = r#"
            func @f(%n: index) -> (index) {
              %lb = const[0]() : index
              %st = const[1]() : index
              for[main](%lb, %n, %st) {
                ^(%i: index):
                yield()
              }
              return(%i)
            }
        "#;
        assert!(matches!(
            parse(escaping).unwrap_err(),
            PipelinerError::Parse(ParseError { kind: ParseErrorKind::UndefinedValue, .. })
        ));

        let shadowing = r#"
            func @f(%n: index) -> () {
              %lb = const[0]() : index
              %st = const[1]() : index
              for[main](%lb, %n, %st) {
                ^(%n: index):
                yield()
              }
              return()
            }
        "#;
        assert!(matches!(
            parse(shadowing).unwrap_err(),
            PipelinerError::Parse(ParseError { kind: ParseErrorKind::DuplicateDefinition, .. })
        ));
    }

    #[test]
    fn test_unknown_operation_and_bad_type() {
        assert!(matches!(
            parse("func @f() -> () { frobnicate() }").unwrap_err(),
            PipelinerError::Parse(ParseError { kind: ParseErrorKind::UnknownOperation, .. })
        ));
        assert!(matches!(
            parse("func @f(%a: vector<4xf32>) -> () { return() }").unwrap_err(),
            PipelinerError::Parse(ParseError { kind: ParseErrorKind::ExpectedType, .. })
        ));
    }
}
