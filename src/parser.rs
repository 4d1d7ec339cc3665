//! Precedence-climbing parser from tokens to [`Program`]

use std::borrow::Cow;
use std::collections::HashSet;

use tracing::debug;

use crate::ast::{
    BinaryOp, Expr, ExprKind, FunctionDecl, Literal, Position, Program, Stmt, StmtKind, TraitDecl,
    UnaryOp,
};
use crate::error::{ParseError, ParseErrorKind};
use crate::token::{Token, TokenKind};

type PResult<T> = Result<T, ParseError>;

/// Deepest nesting of blocks and expressions the parser accepts. Keeps the
/// recursive parser and compiler within the native stack.
pub const MAX_NESTING: usize = 256;

/// Binding power of the binary operators. Higher binds tighter.
fn binding_power(kind: TokenKind) -> Option<(u8, BinaryOp)> {
    let entry = match kind {
        TokenKind::OrOr => (1, BinaryOp::Or),
        TokenKind::AndAnd => (2, BinaryOp::And),
        TokenKind::EqEq => (3, BinaryOp::Eq),
        TokenKind::NotEq => (3, BinaryOp::NotEq),
        TokenKind::Less => (4, BinaryOp::Less),
        TokenKind::LessEq => (4, BinaryOp::LessEq),
        TokenKind::Greater => (4, BinaryOp::Greater),
        TokenKind::GreaterEq => (4, BinaryOp::GreaterEq),
        TokenKind::Plus => (5, BinaryOp::Add),
        TokenKind::Minus => (5, BinaryOp::Sub),
        TokenKind::Star => (6, BinaryOp::Mul),
        TokenKind::Slash => (6, BinaryOp::Div),
        TokenKind::Percent => (6, BinaryOp::Mod),
        _ => return None,
    };
    Some(entry)
}

/// Parse a token stream ending in [`TokenKind::Eof`] into a program.
pub fn parse(tokens: &[Token]) -> PResult<Program> {
    let tokens: Cow<[Token]> = match tokens.last() {
        Some(last) if last.kind == TokenKind::Eof => Cow::Borrowed(tokens),
        last => {
            let (line, column) = last.map_or((1, 1), |t| (t.line, t.column));
            let mut owned = tokens.to_vec();
            owned.push(Token::new(TokenKind::Eof, "", line, column));
            Cow::Owned(owned)
        }
    };

    let program = Parser::new(&tokens).parse_program()?;
    debug!(items = program.items.len(), "parsed program");
    Ok(program)
}

/// Parser over a token slice that ends with [`TokenKind::Eof`]
struct Parser<'a> {
    tokens: &'a [Token],
    cursor: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Parser {
            tokens,
            cursor: 0,
            depth: 0,
        }
    }

    fn parse_program(&mut self) -> PResult<Program> {
        let mut items = Vec::new();
        while !self.check(TokenKind::Eof) {
            let item = match self.peek().kind {
                TokenKind::Fn => self.parse_function()?,
                TokenKind::Personality => self.parse_personality()?,
                _ => self.parse_statement()?,
            };
            items.push(item);
            self.skip_semicolons();
        }
        Ok(Program { items })
    }

    /// `fn name(a, b) { ... }`
    fn parse_function(&mut self) -> PResult<Stmt> {
        let pos = self.position();
        self.expect(TokenKind::Fn, "'fn'")?;
        let name = self.expect(TokenKind::Identifier, "function name")?.lexeme.clone();

        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                params.push(self.expect(TokenKind::Identifier, "parameter name")?.lexeme.clone());
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;

        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::FunctionDecl(FunctionDecl { name, params, body }),
            pos,
        })
    }

    /// `personality { warmth: 0.8, humor: 1 }`
    fn parse_personality(&mut self) -> PResult<Stmt> {
        let pos = self.position();
        self.expect(TokenKind::Personality, "'personality'")?;
        self.expect(TokenKind::LBrace, "'{'")?;

        let mut traits = Vec::new();
        let mut seen = HashSet::new();
        while !self.check(TokenKind::RBrace) {
            let name_token = self.expect(TokenKind::Identifier, "trait name")?;
            let name = name_token.lexeme.clone();
            let trait_pos = Position::new(name_token.line, name_token.column);
            self.expect(TokenKind::Colon, "':'")?;

            let negative = self.eat(TokenKind::Minus);
            let value_token = self.advance();
            let magnitude = match value_token.kind {
                TokenKind::Integer | TokenKind::Float => value_token.lexeme.parse::<f64>().ok(),
                _ => None,
            };
            let magnitude = match magnitude {
                Some(magnitude) => magnitude,
                None => return Err(self.unexpected(value_token, "number between 0 and 1")),
            };
            let value = if negative { -magnitude } else { magnitude };

            if !(0.0..=1.0).contains(&value) {
                return Err(ParseError {
                    kind: ParseErrorKind::TraitOutOfRange { name, value },
                    line: value_token.line,
                    column: value_token.column,
                    expected: Some("number between 0 and 1".to_string()),
                });
            }
            if !seen.insert(name.clone()) {
                return Err(ParseError {
                    kind: ParseErrorKind::DuplicateTrait(name),
                    line: trait_pos.line,
                    column: trait_pos.column,
                    expected: None,
                });
            }

            traits.push(TraitDecl {
                name,
                value,
                pos: trait_pos,
            });

            if !self.eat(TokenKind::Comma) && !self.check(TokenKind::RBrace) {
                return Err(self.unexpected(self.peek(), "',' or '}'"));
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;

        Ok(Stmt {
            kind: StmtKind::PersonalityBlock(traits),
            pos,
        })
    }

    /// `{ statement* }`
    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.deepen()?;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut statements = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            statements.push(self.parse_statement()?);
            self.skip_semicolons();
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        self.depth -= 1;
        Ok(statements)
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        let pos = self.position();
        let kind = match self.peek().kind {
            TokenKind::Let => {
                self.advance();
                let name = self.expect(TokenKind::Identifier, "variable name")?.lexeme.clone();
                self.expect(TokenKind::Assign, "'='")?;
                let value = self.parse_expression()?;
                StmtKind::Let { name, value }
            }
            TokenKind::If => return self.parse_if(),
            TokenKind::While => {
                self.advance();
                let condition = self.parse_expression()?;
                let body = self.parse_block()?;
                StmtKind::While { condition, body }
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.starts_expression() {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                StmtKind::Return(value)
            }
            TokenKind::Print => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let value = self.parse_expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                StmtKind::Print(value)
            }
            TokenKind::LBrace => StmtKind::Block(self.parse_block()?),
            TokenKind::Fn => return Err(self.nested("function")),
            TokenKind::Personality => return Err(self.nested("personality")),
            _ => StmtKind::Expr(self.parse_expression()?),
        };
        Ok(Stmt { kind, pos })
    }

    /// `if cond { ... } else if cond { ... } else { ... }`
    fn parse_if(&mut self) -> PResult<Stmt> {
        let pos = self.position();
        self.expect(TokenKind::If, "'if'")?;
        let condition = self.parse_expression()?;
        let then_branch = self.parse_block()?;

        let else_branch = if self.eat(TokenKind::Else) {
            if self.check(TokenKind::If) {
                Some(vec![self.descend(Self::parse_if)?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };

        Ok(Stmt {
            kind: StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            pos,
        })
    }

    fn parse_expression(&mut self) -> PResult<Expr> {
        self.descend(Self::parse_assignment)
    }

    /// Assignment is right associative and binds loosest. The target is
    /// validated by the compiler so that `1 = 2` reports the right error.
    fn parse_assignment(&mut self) -> PResult<Expr> {
        let target = self.parse_binary(1)?;
        if self.check(TokenKind::Assign) {
            let pos = self.position();
            self.advance();
            let value = self.parse_expression()?;
            return Ok(Expr::new(
                ExprKind::Assign {
                    target: Box::new(target),
                    value: Box::new(value),
                },
                pos,
            ));
        }
        Ok(target)
    }

    /// Precedence climbing over the binary operator table
    fn parse_binary(&mut self, min_power: u8) -> PResult<Expr> {
        let mut left = self.parse_unary()?;
        let depth = self.depth;

        while let Some((power, op)) = binding_power(self.peek().kind) {
            if power < min_power {
                break;
            }
            // Every operator in a chain nests the left operand one level deeper
            self.deepen()?;
            let pos = self.position();
            self.advance();
            let right = self.parse_binary(power + 1)?;
            left = Expr::new(
                ExprKind::BinaryOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                pos,
            );
        }

        self.depth = depth;
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let pos = self.position();
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.parse_call(),
        };
        self.advance();

        // `-9223372036854775808` has no positive counterpart to negate
        if op == UnaryOp::Neg && self.at_min_integer_magnitude() {
            self.advance();
            return Ok(Expr::new(ExprKind::Literal(Literal::Integer(i64::MIN)), pos));
        }

        let operand = self.descend(Self::parse_unary)?;
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            pos,
        ))
    }

    fn parse_call(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        let depth = self.depth;

        while self.check(TokenKind::LParen) {
            self.deepen()?;
            let pos = self.position();
            self.advance();
            let mut args = Vec::new();
            if !self.check(TokenKind::RParen) {
                loop {
                    args.push(self.parse_expression()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen, "')'")?;
            expr = Expr::new(
                ExprKind::Call {
                    callee: Box::new(expr),
                    args,
                },
                pos,
            );
        }

        self.depth = depth;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let token = self.advance();
        let pos = Position::new(token.line, token.column);

        let kind = match token.kind {
            TokenKind::Integer => match token.lexeme.parse::<i64>() {
                Ok(value) => ExprKind::Literal(Literal::Integer(value)),
                Err(_) => {
                    return Err(ParseError {
                        kind: ParseErrorKind::IntegerOutOfRange(token.lexeme.clone()),
                        line: token.line,
                        column: token.column,
                        expected: None,
                    })
                }
            },
            TokenKind::Float => match token.lexeme.parse::<f64>() {
                Ok(value) => ExprKind::Literal(Literal::Float(value)),
                Err(_) => return Err(self.unexpected(token, "float literal")),
            },
            TokenKind::Str => ExprKind::Literal(Literal::Str(token.lexeme.clone())),
            TokenKind::True => ExprKind::Literal(Literal::Bool(true)),
            TokenKind::False => ExprKind::Literal(Literal::Bool(false)),
            TokenKind::Nil => ExprKind::Literal(Literal::Nil),
            TokenKind::Identifier => ExprKind::Identifier(token.lexeme.clone()),
            TokenKind::LParen => {
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                return Ok(inner);
            }
            TokenKind::Knowledge => {
                self.expect(TokenKind::LParen, "'('")?;
                let query = self.parse_expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                ExprKind::KnowledgeQuery(Box::new(query))
            }
            TokenKind::Voice => {
                self.expect(TokenKind::Dot, "'.'")?;
                let method = self.advance();
                match (method.kind, method.lexeme.as_str()) {
                    (TokenKind::Identifier, "say") => {
                        self.expect(TokenKind::LParen, "'('")?;
                        let text = self.parse_expression()?;
                        self.expect(TokenKind::RParen, "')'")?;
                        ExprKind::VoiceSay(Box::new(text))
                    }
                    (TokenKind::Identifier, "listen") => {
                        self.expect(TokenKind::LParen, "'('")?;
                        self.expect(TokenKind::RParen, "')'")?;
                        ExprKind::VoiceListen
                    }
                    _ => return Err(self.unexpected(method, "'say' or 'listen'")),
                }
            }
            TokenKind::Trait => {
                self.expect(TokenKind::LParen, "'('")?;
                let name = self.advance();
                let name = match name.kind {
                    TokenKind::Identifier | TokenKind::Str => name.lexeme.clone(),
                    _ => return Err(self.unexpected(name, "trait name")),
                };
                self.expect(TokenKind::RParen, "')'")?;
                ExprKind::TraitQuery(name)
            }
            _ => return Err(self.unexpected(token, "expression")),
        };

        Ok(Expr::new(kind, pos))
    }

    fn at_min_integer_magnitude(&self) -> bool {
        let token = self.peek();
        token.kind == TokenKind::Integer
            && token.lexeme.parse::<u64>() == Ok(i64::MIN.unsigned_abs())
    }

    /// Run `parse` one nesting level deeper
    fn descend<T>(&mut self, parse: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        self.deepen()?;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn deepen(&mut self) -> PResult<()> {
        if self.depth >= MAX_NESTING {
            let token = self.peek();
            return Err(ParseError {
                kind: ParseErrorKind::NestingTooDeep { limit: MAX_NESTING },
                line: token.line,
                column: token.column,
                expected: None,
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn starts_expression(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Integer
                | TokenKind::Float
                | TokenKind::Str
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Nil
                | TokenKind::Identifier
                | TokenKind::LParen
                | TokenKind::Minus
                | TokenKind::Bang
                | TokenKind::Knowledge
                | TokenKind::Voice
                | TokenKind::Trait
        )
    }

    fn skip_semicolons(&mut self) {
        while self.eat(TokenKind::Semicolon) {}
    }

    /// The current token. The trailing Eof is returned forever once reached.
    fn peek(&self) -> &'a Token {
        let tokens: &'a [Token] = self.tokens;
        &tokens[self.cursor.min(tokens.len() - 1)]
    }

    fn advance(&mut self) -> &'a Token {
        let token = self.peek();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> PResult<&'a Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            let token = self.peek();
            Err(self.unexpected(token, expected))
        }
    }

    fn position(&self) -> Position {
        let token = self.peek();
        Position::new(token.line, token.column)
    }

    fn unexpected(&self, token: &Token, expected: &str) -> ParseError {
        let found = match token.kind {
            TokenKind::Eof => token.kind.describe().to_string(),
            TokenKind::Str => format!("string \"{}\"", token.lexeme),
            TokenKind::Identifier | TokenKind::Integer | TokenKind::Float => {
                format!("{} '{}'", token.kind.describe(), token.lexeme)
            }
            kind => kind.describe().to_string(),
        };
        ParseError {
            kind: ParseErrorKind::UnexpectedToken { found },
            line: token.line,
            column: token.column,
            expected: Some(expected.to_string()),
        }
    }

    fn nested(&self, what: &'static str) -> ParseError {
        let token = self.peek();
        ParseError {
            kind: ParseErrorKind::NestedDeclaration(what),
            line: token.line,
            column: token.column,
            expected: Some("statement".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_source(source: &str) -> PResult<Program> {
        parse(&tokenize(source).unwrap())
    }

    fn expr_of(source: &str) -> Expr {
        match parse_source(source).unwrap().items.remove(0).kind {
            StmtKind::Expr(expr) => expr,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn precedence() {
        let expr = expr_of("1 + 2 * 3");
        match expr.kind {
            ExprKind::BinaryOp { op, left, right } => {
                assert_eq!(op, BinaryOp::Add);
                assert_eq!(left.kind, ExprKind::Literal(Literal::Integer(1)));
                assert!(matches!(right.kind, ExprKind::BinaryOp { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn left_associative() {
        let expr = expr_of("10 - 4 - 3");
        match expr.kind {
            ExprKind::BinaryOp { op: BinaryOp::Sub, left, right } => {
                assert!(matches!(left.kind, ExprKind::BinaryOp { op: BinaryOp::Sub, .. }));
                assert_eq!(right.kind, ExprKind::Literal(Literal::Integer(3)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn assignment_is_right_associative() {
        let expr = expr_of("a = b = 1");
        match expr.kind {
            ExprKind::Assign { target, value } => {
                assert_eq!(target.kind, ExprKind::Identifier("a".to_string()));
                assert!(matches!(value.kind, ExprKind::Assign { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn function_and_call() {
        let program = parse_source("fn main() { print(\"hi\") } main()").unwrap();
        assert_eq!(program.items.len(), 2);

        match &program.items[0].kind {
            StmtKind::FunctionDecl(decl) => {
                assert_eq!(decl.name, "main");
                assert!(decl.params.is_empty());
                assert_eq!(decl.body.len(), 1);
                assert!(matches!(decl.body[0].kind, StmtKind::Print(_)));
            }
            other => panic!("unexpected {:?}", other),
        }

        match &program.items[1].kind {
            StmtKind::Expr(Expr {
                kind: ExprKind::Call { callee, args },
                ..
            }) => {
                assert_eq!(callee.kind, ExprKind::Identifier("main".to_string()));
                assert!(args.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn domain_forms() {
        assert!(matches!(
            expr_of("knowledge(\"capital of France\")").kind,
            ExprKind::KnowledgeQuery(_)
        ));
        assert!(matches!(expr_of("voice.say(\"hello\")").kind, ExprKind::VoiceSay(_)));
        assert_eq!(expr_of("voice.listen()").kind, ExprKind::VoiceListen);
        assert_eq!(
            expr_of("trait(warmth)").kind,
            ExprKind::TraitQuery("warmth".to_string())
        );
    }

    #[test]
    fn voice_requires_known_method() {
        let err = parse_source("voice.shout(\"x\")").unwrap_err();
        assert_eq!(err.expected.as_deref(), Some("'say' or 'listen'"));
        assert_eq!((err.line, err.column), (1, 7));
    }

    #[test]
    fn personality_block() {
        let program = parse_source("personality { warmth: 0.8, humor: 1, calm: 0 }").unwrap();
        match &program.items[0].kind {
            StmtKind::PersonalityBlock(traits) => {
                let values: Vec<(&str, f64)> =
                    traits.iter().map(|t| (t.name.as_str(), t.value)).collect();
                assert_eq!(values, vec![("warmth", 0.8), ("humor", 1.0), ("calm", 0.0)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn trait_out_of_range() {
        let err = parse_source("personality { x: 1.5 }").unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::TraitOutOfRange {
                name: "x".to_string(),
                value: 1.5
            }
        );
        assert_eq!((err.line, err.column), (1, 18));

        let err = parse_source("personality { x: -0.1 }").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::TraitOutOfRange { .. }));
    }

    #[test]
    fn duplicate_trait() {
        let err = parse_source("personality { x: 0.1, x: 0.2 }").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::DuplicateTrait("x".to_string()));
    }

    #[test]
    fn nested_function_rejected() {
        let err = parse_source("fn outer() { fn inner() {} }").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::NestedDeclaration("function"));
    }

    fn assert_too_deep(source: &str) {
        let err = parse_source(source).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::NestingTooDeep { limit: MAX_NESTING });
    }

    #[test]
    fn deep_nesting_rejected() {
        let parens = format!("print({}1{})", "(".repeat(1000), ")".repeat(1000));
        assert_too_deep(&parens);
        assert_too_deep(&format!("print({}true)", "!".repeat(1000)));
        assert_too_deep(&format!("print({}1)", "- ".repeat(1000)));
        assert_too_deep(&format!("{}{}", "if true { ".repeat(300), "}".repeat(300)));
        assert_too_deep(&format!("print(0{})", " + 1".repeat(1000)));
        assert_too_deep(&format!("f{}", "()".repeat(1000)));

        let err = parse_source(&parens).unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.column > 200);
    }

    #[test]
    fn moderate_nesting_accepted() {
        let source = format!("print({}1{})", "(".repeat(100), ")".repeat(100));
        assert!(parse_source(&source).is_ok());

        let source = format!("{}{}", "if true { ".repeat(50), "}".repeat(50));
        assert!(parse_source(&source).is_ok());
    }

    #[test]
    fn min_integer_literal() {
        let expr = expr_of("-9223372036854775808");
        assert_eq!(expr.kind, ExprKind::Literal(Literal::Integer(i64::MIN)));

        let err = parse_source("9223372036854775808").unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::IntegerOutOfRange("9223372036854775808".to_string())
        );
    }

    #[test]
    fn if_else_chain() {
        let program =
            parse_source("if a { print(1) } else if b { print(2) } else { print(3) }").unwrap();
        match &program.items[0].kind {
            StmtKind::If { else_branch, .. } => {
                let else_branch = else_branch.as_ref().unwrap();
                assert!(matches!(
                    else_branch[0].kind,
                    StmtKind::If {
                        else_branch: Some(_),
                        ..
                    }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bare_return() {
        let program = parse_source("fn f() { return }").unwrap();
        match &program.items[0].kind {
            StmtKind::FunctionDecl(decl) => {
                assert_eq!(decl.body[0].kind, StmtKind::Return(None))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn first_error_reports_expected_token() {
        let err = parse_source("let = 5").unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::UnexpectedToken {
                found: "'='".to_string()
            }
        );
        assert_eq!(err.expected.as_deref(), Some("variable name"));
        assert_eq!((err.line, err.column), (1, 5));
    }

    #[test]
    fn unclosed_block() {
        let err = parse_source("while x { print(x)").unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::UnexpectedToken {
                found: "end of input".to_string()
            }
        );
        assert_eq!(err.expected.as_deref(), Some("'}'"));
    }

    #[test]
    fn tokens_without_eof() {
        let mut tokens = tokenize("print(1)").unwrap();
        tokens.pop();
        assert_eq!(parse(&tokens).unwrap().items.len(), 1);
        assert!(parse(&[]).unwrap().items.is_empty());
    }
}
