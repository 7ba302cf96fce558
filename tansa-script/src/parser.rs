//! 構文解析
//!
//! 行ごとのトークン列をインデントに従ってブロックにまとめ、
//! 式は再帰下降で解析します。

use crate::ast::{BinaryOp, Expr, FunctionDef, Handler, Program, Stmt, StmtKind, Target};
use crate::lexer::{tokenize, tokenize_line, SourceLine, Token};
use crate::{Result, ScriptError};
use std::fmt;
use std::sync::Arc;

/// 構文エラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl ParseError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }

    pub fn into_script_error(self, file: &str) -> ScriptError {
        ScriptError::Parse {
            file: file.to_string(),
            line: self.line,
            message: self.message,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

const KEYWORDS: [&str; 19] = [
    "if", "elif", "else", "while", "def", "return", "print", "pass", "try", "except", "raise",
    "spawn", "global", "and", "or", "not", "True", "False", "None",
];

/// ファイル全体を解析する
pub fn parse_program(file: &str, source: &str) -> Result<Program> {
    let file: Arc<str> = file.into();
    let lines = tokenize(source).map_err(|err| err.into_script_error(&file))?;
    let mut parser = BlockParser {
        lines: &lines,
        pos: 0,
        file: file.clone(),
    };
    let body = parser
        .parse_block(0)
        .map_err(|err| err.into_script_error(&file))?;
    if let Some(line) = lines.get(parser.pos) {
        return Err(ParseError::new(line.number, "unexpected indent").into_script_error(&file));
    }
    Ok(Program { file, body })
}

/// 1行の単純文を解析する（デバッガからの評価用）
pub fn parse_snippet(source: &str) -> std::result::Result<Stmt, ParseError> {
    let tokens = tokenize_line(source.trim(), 0)?;
    if tokens.is_empty() {
        return Err(ParseError::new(0, "empty expression"));
    }
    if tokens.last().is_some_and(|t| t.is_op(":")) {
        return Err(ParseError::new(0, "compound statements cannot be evaluated"));
    }
    let line = SourceLine {
        number: 0,
        indent: 0,
        tokens,
    };
    simple_statement(&line)
}

/// 式だけを解析する
pub fn parse_expression(source: &str) -> std::result::Result<Expr, ParseError> {
    let tokens = tokenize_line(source.trim(), 0)?;
    let mut parser = ExprParser::new(&tokens, 0);
    let expr = parser.expression()?;
    parser.finish()?;
    Ok(expr)
}

struct BlockParser<'a> {
    lines: &'a [SourceLine],
    pos: usize,
    file: Arc<str>,
}

impl<'a> BlockParser<'a> {
    fn parse_block(&mut self, indent: usize) -> std::result::Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        while let Some(line) = self.lines.get(self.pos) {
            if line.indent < indent {
                break;
            }
            if line.indent > indent {
                return Err(ParseError::new(line.number, "unexpected indent"));
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    /// ヘッダ行の次から始まるブロック
    fn nested_block(&mut self, header: &SourceLine) -> std::result::Result<Vec<Stmt>, ParseError> {
        match self.lines.get(self.pos) {
            Some(next) if next.indent > header.indent => self.parse_block(next.indent),
            _ => Err(ParseError::new(header.number, "expected an indented block")),
        }
    }

    /// 次の行が同じインデントの指定キーワードで始まるか
    fn next_is(&self, indent: usize, keyword: &str) -> bool {
        self.lines
            .get(self.pos)
            .is_some_and(|line| line.indent == indent && line.tokens[0].is_name(keyword))
    }

    fn statement(&mut self) -> std::result::Result<Stmt, ParseError> {
        let lines = self.lines;
        let line = &lines[self.pos];
        self.pos += 1;

        if !line.tokens.last().is_some_and(|t| t.is_op(":")) {
            return simple_statement(line);
        }
        let header = &line.tokens[..line.tokens.len() - 1];
        let keyword = match header.first() {
            Some(Token::Name(name)) => name.as_str(),
            _ => return Err(ParseError::new(line.number, "invalid syntax")),
        };

        let kind = match keyword {
            "if" => {
                let mut branches = vec![(header_expr(line, header)?, self.nested_block(line)?)];
                let mut orelse = Vec::new();
                loop {
                    if self.next_is(line.indent, "elif") {
                        let elif = &lines[self.pos];
                        self.pos += 1;
                        let tokens = compound_header(elif)?;
                        branches.push((header_expr(elif, tokens)?, self.nested_block(elif)?));
                    } else if self.next_is(line.indent, "else") {
                        let other = &lines[self.pos];
                        self.pos += 1;
                        expect_bare(other, compound_header(other)?)?;
                        orelse = self.nested_block(other)?;
                        break;
                    } else {
                        break;
                    }
                }
                StmtKind::If { branches, orelse }
            }

            "while" => StmtKind::While {
                condition: header_expr(line, header)?,
                body: self.nested_block(line)?,
            },

            "def" => {
                let (name, params) = function_header(line, &header[1..])?;
                StmtKind::Def(Arc::new(FunctionDef {
                    name,
                    params,
                    body: self.nested_block(line)?,
                    file: self.file.clone(),
                    line: line.number,
                }))
            }

            "try" => {
                expect_bare(line, header)?;
                let body = self.nested_block(line)?;
                let mut handlers = Vec::new();
                while self.next_is(line.indent, "except") {
                    let except = &lines[self.pos];
                    self.pos += 1;
                    let tokens = compound_header(except)?;
                    let type_name = match &tokens[1..] {
                        [] => None,
                        [Token::Name(name)] => Some(name.clone()),
                        _ => return Err(ParseError::new(except.number, "expected an exception name")),
                    };
                    handlers.push(Handler {
                        type_name,
                        body: self.nested_block(except)?,
                    });
                }
                if handlers.is_empty() {
                    return Err(ParseError::new(line.number, "try without except"));
                }
                StmtKind::Try { body, handlers }
            }

            other => {
                return Err(ParseError::new(
                    line.number,
                    format!("unexpected block after {}", other),
                ))
            }
        };
        Ok(Stmt {
            line: line.number,
            kind,
        })
    }
}

fn compound_header(line: &SourceLine) -> std::result::Result<&[Token], ParseError> {
    match line.tokens.split_last() {
        Some((last, header)) if last.is_op(":") => Ok(header),
        _ => Err(ParseError::new(line.number, "expected ':'")),
    }
}

fn expect_bare(line: &SourceLine, header: &[Token]) -> std::result::Result<(), ParseError> {
    if header.len() == 1 {
        Ok(())
    } else {
        Err(ParseError::new(line.number, "unexpected tokens before ':'"))
    }
}

fn header_expr(line: &SourceLine, header: &[Token]) -> std::result::Result<Expr, ParseError> {
    let mut parser = ExprParser::new(&header[1..], line.number);
    let expr = parser.expression()?;
    parser.finish()?;
    Ok(expr)
}

fn function_header(
    line: &SourceLine,
    tokens: &[Token],
) -> std::result::Result<(String, Vec<String>), ParseError> {
    let err = || ParseError::new(line.number, "invalid function definition");
    let (name, rest) = match tokens {
        [Token::Name(name), rest @ ..] if !KEYWORDS.contains(&name.as_str()) => (name.clone(), rest),
        _ => return Err(err()),
    };
    let inner = match rest {
        [open, inner @ .., close] if open.is_op("(") && close.is_op(")") => inner,
        _ => return Err(err()),
    };

    let mut params = Vec::new();
    for (i, token) in inner.iter().enumerate() {
        match token {
            Token::Name(param) if i % 2 == 0 => {
                if params.contains(param) {
                    return Err(ParseError::new(
                        line.number,
                        format!("duplicate parameter {}", param),
                    ));
                }
                params.push(param.clone());
            }
            t if i % 2 == 1 && t.is_op(",") => {}
            _ => return Err(err()),
        }
    }
    Ok((name, params))
}

fn simple_statement(line: &SourceLine) -> std::result::Result<Stmt, ParseError> {
    let tokens = &line.tokens;
    let number = line.number;
    let keyword = match &tokens[0] {
        Token::Name(name) => name.as_str(),
        _ => "",
    };

    let kind = match keyword {
        "pass" if tokens.len() == 1 => StmtKind::Pass,

        "print" => {
            let mut parser = ExprParser::new(&tokens[1..], number);
            let mut values = Vec::new();
            if !parser.at_end() {
                values.push(parser.expression()?);
                while parser.eat_op(",") {
                    values.push(parser.expression()?);
                }
            }
            parser.finish()?;
            StmtKind::Print(values)
        }

        "return" => {
            let mut parser = ExprParser::new(&tokens[1..], number);
            let value = if parser.at_end() {
                None
            } else {
                Some(parser.expression()?)
            };
            parser.finish()?;
            StmtKind::Return(value)
        }

        "raise" => {
            let type_name = match tokens.get(1) {
                Some(Token::Name(name)) => name.clone(),
                _ => return Err(ParseError::new(number, "expected an exception name")),
            };
            let mut parser = ExprParser::new(&tokens[2..], number);
            let message = if parser.eat_op("(") {
                let message = if parser.peek().is_some_and(|t| t.is_op(")")) {
                    None
                } else {
                    Some(parser.expression()?)
                };
                parser.expect_op(")")?;
                message
            } else {
                None
            };
            parser.finish()?;
            StmtKind::Raise { type_name, message }
        }

        "spawn" => {
            let mut parser = ExprParser::new(&tokens[1..], number);
            let expr = parser.expression()?;
            parser.finish()?;
            match expr {
                Expr::Call { callee, args } => StmtKind::Spawn {
                    callee: *callee,
                    args,
                },
                _ => return Err(ParseError::new(number, "spawn expects a call")),
            }
        }

        "global" => {
            let mut names = Vec::new();
            for (i, token) in tokens[1..].iter().enumerate() {
                match token {
                    Token::Name(name) if i % 2 == 0 => names.push(name.clone()),
                    t if i % 2 == 1 && t.is_op(",") => {}
                    _ => return Err(ParseError::new(number, "invalid global declaration")),
                }
            }
            if names.is_empty() {
                return Err(ParseError::new(number, "invalid global declaration"));
            }
            StmtKind::Global(names)
        }

        "if" | "elif" | "else" | "while" | "def" | "try" | "except" => {
            return Err(ParseError::new(number, "expected ':'"))
        }

        _ => {
            let mut parser = ExprParser::new(tokens, number);
            let expr = parser.expression()?;
            if parser.eat_op("=") {
                let target = match expr {
                    Expr::Name(name) => Target::Name(name),
                    Expr::Index { target, index } => Target::Index {
                        target: *target,
                        index: *index,
                    },
                    _ => return Err(ParseError::new(number, "cannot assign to expression")),
                };
                let value = parser.expression()?;
                parser.finish()?;
                StmtKind::Assign { target, value }
            } else {
                parser.finish()?;
                StmtKind::Expr(expr)
            }
        }
    };
    Ok(Stmt { line: number, kind })
}

struct ExprParser<'t> {
    tokens: &'t [Token],
    pos: usize,
    line: u32,
}

impl<'t> ExprParser<'t> {
    fn new(tokens: &'t [Token], line: u32) -> Self {
        Self {
            tokens,
            pos: 0,
            line,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, message)
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn finish(&self) -> std::result::Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_op(op)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_name(&mut self, name: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_name(name)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> std::result::Result<(), ParseError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn expression(&mut self) -> std::result::Result<Expr, ParseError> {
        let mut left = self.and_expr()?;
        while self.eat_name("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> std::result::Result<Expr, ParseError> {
        let mut left = self.not_expr()?;
        while self.eat_name("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> std::result::Result<Expr, ParseError> {
        if self.eat_name("not") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> std::result::Result<Expr, ParseError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => BinaryOp::Eq,
            Some(Token::Op("!=")) => BinaryOp::Ne,
            Some(Token::Op("<")) => BinaryOp::Lt,
            Some(Token::Op("<=")) => BinaryOp::Le,
            Some(Token::Op(">")) => BinaryOp::Gt,
            Some(Token::Op(">=")) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(binary(op, left, right))
    }

    fn additive(&mut self) -> std::result::Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOp::Add,
                Some(Token::Op("-")) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = binary(op, left, right);
        }
    }

    fn term(&mut self) -> std::result::Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOp::Mul,
                Some(Token::Op("/")) => BinaryOp::Div,
                Some(Token::Op("%")) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> std::result::Result<Expr, ParseError> {
        if self.eat_op("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> std::result::Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_op("(") {
                let args = self.sequence(")")?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let index = self.expression()?;
                self.expect_op("]")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// 閉じ括弧までのカンマ区切りの式
    fn sequence(&mut self, close: &str) -> std::result::Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        if self.eat_op(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            if self.eat_op(close) {
                return Ok(items);
            }
            self.expect_op(",")?;
            // 末尾のカンマ
            if self.eat_op(close) {
                return Ok(items);
            }
        }
    }

    fn primary(&mut self) -> std::result::Result<Expr, ParseError> {
        let token = self
            .peek()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Int(value) => Ok(Expr::Int(*value)),
            Token::Str(value) => Ok(Expr::Str(value.as_str().into())),
            Token::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "None" => Ok(Expr::None),
                keyword if KEYWORDS.contains(&keyword) => {
                    Err(self.error(format!("unexpected keyword {}", keyword)))
                }
                _ => Ok(Expr::Name(name.clone())),
            },
            Token::Op("(") => {
                let expr = self.expression()?;
                self.expect_op(")")?;
                Ok(expr)
            }
            Token::Op("[") => Ok(Expr::List(self.sequence("]")?)),
            Token::Op("{") => {
                let mut entries = Vec::new();
                if self.eat_op("}") {
                    return Ok(Expr::Dict(entries));
                }
                loop {
                    let key = self.expression()?;
                    self.expect_op(":")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if self.eat_op("}") {
                        return Ok(Expr::Dict(entries));
                    }
                    self.expect_op(",")?;
                    if self.eat_op("}") {
                        return Ok(Expr::Dict(entries));
                    }
                }
            }
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let expr = parse_expression("1 + 2 * 3 == 7 and not x").unwrap();
        let Expr::And(left, right) = expr else {
            panic!("expected and");
        };
        assert!(matches!(*right, Expr::Not(_)));
        let Expr::Binary { op: BinaryOp::Eq, left: sum, .. } = *left else {
            panic!("expected comparison");
        };
        assert!(matches!(
            *sum,
            Expr::Binary {
                op: BinaryOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn test_blocks() {
        let source = "\
def f(a, b):
    if a > b:
        return a
    elif a == b:
        pass
    else:
        return b
x = f(1, 2)
try:
    raise ValueError('bad')
except ValueError:
    print 'caught'
";
        let program = parse_program("a.src", source).unwrap();
        assert_eq!(program.body.len(), 3);
        let StmtKind::Def(def) = &program.body[0].kind else {
            panic!("expected def");
        };
        assert_eq!(def.params, vec!["a", "b"]);
        assert_eq!(def.line, 1);
        let StmtKind::If { branches, orelse } = &def.body[0].kind else {
            panic!("expected if");
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(orelse[0].line, 7);
        assert_eq!(program.body[1].line, 8);
        assert!(matches!(program.body[2].kind, StmtKind::Try { .. }));
    }

    #[test]
    fn test_snippets() {
        assert!(matches!(
            parse_snippet("xs[0] = 5").unwrap().kind,
            StmtKind::Assign {
                target: Target::Index { .. },
                ..
            }
        ));
        assert!(matches!(parse_snippet("len(xs)").unwrap().kind, StmtKind::Expr(_)));
        assert!(parse_snippet("while True:").is_err());
        assert!(parse_snippet("").is_err());
    }

    #[test]
    fn test_syntax_errors() {
        let err = parse_program("a.src", "x = 1\n    y = 2\n").unwrap_err();
        assert!(matches!(err, ScriptError::Parse { line: 2, .. }));
        assert!(parse_program("a.src", "if x:\ny = 1\n").is_err());
        assert!(parse_program("a.src", "def f(a, a):\n    pass\n").is_err());
        assert!(parse_program("a.src", "1 = x\n").is_err());
    }
}
