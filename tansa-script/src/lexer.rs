//! 字句解析
//!
//! ソースを論理行に分け、各行のインデント幅とトークン列を返します。
//! 空行とコメントだけの行は含みません。

use crate::parser::ParseError;

/// トークン
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Int(i64),
    Str(String),
    Name(String),
    Op(&'static str),
}

impl Token {
    pub fn is_op(&self, op: &str) -> bool {
        matches!(self, Token::Op(o) if *o == op)
    }

    pub fn is_name(&self, name: &str) -> bool {
        matches!(self, Token::Name(n) if n == name)
    }
}

/// 1行分のトークン
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// 1始まりの行番号
    pub number: u32,
    pub indent: usize,
    pub tokens: Vec<Token>,
}

/// 長いものから順に照合する
const OPERATORS: [&str; 20] = [
    "==", "!=", "<=", ">=", "<", ">", "=", "+", "-", "*", "/", "%", "(", ")", "[", "]", "{", "}",
    ",", ":",
];

pub fn tokenize(source: &str) -> Result<Vec<SourceLine>, ParseError> {
    let mut lines = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let number = index as u32 + 1;
        let indent = text.chars().take_while(|c| *c == ' ').count();
        if text[indent..].starts_with('\t') {
            return Err(ParseError::new(number, "tabs are not allowed in indentation"));
        }
        let tokens = tokenize_line(&text[indent..], number)?;
        if !tokens.is_empty() {
            lines.push(SourceLine {
                number,
                indent,
                tokens,
            });
        }
    }
    Ok(lines)
}

/// 1行だけを字句解析する（式の評価用）
pub fn tokenize_line(text: &str, number: u32) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '#' {
            break;
        } else if c.is_ascii_digit() {
            let mut end = start;
            while let Some(&(i, d)) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                end = i + d.len_utf8();
                chars.next();
            }
            let digits = &text[start..end];
            let value = digits
                .parse()
                .map_err(|_| ParseError::new(number, format!("integer too large: {}", digits)))?;
            tokens.push(Token::Int(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut end = start;
            while let Some(&(i, d)) = chars.peek() {
                if !(d.is_alphanumeric() || d == '_') {
                    break;
                }
                end = i + d.len_utf8();
                chars.next();
            }
            tokens.push(Token::Name(text[start..end].to_string()));
        } else if c == '"' || c == '\'' {
            chars.next();
            tokens.push(Token::Str(read_string(&mut chars, c, number)?));
        } else {
            let rest = &text[start..];
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| ParseError::new(number, format!("unexpected character {:?}", c)))?;
            for _ in 0..op.len() {
                chars.next();
            }
            tokens.push(Token::Op(op));
        }
    }
    Ok(tokens)
}

fn read_string<I>(chars: &mut I, quote: char, number: u32) -> Result<String, ParseError>
where
    I: Iterator<Item = (usize, char)>,
{
    let mut out = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            c if c == quote => return Ok(out),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err(ParseError::new(number, "unterminated string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lines() {
        let source = "x = 1\n\n# comment\nif x >= 10:\n    print 'a\\'b'  # trailing\n";
        let lines = tokenize(source).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].number, 1);
        assert_eq!(
            lines[0].tokens,
            vec![Token::Name("x".into()), Token::Op("="), Token::Int(1)]
        );
        assert_eq!(lines[1].number, 4);
        assert!(lines[1].tokens[2].is_op(">="));
        assert_eq!(lines[2].indent, 4);
        assert_eq!(lines[2].tokens[1], Token::Str("a'b".into()));
    }

    #[test]
    fn test_tokenize_errors() {
        assert!(tokenize("x = 'open\n").is_err());
        assert!(tokenize("x = 1 $ 2\n").is_err());
        assert!(tokenize("if x:\n\tpass\n").is_err());
    }
}
