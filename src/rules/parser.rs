//! Rule text parsing.
//!
//! Grammar (`&&` binds tighter than `||`, `!` tighter than both):
//! ```text
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" or ")" | NAME "(" [ LITERAL ( "," LITERAL )* ] ")"
//! LITERAL := `...` | "..."
//! ```

use super::RuleError;

/// Syntax tree of a rule, before matcher names are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Call { name: String, args: Vec<String> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Collect the arguments of every call named `matcher` (case-insensitive).
    pub fn values_of(&self, matcher: &str) -> Vec<String> {
        let mut values = Vec::new();
        self.collect_values(matcher, &mut values);
        values
    }

    fn collect_values(&self, matcher: &str, out: &mut Vec<String>) {
        match self {
            Expr::Call { name, args } => {
                if name.eq_ignore_ascii_case(matcher) {
                    out.extend(args.iter().cloned());
                }
            }
            Expr::Not(inner) => inner.collect_values(matcher, out),
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.collect_values(matcher, out);
                rhs.collect_values(matcher, out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Name(String),
    Literal(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
}

fn syntax(offset: usize, message: impl Into<String>) -> RuleError {
    RuleError::Syntax {
        offset,
        message: message.into(),
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, RuleError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | '!' => {
                chars.next();
                let token = match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    _ => Token::Not,
                };
                tokens.push((offset, token));
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        let token = if c == '&' { Token::And } else { Token::Or };
                        tokens.push((offset, token));
                    }
                    _ => return Err(syntax(offset, format!("expected \"{c}{c}\""))),
                }
            }
            '`' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '`')) => break,
                        Some((_, ch)) => value.push(ch),
                        None => return Err(syntax(offset, "unterminated literal")),
                    }
                }
                tokens.push((offset, Token::Literal(value)));
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, ch)) => value.push(ch),
                            None => return Err(syntax(offset, "unterminated literal")),
                        },
                        Some((_, ch)) => value.push(ch),
                        None => return Err(syntax(offset, "unterminated literal")),
                    }
                }
                tokens.push((offset, Token::Literal(value)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        name.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((offset, Token::Name(name)));
            }
            other => return Err(syntax(offset, format!("unexpected character {other:?}"))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.end)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, RuleError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, RuleError> {
        let offset = self.offset();
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                let close = self.offset();
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax(close, "expected \")\"")),
                }
            }
            Some(Token::Name(name)) => {
                let open = self.offset();
                if self.bump() != Some(Token::LParen) {
                    return Err(syntax(open, format!("expected \"(\" after {name}")));
                }
                let args = self.arguments()?;
                Ok(Expr::Call { name, args })
            }
            Some(_) => Err(syntax(offset, "expected matcher or \"(\"")),
            None => Err(syntax(offset, "unexpected end of rule")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<String>, RuleError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            let offset = self.offset();
            match self.bump() {
                Some(Token::Literal(value)) => args.push(value),
                _ => return Err(syntax(offset, "expected quoted argument")),
            }
            let offset = self.offset();
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err(syntax(offset, "expected \",\" or \")\"")),
            }
        }
    }
}

/// Parse rule text into a syntax tree.
pub fn parse(rule: &str) -> Result<Expr, RuleError> {
    if rule.trim().is_empty() {
        return Err(RuleError::Empty);
    }

    let mut parser = Parser {
        tokens: tokenize(rule)?,
        pos: 0,
        end: rule.len(),
    };
    let expr = parser.or_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(syntax(parser.offset(), "unexpected trailing input"));
    }
    Ok(expr)
}
