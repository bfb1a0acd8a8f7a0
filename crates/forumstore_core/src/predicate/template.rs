//! Format-style predicate templates.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or      := and (("OR" | "||") and)*
//! and     := unary (("AND" | "&&") unary)*
//! unary   := ("NOT" | "!") unary | primary
//! primary := "(" or ")" | "TRUEPREDICATE" | "FALSEPREDICATE" | key op options? operand
//! key     := identifier ("." identifier)* | %K
//! op      := == | = | != | <> | < | <= | > | >= | CONTAINS | BEGINSWITH | ENDSWITH | IN
//! operand := literal | %@ | %d | %i | %f | "{" operand ("," operand)* "}"
//! ```
//!
//! Keywords are case-insensitive. Placeholders are counted before parsing so
//! argument count errors are reported even when the template is otherwise valid.

use super::{
    Comparison, ComparisonOp, InvalidPredicateError, KeyPath, Predicate, PredicateResult,
};
use crate::model::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    /// `%@`
    Any,
    /// `%K`
    Key,
    /// `%d`, `%i`
    Integer,
    /// `%f`
    Number,
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word(String),
    Text(String),
    Integer(i64),
    Real(f64),
    Placeholder(Placeholder),
    Op(ComparisonOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Options(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

pub(super) fn parse(template: &str, args: Vec<Value>) -> PredicateResult<Predicate> {
    let tokens = tokenize(template)?;
    let expected = tokens
        .iter()
        .filter(|token| matches!(token.kind, TokenKind::Placeholder(_)))
        .count();
    if expected != args.len() {
        return Err(InvalidPredicateError::ArgumentCount {
            expected,
            supplied: args.len(),
        });
    }
    if tokens.is_empty() {
        return Err(syntax(0, "empty predicate template"));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        args: args.into_iter(),
        next_arg: 0,
        expected_args: expected,
        end: template.len(),
    };
    let predicate = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(syntax(token.offset, "unexpected trailing input"));
    }
    Ok(predicate)
}

fn syntax(offset: usize, message: impl Into<String>) -> InvalidPredicateError {
    InvalidPredicateError::Syntax {
        offset,
        message: message.into(),
    }
}

fn tokenize(template: &str) -> PredicateResult<Vec<Token>> {
    let chars: Vec<(usize, char)> = template.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, ch) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let push = |tokens: &mut Vec<Token>, kind: TokenKind| tokens.push(Token { kind, offset });

        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        match (ch, next) {
            ('=', Some('=')) | ('=', Some('<')) | ('=', Some('>')) => {
                let op = match next {
                    Some('<') => ComparisonOp::LessOrEqual,
                    Some('>') => ComparisonOp::GreaterOrEqual,
                    _ => ComparisonOp::Equal,
                };
                push(&mut tokens, TokenKind::Op(op));
                i += 2;
            }
            ('=', _) => {
                push(&mut tokens, TokenKind::Op(ComparisonOp::Equal));
                i += 1;
            }
            ('!', Some('=')) | ('<', Some('>')) => {
                push(&mut tokens, TokenKind::Op(ComparisonOp::NotEqual));
                i += 2;
            }
            ('!', _) => {
                push(&mut tokens, TokenKind::Not);
                i += 1;
            }
            ('<', Some('=')) => {
                push(&mut tokens, TokenKind::Op(ComparisonOp::LessOrEqual));
                i += 2;
            }
            ('<', _) => {
                push(&mut tokens, TokenKind::Op(ComparisonOp::Less));
                i += 1;
            }
            ('>', Some('=')) => {
                push(&mut tokens, TokenKind::Op(ComparisonOp::GreaterOrEqual));
                i += 2;
            }
            ('>', _) => {
                push(&mut tokens, TokenKind::Op(ComparisonOp::Greater));
                i += 1;
            }
            ('&', Some('&')) => {
                push(&mut tokens, TokenKind::And);
                i += 2;
            }
            ('|', Some('|')) => {
                push(&mut tokens, TokenKind::Or);
                i += 2;
            }
            ('(', _) => {
                push(&mut tokens, TokenKind::LParen);
                i += 1;
            }
            (')', _) => {
                push(&mut tokens, TokenKind::RParen);
                i += 1;
            }
            ('{', _) => {
                push(&mut tokens, TokenKind::LBrace);
                i += 1;
            }
            ('}', _) => {
                push(&mut tokens, TokenKind::RBrace);
                i += 1;
            }
            (',', _) => {
                push(&mut tokens, TokenKind::Comma);
                i += 1;
            }
            ('[', _) => {
                let close = chars[i..]
                    .iter()
                    .position(|(_, c)| *c == ']')
                    .ok_or_else(|| syntax(offset, "unterminated comparison option"))?;
                let option: String = chars[i + 1..i + close].iter().map(|(_, c)| c).collect();
                push(&mut tokens, TokenKind::Options(option));
                i += close + 1;
            }
            ('%', _) => {
                let placeholder = match next {
                    Some('@') => Placeholder::Any,
                    Some('K') => Placeholder::Key,
                    Some('d') | Some('i') => Placeholder::Integer,
                    Some('f') => Placeholder::Number,
                    _ => return Err(syntax(offset, "unknown placeholder")),
                };
                push(&mut tokens, TokenKind::Placeholder(placeholder));
                i += 2;
            }
            ('\'', _) | ('"', _) => {
                let (text, consumed) = read_quoted(&chars[i..], offset)?;
                push(&mut tokens, TokenKind::Text(text));
                i += consumed;
            }
            (c, _) if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
                    .map_or(chars.len(), |pos| i + 1 + pos);
                let literal: String = chars[i..end].iter().map(|(_, c)| c).collect();
                let kind = if literal.contains('.') {
                    literal
                        .parse::<f64>()
                        .map(TokenKind::Real)
                        .map_err(|_| syntax(offset, format!("invalid number `{literal}`")))?
                } else {
                    literal
                        .parse::<i64>()
                        .map(TokenKind::Integer)
                        .map_err(|_| syntax(offset, format!("invalid number `{literal}`")))?
                };
                push(&mut tokens, kind);
                i = end;
            }
            (c, _) if c.is_alphabetic() || c == '_' => {
                let end = chars[i..]
                    .iter()
                    .position(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '.'))
                    .map_or(chars.len(), |pos| i + pos);
                let word: String = chars[i..end].iter().map(|(_, c)| c).collect();
                push(&mut tokens, TokenKind::Word(word));
                i = end;
            }
            (other, _) => return Err(syntax(offset, format!("unexpected character `{other}`"))),
        }
    }

    Ok(tokens)
}

/// Reads a quoted literal starting at `chars[0]`; returns the text and chars consumed.
fn read_quoted(chars: &[(usize, char)], offset: usize) -> PredicateResult<(String, usize)> {
    let quote = chars[0].1;
    let mut text = String::new();
    let mut i = 1;
    while i < chars.len() {
        match chars[i].1 {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .map(|(_, c)| *c)
                    .ok_or_else(|| syntax(offset, "unterminated string literal"))?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err(syntax(offset, "unterminated string literal"))
}

fn keyword(word: &str) -> String {
    word.to_ascii_uppercase()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    args: std::vec::IntoIter<Value>,
    next_arg: usize,
    expected_args: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn current_offset(&self) -> usize {
        self.peek().map_or(self.end, |token| token.offset)
    }

    fn peek_is_word(&self, expected: &str) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::Word(word), .. }) if keyword(word) == expected)
    }

    fn take_arg(&mut self) -> PredicateResult<(usize, Value)> {
        let index = self.next_arg;
        let value = self
            .args
            .next()
            .ok_or(InvalidPredicateError::ArgumentCount {
                expected: self.expected_args,
                supplied: index,
            })?;
        self.next_arg += 1;
        Ok((index, value))
    }

    fn parse_or(&mut self) -> PredicateResult<Predicate> {
        let mut parts = vec![self.parse_and()?];
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Or)) || self.peek_is_word("OR")
        {
            self.advance();
            parts.push(self.parse_and()?);
        }
        Ok(collapse(parts, Predicate::Or))
    }

    fn parse_and(&mut self) -> PredicateResult<Predicate> {
        let mut parts = vec![self.parse_unary()?];
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::And))
            || self.peek_is_word("AND")
        {
            self.advance();
            parts.push(self.parse_unary()?);
        }
        Ok(collapse(parts, Predicate::And))
    }

    fn parse_unary(&mut self) -> PredicateResult<Predicate> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Not)) || self.peek_is_word("NOT")
        {
            self.advance();
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> PredicateResult<Predicate> {
        let offset = self.current_offset();
        let Some(token) = self.advance() else {
            return Err(syntax(offset, "expected a comparison"));
        };

        let key = match token.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                return match self.advance() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    _ => Err(syntax(offset, "unbalanced parenthesis")),
                };
            }
            TokenKind::Word(word) => match keyword(&word).as_str() {
                "TRUEPREDICATE" => return Ok(Predicate::Constant(true)),
                "FALSEPREDICATE" => return Ok(Predicate::Constant(false)),
                "AND" | "OR" | "NOT" | "CONTAINS" | "BEGINSWITH" | "ENDSWITH" | "IN" | "TRUE"
                | "FALSE" | "YES" | "NO" | "NIL" | "NULL" => {
                    return Err(syntax(offset, format!("expected a key path, got `{word}`")));
                }
                _ => KeyPath::parse(&word)?,
            },
            TokenKind::Placeholder(Placeholder::Key) => {
                let (index, value) = self.take_arg()?;
                match value {
                    Value::Text(path) => KeyPath::parse(&path)?,
                    other => {
                        return Err(InvalidPredicateError::ArgumentType {
                            index,
                            expected: "text key path",
                            found: other.kind_name(),
                        });
                    }
                }
            }
            _ => return Err(syntax(offset, "expected a key path")),
        };

        let op = self.parse_operator()?;
        let case_insensitive = self.parse_options()?;
        let operand_offset = self.current_offset();
        let (value, arg_index) = self.parse_operand()?;

        if let Some(expected) = op.operand_mismatch(&value) {
            return Err(match arg_index {
                Some(index) => InvalidPredicateError::ArgumentType {
                    index,
                    expected,
                    found: value.kind_name(),
                },
                None => syntax(
                    operand_offset,
                    format!("operand must be {expected}, got {}", value.kind_name()),
                ),
            });
        }

        Ok(Predicate::Compare(Comparison {
            key,
            op,
            value,
            case_insensitive,
        }))
    }

    fn parse_operator(&mut self) -> PredicateResult<ComparisonOp> {
        let offset = self.current_offset();
        let op = match self.advance().map(|token| token.kind) {
            Some(TokenKind::Op(op)) => op,
            Some(TokenKind::Word(word)) => match keyword(&word).as_str() {
                "CONTAINS" => ComparisonOp::Contains,
                "BEGINSWITH" => ComparisonOp::BeginsWith,
                "ENDSWITH" => ComparisonOp::EndsWith,
                "IN" => ComparisonOp::In,
                _ => return Err(syntax(offset, format!("unknown operator `{word}`"))),
            },
            _ => return Err(syntax(offset, "expected a comparison operator")),
        };
        Ok(op)
    }

    fn parse_options(&mut self) -> PredicateResult<bool> {
        let Some(Token {
            kind: TokenKind::Options(option),
            ..
        }) = self.peek()
        else {
            return Ok(false);
        };
        if option.as_str() != "c" {
            return Err(InvalidPredicateError::UnsupportedOption(option.clone()));
        }
        self.advance();
        Ok(true)
    }

    /// Returns the operand and, when it came from an argument, its index.
    fn parse_operand(&mut self) -> PredicateResult<(Value, Option<usize>)> {
        let offset = self.current_offset();
        let Some(token) = self.advance() else {
            return Err(syntax(offset, "expected an operand"));
        };

        let value = match token.kind {
            TokenKind::Text(text) => Value::Text(text),
            TokenKind::Integer(integer) => Value::Integer(integer),
            TokenKind::Real(real) => Value::Real(real),
            TokenKind::Word(word) => match keyword(&word).as_str() {
                "TRUE" | "YES" => Value::Bool(true),
                "FALSE" | "NO" => Value::Bool(false),
                "NIL" | "NULL" => Value::Null,
                _ => {
                    return Err(syntax(
                        offset,
                        format!("key path `{word}` cannot be used as an operand"),
                    ));
                }
            },
            TokenKind::Placeholder(Placeholder::Key) => {
                return Err(syntax(offset, "%K cannot be used as an operand"));
            }
            TokenKind::Placeholder(placeholder) => {
                let (index, value) = self.take_arg()?;
                let accepted = match placeholder {
                    Placeholder::Integer => matches!(value, Value::Integer(_)),
                    Placeholder::Number => matches!(value, Value::Integer(_) | Value::Real(_)),
                    Placeholder::Any | Placeholder::Key => true,
                };
                if !accepted {
                    return Err(InvalidPredicateError::ArgumentType {
                        index,
                        expected: match placeholder {
                            Placeholder::Integer => "an integer",
                            _ => "a number",
                        },
                        found: value.kind_name(),
                    });
                }
                return Ok((value, Some(index)));
            }
            TokenKind::LBrace => return Ok((Value::List(self.parse_list(offset)?), None)),
            _ => return Err(syntax(offset, "expected an operand")),
        };
        Ok((value, None))
    }

    fn parse_list(&mut self, open_offset: usize) -> PredicateResult<Vec<Value>> {
        let mut items = Vec::new();
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::RBrace)) {
            self.advance();
            return Ok(items);
        }
        loop {
            let (item, _) = self.parse_operand()?;
            items.push(item);
            match self.advance().map(|token| token.kind) {
                Some(TokenKind::Comma) => continue,
                Some(TokenKind::RBrace) => return Ok(items),
                _ => return Err(syntax(open_offset, "unterminated list literal")),
            }
        }
    }
}

fn collapse(mut parts: Vec<Predicate>, combine: fn(Vec<Predicate>) -> Predicate) -> Predicate {
    if parts.len() == 1 {
        if let Some(only) = parts.pop() {
            return only;
        }
    }
    combine(parts)
}

#[cfg(test)]
mod tests {
    use super::parse;
    use crate::predicate::{ComparisonOp, InvalidPredicateError, Predicate};
    use serde_json::json;

    #[test]
    fn single_placeholder_equality() {
        let predicate = parse("name == %@", vec!["foo".into()]).unwrap();
        assert!(predicate.evaluate(&json!({"name": "foo"})));
        assert!(!predicate.evaluate(&json!({"name": "bar"})));
    }

    #[test]
    fn precedence_binds_and_tighter_than_or() {
        let predicate = parse(
            "a == 1 OR b == 2 AND c == 3",
            Vec::new(),
        )
        .unwrap();
        assert!(predicate.evaluate(&json!({"a": 1})));
        assert!(!predicate.evaluate(&json!({"b": 2})));
        assert!(predicate.evaluate(&json!({"b": 2, "c": 3})));

        let grouped = parse("(a == 1 || b == 2) && c == 3", Vec::new()).unwrap();
        assert!(!grouped.evaluate(&json!({"a": 1})));
        assert!(grouped.evaluate(&json!({"a": 1, "c": 3})));
    }

    #[test]
    fn keywords_are_case_insensitive_and_options_fold_case() {
        let predicate = parse(
            "title contains[c] %@ and not closed == YES",
            vec!["RUST".into()],
        )
        .unwrap();
        assert!(predicate.evaluate(&json!({"title": "Rust megathread", "closed": false})));
        assert!(!predicate.evaluate(&json!({"title": "Rust megathread", "closed": true})));
    }

    #[test]
    fn key_placeholder_binds_a_key_path() {
        let predicate = parse("%K >= %d", vec!["author.posts".into(), 100.into()]).unwrap();
        assert!(predicate.evaluate(&json!({"author": {"posts": 150}})));
        assert!(!predicate.evaluate(&json!({"author": {"posts": 99}})));
    }

    #[test]
    fn list_literals_and_in_operator() {
        let predicate = parse("forum_id IN {1, 44, %@}", vec![219.into()]).unwrap();
        assert!(predicate.evaluate(&json!({"forum_id": 219})));
        assert!(!predicate.evaluate(&json!({"forum_id": 2})));

        let from_arg = parse("forum_id IN %@", vec![vec![1, 2].into()]).unwrap();
        assert!(from_arg.evaluate(&json!({"forum_id": 2})));
    }

    #[test]
    fn literal_kinds_parse() {
        let predicate = parse(
            "score > -1.5 AND title == 'It\\'s' AND avatar == nil AND sticky != FALSE",
            Vec::new(),
        )
        .unwrap();
        assert!(predicate.evaluate(&json!({"score": 0, "title": "It's", "sticky": true})));
    }

    #[test]
    fn constants_parse() {
        assert_eq!(parse("TRUEPREDICATE", Vec::new()).unwrap(), Predicate::always());
        assert_eq!(parse("falsepredicate", Vec::new()).unwrap(), Predicate::never());
    }

    #[test]
    fn argument_count_mismatch_fails_at_construction() {
        assert_eq!(
            parse("name == %@", Vec::new()),
            Err(InvalidPredicateError::ArgumentCount {
                expected: 1,
                supplied: 0
            })
        );
        assert_eq!(
            parse("name == %@", vec!["a".into(), "b".into()]),
            Err(InvalidPredicateError::ArgumentCount {
                expected: 1,
                supplied: 2
            })
        );
    }

    #[test]
    fn argument_type_mismatch_fails_at_construction() {
        assert_eq!(
            parse("count > %d", vec!["three".into()]),
            Err(InvalidPredicateError::ArgumentType {
                index: 0,
                expected: "an integer",
                found: "text"
            })
        );
        assert_eq!(
            parse("a == %@ AND b < %@", vec![1.into(), true.into()]),
            Err(InvalidPredicateError::ArgumentType {
                index: 1,
                expected: "a number or text",
                found: "bool"
            })
        );
        assert!(matches!(
            parse("%K == 1", vec![5.into()]),
            Err(InvalidPredicateError::ArgumentType { index: 0, .. })
        ));
        assert!(matches!(
            parse("tags IN %@", vec!["rust".into()]),
            Err(InvalidPredicateError::ArgumentType {
                expected: "a list",
                ..
            })
        ));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(matches!(
            parse("", Vec::new()),
            Err(InvalidPredicateError::Syntax { .. })
        ));
        assert!(matches!(
            parse("name ==", Vec::new()),
            Err(InvalidPredicateError::Syntax { .. })
        ));
        assert!(matches!(
            parse("(name == 'a'", Vec::new()),
            Err(InvalidPredicateError::Syntax { .. })
        ));
        assert!(matches!(
            parse("name == 'a' name", Vec::new()),
            Err(InvalidPredicateError::Syntax { .. })
        ));
        assert!(matches!(
            parse("name LIKE 'a'", Vec::new()),
            Err(InvalidPredicateError::Syntax { .. })
        ));
        assert!(matches!(
            parse("name BEGINSWITH 3", Vec::new()),
            Err(InvalidPredicateError::Syntax { .. })
        ));
        assert_eq!(
            parse("name ==[cd] 'a'", Vec::new()),
            Err(InvalidPredicateError::UnsupportedOption("cd".into()))
        );
        assert!(matches!(
            parse("%K == 1", vec!["bad path!".into()]),
            Err(InvalidPredicateError::InvalidKeyPath(_))
        ));
    }

    #[test]
    fn operators_map_to_comparisons() {
        let cases = [
            ("a = 1", ComparisonOp::Equal),
            ("a <> 1", ComparisonOp::NotEqual),
            ("a =< 1", ComparisonOp::LessOrEqual),
            ("a => 1", ComparisonOp::GreaterOrEqual),
            ("a endswith 'x'", ComparisonOp::EndsWith),
        ];
        for (template, expected) in cases {
            match parse(template, Vec::new()).unwrap() {
                Predicate::Compare(comparison) => assert_eq!(comparison.op, expected),
                other => panic!("unexpected predicate for `{template}`: {other:?}"),
            }
        }
    }
}
