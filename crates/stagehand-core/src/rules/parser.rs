//! Parser for compact rule expressions.
//!
//! Grammar:
//!
//! ```text
//! expr       := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | "(" expr ")" | comparison
//! comparison := field ( ( "==" | "!=" ) string
//!                     | ( "=~" | "!~" ) ( string | regex ) )?
//! ```
//!
//! A bare field is true when it is set to a non-empty value; an unset
//! variable makes it false rather than an error. Strings are
//! single or double quoted; `=~` against a string is a glob match, against
//! `/.../` (optionally with the `i` flag) a regex match.

use super::{Field, MatchPattern, Rule, RuleError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Field(String),
    Str(String),
    Regex(String),
    Eq,
    Ne,
    Match,
    NotMatch,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// Parse an expression such as `$CI_PIPELINE_SOURCE == "push" && $CI_COMMIT_REF_NAME =~ /^v\d+/`.
pub fn parse_expression(input: &str) -> Result<Rule, RuleError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        len: input.len(),
    };
    let rule = parser.parse_or()?;
    if let Some((offset, token)) = parser.tokens.get(parser.pos) {
        return Err(RuleError::Syntax {
            offset: *offset,
            message: format!("unexpected {:?}", token),
        });
    }
    Ok(rule)
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, RuleError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let syntax = |offset: usize, message: &str| RuleError::Syntax {
        offset,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push((offset, Token::Eq));
                i += 2;
            }
            '=' if next == Some('~') => {
                tokens.push((offset, Token::Match));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Token::Ne));
                i += 2;
            }
            '!' if next == Some('~') => {
                tokens.push((offset, Token::NotMatch));
                i += 2;
            }
            '!' => {
                tokens.push((offset, Token::Not));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((offset, Token::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((offset, Token::Or));
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax(offset, "unterminated string")),
                        Some((_, '\\')) if chars.get(i + 1).is_some_and(|(_, n)| *n == quote) => {
                            value.push(quote);
                            i += 2;
                        }
                        Some((_, ch)) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some((_, ch)) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((offset, Token::Str(value)));
            }
            '/' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax(offset, "unterminated regex")),
                        Some((_, '\\')) if chars.get(i + 1).is_some_and(|(_, n)| *n == '/') => {
                            value.push('/');
                            i += 2;
                        }
                        Some((_, '/')) => {
                            i += 1;
                            break;
                        }
                        Some((_, ch)) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                if chars.get(i).is_some_and(|(_, f)| *f == 'i') {
                    value.insert_str(0, "(?i)");
                    i += 1;
                }
                tokens.push((offset, Token::Regex(value)));
            }
            c if c == '$' || c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|(_, ch)| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '.')
                {
                    i += 1;
                }
                let name: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
                if name == "$" {
                    return Err(syntax(offset, "expected variable name after '$'"));
                }
                tokens.push((offset, Token::Field(name)));
            }
            _ => return Err(syntax(offset, &format!("unexpected character '{}'", c))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.len)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> RuleError {
        RuleError::Syntax {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn parse_or(&mut self) -> Result<Rule, RuleError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Rule::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Rule, RuleError> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Rule::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Rule, RuleError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Rule::negate(self.parse_unary()?))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.next() != Some(Token::RParen) {
                    self.pos -= 1;
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Rule, RuleError> {
        let field = match self.next() {
            Some(Token::Field(name)) => Field::parse(&name),
            _ => {
                self.pos -= 1;
                return Err(self.error("expected a field"));
            }
        };

        let op = match self.peek() {
            Some(Token::Eq | Token::Ne | Token::Match | Token::NotMatch) => self.next(),
            _ => return Ok(Rule::defined(field)),
        };

        let value = self.next();
        let rule = match (op, value) {
            (Some(Token::Eq), Some(Token::Str(v))) => Rule::equals(field, v),
            (Some(Token::Ne), Some(Token::Str(v))) => Rule::negate(Rule::equals(field, v)),
            (Some(Token::Match), Some(Token::Str(v))) => {
                Rule::matches(field, MatchPattern::Glob(v))
            }
            (Some(Token::Match), Some(Token::Regex(v))) => {
                Rule::matches(field, MatchPattern::Regex(v))
            }
            (Some(Token::NotMatch), Some(Token::Str(v))) => {
                Rule::negate(Rule::matches(field, MatchPattern::Glob(v)))
            }
            (Some(Token::NotMatch), Some(Token::Regex(v))) => {
                Rule::negate(Rule::matches(field, MatchPattern::Regex(v)))
            }
            _ => {
                self.pos -= 1;
                return Err(self.error("expected a quoted string or /regex/ after operator"));
            }
        };
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_simple_equality() {
        let rule = parse_expression(r#"$CI_PIPELINE_SOURCE == "push""#).unwrap();
        assert_eq!(rule, Rule::equals(Field::PipelineSource, "push"));
    }

    #[test]
    fn test_bare_field_names() {
        let rule = parse_expression("pipeline_source == 'merge_request_event'").unwrap();
        assert_eq!(rule, Rule::equals(Field::PipelineSource, "merge_request_event"));
    }

    #[test]
    fn test_precedence_and_grouping() {
        let rule = parse_expression(
            r#"$A == "1" || $B == "2" && !($CI_COMMIT_BRANCH =~ /^main$/)"#,
        )
        .unwrap();
        assert_eq!(
            rule,
            Rule::Or(vec![
                Rule::equals(Field::Variable("A".into()), "1"),
                Rule::And(vec![
                    Rule::equals(Field::Variable("B".into()), "2"),
                    Rule::negate(Rule::matches(
                        Field::RefName,
                        MatchPattern::Regex("^main$".into())
                    )),
                ]),
            ])
        );
    }

    #[test]
    fn test_negated_operators() {
        let rule = parse_expression(r#"$CI_COMMIT_REF_NAME != "main" && $TAG !~ "v*""#).unwrap();
        assert_eq!(
            rule,
            Rule::And(vec![
                Rule::negate(Rule::equals(Field::RefName, "main")),
                Rule::negate(Rule::matches(
                    Field::Variable("TAG".into()),
                    MatchPattern::Glob("v*".into())
                )),
            ])
        );
    }

    #[test]
    fn test_bare_field_means_non_empty() {
        let rule = parse_expression("$DEPLOY_TOKEN").unwrap();
        assert_eq!(rule, Rule::defined(Field::Variable("DEPLOY_TOKEN".into())));

        let rule = parse_expression("!$DEPLOY_TOKEN && $CI_COMMIT_BRANCH").unwrap();
        assert_eq!(
            rule,
            Rule::And(vec![
                Rule::negate(Rule::defined(Field::Variable("DEPLOY_TOKEN".into()))),
                Rule::defined(Field::RefName),
            ])
        );
    }

    #[test]
    fn test_case_insensitive_regex() {
        let rule = parse_expression("$CI_COMMIT_REF_NAME =~ /^Release/i").unwrap();
        assert_eq!(
            rule,
            Rule::matches(Field::RefName, MatchPattern::Regex("(?i)^Release".into()))
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            parse_expression(r#"$A == "unterminated"#),
            Err(RuleError::Syntax { .. })
        ));
        assert!(matches!(
            parse_expression(r#"($A == "1""#),
            Err(RuleError::Syntax { .. })
        ));
        assert!(matches!(
            parse_expression(r#"$A == /re/"#),
            Err(RuleError::Syntax { .. })
        ));
        assert!(matches!(
            parse_expression(r#"$A == "1" $B"#),
            Err(RuleError::Syntax { .. })
        ));
    }
}
