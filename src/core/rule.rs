//! Predicate rule language.
//!
//! A rule is a boolean expression over path matchers:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := factor ( "&&" factor )*
//! factor  := "(" expr ")" | IDENT "(" [ STRING ( "," STRING )* ] ")"
//! STRING  := '"' ... '"' | '`' ... '`'
//! ```
//!
//! `&&` binds tighter than `||` and both associate to the left, so
//! `Path("/a") || Path("/b") && Path("/c")` parses as `Path("/a") || (Path("/b") && Path("/c"))`.
//! Matcher names are closed over [`MatcherKind`]; anything else is rejected while parsing.
use std::{fmt, str::FromStr};

use thiserror::Error;

/// Errors raised while parsing or installing a rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RuleError {
    /// The rule string is empty or whitespace only
    #[error("Empty rule")]
    Empty,

    /// Malformed rule text
    #[error("Parse error at offset {position}: {message}")]
    Parse { position: usize, message: String },

    /// A matcher name that is neither `Path` nor `PathPrefix`
    #[error("Unknown matcher: {0}")]
    UnknownMatcher(String),

    /// A leaf matcher declared without arguments
    #[error("Matcher {matcher} requires at least one argument")]
    MissingArguments { matcher: MatcherKind },

    /// A leaf matcher with an empty string argument
    #[error("Matcher {matcher} has an empty argument")]
    EmptyArgument { matcher: MatcherKind },

    /// A path template that cannot be turned into a matcher
    #[error("Invalid path template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
}

impl RuleError {
    /// True for errors in the rule text itself, false for matcher installation failures.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, RuleError::Empty | RuleError::Parse { .. })
    }
}

pub type RuleResult<T> = Result<T, RuleError>;

/// Closed set of leaf matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatcherKind {
    Path,
    PathPrefix,
}

impl MatcherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatcherKind::Path => "Path",
            MatcherKind::PathPrefix => "PathPrefix",
        }
    }
}

impl fmt::Display for MatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatcherKind {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("path") {
            Ok(MatcherKind::Path)
        } else if s.eq_ignore_ascii_case("pathprefix") {
            Ok(MatcherKind::PathPrefix)
        } else {
            Err(RuleError::UnknownMatcher(s.to_string()))
        }
    }
}

/// Parsed rule tree. Leaves carry arguments, `And`/`Or` carry none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleNode {
    Matcher { kind: MatcherKind, args: Vec<String> },
    And(Box<RuleNode>, Box<RuleNode>),
    Or(Box<RuleNode>, Box<RuleNode>),
}

impl RuleNode {
    pub fn matcher(kind: MatcherKind, args: &[&str]) -> Self {
        RuleNode::Matcher {
            kind,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn and(left: RuleNode, right: RuleNode) -> Self {
        RuleNode::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: RuleNode, right: RuleNode) -> Self {
        RuleNode::Or(Box::new(left), Box::new(right))
    }
}

impl fmt::Display for RuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleNode::Matcher { kind, args } => {
                write!(f, "{kind}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg:?}")?;
                }
                f.write_str(")")
            }
            RuleNode::And(l, r) => write!(f, "({l} && {r})"),
            RuleNode::Or(l, r) => write!(f, "({l} || {r})"),
        }
    }
}

/// Validate the arguments of a leaf matcher.
pub fn check_rule(kind: MatcherKind, args: &[String]) -> RuleResult<()> {
    if args.is_empty() {
        return Err(RuleError::MissingArguments { matcher: kind });
    }
    if args.iter().any(|arg| arg.is_empty()) {
        return Err(RuleError::EmptyArgument { matcher: kind });
    }
    Ok(())
}

/// Parse a rule string into a [`RuleNode`] tree.
pub fn parse_rule(rule: &str) -> RuleResult<RuleNode> {
    if rule.trim().is_empty() {
        return Err(RuleError::Empty);
    }
    let mut parser = Parser::new(rule);
    let node = parser.parse_or()?;
    parser.skip_whitespace();
    if let Some(c) = parser.peek() {
        return Err(parser.error(format!("unexpected '{c}'")));
    }
    Ok(node)
}

impl FromStr for RuleNode {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_rule(s)
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn error(&self, message: impl Into<String>) -> RuleError {
        RuleError::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> RuleResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{token}'")))
        }
    }

    fn parse_or(&mut self) -> RuleResult<RuleNode> {
        let mut left = self.parse_and()?;
        while self.eat("||") {
            let right = self.parse_and()?;
            left = RuleNode::or(left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> RuleResult<RuleNode> {
        let mut left = self.parse_factor()?;
        while self.eat("&&") {
            let right = self.parse_factor()?;
            left = RuleNode::and(left, right);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> RuleResult<RuleNode> {
        if self.eat("(") {
            let node = self.parse_or()?;
            self.expect(")")?;
            return Ok(node);
        }

        let name = self.parse_ident()?;
        let kind = name.parse::<MatcherKind>()?;
        self.expect("(")?;

        let mut args = Vec::new();
        if !self.eat(")") {
            loop {
                args.push(self.parse_string()?);
                if self.eat(",") {
                    continue;
                }
                self.expect(")")?;
                break;
            }
        }

        Ok(RuleNode::Matcher { kind, args })
    }

    fn parse_ident(&mut self) -> RuleResult<&'a str> {
        self.skip_whitespace();
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        if start == self.pos {
            return Err(match self.peek() {
                Some(c) => self.error(format!("expected matcher name, found '{c}'")),
                None => self.error("expected matcher name, found end of rule"),
            });
        }
        Ok(&self.input[start..self.pos])
    }

    fn parse_string(&mut self) -> RuleResult<String> {
        self.skip_whitespace();
        let quote = match self.peek() {
            Some(q @ ('"' | '`')) => q,
            _ => return Err(self.error("expected quoted string")),
        };
        self.bump();

        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(value),
                // raw strings (backticks) take everything literally
                Some('\\') if quote == '"' => match self.bump() {
                    Some(escaped @ ('"' | '\\')) => value.push(escaped),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => value.push(c),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_matcher() {
        let node = parse_rule(r#"PathPrefix("/api/foo")"#).unwrap();
        assert_eq!(node, RuleNode::matcher(MatcherKind::PathPrefix, &["/api/foo"]));
    }

    #[test]
    fn test_parse_multiple_arguments_and_backticks() {
        let node = parse_rule(r#"Path(`/a`, "/b")"#).unwrap();
        assert_eq!(node, RuleNode::matcher(MatcherKind::Path, &["/a", "/b"]));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let node = parse_rule(r#"Path("/a") || Path("/b") && PathPrefix("/c")"#).unwrap();
        let expected = RuleNode::or(
            RuleNode::matcher(MatcherKind::Path, &["/a"]),
            RuleNode::and(
                RuleNode::matcher(MatcherKind::Path, &["/b"]),
                RuleNode::matcher(MatcherKind::PathPrefix, &["/c"]),
            ),
        );
        assert_eq!(node, expected);
    }

    #[test]
    fn test_parentheses_override_precedence() {
        let node = parse_rule(r#"(Path("/a") || Path("/b")) && PathPrefix("/c")"#).unwrap();
        assert!(matches!(node, RuleNode::And(_, _)));
    }

    #[test]
    fn test_matcher_names_are_case_insensitive() {
        let node = parse_rule(r#"pathprefix("/x")"#).unwrap();
        assert_eq!(node, RuleNode::matcher(MatcherKind::PathPrefix, &["/x"]));
    }

    #[test]
    fn test_unknown_matcher() {
        let err = parse_rule(r#"Host("example.com")"#).unwrap_err();
        assert_eq!(err, RuleError::UnknownMatcher("Host".to_string()));
        assert!(!err.is_parse_error());
    }

    #[test]
    fn test_parse_errors() {
        for rule in [
            "",
            "   ",
            "Path(",
            r#"Path("/a""#,
            r#"Path("/a") &&"#,
            r#"Path("/a") Path("/b")"#,
            r#"Path(/a)"#,
            r#"(Path("/a")"#,
        ] {
            let err = parse_rule(rule).unwrap_err();
            assert!(err.is_parse_error(), "rule {rule:?} gave {err:?}");
        }
    }

    #[test]
    fn test_empty_argument_list_parses() {
        // rejected later by check_rule, not by the parser
        let node = parse_rule("Path()").unwrap();
        assert_eq!(node, RuleNode::matcher(MatcherKind::Path, &[]));
    }

    #[test]
    fn test_check_rule() {
        assert_eq!(
            check_rule(MatcherKind::Path, &[]),
            Err(RuleError::MissingArguments {
                matcher: MatcherKind::Path
            })
        );
        assert_eq!(
            check_rule(MatcherKind::PathPrefix, &["/a".to_string(), String::new()]),
            Err(RuleError::EmptyArgument {
                matcher: MatcherKind::PathPrefix
            })
        );
        assert!(check_rule(MatcherKind::Path, &["/a".to_string()]).is_ok());
    }

    #[test]
    fn test_escaped_quotes() {
        let node = parse_rule(r#"Path("/a\"b")"#).unwrap();
        assert_eq!(node, RuleNode::matcher(MatcherKind::Path, &["/a\"b"]));
    }

    #[test]
    fn test_display_round_trips_structure() {
        let node = parse_rule(r#"Path("/a") && PathPrefix("/b")"#).unwrap();
        assert_eq!(node.to_string(), r#"(Path("/a") && PathPrefix("/b"))"#);
    }
}
