//! Substitution engine for $(arg), $(env), $(timestamp) patterns
//!
//! Strings in a launch description are compiled into a [`Substitution`]
//! expression tree at parse time and only resolved against a
//! [`LaunchContext`] when the owning action executes.

use crate::config::LaunchContext;
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use std::fmt::{self, Write as _};

/// Default format for `$(timestamp)`: YYYYMMDD_HHMMSS
const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Default format for `$(date)`: YYYY-MM-DD
const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// A lazily evaluated textual expression
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ScalarValue")]
pub struct Substitution {
    source: String,
    fragments: Vec<Fragment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Fragment {
    Text(String),
    Arg(Substitution),
    Env {
        name: Substitution,
        default: Option<Substitution>,
    },
    Timestamp(Option<String>),
    Date(Option<String>),
}

/// Scalar values accepted wherever a substitution is expected
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ScalarValue {
    /// Convert to string representation
    pub fn as_str(&self) -> String {
        match self {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::String(s) => s.clone(),
        }
    }
}

impl TryFrom<ScalarValue> for Substitution {
    type Error = SubstitutionError;

    fn try_from(value: ScalarValue) -> Result<Self, Self::Error> {
        Substitution::parse(&value.as_str())
    }
}

impl Substitution {
    /// Parse an expression such as `robot_$(arg ns)/$(env HOME)`
    pub fn parse(input: &str) -> Result<Self, SubstitutionError> {
        let mut parser = Parser::new(input);
        let fragments = parser.sequence(false)?;
        Ok(Self {
            source: input.to_string(),
            fragments,
        })
    }

    /// A substitution that always resolves to `text`
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        let fragments = if text.is_empty() {
            Vec::new()
        } else {
            vec![Fragment::Text(text.clone())]
        };
        Self {
            source: text,
            fragments,
        }
    }

    /// The expression as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True if the expression contains no substitution calls
    pub fn is_literal(&self) -> bool {
        self.fragments
            .iter()
            .all(|f| matches!(f, Fragment::Text(_)))
    }

    /// Evaluate depth-first, left-to-right against `ctx`
    pub fn evaluate(&self, ctx: &LaunchContext) -> Result<String, ResolutionError> {
        let mut out = String::new();
        for fragment in &self.fragments {
            match fragment {
                Fragment::Text(text) => out.push_str(text),
                Fragment::Arg(name) => {
                    let name = name.evaluate(ctx)?;
                    let value = ctx
                        .lookup(&name)
                        .ok_or(ResolutionError::UndefinedArgument(name.clone()))?;
                    out.push_str(value);
                }
                Fragment::Env { name, default } => {
                    let name = name.evaluate(ctx)?;
                    match (ctx.env_var(&name), default) {
                        (Some(value), _) => out.push_str(&value),
                        (None, Some(default)) => out.push_str(&default.evaluate(ctx)?),
                        (None, None) => return Err(ResolutionError::UndefinedEnv(name)),
                    }
                }
                Fragment::Timestamp(format) => {
                    let format = format.as_deref().unwrap_or(DEFAULT_TIMESTAMP_FORMAT);
                    let _ = write!(out, "{}", chrono::Local::now().format(format));
                }
                Fragment::Date(format) => {
                    let format = format.as_deref().unwrap_or(DEFAULT_DATE_FORMAT);
                    let _ = write!(out, "{}", chrono::Local::now().format(format));
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Substitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Resolves substitutions on behalf of the executor
pub trait Resolve: Send + Sync {
    fn resolve(&self, subst: &Substitution, ctx: &LaunchContext)
        -> Result<String, ResolutionError>;
}

/// Resolver backed by the launch context and the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardResolver;

impl Resolve for StandardResolver {
    fn resolve(
        &self,
        subst: &Substitution,
        ctx: &LaunchContext,
    ) -> Result<String, ResolutionError> {
        subst.evaluate(ctx)
    }
}

/// Recursive-descent parser over `$(type operand...)` calls
struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn text(&self, start: usize) -> String {
        self.chars[start..self.pos].iter().collect()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    /// Parse text and calls; operands stop at whitespace or `)`
    fn sequence(&mut self, in_operand: bool) -> Result<Vec<Fragment>, SubstitutionError> {
        let mut fragments = Vec::new();
        let mut text = String::new();

        while let Some(c) = self.peek() {
            if in_operand && (c.is_whitespace() || c == ')') {
                break;
            }
            if c == '$' {
                match self.peek_at(1) {
                    Some('$') => {
                        text.push('$');
                        self.pos += 2;
                        continue;
                    }
                    Some('(') => {
                        if !text.is_empty() {
                            fragments.push(Fragment::Text(std::mem::take(&mut text)));
                        }
                        fragments.push(self.call()?);
                        continue;
                    }
                    _ => {}
                }
            }
            text.push(c);
            self.pos += 1;
        }

        if !text.is_empty() {
            fragments.push(Fragment::Text(text));
        }
        Ok(fragments)
    }

    fn call(&mut self) -> Result<Fragment, SubstitutionError> {
        let start = self.pos;
        self.pos += 2;

        let kind_start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let kind = self.text(kind_start);

        if kind == "timestamp" || kind == "date" {
            return self.format_call(start, kind);
        }

        let mut operands = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(SubstitutionError::Unterminated(self.text(start))),
                Some(')') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let operand_start = self.pos;
                    let fragments = self.sequence(true)?;
                    operands.push(Substitution {
                        source: self.text(operand_start),
                        fragments,
                    });
                }
            }
        }

        let found = operands.len();
        match (kind.as_str(), found) {
            ("arg" | "var", 1) => Ok(Fragment::Arg(operands.remove(0))),
            ("env", 1 | 2) => {
                let default = if found == 2 { operands.pop() } else { None };
                Ok(Fragment::Env {
                    name: operands.remove(0),
                    default,
                })
            }
            ("arg" | "var", _) => Err(SubstitutionError::Arity {
                kind,
                expected: "exactly one operand",
                found,
            }),
            ("env", _) => Err(SubstitutionError::Arity {
                kind,
                expected: "a name and an optional default",
                found,
            }),
            _ => Err(SubstitutionError::UnknownType(kind)),
        }
    }

    /// `$(timestamp FORMAT)` and `$(date FORMAT)` take the raw text up to `)`
    fn format_call(&mut self, start: usize, kind: String) -> Result<Fragment, SubstitutionError> {
        let format_start = self.pos;
        loop {
            match self.peek() {
                None => return Err(SubstitutionError::Unterminated(self.text(start))),
                Some(')') => break,
                Some(_) => self.pos += 1,
            }
        }
        let format = self.text(format_start).trim().to_string();
        self.pos += 1;

        let format = if format.is_empty() {
            None
        } else {
            if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
                return Err(SubstitutionError::InvalidFormat(format));
            }
            Some(format)
        };

        if kind == "timestamp" {
            Ok(Fragment::Timestamp(format))
        } else {
            Ok(Fragment::Date(format))
        }
    }
}

/// Errors that can occur while parsing a substitution expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown substitution type: {0}")]
    UnknownType(String),

    #[error("Unterminated substitution: {0}")]
    Unterminated(String),

    #[error("Substitution '{kind}' expects {expected}, found {found}")]
    Arity {
        kind: String,
        expected: &'static str,
        found: usize,
    },

    #[error("Invalid time format: {0}")]
    InvalidFormat(String),
}

/// Errors that can occur while resolving a substitution against a context
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolutionError {
    #[error("Undefined argument: {0}")]
    UndefinedArgument(String),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Invalid condition value '{0}', expected 'true' or 'false'")]
    InvalidCondition(String),

    #[error("Argument '{name}' value '{value}' is not one of: {}", .choices.join(", "))]
    InvalidChoice {
        name: String,
        value: String,
        choices: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(input: &str, ctx: &LaunchContext) -> Result<String, ResolutionError> {
        Substitution::parse(input).unwrap().evaluate(ctx)
    }

    #[test]
    fn test_arg_substitution() {
        let ctx = LaunchContext::new().with_argument("config", "my_config.yaml");

        let result = resolve("$(arg config)", &ctx).unwrap();
        assert_eq!(result, "my_config.yaml");
    }

    #[test]
    fn test_var_alias() {
        let ctx = LaunchContext::new().with_argument("ns", "robot1");
        assert_eq!(resolve("/$(var ns)/cmd", &ctx).unwrap(), "/robot1/cmd");
    }

    #[test]
    fn test_env_substitution() {
        let mut ctx = LaunchContext::new();
        ctx.set_env("LAUNCH_TREE_TEST_VAR", "my_value");

        let result = resolve("$(env LAUNCH_TREE_TEST_VAR)", &ctx).unwrap();
        assert_eq!(result, "my_value");
    }

    #[test]
    fn test_env_default() {
        let ctx = LaunchContext::new().with_argument("fallback", "fb");
        let result = resolve("$(env LAUNCH_TREE_SURELY_UNSET $(arg fallback))", &ctx).unwrap();
        assert_eq!(result, "fb");

        let result = resolve("$(env LAUNCH_TREE_SURELY_UNSET)", &ctx);
        assert_eq!(
            result,
            Err(ResolutionError::UndefinedEnv(
                "LAUNCH_TREE_SURELY_UNSET".to_string()
            ))
        );
    }

    #[test]
    fn test_timestamp_substitution() {
        let ctx = LaunchContext::new();

        let result = resolve("recording_$(timestamp).mcap", &ctx).unwrap();
        assert!(result.starts_with("recording_"));
        assert!(result.ends_with(".mcap"));
        assert!(result.len() > 20);
    }

    #[test]
    fn test_date_with_format() {
        let ctx = LaunchContext::new();
        let result = resolve("$(date %Y)", &ctx).unwrap();
        assert_eq!(result.len(), 4);
        assert!(result.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_multiple_substitutions_preserve_order() {
        let ctx = LaunchContext::new()
            .with_argument("prefix", "data")
            .with_argument("suffix", "log");

        let result = resolve("$(arg prefix)_$(timestamp)_$(arg suffix)", &ctx).unwrap();
        assert!(result.starts_with("data_"));
        assert!(result.ends_with("_log"));
    }

    #[test]
    fn test_undefined_arg_error() {
        let ctx = LaunchContext::new();

        let result = resolve("prefix-$(arg undefined)", &ctx);
        assert_eq!(
            result,
            Err(ResolutionError::UndefinedArgument("undefined".to_string()))
        );
    }

    #[test]
    fn test_nested_substitution() {
        let ctx = LaunchContext::new()
            .with_argument("robot", "r2")
            .with_argument("r2_ns", "resolved");

        let result = resolve("$(arg $(arg robot)_ns)", &ctx).unwrap();
        assert_eq!(result, "resolved");
    }

    #[test]
    fn test_no_substitution_needed() {
        let subst = Substitution::parse("plain (string) $ sign").unwrap();
        assert!(subst.is_literal());
        assert_eq!(
            subst.evaluate(&LaunchContext::new()).unwrap(),
            "plain (string) $ sign"
        );
    }

    #[test]
    fn test_escaped_dollar() {
        let subst = Substitution::parse("$$(arg x)").unwrap();
        assert_eq!(subst.evaluate(&LaunchContext::new()).unwrap(), "$(arg x)");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Substitution::parse("$(arg ns"),
            Err(SubstitutionError::Unterminated(_))
        ));
        assert!(matches!(
            Substitution::parse("$(find pkg)"),
            Err(SubstitutionError::UnknownType(kind)) if kind == "find"
        ));
        assert!(matches!(
            Substitution::parse("$(arg)"),
            Err(SubstitutionError::Arity { found: 0, .. })
        ));
        assert!(matches!(
            Substitution::parse("$(env A B C)"),
            Err(SubstitutionError::Arity { found: 3, .. })
        ));
        assert!(matches!(
            Substitution::parse("$(timestamp %Q%)"),
            Err(SubstitutionError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_scalar_values_become_literals() {
        let subst: Substitution = serde_yaml::from_str("true").unwrap();
        assert_eq!(subst.source(), "true");
        let subst: Substitution = serde_yaml::from_str("42").unwrap();
        assert_eq!(subst.evaluate(&LaunchContext::new()).unwrap(), "42");
    }
}
