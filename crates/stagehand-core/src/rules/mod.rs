//! Rule predicates and their evaluation against a trigger context.
//!
//! A [`Rule`] is a small tagged predicate tree: equality and pattern
//! matches against context fields, composed with `and`, `or` and `not`.
//! Rules can be written structurally in the pipeline document or as a
//! compact expression string (see [`parser`]); both produce the same tree.
//!
//! Evaluation is pure. Every field and pattern in the tree is checked before
//! any branch is evaluated, so an undefined field is reported even when it
//! sits behind a short-circuiting operator.

pub mod parser;

use crate::context::TriggerContext;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

pub use parser::parse_expression;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("undefined context field '{0}'")]
    UndefinedField(String),

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
}

impl RuleError {
    /// The context field or expression fragment the error is about.
    pub fn subject(&self) -> String {
        match self {
            RuleError::UndefinedField(field) => field.clone(),
            RuleError::InvalidPattern { pattern, .. } => pattern.clone(),
            RuleError::Syntax { offset, .. } => format!("offset {}", offset),
        }
    }
}

/// A field of the trigger context a rule can inspect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Field {
    PipelineSource,
    RefName,
    TargetBranch,
    Variable(String),
}

impl Field {
    /// Parse a field reference. Accepts the canonical names, the
    /// `$CI_*` predefined variable spellings, `variables.NAME` and `$NAME`.
    pub fn parse(raw: &str) -> Field {
        let name = raw.trim().trim_start_matches('$');
        match name {
            "pipeline_source" | "CI_PIPELINE_SOURCE" => Field::PipelineSource,
            "ref_name" | "ref" | "CI_COMMIT_REF_NAME" | "CI_COMMIT_BRANCH" => Field::RefName,
            "target_branch" | "CI_MERGE_REQUEST_TARGET_BRANCH_NAME" => Field::TargetBranch,
            other => Field::Variable(
                other
                    .strip_prefix("variables.")
                    .unwrap_or(other)
                    .to_string(),
            ),
        }
    }

    fn resolve<'a>(&self, ctx: &'a TriggerContext) -> Result<Cow<'a, str>, RuleError> {
        match self {
            Field::PipelineSource => Ok(Cow::Borrowed(ctx.source.as_str())),
            Field::RefName => Ok(Cow::Borrowed(ctx.ref_name.as_str())),
            Field::TargetBranch => Ok(Cow::Borrowed(
                ctx.target_branch.as_deref().unwrap_or_default(),
            )),
            Field::Variable(name) => ctx
                .variables
                .get(name)
                .map(|v| Cow::Borrowed(v.as_str()))
                .ok_or_else(|| RuleError::UndefinedField(self.to_string())),
        }
    }
}

impl From<String> for Field {
    fn from(raw: String) -> Self {
        Field::parse(&raw)
    }
}

impl From<Field> for String {
    fn from(field: Field) -> Self {
        field.to_string()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::PipelineSource => f.write_str("pipeline_source"),
            Field::RefName => f.write_str("ref_name"),
            Field::TargetBranch => f.write_str("target_branch"),
            Field::Variable(name) => write!(f, "variables.{}", name),
        }
    }
}

/// A glob, or a regex when written between slashes (`/^release-\d+$/`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MatchPattern {
    Glob(String),
    Regex(String),
}

impl MatchPattern {
    fn check(&self) -> Result<(), RuleError> {
        match self {
            MatchPattern::Glob(pattern) => glob::Pattern::new(pattern)
                .map(|_| ())
                .map_err(|e| RuleError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                }),
            MatchPattern::Regex(pattern) => regex::Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| RuleError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                }),
        }
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            MatchPattern::Glob(pattern) => glob::Pattern::new(pattern)
                .map(|p| p.matches(text))
                .unwrap_or(false),
            MatchPattern::Regex(pattern) => regex::Regex::new(pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false),
        }
    }
}

impl From<String> for MatchPattern {
    fn from(raw: String) -> Self {
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            MatchPattern::Regex(raw[1..raw.len() - 1].to_string())
        } else {
            MatchPattern::Glob(raw)
        }
    }
}

impl From<MatchPattern> for String {
    fn from(pattern: MatchPattern) -> Self {
        match pattern {
            MatchPattern::Glob(p) => p,
            MatchPattern::Regex(p) => format!("/{}/", p),
        }
    }
}

/// A predicate over the trigger context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Equals { field: Field, value: String },
    Matches { field: Field, pattern: MatchPattern },
    /// Set to a non-empty value. An unset variable is false, not an error.
    Defined { field: Field },
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
}

impl Rule {
    pub fn equals(field: Field, value: impl Into<String>) -> Self {
        Rule::Equals {
            field,
            value: value.into(),
        }
    }

    pub fn matches(field: Field, pattern: MatchPattern) -> Self {
        Rule::Matches { field, pattern }
    }

    pub fn defined(field: Field) -> Self {
        Rule::Defined { field }
    }

    pub fn negate(rule: Rule) -> Self {
        Rule::Not(Box::new(rule))
    }

    /// Check every field reference and pattern in the tree.
    pub fn validate(&self, ctx: &TriggerContext) -> Result<(), RuleError> {
        match self {
            Rule::Equals { field, .. } => field.resolve(ctx).map(|_| ()),
            Rule::Matches { field, pattern } => {
                field.resolve(ctx)?;
                pattern.check()
            }
            Rule::Defined { .. } => Ok(()),
            Rule::And(rules) | Rule::Or(rules) => {
                rules.iter().try_for_each(|rule| rule.validate(ctx))
            }
            Rule::Not(rule) => rule.validate(ctx),
        }
    }

    fn holds(&self, ctx: &TriggerContext) -> bool {
        match self {
            Rule::Equals { field, value } => field
                .resolve(ctx)
                .map(|actual| actual == value.as_str())
                .unwrap_or(false),
            Rule::Matches { field, pattern } => field
                .resolve(ctx)
                .map(|actual| pattern.matches(&actual))
                .unwrap_or(false),
            Rule::Defined { field } => field.resolve(ctx).is_ok_and(|actual| !actual.is_empty()),
            Rule::And(rules) => rules.iter().all(|rule| rule.holds(ctx)),
            Rule::Or(rules) => rules.iter().any(|rule| rule.holds(ctx)),
            Rule::Not(rule) => !rule.holds(ctx),
        }
    }
}

/// Evaluate a rule against the context.
pub fn evaluate(rule: &Rule, ctx: &TriggerContext) -> Result<bool, RuleError> {
    rule.validate(ctx)?;
    Ok(rule.holds(ctx))
}

/// How a rule is written in the pipeline document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSource {
    Expression(String),
    Predicate(Rule),
}

impl RuleSource {
    pub fn compile(&self) -> Result<Rule, RuleError> {
        match self {
            RuleSource::Expression(expr) => parse_expression(expr),
            RuleSource::Predicate(rule) => Ok(rule.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleWhen {
    #[default]
    OnSuccess,
    Never,
}

/// One entry of a job's `rules` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleClause {
    #[serde(rename = "if", default)]
    pub condition: Option<RuleSource>,
    #[serde(default)]
    pub when: RuleWhen,
    #[serde(default)]
    pub allow_failure: Option<bool>,
}

/// Outcome of evaluating a job's rule clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDecision {
    Run { allow_failure: Option<bool> },
    Skip,
}

impl JobDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, JobDecision::Run { .. })
    }
}

/// Decide whether a job runs. The first matching clause wins; with no
/// matching clause the job is skipped; with no clauses at all it runs.
///
/// Every clause is compiled and validated, including those after the
/// deciding one. On failure the index of the offending clause is returned.
pub fn decide(clauses: &[RuleClause], ctx: &TriggerContext) -> Result<JobDecision, (usize, RuleError)> {
    if clauses.is_empty() {
        return Ok(JobDecision::Run {
            allow_failure: None,
        });
    }

    let mut compiled = Vec::with_capacity(clauses.len());
    for (idx, clause) in clauses.iter().enumerate() {
        let rule = match &clause.condition {
            Some(source) => {
                let rule = source.compile().map_err(|e| (idx, e))?;
                rule.validate(ctx).map_err(|e| (idx, e))?;
                Some(rule)
            }
            None => None,
        };
        compiled.push(rule);
    }

    for (clause, rule) in clauses.iter().zip(&compiled) {
        let matched = rule.as_ref().is_none_or(|rule| rule.holds(ctx));
        if matched {
            return Ok(match clause.when {
                RuleWhen::Never => JobDecision::Skip,
                RuleWhen::OnSuccess => JobDecision::Run {
                    allow_failure: clause.allow_failure,
                },
            });
        }
    }

    Ok(JobDecision::Skip)
}
