//! Pipeline document and specification types.
//!
//! A [`PipelineDocument`] is the parsed, not yet materialized form of a
//! pipeline file: reserved top-level keys are decoded, while job bodies and
//! hidden `.template` bodies stay as raw YAML mappings so that includes can
//! be merged in and `extends` resolved across files. [`PipelineDocument::materialize`]
//! then produces the immutable [`PipelineSpec`].

use crate::rules::RuleClause;
use crate::{Error, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Top-level keys that are not jobs.
pub const RESERVED_KEYS: &[&str] = &["variables", "stages", "cache", "include", "default"];

/// Keys a `default` block may provide to every job.
const DEFAULT_KEYS: &[&str] = &[
    "image",
    "before_script",
    "after_script",
    "cache",
    "timeout_minutes",
];

const MAX_EXTENDS_DEPTH: usize = 10;

pub fn default_stages() -> Vec<String> {
    vec!["build".to_string(), "test".to_string(), "deploy".to_string()]
}

fn default_stage() -> String {
    "test".to_string()
}

fn default_ref() -> String {
    "HEAD".to_string()
}

/// A parsed pipeline file before includes and `extends` are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineDocument {
    pub variables: BTreeMap<String, String>,
    pub stages: Option<Vec<String>>,
    pub cache: Option<CacheConfig>,
    pub include: Vec<IncludeRef>,
    pub default: Option<Mapping>,
    pub templates: BTreeMap<String, Mapping>,
    pub jobs: BTreeMap<String, Mapping>,
}

impl PipelineDocument {
    /// Parse a pipeline document from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut root: Value = serde_yaml::from_str(content)?;
        root.apply_merge()?;

        let Value::Mapping(root) = root else {
            return Err(Error::InvalidPipeline(
                "pipeline document must be a mapping".to_string(),
            ));
        };

        let mut document = PipelineDocument::default();
        for (key, value) in root {
            let Some(key) = key.as_str().map(str::to_string) else {
                return Err(Error::InvalidPipeline(format!(
                    "top-level keys must be strings, found {:?}",
                    key
                )));
            };

            match key.as_str() {
                "variables" => document.variables = variables_from_value(&value)?,
                "stages" => document.stages = Some(serde_yaml::from_value(value)?),
                "cache" => document.cache = Some(serde_yaml::from_value(value)?),
                "include" => document.include = IncludeRef::parse_list(&value)?,
                "default" => match value {
                    Value::Mapping(mapping) => document.default = Some(mapping),
                    _ => {
                        return Err(Error::InvalidPipeline(
                            "'default' must be a mapping".to_string(),
                        ));
                    }
                },
                name => {
                    let Value::Mapping(body) = value else {
                        return Err(Error::InvalidPipeline(format!(
                            "job '{}' must be a mapping",
                            name
                        )));
                    };
                    if name.starts_with('.') {
                        document.templates.insert(key, body);
                    } else {
                        document.jobs.insert(key, body);
                    }
                }
            }
        }

        Ok(document)
    }

    /// Load and parse a pipeline file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Merge an included document into this one. Definitions already
    /// present here win over the included ones.
    pub fn merge_included(&mut self, included: &PipelineDocument) {
        for (name, body) in &included.jobs {
            if self.jobs.contains_key(name) {
                tracing::info!(job = %name, "Local job shadows included definition");
                continue;
            }
            self.jobs.insert(name.clone(), body.clone());
        }
        for (name, body) in &included.templates {
            self.templates
                .entry(name.clone())
                .or_insert_with(|| body.clone());
        }
        for (key, value) in &included.variables {
            self.variables
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if self.stages.is_none() {
            self.stages = included.stages.clone();
        }
        if self.cache.is_none() {
            self.cache = included.cache.clone();
        }
        if self.default.is_none() {
            self.default = included.default.clone();
        }
    }

    /// Resolve `extends` and `default`, decode every job, and check the
    /// stage configuration.
    pub fn materialize(&self) -> Result<PipelineSpec> {
        let default_base = self.default.as_ref().map(|default| {
            default
                .iter()
                .filter(|(k, _)| k.as_str().is_some_and(|k| DEFAULT_KEYS.contains(&k)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Mapping>()
        });

        let mut jobs = BTreeMap::new();
        for (name, body) in &self.jobs {
            let extended = self.resolve_extends(name, body, 0)?;
            let merged = match &default_base {
                Some(base) => deep_merge(base.clone(), extended),
                None => extended,
            };

            let mut job: JobDescriptor =
                serde_yaml::from_value(Value::Mapping(merged)).map_err(|e| {
                    Error::InvalidPipeline(format!("job '{}': {}", name, e))
                })?;
            job.name = name.clone();
            if job.script.is_empty() {
                return Err(Error::InvalidPipeline(format!(
                    "job '{}' has no script",
                    name
                )));
            }
            if job.cache.is_none() {
                job.cache = self.cache.clone();
            }
            jobs.insert(name.clone(), job);
        }

        let spec = PipelineSpec {
            stages: self.stages.clone().unwrap_or_else(default_stages),
            variables: self.variables.clone(),
            cache: self.cache.clone(),
            include: self.include.clone(),
            jobs,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn resolve_extends(&self, job: &str, body: &Mapping, depth: usize) -> Result<Mapping> {
        if depth > MAX_EXTENDS_DEPTH {
            return Err(Error::InvalidPipeline(format!(
                "job '{}' exceeds the maximum extends depth of {}",
                job, MAX_EXTENDS_DEPTH
            )));
        }

        let mut body = body.clone();
        let Some(extends) = body.remove("extends") else {
            return Ok(body);
        };
        let parents = string_list_from_value(&extends).map_err(|e| {
            Error::InvalidPipeline(format!("job '{}': invalid extends: {}", job, e))
        })?;

        let mut base = Mapping::new();
        for parent in parents {
            let parent_body = self
                .templates
                .get(&parent)
                .or_else(|| self.jobs.get(&parent))
                .ok_or_else(|| Error::UnknownTemplate {
                    job: job.to_string(),
                    template: parent.clone(),
                })?;
            let resolved = self.resolve_extends(job, parent_body, depth + 1)?;
            base = deep_merge(base, resolved);
        }
        Ok(deep_merge(base, body))
    }
}

/// Merge `overlay` onto `base`: nested mappings merge key by key, every
/// other value in `overlay` replaces the one in `base`.
pub fn deep_merge(mut base: Mapping, overlay: Mapping) -> Mapping {
    for (key, value) in overlay {
        let merged = match (base.remove(&key), value) {
            (Some(Value::Mapping(b)), Value::Mapping(o)) => Value::Mapping(deep_merge(b, o)),
            (_, v) => v,
        };
        base.insert(key, merged);
    }
    base
}

/// The materialized, validated pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSpec {
    pub stages: Vec<String>,
    pub variables: BTreeMap<String, String>,
    pub cache: Option<CacheConfig>,
    pub include: Vec<IncludeRef>,
    pub jobs: BTreeMap<String, JobDescriptor>,
}

impl PipelineSpec {
    /// Stage order must be a total order and every job must name a
    /// declared stage.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.as_str()) {
                return Err(Error::DuplicateStage(stage.clone()));
            }
        }
        for job in self.jobs.values() {
            if !seen.contains(job.stage.as_str()) {
                return Err(Error::UnknownStage {
                    job: job.name.clone(),
                    stage: job.stage.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn job(&self, name: &str) -> Option<&JobDescriptor> {
        self.jobs.get(name)
    }
}

/// Static definition of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(skip)]
    pub name: String,
    #[serde(default, deserialize_with = "image_name")]
    pub image: Option<String>,
    #[serde(default = "default_stage")]
    pub stage: String,
    #[serde(default, deserialize_with = "variable_map")]
    pub variables: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "string_list")]
    pub before_script: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub script: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub after_script: Vec<String>,
    #[serde(default)]
    pub artifacts: Option<ArtifactsConfig>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub rules: Vec<RuleClause>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

impl JobDescriptor {
    /// Setup steps followed by script steps, in execution order.
    pub fn main_steps(&self) -> impl Iterator<Item = &String> {
        self.before_script.iter().chain(self.script.iter())
    }

    pub fn junit_reports(&self) -> &[String] {
        self.artifacts
            .as_ref()
            .map(|a| a.reports.junit.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub paths: Vec<String>,
    #[serde(default)]
    pub when: ArtifactWhen,
    #[serde(default)]
    pub reports: ArtifactReports,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtifactReports {
    #[serde(default, deserialize_with = "string_list")]
    pub junit: Vec<String>,
}

/// When declared artifact paths are uploaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactWhen {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
}

impl ArtifactWhen {
    pub fn applies(&self, succeeded: bool) -> bool {
        match self {
            ArtifactWhen::Always => true,
            ArtifactWhen::OnSuccess => succeeded,
            ArtifactWhen::OnFailure => !succeeded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub key: Option<CacheKeySpec>,
    #[serde(default, deserialize_with = "string_list")]
    pub paths: Vec<String>,
}

/// A literal cache key, or one derived from lock-file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheKeySpec {
    Literal(String),
    Files {
        files: Vec<String>,
        #[serde(default)]
        prefix: Option<String>,
    },
}

/// Reference to an external bundle of job and template definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeRef {
    Project {
        project: String,
        reference: String,
        file: String,
    },
    Template(String),
    Local(String),
    Remote(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInclude {
    Project {
        project: String,
        #[serde(rename = "ref", default = "default_ref")]
        reference: String,
        #[serde(deserialize_with = "string_list")]
        file: Vec<String>,
    },
    Template {
        template: String,
    },
    Local {
        local: String,
    },
    Remote {
        remote: String,
    },
}

impl IncludeRef {
    /// Parse the value of an `include` key: a string, a mapping, or a list
    /// of either. A project include with several files yields one reference
    /// per file.
    pub fn parse_list(value: &Value) -> Result<Vec<IncludeRef>> {
        match value {
            Value::Sequence(items) => {
                let mut refs = Vec::new();
                for item in items {
                    refs.extend(Self::parse_one(item)?);
                }
                Ok(refs)
            }
            other => Self::parse_one(other),
        }
    }

    fn parse_one(value: &Value) -> Result<Vec<IncludeRef>> {
        if let Some(location) = value.as_str() {
            return Ok(vec![
                if location.starts_with("http://") || location.starts_with("https://") {
                    IncludeRef::Remote(location.to_string())
                } else {
                    IncludeRef::Local(location.to_string())
                },
            ]);
        }

        let raw: RawInclude =
            serde_yaml::from_value(value.clone()).map_err(|e| Error::MalformedInclude {
                include: format!("{:?}", value),
                message: e.to_string(),
            })?;

        Ok(match raw {
            RawInclude::Project {
                project,
                reference,
                file,
            } => file
                .into_iter()
                .map(|file| IncludeRef::Project {
                    project: project.clone(),
                    reference: reference.clone(),
                    file,
                })
                .collect(),
            RawInclude::Template { template } => vec![IncludeRef::Template(template)],
            RawInclude::Local { local } => vec![IncludeRef::Local(local)],
            RawInclude::Remote { remote } => vec![IncludeRef::Remote(remote)],
        })
    }

    /// Memoization key: origin, ref and path.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IncludeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncludeRef::Project {
                project,
                reference,
                file,
            } => write!(f, "project:{}@{}:{}", project, reference, file),
            IncludeRef::Template(template) => write!(f, "template:{}", template),
            IncludeRef::Local(path) => write!(f, "local:{}", path),
            IncludeRef::Remote(url) => write!(f, "remote:{}", url),
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn variables_from_value(value: &Value) -> Result<BTreeMap<String, String>> {
    variables_map(value).map_err(Error::InvalidPipeline)
}

fn variables_map(value: &Value) -> std::result::Result<BTreeMap<String, String>, String> {
    let Value::Mapping(mapping) = value else {
        return Err("variables must be a mapping".to_string());
    };
    let mut vars = BTreeMap::new();
    for (key, value) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| format!("variable names must be strings, found {:?}", key))?;
        let value = match value {
            Value::Mapping(detail) => detail.get("value").and_then(scalar_to_string),
            other => scalar_to_string(other),
        }
        .ok_or_else(|| format!("variable '{}' must be a scalar", key))?;
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

fn string_list_from_value(value: &Value) -> std::result::Result<Vec<String>, String> {
    match value {
        Value::Sequence(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(string_list_from_value(item)?);
            }
            Ok(out)
        }
        Value::Null => Ok(Vec::new()),
        other => scalar_to_string(other)
            .map(|s| vec![s])
            .ok_or_else(|| format!("expected a string or a list of strings, found {:?}", other)),
    }
}

/// A string or an arbitrarily nested list of strings (as produced by YAML
/// anchors), flattened.
fn string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    string_list_from_value(&value).map_err(D::Error::custom)
}

fn variable_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    variables_map(&value).map_err(D::Error::custom)
}

/// `image: rust:1.85` or `image: { name: rust:1.85 }`.
fn image_name<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Mapping(m) => m
            .get("name")
            .and_then(Value::as_str)
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| D::Error::custom("image mapping requires a 'name'")),
        other => Err(D::Error::custom(format!("invalid image: {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
variables:
  PYTHONPATH: src
  RETRIES: 3

stages: [lint, test]

cache:
  paths: [.cache/pip]

include:
  - project: ci/templates
    ref: main
    file: [security.yml, docs.yml]
  - template: Jobs/SAST.yml
  - ci/local.yml

default:
  image: python:3.12
  before_script: pip install -r requirements.txt

.pytest:
  stage: test
  script:
    - pytest --junitxml=report.xml
  artifacts:
    when: always
    reports:
      junit: report.xml

lint:
  stage: lint
  script: flake8 src
  rules:
    - if: '$CI_PIPELINE_SOURCE == "push"'

test:
  extends: .pytest
  variables:
    COVERAGE: "1"
"#;

    #[test]
    fn test_parse_document() {
        let doc = PipelineDocument::from_yaml(PIPELINE).unwrap();
        assert_eq!(doc.variables["RETRIES"], "3");
        assert_eq!(doc.stages, Some(vec!["lint".to_string(), "test".to_string()]));
        assert_eq!(doc.include.len(), 4);
        assert_eq!(
            doc.include[1],
            IncludeRef::Project {
                project: "ci/templates".into(),
                reference: "main".into(),
                file: "docs.yml".into()
            }
        );
        assert_eq!(doc.include[2], IncludeRef::Template("Jobs/SAST.yml".into()));
        assert_eq!(doc.include[3], IncludeRef::Local("ci/local.yml".into()));
        assert!(doc.templates.contains_key(".pytest"));
        assert_eq!(doc.jobs.len(), 2);
    }

    #[test]
    fn test_materialize_extends_and_default() {
        let spec = PipelineDocument::from_yaml(PIPELINE)
            .unwrap()
            .materialize()
            .unwrap();

        let test = spec.job("test").unwrap();
        assert_eq!(test.stage, "test");
        assert_eq!(test.image.as_deref(), Some("python:3.12"));
        assert_eq!(test.before_script, vec!["pip install -r requirements.txt"]);
        assert_eq!(test.script, vec!["pytest --junitxml=report.xml"]);
        assert_eq!(test.junit_reports(), ["report.xml".to_string()]);
        assert_eq!(
            test.artifacts.as_ref().map(|a| a.when),
            Some(ArtifactWhen::Always)
        );
        assert_eq!(test.variables["COVERAGE"], "1");
        assert_eq!(
            test.cache.as_ref().map(|c| c.paths.clone()),
            Some(vec![".cache/pip".to_string()])
        );

        let lint = spec.job("lint").unwrap();
        assert_eq!(lint.script, vec!["flake8 src"]);
        assert_eq!(lint.rules.len(), 1);
    }

    #[test]
    fn test_unknown_stage() {
        let yaml = r#"
stages: [build]
lint:
  stage: lint
  script: echo lint
"#;
        let err = PipelineDocument::from_yaml(yaml)
            .unwrap()
            .materialize()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownStage { ref job, ref stage } if job == "lint" && stage == "lint"));
    }

    #[test]
    fn test_duplicate_stage() {
        let yaml = r#"
stages: [build, build]
compile:
  stage: build
  script: make
"#;
        let err = PipelineDocument::from_yaml(yaml)
            .unwrap()
            .materialize()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateStage(ref s) if s == "build"));
    }

    #[test]
    fn test_unknown_template() {
        let yaml = r#"
test:
  extends: .missing
  script: echo hi
"#;
        let err = PipelineDocument::from_yaml(yaml)
            .unwrap()
            .materialize()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTemplate { .. }));
    }

    #[test]
    fn test_job_without_script() {
        let yaml = "build:\n  stage: build\n";
        let err = PipelineDocument::from_yaml(yaml)
            .unwrap()
            .materialize()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_merge_included_local_precedence() {
        let mut local = PipelineDocument::from_yaml(
            r#"
test:
  script: echo local
"#,
        )
        .unwrap();
        let included = PipelineDocument::from_yaml(
            r#"
stages: [build, test]
variables:
  FROM_INCLUDE: "yes"
test:
  script: echo included
sast:
  script: echo scan
"#,
        )
        .unwrap();

        local.merge_included(&included);
        let spec = local.materialize().unwrap();
        assert_eq!(spec.job("test").unwrap().script, vec!["echo local"]);
        assert_eq!(spec.job("sast").unwrap().script, vec!["echo scan"]);
        assert_eq!(spec.stages, vec!["build", "test"]);
        assert_eq!(spec.variables["FROM_INCLUDE"], "yes");
    }

    #[test]
    fn test_deep_merge() {
        let base: Mapping =
            serde_yaml::from_str("artifacts: {when: always, paths: [a]}\nscript: [x]").unwrap();
        let overlay: Mapping = serde_yaml::from_str("artifacts: {paths: [b]}").unwrap();
        let merged = deep_merge(base, overlay);
        let expected: Mapping =
            serde_yaml::from_str("artifacts: {when: always, paths: [b]}\nscript: [x]").unwrap();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_cache_key_forms() {
        let literal: CacheConfig = serde_yaml::from_str("key: deps\npaths: [vendor]").unwrap();
        assert_eq!(literal.key, Some(CacheKeySpec::Literal("deps".into())));

        let files: CacheConfig =
            serde_yaml::from_str("key: {files: [Cargo.lock], prefix: rust}\npaths: [target]")
                .unwrap();
        assert_eq!(
            files.key,
            Some(CacheKeySpec::Files {
                files: vec!["Cargo.lock".into()],
                prefix: Some("rust".into())
            })
        );
    }

    #[test]
    fn test_artifact_when_policy() {
        assert!(ArtifactWhen::Always.applies(true));
        assert!(ArtifactWhen::Always.applies(false));
        assert!(ArtifactWhen::OnSuccess.applies(true));
        assert!(!ArtifactWhen::OnSuccess.applies(false));
        assert!(ArtifactWhen::OnFailure.applies(false));
        assert!(!ArtifactWhen::OnFailure.applies(true));
    }

    #[test]
    fn test_malformed_include() {
        let err = PipelineDocument::from_yaml("include:\n  - { file: a.yml }\n").unwrap_err();
        assert!(matches!(err, Error::MalformedInclude { .. }));
    }
}
