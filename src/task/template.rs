#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::parse_duration;
use crate::error::TemplateError;
use crate::runner::agent::Agent;
use crate::step::definition::{
    AiStepConfig, CiStepConfig, GitOperation, GitStepConfig, LoopUntil, SddStepConfig, StepConfig,
    StepDefinition, StepType, ValidationStepConfig, VerifyStepConfig,
};

/// A named, ordered list of steps plus the defaults a run starts from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub steps: Vec<StepDefinition>,
}

fn default_branch_prefix() -> String {
    "feat".to_owned()
}

impl Template {
    fn builtin(id: &str, description: &str, prefix: &str, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.to_owned(),
            description: description.to_owned(),
            branch_prefix: prefix.to_owned(),
            default_agent: None,
            default_model: None,
            steps,
        }
    }

    /// Reject templates that could only fail at run time.
    pub fn validate(&self) -> Result<(), TemplateError> {
        let invalid = |reason: String| TemplateError::Invalid {
            id: self.id.clone(),
            reason,
        };
        if self.steps.is_empty() {
            return Err(invalid("has no steps".to_owned()));
        }
        if let Some(agent) = &self.default_agent {
            let agent: Agent = agent.parse().map_err(|e: crate::error::EngineError| invalid(e.to_string()))?;
            if let Some(model) = &self.default_model {
                agent.validate_model(model).map_err(|e| invalid(e.to_string()))?;
            }
        }
        validate_steps(&self.steps, false).map_err(invalid)
    }
}

fn check_duration(step: &str, field: &str, raw: Option<&str>) -> Result<(), String> {
    match raw {
        Some(s) => parse_duration(s)
            .map(|_| ())
            .map_err(|e| format!("step '{step}' {field}: {e}")),
        None => Ok(()),
    }
}

fn validate_steps(steps: &[StepDefinition], nested: bool) -> Result<(), String> {
    let mut seen = BTreeSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err("a step has an empty name".to_owned());
        }
        if !seen.insert(step.name.as_str()) {
            return Err(format!("duplicate step name '{}'", step.name));
        }
        match &step.config {
            StepConfig::Ai(c) => check_duration(&step.name, "timeout", c.timeout.as_deref())?,
            StepConfig::Validation(c) => {
                check_duration(&step.name, "timeout", c.timeout.as_deref())?;
            }
            StepConfig::Ci(c) => {
                check_duration(&step.name, "poll_interval", c.poll_interval.as_deref())?;
                check_duration(&step.name, "timeout", c.timeout.as_deref())?;
            }
            StepConfig::Human(_) if nested => {
                return Err(format!(
                    "human step '{}' cannot run inside a loop",
                    step.name
                ));
            }
            StepConfig::Loop(l) => {
                if l.steps.is_empty() {
                    return Err(format!("loop step '{}' has no nested steps", step.name));
                }
                if l.max_iterations == 0 {
                    return Err(format!("loop step '{}' needs max_iterations > 0", step.name));
                }
                if l.until == LoopUntil::Signal
                    && l.exit_signal.as_deref().is_none_or(|s| s.trim().is_empty())
                {
                    return Err(format!(
                        "loop step '{}' uses until: signal without an exit_signal",
                        step.name
                    ));
                }
                validate_steps(&l.steps, true)?;
            }
            StepConfig::Git(_)
            | StepConfig::Verify(_)
            | StepConfig::Sdd(_)
            | StepConfig::Human(_) => {}
        }
    }
    Ok(())
}

/// Walk the raw YAML first so an unknown `type` gets its own error instead of
/// serde's generic "unknown variant".
fn check_step_types(template: &str, steps: &serde_yaml::Value) -> Result<(), TemplateError> {
    let Some(seq) = steps.as_sequence() else {
        return Ok(());
    };
    for step in seq {
        let name = step
            .get("name")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or("<unnamed>");
        if let Some(t) = step.get("type").and_then(serde_yaml::Value::as_str)
            && t.parse::<StepType>().is_err()
        {
            return Err(TemplateError::UnknownStepType {
                template: template.to_owned(),
                step: name.to_owned(),
                step_type: t.to_owned(),
            });
        }
        if let Some(nested) = step.get("steps") {
            check_step_types(template, nested)?;
        }
    }
    Ok(())
}

/// Parse one YAML template; `fallback_id` is used when the file has no `id`.
pub fn parse_template(yaml: &str, fallback_id: &str, path: &Path) -> Result<Template, TemplateError> {
    let raw: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|source| TemplateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let id = raw
        .get("id")
        .and_then(serde_yaml::Value::as_str)
        .unwrap_or(fallback_id)
        .to_owned();
    if let Some(steps) = raw.get("steps") {
        check_step_types(&id, steps)?;
    }
    let mut template: Template =
        serde_yaml::from_value(raw).map_err(|source| TemplateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    template.id = id;
    template.validate()?;
    Ok(template)
}

fn ai(name: &str, prompt: &str) -> StepDefinition {
    StepDefinition::new(
        name,
        StepConfig::Ai(AiStepConfig {
            prompt: Some(prompt.to_owned()),
            ..AiStepConfig::default()
        }),
    )
}

fn validate() -> StepDefinition {
    StepDefinition::new("validate", StepConfig::Validation(ValidationStepConfig::default()))
        .describe("Run format, lint and test commands")
}

fn git(name: &str, op: GitOperation) -> StepDefinition {
    StepDefinition::new(name, StepConfig::Git(GitStepConfig::new(op)))
}

fn builtins() -> Vec<Template> {
    vec![
        Template::builtin(
            "bugfix",
            "Fix a bug, validate, and open a pull request",
            "fix",
            vec![
                ai(
                    "fix",
                    "Fix the following bug. Find the root cause, fix it with the smallest \
                     reasonable change, and add a regression test.\n\n{{description}}",
                )
                .describe("Diagnose and fix the bug"),
                validate(),
                git("commit", GitOperation::Commit),
                git("push", GitOperation::Push),
                git("pr", GitOperation::CreatePr),
            ],
        ),
        Template::builtin(
            "feature",
            "Specify, implement, verify and ship a feature",
            "feat",
            vec![
                StepDefinition::new("specify", StepConfig::Sdd(SddStepConfig::default()))
                    .describe("Write a specification first"),
                ai(
                    "implement",
                    "Implement the following feature according to the specification at \
                     specs/{{task_id}}/spec.md. Include tests.\n\n{{description}}",
                )
                .describe("Implement the feature"),
                validate(),
                StepDefinition::new("verify", StepConfig::Verify(VerifyStepConfig::default()))
                    .describe("Cross-model review of the change")
                    .optional(),
                git("commit", GitOperation::Commit),
                git("push", GitOperation::Push),
                git("pr", GitOperation::CreatePr),
                StepDefinition::new("ci", StepConfig::Ci(CiStepConfig::default()))
                    .describe("Wait for CI checks"),
            ],
        ),
        Template::builtin(
            "task",
            "Implement a change and commit it locally",
            "task",
            vec![
                ai("implement", "{{description}}").describe("Make the change"),
                validate(),
                git("commit", GitOperation::Commit),
            ],
        ),
        Template::builtin(
            "commit",
            "Validate and commit the worktree's current changes",
            "chore",
            vec![validate(), git("commit", GitOperation::Commit)],
        ),
    ]
}

/// Built-in templates overlaid with the user's YAML files.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Template>,
}

impl TemplateRegistry {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            templates: builtins().into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// Built-ins plus every `*.yaml`/`*.yml` in `dir`. A user template with a
    /// built-in's id replaces it.
    pub fn load(dir: Option<&Path>) -> Result<Self, TemplateError> {
        let mut reg = Self::builtin();
        let Some(dir) = dir.filter(|d| d.is_dir()) else {
            return Ok(reg);
        };
        let entries = std::fs::read_dir(dir).map_err(|source| TemplateError::IoPath {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect();
        paths.sort();
        for path in paths {
            let yaml = std::fs::read_to_string(&path).map_err(|source| TemplateError::IoPath {
                path: path.clone(),
                source,
            })?;
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let template = parse_template(&yaml, stem, &path)?;
            if reg.templates.contains_key(&template.id) {
                info!(template = %template.id, path = %path.display(), "user template overrides built-in");
            } else {
                debug!(template = %template.id, path = %path.display(), "loaded user template");
            }
            reg.templates.insert(template.id.clone(), template);
        }
        Ok(reg)
    }

    pub fn get(&self, id: &str) -> Result<&Template, TemplateError> {
        self.templates
            .get(id)
            .ok_or_else(|| TemplateError::NotFound(id.to_owned()))
    }

    pub fn list(&self) -> impl Iterator<Item = &Template> {
        self.templates.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::definition::{HumanStepConfig, LoopStepConfig};

    #[test]
    fn builtins_are_valid() {
        let reg = TemplateRegistry::builtin();
        for id in ["bugfix", "feature", "task", "commit"] {
            reg.get(id).unwrap().validate().unwrap();
        }
        assert!(matches!(reg.get("deploy"), Err(TemplateError::NotFound(_))));
    }

    #[test]
    fn user_templates_override_builtins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("task.yaml"),
            "description: mine\nbranch_prefix: wip\nsteps:\n  - name: only\n    type: ai\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let reg = TemplateRegistry::load(Some(dir.path())).unwrap();
        let t = reg.get("task").unwrap();
        assert_eq!(t.branch_prefix, "wip");
        assert_eq!(t.steps.len(), 1);
        assert!(reg.get("bugfix").is_ok());
    }

    #[test]
    fn unknown_step_type_is_distinct() {
        let yaml = "steps:\n  - name: outer\n    type: loop\n    steps:\n      - name: ship\n        type: deploy\n";
        let err = parse_template(yaml, "custom", Path::new("custom.yaml")).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::UnknownStepType { ref step, ref step_type, .. }
                if step == "ship" && step_type == "deploy"
        ));
    }

    #[test]
    fn rejects_structural_mistakes() {
        let dup = Template::builtin(
            "dup",
            "",
            "feat",
            vec![validate(), validate()],
        );
        assert!(dup.validate().is_err());

        let human_in_loop = Template::builtin(
            "hil",
            "",
            "feat",
            vec![StepDefinition::new(
                "iterate",
                StepConfig::Loop(LoopStepConfig {
                    steps: vec![StepDefinition::new(
                        "ask",
                        StepConfig::Human(HumanStepConfig::default()),
                    )],
                    max_iterations: 2,
                    until: LoopUntil::Success,
                    exit_signal: None,
                }),
            )],
        );
        assert!(human_in_loop.validate().is_err());

        let bad_timeout = Template::builtin(
            "slow",
            "",
            "feat",
            vec![StepDefinition::new(
                "implement",
                StepConfig::Ai(AiStepConfig {
                    timeout: Some("soon".into()),
                    ..AiStepConfig::default()
                }),
            )],
        );
        assert!(bad_timeout.validate().is_err());
        assert!(Template::builtin("empty", "", "feat", Vec::new()).validate().is_err());
    }
}
