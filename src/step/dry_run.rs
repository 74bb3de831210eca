#![forbid(unsafe_code)]

//! Simulated execution: each step type describes what it would do without
//! touching the repository, the network, or the state store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::error::StepError;
use crate::step::ExecutionSettings;
use crate::step::definition::{
    GitOperation, LoopUntil, StepConfig, StepDefinition, StepType,
};
use crate::step::validation::ValidationPlan;
use crate::step::{resolve_agent, step_timeout};

pub const WORKSPACE_SIDE_EFFECT: &str = "Workspace creation (git worktree)";

/// What a step would do, in words, plus the configuration it would use.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub would_do: Vec<String>,
    pub config: Option<serde_json::Value>,
    /// Side effects the real run would have had.
    pub side_effects: Vec<String>,
}

/// Inputs a simulator may consult. Nothing here can mutate state.
pub struct SimulationContext<'a> {
    pub settings: &'a ExecutionSettings,
    pub repo: &'a Path,
    pub branch: &'a str,
    pub base: Option<&'a str>,
    pub agent: Option<&'a str>,
    pub model: Option<&'a str>,
    pub registry: &'a DryRunRegistry,
}

pub trait Simulator: Send + Sync {
    fn step_type(&self) -> StepType;

    fn simulate(&self, cx: &SimulationContext<'_>, step: &StepDefinition) -> Result<Plan, StepError>;
}

#[derive(Clone, Default)]
pub struct DryRunRegistry {
    simulators: BTreeMap<StepType, Arc<dyn Simulator>>,
}

impl DryRunRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn standard() -> Self {
        let mut reg = Self::empty();
        for step_type in StepType::ALL {
            reg.register(simulator_for(step_type));
        }
        reg
    }

    pub fn register(&mut self, sim: Arc<dyn Simulator>) -> Option<Arc<dyn Simulator>> {
        self.simulators.insert(sim.step_type(), sim)
    }

    pub fn get(&self, step_type: StepType) -> Result<Arc<dyn Simulator>, StepError> {
        self.simulators
            .get(&step_type)
            .cloned()
            .ok_or(StepError::NoExecutor(step_type))
    }
}

// Mirrors `executor_for`: both matches must name every StepType.
fn simulator_for(step_type: StepType) -> Arc<dyn Simulator> {
    match step_type {
        StepType::Ai => Arc::new(AiSimulator),
        StepType::Validation => Arc::new(ValidationSimulator),
        StepType::Git => Arc::new(GitSimulator),
        StepType::Verify => Arc::new(VerifySimulator),
        StepType::Sdd => Arc::new(SddSimulator),
        StepType::Ci => Arc::new(CiSimulator),
        StepType::Human => Arc::new(HumanSimulator),
        StepType::Loop => Arc::new(LoopSimulator),
    }
}

fn wrong_config(step: &StepDefinition) -> StepError {
    StepError::Failed(format!(
        "step '{}' does not carry {} configuration",
        step.name,
        step.step_type()
    ))
}

fn human_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else if secs > 0 {
        format!("{secs}s")
    } else {
        format!("{}ms", d.as_millis())
    }
}

struct AiSimulator;

impl Simulator for AiSimulator {
    fn step_type(&self) -> StepType {
        StepType::Ai
    }

    fn simulate(&self, cx: &SimulationContext<'_>, step: &StepDefinition) -> Result<Plan, StepError> {
        let StepConfig::Ai(cfg) = &step.config else {
            return Err(wrong_config(step));
        };
        let (agent, model) = resolve_agent(
            &[(cx.agent, cx.model), (cfg.agent.as_deref(), cfg.model.as_deref())],
            cx.settings,
        )?;
        let timeout = step_timeout(cfg.timeout.as_deref(), cx.settings.ai_timeout)?;
        Ok(Plan {
            would_do: vec![
                format!("Run {agent} ({model}) with the task prompt in the worktree"),
                format!("Allow the agent to modify files for up to {}", human_duration(timeout)),
            ],
            config: Some(json!({
                "agent": agent.as_str(),
                "model": model,
                "timeout": human_duration(timeout),
            })),
            side_effects: vec!["File modifications (AI agent)".to_owned()],
        })
    }
}

struct ValidationSimulator;

impl Simulator for ValidationSimulator {
    fn step_type(&self) -> StepType {
        StepType::Validation
    }

    fn simulate(&self, cx: &SimulationContext<'_>, step: &StepDefinition) -> Result<Plan, StepError> {
        let StepConfig::Validation(cfg) = &step.config else {
            return Err(wrong_config(step));
        };
        let plan = ValidationPlan::resolve(cfg, cx.settings, cx.repo)?;
        let mut would_do: Vec<String> = plan
            .format_commands
            .iter()
            .map(|c| format!("Run format command: {c}"))
            .chain(plan.commands.iter().map(|c| format!("Run validation command: {c}")))
            .collect();
        if would_do.is_empty() {
            would_do.push("No validation commands configured or detected".to_owned());
        }
        let side_effects = if plan.format_commands.is_empty() {
            Vec::new()
        } else {
            vec!["Auto-formatting of source files".to_owned()]
        };
        Ok(Plan {
            would_do,
            config: Some(json!({
                "format_commands": plan.format_commands,
                "commands": plan.commands,
                "timeout": human_duration(plan.timeout),
            })),
            side_effects,
        })
    }
}

struct GitSimulator;

impl Simulator for GitSimulator {
    fn step_type(&self) -> StepType {
        StepType::Git
    }

    fn simulate(&self, cx: &SimulationContext<'_>, step: &StepDefinition) -> Result<Plan, StepError> {
        let StepConfig::Git(cfg) = &step.config else {
            return Err(wrong_config(step));
        };
        let (would_do, effect) = match cfg.operation {
            GitOperation::Commit => (
                vec![
                    "Stage all changes in the worktree".to_owned(),
                    format!("Commit to branch {}", cx.branch),
                ],
                "Git commit",
            ),
            GitOperation::Push => (
                vec![format!("Push branch {} to {}", cx.branch, cx.settings.remote)],
                "Git push",
            ),
            GitOperation::CreatePr => {
                let base = cfg.base.as_deref().or(cx.base).unwrap_or("the default branch");
                let kind = if cfg.draft { "draft pull request" } else { "pull request" };
                (
                    vec![format!("Create {kind} from {} into {base}", cx.branch)],
                    "Pull request creation",
                )
            }
        };
        Ok(Plan {
            would_do,
            config: Some(json!({ "operation": cfg.operation.as_str() })),
            side_effects: vec![effect.to_owned()],
        })
    }
}

struct VerifySimulator;

impl Simulator for VerifySimulator {
    fn step_type(&self) -> StepType {
        StepType::Verify
    }

    fn simulate(&self, cx: &SimulationContext<'_>, step: &StepDefinition) -> Result<Plan, StepError> {
        let StepConfig::Verify(cfg) = &step.config else {
            return Err(wrong_config(step));
        };
        let (agent, model) = resolve_agent(
            &[
                (cfg.agent.as_deref(), cfg.model.as_deref()),
                (
                    cx.settings.verify_agent.map(|a| a.as_str()),
                    cx.settings.verify_model.as_deref(),
                ),
                (cx.agent, cx.model),
            ],
            cx.settings,
        )?;
        Ok(Plan {
            would_do: vec![format!(
                "Review the changes with {agent} ({model}) in read-only mode"
            )],
            config: Some(json!({ "agent": agent.as_str(), "model": model, "checks": cfg.checks })),
            side_effects: Vec::new(),
        })
    }
}

struct SddSimulator;

impl Simulator for SddSimulator {
    fn step_type(&self) -> StepType {
        StepType::Sdd
    }

    fn simulate(&self, cx: &SimulationContext<'_>, step: &StepDefinition) -> Result<Plan, StepError> {
        let StepConfig::Sdd(cfg) = &step.config else {
            return Err(wrong_config(step));
        };
        let (agent, model) = resolve_agent(
            &[(cx.agent, cx.model), (cfg.agent.as_deref(), cfg.model.as_deref())],
            cx.settings,
        )?;
        Ok(Plan {
            would_do: vec![format!(
                "Generate a specification document at {} with {agent} ({model})",
                cfg.output
            )],
            config: Some(json!({ "agent": agent.as_str(), "model": model, "output": cfg.output })),
            side_effects: vec!["Specification document generation".to_owned()],
        })
    }
}

struct CiSimulator;

impl Simulator for CiSimulator {
    fn step_type(&self) -> StepType {
        StepType::Ci
    }

    fn simulate(&self, cx: &SimulationContext<'_>, step: &StepDefinition) -> Result<Plan, StepError> {
        let StepConfig::Ci(cfg) = &step.config else {
            return Err(wrong_config(step));
        };
        let interval = step_timeout(cfg.poll_interval.as_deref(), cx.settings.ci_poll_interval)?;
        let timeout = step_timeout(cfg.timeout.as_deref(), cx.settings.ci_timeout)?;
        let scope = if cfg.checks.is_empty() {
            "all checks".to_owned()
        } else {
            cfg.checks.join(", ")
        };
        Ok(Plan {
            would_do: vec![format!(
                "Poll CI ({scope}) every {} for up to {}",
                human_duration(interval),
                human_duration(timeout)
            )],
            config: Some(json!({
                "poll_interval": human_duration(interval),
                "timeout": human_duration(timeout),
                "checks": cfg.checks,
            })),
            side_effects: vec!["CI status polling".to_owned()],
        })
    }
}

struct HumanSimulator;

impl Simulator for HumanSimulator {
    fn step_type(&self) -> StepType {
        StepType::Human
    }

    fn simulate(&self, _cx: &SimulationContext<'_>, step: &StepDefinition) -> Result<Plan, StepError> {
        let StepConfig::Human(cfg) = &step.config else {
            return Err(wrong_config(step));
        };
        Ok(Plan {
            would_do: vec![format!("Pause for human approval: {}", cfg.prompt)],
            config: None,
            side_effects: Vec::new(),
        })
    }
}

struct LoopSimulator;

impl Simulator for LoopSimulator {
    fn step_type(&self) -> StepType {
        StepType::Loop
    }

    fn simulate(&self, cx: &SimulationContext<'_>, step: &StepDefinition) -> Result<Plan, StepError> {
        let StepConfig::Loop(cfg) = &step.config else {
            return Err(wrong_config(step));
        };
        let until = match cfg.until {
            LoopUntil::Success => "every nested step succeeds".to_owned(),
            LoopUntil::Signal => format!(
                "output contains '{}'",
                cfg.exit_signal.as_deref().unwrap_or_default()
            ),
            LoopUntil::Exhausted => "all iterations have run".to_owned(),
        };
        let mut plan = Plan {
            would_do: vec![format!(
                "Repeat up to {} time(s) until {until}:",
                cfg.max_iterations
            )],
            config: Some(json!({
                "max_iterations": cfg.max_iterations,
                "until": cfg.until,
                "steps": cfg.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            })),
            side_effects: Vec::new(),
        };
        for (i, nested) in cfg.steps.iter().enumerate() {
            let inner = cx.registry.get(nested.step_type())?.simulate(cx, nested)?;
            plan.would_do
                .push(format!("  {}. {} ({})", i + 1, nested.name, nested.step_type()));
            plan.would_do
                .extend(inner.would_do.into_iter().map(|w| format!("     {w}")));
            plan.side_effects.extend(inner.side_effects);
        }
        Ok(plan)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DryRunWorkspace {
    pub name: String,
    pub branch: String,
    pub would_create: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DryRunStep {
    pub index: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
    pub status: &'static str,
    pub would_do: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DryRunSummary {
    pub total_steps: usize,
    pub side_effects_prevented: Vec<String>,
}

/// The machine-readable dry-run report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DryRunReport {
    pub dry_run: bool,
    pub template: String,
    pub workspace: DryRunWorkspace,
    pub steps: Vec<DryRunStep>,
    pub summary: DryRunSummary,
}

/// Simulate every step of a template. Steps without a simulator are logged
/// and left out of the report.
pub fn build_report(
    cx: &SimulationContext<'_>,
    template_id: &str,
    workspace: DryRunWorkspace,
    steps: &[StepDefinition],
) -> Result<DryRunReport, StepError> {
    let mut effects = vec![WORKSPACE_SIDE_EFFECT.to_owned()];
    let mut entries = Vec::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        let sim = match cx.registry.get(step.step_type()) {
            Ok(sim) => sim,
            Err(e) => {
                warn!(step = %step.name, error = %e, "skipping step in dry run");
                continue;
            }
        };
        let plan = sim.simulate(cx, step)?;
        for effect in plan.side_effects {
            if !effects.contains(&effect) {
                effects.push(effect);
            }
        }
        entries.push(DryRunStep {
            index,
            name: step.name.clone(),
            step_type: step.step_type(),
            description: step.description.clone(),
            required: step.required,
            status: "would_execute",
            would_do: plan.would_do,
            config: plan.config,
        });
    }
    Ok(DryRunReport {
        dry_run: true,
        template: template_id.to_owned(),
        workspace,
        summary: DryRunSummary {
            total_steps: steps.len(),
            side_effects_prevented: effects,
        },
        steps: entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::definition::{AiStepConfig, GitStepConfig, HumanStepConfig};

    fn cx<'a>(
        settings: &'a ExecutionSettings,
        repo: &'a Path,
        registry: &'a DryRunRegistry,
    ) -> SimulationContext<'a> {
        SimulationContext {
            settings,
            repo,
            branch: "feat/x",
            base: Some("main"),
            agent: None,
            model: None,
            registry,
        }
    }

    #[test]
    fn report_matches_schema() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExecutionSettings::default();
        let registry = DryRunRegistry::standard();
        let steps = vec![
            StepDefinition::new("implement", StepConfig::Ai(AiStepConfig::default()))
                .describe("Make the change"),
            StepDefinition::new("commit", StepConfig::Git(GitStepConfig::new(GitOperation::Commit))),
            StepDefinition::new("review", StepConfig::Human(HumanStepConfig::default())).optional(),
        ];
        let report = build_report(
            &cx(&settings, dir.path(), &registry),
            "feature",
            DryRunWorkspace {
                name: "x".into(),
                branch: "feat/x".into(),
                would_create: true,
            },
            &steps,
        )
        .unwrap();

        let v = serde_json::to_value(&report).unwrap();
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 5);
        assert_eq!(v["dry_run"], true);
        assert_eq!(v["workspace"], json!({"name": "x", "branch": "feat/x", "would_create": true}));
        assert_eq!(v["steps"][0]["type"], "ai");
        assert_eq!(v["steps"][0]["status"], "would_execute");
        assert_eq!(v["steps"][0]["description"], "Make the change");
        assert!(v["steps"][1].get("description").is_none());
        assert!(v["steps"][2].get("config").is_none());
        assert_eq!(v["steps"][2]["required"], false);
        assert_eq!(v["summary"]["total_steps"], 3);
        assert_eq!(
            v["summary"]["side_effects_prevented"],
            json!([WORKSPACE_SIDE_EFFECT, "File modifications (AI agent)", "Git commit"])
        );
    }

    #[test]
    fn standard_registry_covers_every_step_type() {
        let reg = DryRunRegistry::standard();
        for t in StepType::ALL {
            assert_eq!(reg.get(t).unwrap().step_type(), t);
        }
    }

    #[test]
    fn missing_simulator_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExecutionSettings::default();
        let registry = DryRunRegistry::empty();
        let steps = vec![StepDefinition::new("implement", StepConfig::Ai(AiStepConfig::default()))];
        let report = build_report(
            &cx(&settings, dir.path(), &registry),
            "task",
            DryRunWorkspace {
                name: "x".into(),
                branch: "feat/x".into(),
                would_create: false,
            },
            &steps,
        )
        .unwrap();
        assert!(report.steps.is_empty());
        assert_eq!(report.summary.total_steps, 1);
        assert_eq!(report.summary.side_effects_prevented, vec![WORKSPACE_SIDE_EFFECT]);
    }
}
