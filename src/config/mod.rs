#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::runner::agent::Agent;
use crate::runner::ai::AgentExecutables;
use crate::step::ExecutionSettings;
use crate::task::retry::RetryPolicy;
use crate::workspace::manager::WorktreeSettings;

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "TASKSMITH_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub ai: AiConfig,
    pub validation: ValidationConfig,
    pub ci: CiConfig,
    pub templates: TemplatesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Workspace and task records.
    pub state_dir: String,
    /// Parent directory for worktrees; empty means next to the repository.
    #[serde(alias = "basedir")]
    pub base_dir: String,
    #[serde(alias = "template")]
    pub path_template: String,
    pub branch_prefix: String,
    pub remote: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            state_dir: "~/.local/share/tasksmith".to_owned(),
            base_dir: String::new(),
            path_template: "{{repo}}-{{name}}".to_owned(),
            branch_prefix: "feat".to_owned(),
            remote: "origin".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiConfig {
    pub agent: String,
    /// Empty means the agent's default model.
    pub model: String,
    pub timeout: String,
    pub verify_agent: String,
    pub verify_model: String,
    pub executables: ExecutablesConfig,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            agent: "claude".to_owned(),
            model: String::new(),
            timeout: "30m".to_owned(),
            verify_agent: String::new(),
            verify_model: String::new(),
            executables: ExecutablesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutablesConfig {
    pub claude: String,
    pub codex: String,
    pub gemini: String,
}

impl Default for ExecutablesConfig {
    fn default() -> Self {
        let d = AgentExecutables::default();
        Self {
            claude: d.claude,
            codex: d.codex,
            gemini: d.gemini,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    pub format_commands: Vec<String>,
    pub lint_commands: Vec<String>,
    pub test_commands: Vec<String>,
    pub timeout: String,
    pub ai_retry: AiRetryConfig,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            format_commands: Vec::new(),
            lint_commands: Vec::new(),
            test_commands: Vec::new(),
            timeout: "10m".to_owned(),
            ai_retry: AiRetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiRetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub initial_delay: String,
    pub max_delay: String,
}

impl Default for AiRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            backoff_factor: 2.0,
            initial_delay: "1s".to_owned(),
            max_delay: "1m".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CiConfig {
    pub poll_interval: String,
    pub timeout: String,
    /// Polls with no checks reported before the ci step passes anyway.
    pub grace_polls: u32,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            poll_interval: "30s".to_owned(),
            timeout: "30m".to_owned(),
            grace_polls: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TemplatesConfig {
    pub dir: String,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            dir: "~/.config/tasksmith/templates".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
}

pub fn default_paths() -> anyhow::Result<ConfigPaths> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Ok(ConfigPaths {
            config_file: PathBuf::from(path),
        });
    }
    let unix = home_config_path_unix();
    if !cfg!(windows) {
        return Ok(ConfigPaths { config_file: unix });
    }

    // Windows: prefer the Unix-style path if present for portability.
    if unix.exists() {
        return Ok(ConfigPaths { config_file: unix });
    }

    let proj = ProjectDirs::from("dev", "tasksmith", "tasksmith")
        .context("failed to determine platform config directory")?;
    Ok(ConfigPaths {
        config_file: proj.config_dir().join("config.toml"),
    })
}

fn home_config_path_unix() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("~"));
    home.join(".config").join("tasksmith").join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    let drive = std::env::var_os("HOMEDRIVE");
    let path = std::env::var_os("HOMEPATH");
    match (drive, path) {
        (Some(d), Some(p)) => Some(PathBuf::from(d).join(PathBuf::from(p))),
        _ => None,
    }
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

/// Shorten paths under `$HOME` for display.
#[must_use]
pub fn tilde_path(input: &str) -> String {
    let Some(home) = home_dir() else {
        return input.to_owned();
    };
    let home_str = home.to_string_lossy();
    if let Some(rest) = input.strip_prefix(home_str.as_ref()) {
        if rest.is_empty() {
            return "~".to_owned();
        }
        if rest.starts_with(std::path::MAIN_SEPARATOR) {
            return format!("~{rest}");
        }
    }
    input.to_owned()
}

/// `~` and `$VAR` expansion; relative results are anchored at the cwd.
pub fn expand_path(input: &str) -> Result<PathBuf, ConfigError> {
    let p = PathBuf::from(expand_env_vars(&expand_tilde(input)));
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| ConfigError::Invalid(format!("cannot resolve '{input}': {e}")))?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // Expand $VAR and ${VAR}. Leave unknown vars untouched.
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

/// Human durations: `500ms`, `30s`, `5m`, `2h`, `1d`, `1w`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_owned());
    if s.is_empty() {
        return Err(invalid());
    }

    let (num, unit) = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .map_or((s, ""), |i| s.split_at(i));
    let n: u64 = num.parse().map_err(|_| invalid())?;

    let secs = |mult: u64| n.checked_mul(mult).map(Duration::from_secs).ok_or_else(invalid);
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(n)),
        "s" | "" => secs(1),
        "m" => secs(60),
        "h" => secs(60 * 60),
        "d" => secs(24 * 60 * 60),
        "w" => secs(7 * 24 * 60 * 60),
        _ => Err(invalid()),
    }
}

fn opt(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn agent_value(key: &str, raw: &str) -> Result<Agent, ConfigError> {
    raw.parse::<Agent>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_owned(),
        msg: e.to_string(),
    })
}

fn duration_value(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse_duration(raw).map_err(|e| ConfigError::InvalidValue {
        key: key.to_owned(),
        msg: e.to_string(),
    })
}

pub fn load() -> anyhow::Result<(Config, toml_edit::DocumentMut, ConfigPaths)> {
    let paths = default_paths()?;
    let (doc, cfg) = load_from_file(&paths.config_file)?;
    cfg.validate()?;
    Ok((cfg, doc, paths))
}

pub fn list_resolved_toml() -> anyhow::Result<String> {
    let (cfg, _doc, _paths) = load()?;
    Ok(toml::to_string_pretty(&cfg)?)
}

pub fn get_value_string(key: &str) -> anyhow::Result<Option<String>> {
    let paths = default_paths()?;
    get_value_string_at_path(&paths.config_file, key)
}

pub fn set_value_string(key: &str, value: &str) -> anyhow::Result<()> {
    let paths = default_paths()?;
    set_value_string_at_path(&paths.config_file, key, value)
}

pub fn load_from_file(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    if !path.exists() {
        return Ok((toml_edit::DocumentMut::new(), Config::default()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;

    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let (_doc, cfg) = load_from_file(path)?;
    cfg.validate()?;
    let norm = normalize_key(key);
    let value = lookup_value(&cfg, &norm);
    Ok(value.map(format_value_for_stdout))
}

/// Edit one key in place, keeping the file's comments and layout.
pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let (mut doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let (norm_key, value_item) = normalize_key_and_parse_value(key, value)?;
    apply_set(&mut doc, &norm_key, value_item)?;

    // Validate by re-parsing the updated doc into a Config.
    let new_raw = doc.to_string();
    let new_cfg: Config = toml::from_str(&new_raw)
        .with_context(|| format!("config update produced invalid TOML for {}", path.display()))?;
    new_cfg.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, new_raw.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(key = %norm_key, path = %path.display(), "config updated");

    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));
        if self.workspace.state_dir.trim().is_empty() {
            return invalid("workspace.state_dir must not be empty");
        }
        if !self.workspace.path_template.contains("{{name}}") {
            return invalid("workspace.path_template must contain {{name}}");
        }
        if self.workspace.branch_prefix.trim().is_empty() {
            return invalid("workspace.branch_prefix must not be empty");
        }
        let agent = agent_value("ai.agent", &self.ai.agent)?;
        if let Some(model) = opt(&self.ai.model) {
            agent.validate_model(model).map_err(|e| ConfigError::InvalidValue {
                key: "ai.model".to_owned(),
                msg: e.to_string(),
            })?;
        }
        if let Some(v) = opt(&self.ai.verify_agent) {
            let verify = agent_value("ai.verify_agent", v)?;
            if let Some(model) = opt(&self.ai.verify_model) {
                verify.validate_model(model).map_err(|e| ConfigError::InvalidValue {
                    key: "ai.verify_model".to_owned(),
                    msg: e.to_string(),
                })?;
            }
        }
        duration_value("ai.timeout", &self.ai.timeout)?;
        duration_value("validation.timeout", &self.validation.timeout)?;

        let retry = &self.validation.ai_retry;
        if retry.max_attempts == 0 {
            return invalid("validation.ai_retry.max_attempts must be >= 1");
        }
        if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
            return invalid("validation.ai_retry.backoff_factor must be >= 1.0");
        }
        duration_value("validation.ai_retry.initial_delay", &retry.initial_delay)?;
        duration_value("validation.ai_retry.max_delay", &retry.max_delay)?;

        if duration_value("ci.poll_interval", &self.ci.poll_interval)?.is_zero() {
            return invalid("ci.poll_interval must be > 0");
        }
        duration_value("ci.timeout", &self.ci.timeout)?;
        Ok(())
    }

    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        expand_path(&self.workspace.state_dir)
    }

    pub fn templates_dir(&self) -> Result<Option<PathBuf>, ConfigError> {
        opt(&self.templates.dir).map(expand_path).transpose()
    }

    pub fn worktree_settings(&self) -> Result<WorktreeSettings, ConfigError> {
        Ok(WorktreeSettings {
            branch_prefix: self.workspace.branch_prefix.trim().to_owned(),
            remote: self.workspace.remote.trim().to_owned(),
            base_dir: opt(&self.workspace.base_dir).map(expand_path).transpose()?,
            path_template: self.workspace.path_template.clone(),
        })
    }

    pub fn execution_settings(&self) -> Result<ExecutionSettings, ConfigError> {
        let agent = agent_value("ai.agent", &self.ai.agent)?;
        let verify_agent = opt(&self.ai.verify_agent)
            .map(|v| agent_value("ai.verify_agent", v))
            .transpose()?;
        let mut validation_commands = self.validation.lint_commands.clone();
        validation_commands.extend(self.validation.test_commands.iter().cloned());
        Ok(ExecutionSettings {
            agent,
            model: opt(&self.ai.model).map_or_else(|| agent.default_model().to_owned(), str::to_owned),
            verify_agent,
            verify_model: opt(&self.ai.verify_model).map(str::to_owned),
            ai_timeout: duration_value("ai.timeout", &self.ai.timeout)?,
            format_commands: self.validation.format_commands.clone(),
            validation_commands,
            command_timeout: duration_value("validation.timeout", &self.validation.timeout)?,
            ci_poll_interval: duration_value("ci.poll_interval", &self.ci.poll_interval)?,
            ci_timeout: duration_value("ci.timeout", &self.ci.timeout)?,
            ci_grace_polls: self.ci.grace_polls,
            remote: self.workspace.remote.trim().to_owned(),
        })
    }

    /// `None` when AI repair of validation failures is switched off.
    pub fn retry_policy(&self) -> Result<Option<RetryPolicy>, ConfigError> {
        let r = &self.validation.ai_retry;
        if !r.enabled {
            return Ok(None);
        }
        Ok(Some(RetryPolicy {
            max_attempts: r.max_attempts,
            backoff_factor: r.backoff_factor,
            initial_delay: duration_value("validation.ai_retry.initial_delay", &r.initial_delay)?,
            max_delay: duration_value("validation.ai_retry.max_delay", &r.max_delay)?,
        }))
    }

    #[must_use]
    pub fn agent_executables(&self) -> AgentExecutables {
        let e = &self.ai.executables;
        AgentExecutables {
            claude: e.claude.clone(),
            codex: e.codex.clone(),
            gemini: e.gemini.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Bool,
    Int,
    Float,
    String,
    Duration,
    /// Comma-separated on the command line, a TOML array in the file.
    List,
    Enum(&'static [&'static str]),
}

const AGENTS: &[&str] = &["claude", "codex", "gemini"];

fn normalize_key(key: &str) -> String {
    match key.trim() {
        "workspace.basedir" => "workspace.base_dir",
        "workspace.template" => "workspace.path_template",
        "ai.claude" => "ai.executables.claude",
        "ai.codex" => "ai.executables.codex",
        "ai.gemini" => "ai.executables.gemini",
        other => other,
    }
    .to_owned()
}

fn normalize_key_and_parse_value(key: &str, value: &str) -> anyhow::Result<(String, toml_edit::Item)> {
    let norm = normalize_key(key);
    let key_type = key_type(&norm).ok_or_else(|| ConfigError::InvalidKey(key.to_owned()))?;
    let bad = |msg: String| ConfigError::InvalidValue {
        key: key.to_owned(),
        msg,
    };
    let item = match key_type {
        KeyType::Bool => toml_edit::value(parse_bool(value).map_err(bad)?),
        KeyType::Int => toml_edit::value(parse_int(value).map_err(bad)?),
        KeyType::Float => toml_edit::value(parse_float(value).map_err(bad)?),
        KeyType::String => toml_edit::value(value),
        KeyType::Duration => {
            parse_duration(value).map_err(|e| bad(e.to_string()))?;
            toml_edit::value(value.trim())
        }
        KeyType::List => {
            let mut arr = toml_edit::Array::new();
            for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                arr.push(part);
            }
            toml_edit::value(arr)
        }
        KeyType::Enum(allowed) => {
            let v = value.trim();
            if !allowed.contains(&v) {
                return Err(bad(format!("must be one of: {}", allowed.join(", "))).into());
            }
            toml_edit::value(v)
        }
    };

    Ok((norm, item))
}

fn key_type(key: &str) -> Option<KeyType> {
    Some(match key {
        "workspace.state_dir"
        | "workspace.base_dir"
        | "workspace.path_template"
        | "workspace.branch_prefix"
        | "workspace.remote"
        | "ai.model"
        | "ai.verify_model"
        | "ai.executables.claude"
        | "ai.executables.codex"
        | "ai.executables.gemini"
        | "templates.dir" => KeyType::String,

        "ai.timeout"
        | "validation.timeout"
        | "validation.ai_retry.initial_delay"
        | "validation.ai_retry.max_delay"
        | "ci.poll_interval"
        | "ci.timeout" => KeyType::Duration,

        "validation.format_commands" | "validation.lint_commands" | "validation.test_commands" => {
            KeyType::List
        }

        "validation.ai_retry.enabled" => KeyType::Bool,
        "validation.ai_retry.max_attempts" | "ci.grace_polls" => KeyType::Int,
        "validation.ai_retry.backoff_factor" => KeyType::Float,

        "ai.agent" => KeyType::Enum(AGENTS),
        "ai.verify_agent" => KeyType::Enum(&["", "claude", "codex", "gemini"]),

        _ => return None,
    })
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true|false, got '{other}'")),
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    s.trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))
}

fn parse_float(s: &str) -> Result<f64, String> {
    s.trim()
        .parse::<f64>()
        .map_err(|e| format!("expected number, got '{s}': {e}"))
}

fn apply_set(doc: &mut toml_edit::DocumentMut, key: &str, value: toml_edit::Item) -> anyhow::Result<()> {
    let parts: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
    let Some((leaf, tables)) = parts.split_last() else {
        return Err(ConfigError::InvalidKey(key.to_owned()).into());
    };

    let mut cur = doc.as_table_mut();
    for seg in tables {
        if !cur.contains_key(seg) {
            let mut t = toml_edit::Table::new();
            t.set_implicit(true);
            cur.insert(seg, toml_edit::Item::Table(t));
        }
        cur = cur[seg]
            .as_table_mut()
            .ok_or_else(|| ConfigError::Invalid(format!("cannot set {key}: '{seg}' is not a table")))?;
    }

    cur.insert(leaf, value);
    Ok(())
}

fn lookup_value(cfg: &Config, key: &str) -> Option<serde_json::Value> {
    let mut v = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        match v {
            serde_json::Value::Object(mut map) => {
                v = map.remove(seg)?;
            }
            _ => return None,
        }
    }
    Some(v)
}

fn format_value_for_stdout(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_owned(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(format_value_for_stdout)
            .collect::<Vec<_>>()
            .join(","),
        other @ serde_json::Value::Object(_) => {
            serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string())
        }
    }
}
