use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::guard::QueryPolicy;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;

const CONFIG_DIR_NAME: &str = "ashare-agent";
const CONFIG_FILE_NAME: &str = "config.toml";
const SKILLS_DIR_NAME: &str = "skills";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub config_is_explicit: bool,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub sandbox: SandboxConfig,
    pub data: DataConfig,
    pub skills_dir: PathBuf,
    pub trace_dir: Option<PathBuf>,
    pub guard: GuardConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Fail init when numpy or pandas cannot be imported.
    pub strict_libraries: bool,
    pub plotting: bool,
    /// Zero disables the execution deadline.
    pub timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            strict_libraries: true,
            plotting: true,
            timeout_secs: DEFAULT_EXEC_TIMEOUT_SECS,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataConfig {
    pub factory: Option<String>,
    pub store_dir: Option<String>,
    pub python_path: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    pub enabled: bool,
    pub computation_terms: Option<Vec<String>>,
    pub lookup_terms: Option<Vec<String>>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            computation_terms: None,
            lookup_terms: None,
        }
    }
}

impl GuardConfig {
    pub fn policy(&self) -> QueryPolicy {
        match (&self.computation_terms, &self.lookup_terms) {
            (None, None) => QueryPolicy::default(),
            (computation, lookup) => {
                let defaults = QueryPolicy::default();
                QueryPolicy::from_terms(
                    computation
                        .clone()
                        .unwrap_or_else(|| defaults.computation_terms()),
                    lookup.clone().unwrap_or_else(|| defaults.lookup_terms()),
                )
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileConfig {
    gemini_api_key: Option<String>,
    gemini_model: Option<String>,
    gemini_base_url: Option<String>,
    trace_dir: Option<String>,
    sandbox: Option<RawSandboxConfig>,
    data: Option<RawDataConfig>,
    skills: Option<RawSkillsConfig>,
    guard: Option<RawGuardConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSandboxConfig {
    strict_libraries: Option<bool>,
    plotting: Option<bool>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDataConfig {
    factory: Option<String>,
    store_dir: Option<String>,
    python_path: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSkillsConfig {
    dir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGuardConfig {
    enabled: Option<bool>,
    computation_terms: Option<Vec<String>>,
    lookup_terms: Option<Vec<String>>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    /// Loads `explicit_path` when given (it must exist), otherwise the XDG
    /// config file if present. Environment variables override file values.
    pub fn load_with_path(explicit_path: Option<&Path>) -> Result<Self> {
        let (config_path, config_is_explicit) = match explicit_path {
            Some(path) => {
                if !path.is_file() {
                    bail!("Failed to load config {}: file not found", path.display());
                }
                (path.to_path_buf(), true)
            }
            None => (discover_config_path()?, false),
        };
        let file_config = load_file_config(&config_path)?;

        dotenvy::dotenv().ok();

        let file_api_key = file_config
            .as_ref()
            .and_then(|cfg| cfg.gemini_api_key.as_deref())
            .and_then(non_empty_owned);
        let file_model = file_config
            .as_ref()
            .and_then(|cfg| cfg.gemini_model.as_deref())
            .and_then(non_empty_owned);
        let file_base_url = file_config
            .as_ref()
            .and_then(|cfg| cfg.gemini_base_url.as_deref())
            .and_then(non_empty_owned);

        let sandbox = validate_sandbox(
            file_config.as_ref().and_then(|cfg| cfg.sandbox.as_ref()),
            &config_path,
        )?;
        let data = resolve_data(file_config.as_ref().and_then(|cfg| cfg.data.as_ref()));
        let skills_dir = resolve_skills_dir(
            file_config.as_ref().and_then(|cfg| cfg.skills.as_ref()),
            &config_path,
        )?;
        let trace_dir = env_non_empty("AGENT_TRACE_DIR")
            .or_else(|| {
                file_config
                    .as_ref()
                    .and_then(|cfg| cfg.trace_dir.as_deref())
                    .and_then(non_empty_owned)
            })
            .map(PathBuf::from);
        let guard = validate_guard(
            file_config.as_ref().and_then(|cfg| cfg.guard.as_ref()),
            &config_path,
        )?;

        Ok(Self {
            config_path,
            config_is_explicit,
            gemini_api_key: env_non_empty("GEMINI_API_KEY").or(file_api_key),
            gemini_model: env_non_empty("GEMINI_MODEL")
                .or(file_model)
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_base_url: env_non_empty("GEMINI_BASE_URL")
                .or(file_base_url)
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            sandbox,
            data,
            skills_dir,
            trace_dir,
            guard,
        })
    }
}

fn discover_config_path() -> Result<PathBuf> {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let trimmed = xdg.trim();
        if trimmed.is_empty() {
            bail!("Failed to resolve config path: XDG_CONFIG_HOME is set but empty");
        }

        return Ok(PathBuf::from(trimmed)
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME));
    }

    let home = dirs::home_dir()
        .ok_or_else(|| anyhow!("Failed to resolve config path: HOME directory is unavailable"))?;

    Ok(home
        .join(".config")
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME))
}

fn load_file_config(config_path: &Path) -> Result<Option<RawFileConfig>> {
    if !config_path.is_file() {
        return Ok(None);
    }

    let config_text = fs::read_to_string(config_path).map_err(|err| {
        anyhow!(
            "Failed to load config {}: unable to read file: {err}",
            config_path.display()
        )
    })?;

    toml::from_str(&config_text)
        .map(Some)
        .map_err(|err| anyhow!("Failed to load config {}: {err}", config_path.display()))
}

fn validate_sandbox(raw: Option<&RawSandboxConfig>, config_path: &Path) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::default();
    if let Some(raw) = raw {
        if let Some(strict) = raw.strict_libraries {
            config.strict_libraries = strict;
        }
        if let Some(plotting) = raw.plotting {
            config.plotting = plotting;
        }
        if let Some(timeout) = raw.timeout_secs {
            config.timeout_secs = timeout;
        }
    }

    if let Some(value) = env_non_empty("AGENT_EXEC_TIMEOUT_SECS") {
        config.timeout_secs = value.parse().map_err(|_| {
            config_error(
                config_path,
                "AGENT_EXEC_TIMEOUT_SECS",
                &format!("expected a whole number of seconds, got '{value}'"),
            )
        })?;
    }

    Ok(config)
}

fn resolve_data(raw: Option<&RawDataConfig>) -> DataConfig {
    let factory = raw
        .and_then(|data| data.factory.as_deref())
        .and_then(non_empty_owned);
    let store_dir = env_non_empty("STOCK_DATA_STORE_DIR").or_else(|| {
        raw.and_then(|data| data.store_dir.as_deref())
            .and_then(non_empty_owned)
    });
    let python_path = raw
        .and_then(|data| data.python_path.as_ref())
        .map(|paths| {
            paths
                .iter()
                .filter_map(|path| non_empty(path).map(PathBuf::from))
                .collect()
        })
        .unwrap_or_default();

    DataConfig {
        factory,
        store_dir,
        python_path,
    }
}

fn resolve_skills_dir(raw: Option<&RawSkillsConfig>, config_path: &Path) -> Result<PathBuf> {
    if let Some(dir) = env_non_empty("AGENT_SKILLS_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = raw.and_then(|skills| skills.dir.as_deref()).and_then(non_empty) {
        return Ok(PathBuf::from(dir));
    }

    let config_dir = config_path.parent().ok_or_else(|| {
        anyhow!(
            "Failed to resolve skills directory from config {}: missing parent directory",
            config_path.display()
        )
    })?;
    Ok(config_dir.join(SKILLS_DIR_NAME))
}

fn validate_guard(raw: Option<&RawGuardConfig>, config_path: &Path) -> Result<GuardConfig> {
    let Some(raw) = raw else {
        return Ok(GuardConfig::default());
    };

    let computation_terms = validate_terms(
        raw.computation_terms.as_deref(),
        config_path,
        "guard.computation_terms",
    )?;
    let lookup_terms =
        validate_terms(raw.lookup_terms.as_deref(), config_path, "guard.lookup_terms")?;

    Ok(GuardConfig {
        enabled: raw.enabled.unwrap_or(true),
        computation_terms,
        lookup_terms,
    })
}

fn validate_terms(
    values: Option<&[String]>,
    config_path: &Path,
    key_path: &str,
) -> Result<Option<Vec<String>>> {
    let Some(values) = values else {
        return Ok(None);
    };

    let mut terms = Vec::with_capacity(values.len());
    for value in values {
        let term = non_empty(value)
            .ok_or_else(|| config_error(config_path, key_path, "terms must not be empty"))?;
        terms.push(term.to_string());
    }
    Ok(Some(terms))
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| non_empty_owned(&value))
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn non_empty_owned(value: &str) -> Option<String> {
    non_empty(value).map(ToOwned::to_owned)
}

fn config_error(config_path: &Path, key_path: &str, reason: &str) -> anyhow::Error {
    anyhow!(
        "Failed to load config {}: {key_path}: {reason}",
        config_path.display()
    )
}
