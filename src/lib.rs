pub mod agent;
pub mod cli;
pub mod config;
pub mod guard;
pub mod llm;
pub mod logging;
pub mod sandbox;
pub mod skills;
pub mod trace;

use agent::{AgentConfig, ToolContext};
use anyhow::{Context, Result, bail};
use cli::{AppState, CliArgs, CliCommand, Mode, SkillsAction, run_repl};
use config::AppConfig;
use guard::PythonGuard;
use llm::gemini::GeminiProvider;
use pyo3::prelude::*;
use sandbox::{DataHandleSource, ExecutionRequest, Sandbox};
use skills::SkillCatalog;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use trace::SessionTrace;
use tracing::{info, warn};

pub async fn run(args: CliArgs) -> Result<()> {
    logging::init_logging(args.verbose);

    if args.smoke_python {
        return smoke_python();
    }

    let config = if let Some(path) = args.config.as_deref() {
        AppConfig::load_with_path(Some(path))?
    } else {
        AppConfig::load()?
    };
    info!(config = %config.config_path.display(), explicit = config.config_is_explicit, "configuration loaded");

    match args.command.unwrap_or(CliCommand::Chat) {
        CliCommand::Chat => run_chat(&config).await,
        CliCommand::Exec { session, file } => run_exec(&config, session.as_deref(), &file),
        CliCommand::Skills { action } => run_skills(&config, action),
    }
}

fn smoke_python() -> Result<()> {
    let version = Python::attach(|py| -> PyResult<String> {
        py.import("sys")?;
        Ok(py.version().to_string())
    })
    .context("Failed to start the embedded Python interpreter")?;
    let version = version.split_whitespace().next().unwrap_or("unknown");
    println!("smoke-python: ok (Python {version})");
    Ok(())
}

fn init_sandbox(config: &AppConfig) -> Result<Sandbox> {
    let sandbox = Sandbox::init(&config.sandbox, DataHandleSource::from_config(&config.data))?;
    if !sandbox.has_data_handle() {
        warn!("no data store configured; lookup tools and `store` will report it as unavailable");
    }
    Ok(sandbox)
}

async fn run_chat(config: &AppConfig) -> Result<()> {
    let sandbox = Arc::new(init_sandbox(config)?);
    let session_id = generate_session_id();
    sandbox.set_current_session(session_id.clone());
    let trace = SessionTrace::create(&session_id, config.trace_dir.as_deref())?;
    let llm = GeminiProvider::new(
        reqwest::Client::new(),
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        config.gemini_base_url.clone(),
    )
    .ok();
    match &llm {
        Some(provider) => info!(model = provider.model(), "assistant enabled"),
        None => info!("assistant disabled: no Gemini API key"),
    }

    let mut app_state = AppState {
        mode: Mode::Python,
        tools: ToolContext {
            sandbox: Arc::clone(&sandbox),
            skills: SkillCatalog::new(&config.skills_dir),
            guard: PythonGuard::new(config.guard.policy(), config.guard.enabled),
            session_id,
        },
        llm,
        agent_config: AgentConfig::default(),
        conversation: Vec::new(),
        trace,
        show_steps: false,
    };

    let outcome = run_repl(&mut app_state).await;
    sandbox.teardown();
    outcome
}

fn run_exec(config: &AppConfig, session_id: Option<&str>, file: &Path) -> Result<()> {
    let code = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let sandbox = init_sandbox(config)?;

    let mut request = ExecutionRequest::new(code);
    if let Some(session_id) = session_id {
        request = request.in_session(session_id);
    }
    let outcome = sandbox.execute(&request);
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.success {
        bail!("execution of {} failed", file.display());
    }
    Ok(())
}

fn run_skills(config: &AppConfig, action: SkillsAction) -> Result<()> {
    let catalog = SkillCatalog::new(&config.skills_dir);
    let rendered = match action {
        SkillsAction::List => serde_json::to_string_pretty(&catalog.list()?)?,
        SkillsAction::Search { query, limit } => {
            serde_json::to_string_pretty(&catalog.search(&query, limit)?)?
        }
        SkillsAction::Show { skill_id } => {
            let loaded = catalog.load(&skill_id)?;
            if !loaded.found {
                bail!(
                    "skill '{skill_id}' not found in {}",
                    catalog.root().display()
                );
            }
            loaded.content.unwrap_or_default()
        }
    };
    println!("{rendered}");
    Ok(())
}

fn generate_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis());
    format!("{millis:x}-{:x}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::generate_session_id;

    #[test]
    fn generated_session_id_has_expected_shape() {
        let session_id = generate_session_id();
        let mut parts = session_id.split('-');
        let ts = parts.next().expect("timestamp segment");
        let pid = parts.next().expect("pid segment");
        assert!(
            parts.next().is_none(),
            "session id should contain one delimiter"
        );
        assert!(!ts.is_empty(), "timestamp segment should not be empty");
        assert!(!pid.is_empty(), "pid segment should not be empty");
        assert!(
            ts.chars().all(|ch| ch.is_ascii_hexdigit()),
            "timestamp segment should be hex"
        );
        assert!(
            pid.chars().all(|ch| ch.is_ascii_hexdigit()),
            "pid segment should be hex"
        );
    }
}
