use crate::agent::{AgentConfig, AgentProgressEvent, ToolContext, run_question_with_events};
use crate::cli::commands::{
    Command, CommandMode, HELP_TEXT, ParseError, is_command_line, parse_command,
};
use crate::llm::{gemini::GeminiProvider, provider::AssistantMessage};
use crate::sandbox::{ExecutionOutcome, ExecutionRequest};
use crate::skills::DEFAULT_SEARCH_LIMIT;
use crate::trace::SessionTrace;
use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::{
    Cmd, ConditionalEventHandler, Editor, Event, EventContext, EventHandler, KeyEvent, RepeatCount,
};
use std::fs;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

const MISSING_KEY_MESSAGE: &str = "Assistant unavailable: missing GEMINI_API_KEY. Configure it in your shell or .env file (example: GEMINI_API_KEY=your_key).";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Python,
    Assistant,
}

pub struct AppState {
    pub mode: Mode,
    pub tools: ToolContext,
    pub llm: Option<GeminiProvider>,
    pub agent_config: AgentConfig,
    /// Messages of the current session's conversation, fed back to the guard.
    pub conversation: Vec<AssistantMessage>,
    pub trace: SessionTrace,
    pub show_steps: bool,
}

impl AppState {
    fn session_id(&self) -> &str {
        &self.tools.session_id
    }

    fn switch_session(&mut self, session_id: String) {
        self.tools.sandbox.set_current_session(session_id.clone());
        self.tools.session_id = session_id;
        self.conversation.clear();
    }
}

#[derive(Default)]
struct TabCaptureState {
    initial: Option<(String, String)>,
}

struct TabModeToggleHandler {
    state: Arc<Mutex<TabCaptureState>>,
}

impl ConditionalEventHandler for TabModeToggleHandler {
    fn handle(
        &self,
        _evt: &Event,
        _n: RepeatCount,
        _positive: bool,
        ctx: &EventContext,
    ) -> Option<Cmd> {
        let (left, right) = ctx.line().split_at(ctx.pos());

        if let Ok(mut state) = self.state.lock() {
            state.initial = Some((left.to_string(), right.to_string()));
        }

        Some(Cmd::Interrupt)
    }
}

pub fn prompt_for(mode: Mode) -> &'static str {
    match mode {
        Mode::Python => "py> ",
        Mode::Assistant => "ai> ",
    }
}

pub async fn run_repl(state: &mut AppState) -> Result<()> {
    let mut rl = Editor::<(), rustyline::history::DefaultHistory>::new()?;
    let tab_capture_state = Arc::new(Mutex::new(TabCaptureState::default()));
    rl.bind_sequence(
        KeyEvent::from('\t'),
        EventHandler::Conditional(Box::new(TabModeToggleHandler {
            state: Arc::clone(&tab_capture_state),
        })),
    );

    loop {
        let initial = tab_capture_state
            .lock()
            .ok()
            .and_then(|mut capture| capture.initial.take());

        let line_result = if let Some((left, right)) = initial {
            rl.readline_with_initial(prompt_for(state.mode), (&left, &right))
        } else {
            rl.readline(prompt_for(state.mode))
        };

        match line_result {
            Ok(line) => {
                let line = line.trim();
                if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
                    break;
                }

                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                handle_line(state, line).await;
            }
            Err(ReadlineError::Interrupted) => {
                let should_toggle = tab_capture_state
                    .lock()
                    .is_ok_and(|capture| capture.initial.is_some());

                if should_toggle {
                    state.mode = toggle_mode(state.mode);
                    repaint_previous_line()?;
                }
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

fn repaint_previous_line() -> Result<()> {
    // readline writes a newline after interrupt; move up and clear it so the next
    // prompt redraw keeps the user on the same logical line.
    let mut stdout = io::stdout().lock();
    stdout.write_all(b"\x1b[1A\x1b[2K\r")?;
    stdout.flush()?;
    Ok(())
}

fn toggle_mode(mode: Mode) -> Mode {
    match mode {
        Mode::Python => Mode::Assistant,
        Mode::Assistant => Mode::Python,
    }
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Python => "py",
        Mode::Assistant => "ai",
    }
}

async fn handle_line(state: &mut AppState, line: &str) {
    if is_command_line(line) {
        match parse_command(line) {
            Ok(command) => handle_command(state, command).await,
            Err(err) => print_parse_error(&err),
        }
        return;
    }

    match state.mode {
        Mode::Python => run_python(state, line.to_string()).await,
        Mode::Assistant => ask_assistant(state, line).await,
    }
}

fn print_parse_error(err: &ParseError) {
    println!("error: {}", err.message());
}

async fn handle_command(state: &mut AppState, command: Command) {
    match command {
        Command::Help => println!("{HELP_TEXT}"),
        Command::Mode(None) => println!("mode: {}", mode_name(state.mode)),
        Command::Mode(Some(mode)) => {
            state.mode = match mode {
                CommandMode::Python => Mode::Python,
                CommandMode::Assistant => Mode::Assistant,
            };
            println!("mode: {}", mode_name(state.mode));
        }
        Command::Session(None) => println!("session: {}", state.session_id()),
        Command::Session(Some(session_id)) => {
            state.switch_session(session_id);
            println!(
                "session: {} (assistant conversation reset)",
                state.session_id()
            );
        }
        Command::Clear => {
            let session_id = state.session_id().to_string();
            if state.tools.sandbox.clear_session(Some(&session_id)) {
                println!("Cleared session {session_id}");
            } else {
                println!("Session {session_id} has no variables yet");
            }
        }
        Command::Skills(query) => print_skills(state, query.as_deref()),
        Command::Run { path } => match fs::read_to_string(&path) {
            Ok(source) => run_python(state, source).await,
            Err(err) => println!("error: unable to read {path}: {err}"),
        },
        Command::Trace => println!("{}", state.trace.file_path().display()),
        Command::Steps(None) => println!("steps: {}", on_off(state.show_steps)),
        Command::Steps(Some(show)) => {
            state.show_steps = show;
            println!("steps: {}", on_off(show));
        }
    }
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

fn print_skills(state: &AppState, query: Option<&str>) {
    let catalog = &state.tools.skills;
    let lines = match query {
        None => catalog.list().map(|skills| {
            skills
                .into_iter()
                .map(|skill| {
                    format!(
                        "{}  {}",
                        skill.skill_id,
                        skill.description.as_deref().unwrap_or("")
                    )
                })
                .collect::<Vec<_>>()
        }),
        Some(query) => catalog.search(query, DEFAULT_SEARCH_LIMIT).map(|matches| {
            matches
                .into_iter()
                .map(|found| {
                    format!(
                        "{}  [{}] {}",
                        found.skill.skill_id,
                        found.score,
                        found.skill.description.as_deref().unwrap_or("")
                    )
                })
                .collect::<Vec<_>>()
        }),
    };

    match lines {
        Ok(lines) if lines.is_empty() => println!("No skills found in {}", catalog.root().display()),
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
        }
        Err(err) => println!("error: {err}"),
    }
}

async fn run_python(state: &AppState, code: String) {
    state.trace.log_python_input(&code);
    let request = ExecutionRequest::new(code).in_session(state.session_id());
    let outcome = Arc::clone(&state.tools.sandbox)
        .execute_async(request)
        .await;
    state.trace.log_execution(state.session_id(), &outcome);
    print_outcome(&outcome);
}

fn print_outcome(outcome: &ExecutionOutcome) {
    if let Some(output) = outcome.output.as_deref() {
        print!("{output}");
        if !output.ends_with('\n') {
            println!();
        }
    }
    if let Some(result) = outcome.result.as_deref() {
        println!("{result}");
    }
    if let Some(error) = outcome.error.as_deref() {
        eprintln!("{}", error.trim_end());
    }
}

async fn ask_assistant(state: &mut AppState, question: &str) {
    let Some(provider) = &state.llm else {
        println!("{MISSING_KEY_MESSAGE}");
        return;
    };

    state.trace.log_question(question);
    let trace = state.trace.clone();
    let show_steps = state.show_steps;
    let mut on_event = |event: AgentProgressEvent| {
        trace.log_agent_event(&event);
        if show_steps && let Some(line) = step_line(&event) {
            println!("{line}");
        }
    };

    match run_question_with_events(
        provider,
        &state.tools,
        &mut state.conversation,
        question,
        &state.agent_config,
        &mut on_event,
    )
    .await
    {
        Ok(answer) => {
            state.trace.log_answer(&answer);
            println!("{}", answer.text);
        }
        Err(err) => {
            state.trace.log_error(&err.to_string());
            println!("Assistant request failed: {err}");
        }
    }
}

fn step_line(event: &AgentProgressEvent) -> Option<String> {
    match event {
        AgentProgressEvent::ToolRequest {
            step,
            name,
            args_json,
            ..
        } => Some(format!("  [{step}] -> {name} {args_json}")),
        AgentProgressEvent::ToolResult {
            step,
            name,
            refused: true,
            ..
        } => Some(format!("  [{step}] <- {name} refused by guard")),
        AgentProgressEvent::ToolResult { step, name, .. } => {
            Some(format!("  [{step}] <- {name}"))
        }
        AgentProgressEvent::StepStarted { .. } | AgentProgressEvent::ModelResponse { .. } => None,
    }
}
