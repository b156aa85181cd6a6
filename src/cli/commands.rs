#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Help,
    Mode(Option<CommandMode>),
    Session(Option<String>),
    Clear,
    Skills(Option<String>),
    Run { path: String },
    Trace,
    Steps(Option<bool>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandMode {
    Python,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParseError {
    message: String,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn message(&self) -> &str {
        &self.message
    }
}

pub(crate) const HELP_TEXT: &str = "Available commands:\n  /help                Show this command list\n  /mode [py|ai]        Show or switch active mode (Tab also toggles)\n  /session [id]        Show or switch the sandbox session\n  /clear               Drop every variable in the current sandbox session\n  /skills [query]      List skills, or search them\n  /run <file.py>       Execute a Python file in the current sandbox session\n  /trace               Show path to the current trace file\n  /steps [on|off]      Show or hide assistant tool steps";

pub(crate) fn parse_command(line: &str) -> Result<Command, ParseError> {
    if !line.starts_with('/') {
        return Err(ParseError::new("not a command"));
    }

    let trimmed = line.trim();
    let command_text = &trimmed[1..];
    let mut parts = command_text.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("").to_ascii_lowercase();
    if name.is_empty() {
        return Err(ParseError::new("empty command. Try /help"));
    }
    let rest = parts.next().map(str::trim).unwrap_or("");

    match name.as_str() {
        "help" => expect_no_args(rest, Command::Help, "usage: /help"),
        "mode" => parse_mode(rest),
        "session" => parse_session(rest),
        "clear" => expect_no_args(rest, Command::Clear, "usage: /clear"),
        "skills" => Ok(Command::Skills(optional_text(rest))),
        "run" => parse_run(rest),
        "trace" => expect_no_args(rest, Command::Trace, "usage: /trace"),
        "steps" => parse_steps(rest),
        _ => Err(ParseError::new(format!(
            "unknown command '/{name}'. Try /help"
        ))),
    }
}

pub(crate) fn is_command_line(line: &str) -> bool {
    line.starts_with('/')
}

fn expect_no_args(rest: &str, command: Command, usage: &str) -> Result<Command, ParseError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(ParseError::new(usage))
    }
}

fn optional_text(rest: &str) -> Option<String> {
    (!rest.is_empty()).then(|| rest.to_string())
}

fn parse_mode(rest: &str) -> Result<Command, ParseError> {
    match rest {
        "" => Ok(Command::Mode(None)),
        "py" => Ok(Command::Mode(Some(CommandMode::Python))),
        "ai" => Ok(Command::Mode(Some(CommandMode::Assistant))),
        _ => Err(ParseError::new("usage: /mode [py|ai]")),
    }
}

fn parse_session(rest: &str) -> Result<Command, ParseError> {
    if rest.chars().any(char::is_whitespace) {
        return Err(ParseError::new("usage: /session [id] (id must not contain spaces)"));
    }
    Ok(Command::Session(optional_text(rest)))
}

fn parse_run(rest: &str) -> Result<Command, ParseError> {
    if rest.is_empty() {
        return Err(ParseError::new(
            "missing file argument. usage: /run <file.py>",
        ));
    }
    Ok(Command::Run {
        path: rest.to_string(),
    })
}

fn parse_steps(rest: &str) -> Result<Command, ParseError> {
    match rest {
        "" => Ok(Command::Steps(None)),
        "on" => Ok(Command::Steps(Some(true))),
        "off" => Ok(Command::Steps(Some(false))),
        _ => Err(ParseError::new("usage: /steps [on|off]")),
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, CommandMode, HELP_TEXT, is_command_line, parse_command};

    #[test]
    fn help_text_lists_all_supported_commands() {
        for needle in [
            "/help",
            "/mode [py|ai]",
            "/session [id]",
            "/clear",
            "/skills [query]",
            "/run <file.py>",
            "/trace",
            "/steps [on|off]",
        ] {
            assert!(HELP_TEXT.contains(needle), "missing help entry: {needle}");
        }
    }

    #[test]
    fn parse_simple_commands() {
        assert_eq!(parse_command("/help").expect("help"), Command::Help);
        assert_eq!(parse_command("/clear").expect("clear"), Command::Clear);
        assert_eq!(parse_command("/trace").expect("trace"), Command::Trace);
        assert_eq!(
            parse_command("/HELP").expect("case insensitive"),
            Command::Help
        );
    }

    #[test]
    fn parse_mode_and_session_arguments() {
        assert_eq!(parse_command("/mode").expect("mode"), Command::Mode(None));
        assert_eq!(
            parse_command("/mode ai").expect("mode ai"),
            Command::Mode(Some(CommandMode::Assistant))
        );
        assert_eq!(
            parse_command("/session").expect("session"),
            Command::Session(None)
        );
        assert_eq!(
            parse_command("/session backtest-1").expect("session id"),
            Command::Session(Some("backtest-1".to_string()))
        );
    }

    #[test]
    fn parse_skills_keeps_the_whole_query() {
        assert_eq!(
            parse_command("/skills").expect("skills"),
            Command::Skills(None)
        );
        assert_eq!(
            parse_command("/skills 双均线 回测").expect("skills query"),
            Command::Skills(Some("双均线 回测".to_string()))
        );
    }

    #[test]
    fn parse_reports_usage_for_invalid_arguments() {
        for (line, message) in [
            ("/mode bad", "usage: /mode [py|ai]"),
            ("/clear now", "usage: /clear"),
            ("/session a b", "usage: /session [id] (id must not contain spaces)"),
            ("/run", "missing file argument. usage: /run <file.py>"),
            ("/steps maybe", "usage: /steps [on|off]"),
            ("/bogus", "unknown command '/bogus'. Try /help"),
            ("/", "empty command. Try /help"),
            ("/ help", "empty command. Try /help"),
        ] {
            assert_eq!(
                parse_command(line).expect_err(line).message(),
                message,
                "line: {line}"
            );
        }
    }

    #[test]
    fn command_line_detection_is_prefix_based() {
        assert!(is_command_line("/help"));
        assert!(!is_command_line(" /help"));
        assert!(!is_command_line("print('/help')"));
    }
}
