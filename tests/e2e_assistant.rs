#![cfg(unix)]

use expectrl::{Eof, Error as ExpectError, Session};
use serde_json::Value;
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path as path_matcher};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EXPECT_TIMEOUT: Duration = Duration::from_secs(10);
const EXPECT_RETRIES: usize = 3;
const ENDPOINT: &str = "/v1beta/models/gemini-test:generateContent";

fn text_response(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "candidates": [
            {"finishReason": "STOP", "content": {"role": "model", "parts": [{"text": text}]}}
        ]
    }))
}

#[test]
#[serial]
fn assistant_answer_is_printed_and_traced() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let server = rt.block_on(MockServer::start());
    rt.block_on(async {
        Mock::given(method("POST"))
            .and(path_matcher(ENDPOINT))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(text_response("Mock assistant says hello"))
            .mount(&server)
            .await;
    });

    let app = spawn_app_with_mock_provider(&server);
    let mut session = app.session;
    expect_text(&mut session, "py> ");

    submit_line(&mut session, "/mode ai");
    submit_line(&mut session, "hello assistant");
    expect_text(&mut session, "Mock assistant says hello");

    exit_repl(&mut session);
    let events = read_trace_events(&app.state_home);
    assert!(
        events
            .iter()
            .any(|event| event["event"] == "question" && event["text"] == "hello assistant"),
        "trace events: {events:?}"
    );
    assert!(
        events
            .iter()
            .any(|event| event["event"] == "answer" && event["text"] == "Mock assistant says hello"),
        "trace events: {events:?}"
    );
}

#[test]
#[serial]
fn execute_python_without_skills_is_refused_and_traced() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let server = rt.block_on(MockServer::start());
    rt.block_on(async {
        Mock::given(method("POST"))
            .and(path_matcher(ENDPOINT))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_string_contains("functionResponse"))
            .respond_with(text_response("I need to load a skill first"))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path_matcher(ENDPOINT))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "finishReason": "STOP",
                    "content": {"role": "model", "parts": [{
                        "functionCall": {
                            "id": "call-1",
                            "name": "execute_python",
                            "args": {"code": "result = 1", "skills_used": []}
                        }
                    }]}
                }]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
    });

    let app = spawn_app_with_mock_provider(&server);
    let mut session = app.session;
    expect_text(&mut session, "py> ");

    submit_line(&mut session, "/mode ai");
    submit_line(&mut session, "calculate the 20 day return of 600519.SH");
    expect_text(&mut session, "I need to load a skill first");

    exit_repl(&mut session);
    let events = read_trace_events(&app.state_home);
    let rejection = events
        .iter()
        .find(|event| event["event"] == "guard_rejection")
        .unwrap_or_else(|| panic!("no guard rejection in trace: {events:?}"));
    assert_eq!(rejection["name"], "execute_python");
    assert_eq!(rejection["response"]["correlates_to"], "call-1");
    assert!(
        !events.iter().any(|event| event["event"] == "execution"),
        "refused code must not run: {events:?}"
    );
}

#[test]
#[serial]
fn provider_failure_then_recovery_allows_next_prompt() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let server = rt.block_on(MockServer::start());
    rt.block_on(async {
        Mock::given(method("POST"))
            .and(path_matcher(ENDPOINT))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_string_contains("second question"))
            .respond_with(text_response("Recovered answer"))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path_matcher(ENDPOINT))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_string_contains("first question"))
            .respond_with(ResponseTemplate::new(500).set_body_string("provider down"))
            .mount(&server)
            .await;
    });

    let app = spawn_app_with_mock_provider(&server);
    let mut session = app.session;
    expect_text(&mut session, "py> ");

    submit_line(&mut session, "/mode ai");
    submit_line(&mut session, "first question");
    expect_text(&mut session, "ai> ");

    submit_line(&mut session, "second question");
    expect_text(&mut session, "Recovered answer");

    exit_repl(&mut session);
    let events = read_trace_events(&app.state_home);
    let questions = events
        .iter()
        .filter(|event| event["event"] == "question")
        .count();
    assert_eq!(questions, 2, "trace events: {events:?}");
    assert!(
        events
            .iter()
            .any(|event| event["event"] == "answer" && event["text"] == "Recovered answer"),
        "trace events: {events:?}"
    );
}

struct SpawnedApp {
    session: Session,
    state_home: TempDir,
    _config_home: TempDir,
    _cfg_dir: TempDir,
}

fn spawn_app_with_mock_provider(server: &MockServer) -> SpawnedApp {
    let config_home = tempfile::tempdir().expect("create XDG_CONFIG_HOME tempdir");
    let state_home = tempfile::tempdir().expect("create XDG_STATE_HOME tempdir");
    let cfg_dir = tempfile::tempdir().expect("config tempdir");
    let cfg_path = write_test_config(cfg_dir.path(), &server.uri());

    let mut command = Command::new(binary_path());
    command
        .arg("--config")
        .arg(&cfg_path)
        .env_remove("AGENT_TRACE_DIR")
        .env_remove("GEMINI_MODEL")
        .env_remove("GEMINI_BASE_URL")
        .env("XDG_CONFIG_HOME", config_home.path())
        .env("XDG_STATE_HOME", state_home.path())
        .env("GEMINI_API_KEY", "test-key");

    let mut session = Session::spawn(command).expect("spawn ashare-agent in PTY");
    session.set_expect_timeout(Some(EXPECT_TIMEOUT));

    SpawnedApp {
        session,
        state_home,
        _config_home: config_home,
        _cfg_dir: cfg_dir,
    }
}

fn write_test_config(dir: &Path, base_url: &str) -> PathBuf {
    let path = dir.join("config.toml");
    let content = format!(
        "gemini_api_key = \"test-key\"\n\
         gemini_model = \"gemini-test\"\n\
         gemini_base_url = \"{base_url}\"\n\
         \n\
         [sandbox]\n\
         strict_libraries = false\n\
         plotting = false\n\
         \n\
         [skills]\n\
         dir = \"{}\"\n",
        dir.join("skills").display()
    );
    fs::write(&path, content).expect("write test config");
    path
}

fn binary_path() -> String {
    std::env::var("CARGO_BIN_EXE_ashare-agent")
        .unwrap_or_else(|_| "target/debug/ashare-agent".to_string())
}

fn submit_line(session: &mut Session, line: &str) {
    session.send(line).expect("send line text");
    session.send([b'\r']).expect("send Enter");
}

fn exit_repl(session: &mut Session) {
    submit_line(session, "quit");
    let _ = session.expect(Eof);
    thread::sleep(Duration::from_millis(25));
}

fn expect_text(session: &mut Session, text: &str) {
    for attempt in 1..=EXPECT_RETRIES {
        match session.expect(text) {
            Ok(_) => return,
            Err(ExpectError::ExpectTimeout) if attempt < EXPECT_RETRIES => continue,
            Err(err) => panic!("failed to match text {text:?} on attempt {attempt}: {err}"),
        }
    }

    panic!("unreachable: retries exhausted without returning");
}

fn read_trace_events(state_home: &TempDir) -> Vec<Value> {
    let trace_dir = state_home.path().join("ashare-agent").join("traces");
    let mut entries = fs::read_dir(&trace_dir)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", trace_dir.display()))
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|err| panic!("failed to iterate {}: {err}", trace_dir.display()));
    assert_eq!(
        entries.len(),
        1,
        "expected exactly one trace file in {}",
        trace_dir.display()
    );
    let path = entries.remove(0).path();
    fs::read_to_string(&path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()))
        .lines()
        .map(|line| serde_json::from_str(line).expect("trace line is json"))
        .collect()
}
