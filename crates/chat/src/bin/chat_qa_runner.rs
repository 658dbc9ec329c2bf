use std::env;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};

use quill::chat::{
    ChatStore, IngestOutcome, MessageStatus, Prompt, PromptStore, SessionId, autocomplete_query,
};
use quill::config::ChatConfig;
use quill_llm::ScriptedProvider;
use quill_storage::{MemoryStore, StateStore};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    SubmitComplete,
    StopBeforeChunk,
    TransportError,
    ResendLookup,
    SessionGuard,
    PromptSearch,
    StateReload,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "submit_complete" => Some(Self::SubmitComplete),
            "stop_before_chunk" => Some(Self::StopBeforeChunk),
            "transport_error" => Some(Self::TransportError),
            "resend_lookup" => Some(Self::ResendLookup),
            "session_guard" => Some(Self::SessionGuard),
            "prompt_search" => Some(Self::PromptSearch),
            "state_reload" => Some(Self::StateReload),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SubmitComplete => "submit_complete",
            Self::StopBeforeChunk => "stop_before_chunk",
            Self::TransportError => "transport_error",
            Self::ResendLookup => "resend_lookup",
            Self::SessionGuard => "session_guard",
            Self::PromptSearch => "prompt_search",
            Self::StateReload => "state_reload",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("chat store setup failed: {source}"))]
    StoreSetup {
        stage: &'static str,
        source: quill::chat::ChatError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    match args.scenario {
        Scenario::SubmitComplete => run_submit_complete().await,
        Scenario::StopBeforeChunk => run_stop_before_chunk().await,
        Scenario::TransportError => run_transport_error().await,
        Scenario::ResendLookup => run_resend_lookup().await,
        Scenario::SessionGuard => run_session_guard().await,
        Scenario::PromptSearch => run_prompt_search(),
        Scenario::StateReload => run_state_reload().await,
        Scenario::All => run_all().await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut pending = args.into_iter();

    // The parser is intentionally strict to keep scenario execution deterministic in CI.
    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
    })
}

fn runner_config() -> ChatConfig {
    ChatConfig {
        model: "scripted-v1".to_string(),
        ..ChatConfig::default()
    }
}

fn open_store(
    provider: ScriptedProvider,
    memory: Arc<MemoryStore>,
    stage: &'static str,
) -> RunnerResult<ChatStore> {
    ChatStore::load(Arc::new(provider), memory, runner_config()).context(StoreSetupSnafu { stage })
}

async fn run_all() -> RunnerResult<()> {
    run_submit_complete().await?;
    run_stop_before_chunk().await?;
    run_transport_error().await?;
    run_resend_lookup().await?;
    run_session_guard().await?;
    run_prompt_search()?;
    run_state_reload().await?;

    println!("all_passed=true");
    Ok(())
}

async fn run_submit_complete() -> RunnerResult<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = open_store(
        ScriptedProvider::completing(["Hi", " there"]),
        memory.clone(),
        "scenario-submit-complete-open",
    )?;

    let handle = store
        .submit("Hello")
        .context(ScenarioFailedSnafu {
            stage: "scenario-submit-complete-submit",
            scenario: "submit_complete",
            reason: "submission was unexpectedly rejected".to_string(),
        })?;
    let outcome = handle.wait().await;

    let snapshot = store.snapshot();
    let messages = &snapshot.current_session().messages;
    let reply = messages.last().map(|message| message.content.clone());

    let completed = outcome == IngestOutcome::Completed;
    let reply_ok = reply.as_deref() == Some("Hi there");
    let status_ok = messages
        .last()
        .is_some_and(|message| message.status == MessageStatus::Done);
    let registry_drained = store.active_stream_count() == 0;
    let persisted = memory.save_count() >= 2;

    println!("completed={completed}");
    println!("reply_ok={reply_ok}");
    println!("status_ok={status_ok}");
    println!("registry_drained={registry_drained}");
    println!("save_count={}", memory.save_count());

    if !(completed && reply_ok && status_ok && registry_drained && persisted) {
        return ScenarioFailedSnafu {
            stage: "scenario-submit-complete-assert",
            scenario: "submit_complete",
            reason: format!(
                "expected a completed exchange with reply 'Hi there', got outcome={outcome:?}, reply={reply:?}"
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_stop_before_chunk() -> RunnerResult<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = open_store(
        ScriptedProvider::hanging(),
        memory,
        "scenario-stop-before-chunk-open",
    )?;

    let handle = store
        .submit("Hello")
        .context(ScenarioFailedSnafu {
            stage: "scenario-stop-before-chunk-submit",
            scenario: "stop_before_chunk",
            reason: "submission was unexpectedly rejected".to_string(),
        })?;
    let target = handle.target();

    let stop_accepted = store.stop(target.session_index, target.message_index);
    let outcome = handle.wait().await;
    let stop_repeated = store.stop(target.session_index, target.message_index);

    let snapshot = store.snapshot();
    let message = &snapshot.current_session().messages[target.message_index];
    let cancelled = outcome == IngestOutcome::Cancelled
        && message.status == MessageStatus::Cancelled
        && message.content.is_empty();

    println!("stop_accepted={stop_accepted}");
    println!("stop_repeated_noop={}", !stop_repeated);
    println!("cancelled={cancelled}");

    if !(stop_accepted && !stop_repeated && cancelled) {
        return ScenarioFailedSnafu {
            stage: "scenario-stop-before-chunk-assert",
            scenario: "stop_before_chunk",
            reason: format!(
                "expected clean cancellation before any chunk, got outcome={outcome:?}, status={:?}",
                message.status
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_transport_error() -> RunnerResult<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = open_store(
        ScriptedProvider::failing_after(["partial"], "connection reset"),
        memory,
        "scenario-transport-error-open",
    )?;

    let handle = store
        .submit("Hello")
        .context(ScenarioFailedSnafu {
            stage: "scenario-transport-error-submit",
            scenario: "transport_error",
            reason: "submission was unexpectedly rejected".to_string(),
        })?;
    let outcome = handle.wait().await;

    let snapshot = store.snapshot();
    let message = snapshot.current_session().messages.last().cloned();
    let partial_kept = message
        .as_ref()
        .is_some_and(|message| message.content.starts_with("partial"));
    let error_marked = message.as_ref().is_some_and(|message| {
        message.is_error() && message.content.contains("Request failed: connection reset")
    });

    println!("partial_kept={partial_kept}");
    println!("error_marked={error_marked}");

    if !(matches!(outcome, IngestOutcome::Failed(_)) && partial_kept && error_marked) {
        return ScenarioFailedSnafu {
            stage: "scenario-transport-error-assert",
            scenario: "transport_error",
            reason: format!("expected failed outcome with partial content, got {outcome:?}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_resend_lookup() -> RunnerResult<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = open_store(
        ScriptedProvider::completing(["pong"]),
        memory,
        "scenario-resend-lookup-open",
    )?;

    store
        .submit("ping")
        .context(ScenarioFailedSnafu {
            stage: "scenario-resend-lookup-submit",
            scenario: "resend_lookup",
            reason: "initial submission was unexpectedly rejected".to_string(),
        })?
        .wait()
        .await;

    let resent = store.resend(1).context(ScenarioFailedSnafu {
        stage: "scenario-resend-lookup-resend",
        scenario: "resend_lookup",
        reason: "resend from the assistant reply found no prior user turn".to_string(),
    })?;
    resent.wait().await;

    let snapshot = store.snapshot();
    let messages = &snapshot.current_session().messages;
    let appended = messages.len() == 4
        && messages[2].content == "ping"
        && messages[3].content == "pong";

    // An index with no user turn at or before it must be a silent no-op.
    let fresh_store = open_store(
        ScriptedProvider::completing(["x"]),
        Arc::new(MemoryStore::new()),
        "scenario-resend-lookup-open-fresh",
    )?;
    let empty_resend_rejected = fresh_store.resend(0).is_none();

    println!("appended={appended}");
    println!("empty_resend_rejected={empty_resend_rejected}");

    if !(appended && empty_resend_rejected) {
        return ScenarioFailedSnafu {
            stage: "scenario-resend-lookup-assert",
            scenario: "resend_lookup",
            reason: format!(
                "expected non-destructive resend to append a fresh exchange, message_count={}",
                messages.len()
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_session_guard() -> RunnerResult<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = open_store(
        ScriptedProvider::completing(["x"]),
        memory,
        "scenario-session-guard-open",
    )?;

    let blank_rejected = store.submit("   ").is_none();

    let second = store.new_session();
    let switched_back = store.switch_session(0);
    let switch_out_of_range = store.switch_session(9);

    let removed = store.remove_session(0);
    let after_remove = store.snapshot();
    let survivor_ok =
        after_remove.sessions.len() == 1 && after_remove.current_session().id == second;

    let removed_last = store.remove_session(0);
    let after_remove_last = store.snapshot();
    let fresh_session_ok = after_remove_last.sessions.len() == 1
        && after_remove_last.current_session().messages.is_empty()
        && after_remove_last.current_session().id == SessionId::new(1);

    println!("blank_rejected={blank_rejected}");
    println!("switched_back={switched_back}");
    println!("switch_out_of_range_rejected={}", !switch_out_of_range);
    println!("survivor_ok={survivor_ok}");
    println!("fresh_session_ok={fresh_session_ok}");

    if !(blank_rejected
        && switched_back
        && !switch_out_of_range
        && removed
        && survivor_ok
        && removed_last
        && fresh_session_ok)
    {
        return ScenarioFailedSnafu {
            stage: "scenario-session-guard-assert",
            scenario: "session_guard",
            reason: "session list/cursor invariants were violated".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn run_prompt_search() -> RunnerResult<()> {
    let store = PromptStore::new(vec![
        Prompt::new("Greeting", "Say hello in a friendly tone"),
        Prompt::new("Summarize", "Summarize the following text"),
    ]);

    let query_extracted = autocomplete_query("/greet") == Some("greet");
    let plain_text_ignored = autocomplete_query("greet").is_none();
    let bare_slash_ignored = autocomplete_query("/").is_none();
    let search_hits = store.search("GREET").len();

    println!("query_extracted={query_extracted}");
    println!("plain_text_ignored={plain_text_ignored}");
    println!("bare_slash_ignored={bare_slash_ignored}");
    println!("search_hits={search_hits}");

    if !(query_extracted && plain_text_ignored && bare_slash_ignored && search_hits == 1) {
        return ScenarioFailedSnafu {
            stage: "scenario-prompt-search-assert",
            scenario: "prompt_search",
            reason: "prompt query extraction or search behavior mismatch".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_state_reload() -> RunnerResult<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = open_store(
        ScriptedProvider::hanging(),
        memory.clone(),
        "scenario-state-reload-open",
    )?;

    let handle = store
        .submit("Hello")
        .context(ScenarioFailedSnafu {
            stage: "scenario-state-reload-submit",
            scenario: "state_reload",
            reason: "submission was unexpectedly rejected".to_string(),
        })?;
    let target = handle.target();

    // The persisted snapshot still carries the streaming placeholder.
    let streaming_persisted = memory
        .load()
        .ok()
        .flatten()
        .is_some_and(|record| {
            record.sessions[0]
                .messages
                .last()
                .is_some_and(|message| {
                    message.status == quill_storage::MessageStatusRecord::Streaming
                })
        });

    let reloaded = open_store(
        ScriptedProvider::completing(["x"]),
        memory.clone(),
        "scenario-state-reload-reopen",
    )?;
    let normalized = reloaded
        .snapshot()
        .current_session()
        .messages
        .last()
        .is_some_and(|message| message.status == MessageStatus::Cancelled);

    store.stop(target.session_index, target.message_index);
    handle.wait().await;

    println!("streaming_persisted={streaming_persisted}");
    println!("normalized={normalized}");

    if !(streaming_persisted && normalized) {
        return ScenarioFailedSnafu {
            stage: "scenario-state-reload-assert",
            scenario: "state_reload",
            reason: "interrupted stream was not normalized to cancelled on reload".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}
