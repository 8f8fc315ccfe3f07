use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use anywhere_engine::{
    ConversationOrchestrator, EngineError, EngineSettings, RetryContinuation, SettingsStore,
    TurnOutcome, TurnReport, TurnStatus,
};
use anywhere_llm::{ContinuationState, Script, ScriptedService};
use anywhere_storage::{MemorySessionStore, Message};

const MODEL_ID: &str = "m1";
const PROGRESS_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    SendBasic,
    RetrySplice,
    CancelMidstream,
    FailureMidstream,
    RetryRewind,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "send_basic" => Some(Self::SendBasic),
            "retry_splice" => Some(Self::RetrySplice),
            "cancel_midstream" => Some(Self::CancelMidstream),
            "failure_midstream" => Some(Self::FailureMidstream),
            "retry_rewind" => Some(Self::RetryRewind),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SendBasic => "send_basic",
            Self::RetrySplice => "retry_splice",
            Self::CancelMidstream => "cancel_midstream",
            Self::FailureMidstream => "failure_midstream",
            Self::RetryRewind => "retry_rewind",
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
    #[snafu(display("engine call failed on `{stage}`: {source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("turn task failed to join on `{stage}`: {source}"))]
    TaskJoin {
        stage: &'static str,
        source: tokio::task::JoinError,
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
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    let base = match args.settings_path.as_ref() {
        Some(path) => {
            println!("settings_path={}", path.display());
            EngineSettings::clone(&SettingsStore::new(path.clone()).settings())
        }
        None => EngineSettings::default(),
    };

    match args.scenario {
        Scenario::SendBasic => run_send_basic(&base).await?,
        Scenario::RetrySplice => run_retry_splice(&base).await?,
        Scenario::CancelMidstream => run_cancel_midstream(&base).await?,
        Scenario::FailureMidstream => run_failure_midstream(&base).await?,
        Scenario::RetryRewind => run_retry_rewind(&base).await?,
        Scenario::All => {
            run_send_basic(&base).await?;
            run_retry_splice(&base).await?;
            run_cancel_midstream(&base).await?;
            run_failure_midstream(&base).await?;
            run_retry_rewind(&base).await?;
        }
    }

    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut settings_path = None;
    let mut pending = args.into_iter();

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
            "--settings" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-settings-value",
                    arg: "--settings",
                })?;
                settings_path = Some(PathBuf::from(value));
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
        settings_path,
    })
}

fn harness(
    settings: EngineSettings,
    service: Arc<ScriptedService>,
) -> RunnerResult<ConversationOrchestrator> {
    let orchestrator = ConversationOrchestrator::with_settings(
        service,
        Arc::new(MemorySessionStore::new()),
        settings,
    )
    .context(EngineSnafu {
        stage: "harness-build-orchestrator",
    })?;
    orchestrator.select_model(Some(MODEL_ID.to_string()));
    Ok(orchestrator)
}

fn settled(scenario: &'static str, outcome: TurnOutcome) -> RunnerResult<TurnReport> {
    match outcome {
        TurnOutcome::Settled(report) => Ok(report),
        TurnOutcome::Skipped(reason) => ScenarioFailedSnafu {
            stage: "turn-settled",
            scenario,
            reason: format!("turn was skipped: {reason:?}"),
        }
        .fail(),
    }
}

fn active_log(orchestrator: &ConversationOrchestrator) -> RunnerResult<Vec<Message>> {
    let log = orchestrator.active_messages().context(EngineSnafu {
        stage: "read-active-log",
    })?;
    Ok(log.to_vec())
}

fn active_continuation(orchestrator: &ConversationOrchestrator) -> RunnerResult<ContinuationState> {
    let session_id = orchestrator.active_session().context(ScenarioFailedSnafu {
        stage: "read-active-session",
        scenario: "harness",
        reason: "no active session".to_string(),
    })?;
    orchestrator
        .continuation_state(session_id)
        .context(EngineSnafu {
            stage: "read-continuation",
        })
}

async fn send(
    scenario: &'static str,
    orchestrator: &ConversationOrchestrator,
    text: &str,
) -> RunnerResult<TurnReport> {
    let outcome = orchestrator
        .send_turn(text, Vec::new())
        .await
        .context(EngineSnafu { stage: "send-turn" })?;
    settled(scenario, outcome)
}

async fn run_send_basic(base: &EngineSettings) -> RunnerResult<()> {
    let scenario = "send_basic";
    let service = Arc::new(
        ScriptedService::with_model_ids([MODEL_ID]).with_script(
            Script::new()
                .chunk("Hi")
                .chunk(" there")
                .finish_with([1, 2, 3]),
        ),
    );
    let orchestrator = harness(base.clone(), service)?;

    send(scenario, &orchestrator, "hello").await?;

    let log = active_log(&orchestrator)?;
    let continuation = active_continuation(&orchestrator)?;
    println!("send_basic_log_len={}", log.len());
    println!("send_basic_continuation={:?}", continuation.tokens());

    let expected = log.len() == 2
        && log[0].is_user()
        && log[0].text == "hello"
        && log[1].is_assistant()
        && log[1].text == "Hi there"
        && log[1].terminated
        && continuation == ContinuationState::from([1, 2, 3]);
    ensure!(
        expected,
        ScenarioFailedSnafu {
            stage: "scenario-send-basic",
            scenario,
            reason: format!("unexpected log {log:?} with state {continuation:?}"),
        }
    );
    Ok(())
}

async fn run_retry_splice(base: &EngineSettings) -> RunnerResult<()> {
    let scenario = "retry_splice";
    let service = Arc::new(
        ScriptedService::with_model_ids([MODEL_ID])
            .with_script(Script::new().chunk("Hi there").finish_with([1, 2, 3]))
            .with_script(Script::new().chunk("Hey!").finish_with([9])),
    );
    let orchestrator = harness(base.clone(), service)?;
    send(scenario, &orchestrator, "hello").await?;

    let outcome = orchestrator
        .retry_turn(0, Some(1))
        .await
        .context(EngineSnafu { stage: "retry-turn" })?;
    let report = settled(scenario, outcome)?;

    let log = active_log(&orchestrator)?;
    let continuation = active_continuation(&orchestrator)?;
    println!("retry_splice_log_len={}", log.len());
    println!("retry_splice_reply={}", report.reply.text);
    println!("retry_splice_continuation={:?}", continuation.tokens());

    let expected = log.len() == 2
        && log[0].text == "hello"
        && log[1].text == "Hey!"
        && continuation == ContinuationState::from([9]);
    ensure!(
        expected,
        ScenarioFailedSnafu {
            stage: "scenario-retry-splice",
            scenario,
            reason: format!("unexpected log {log:?} with state {continuation:?}"),
        }
    );
    Ok(())
}

async fn run_cancel_midstream(base: &EngineSettings) -> RunnerResult<()> {
    let scenario = "cancel_midstream";
    let service = Arc::new(
        ScriptedService::with_model_ids([MODEL_ID])
            .with_script(Script::new().chunk("Hi").chunk(" the").stall().chunk("re")),
    );
    let orchestrator = Arc::new(harness(base.clone(), service)?);
    let session_id = orchestrator.active_session().context(ScenarioFailedSnafu {
        stage: "scenario-cancel-session",
        scenario,
        reason: "no active session".to_string(),
    })?;

    let turn = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.send_turn("hello", Vec::new()).await })
    };

    let reached = tokio::time::timeout(PROGRESS_WAIT, async {
        let mut progress = loop {
            if let Some(progress) = orchestrator.progress(session_id) {
                break progress;
            }
            tokio::task::yield_now().await;
        };
        progress.wait_for(|text| text == "Hi the").await.is_ok()
    })
    .await
    .unwrap_or(false);
    ensure!(
        reached,
        ScenarioFailedSnafu {
            stage: "scenario-cancel-progress",
            scenario,
            reason: "stream never reached the expected progress".to_string(),
        }
    );
    orchestrator.cancel_active_generation();

    let outcome = turn
        .await
        .context(TaskJoinSnafu {
            stage: "scenario-cancel-join",
        })?
        .context(EngineSnafu {
            stage: "scenario-cancel-send",
        })?;
    let report = settled(scenario, outcome)?;
    let continuation = active_continuation(&orchestrator)?;
    println!("cancel_midstream_reply={}", report.reply.display_text());
    println!("cancel_midstream_terminated={}", report.reply.terminated);

    let expected = matches!(report.status, TurnStatus::Cancelled)
        && report.reply.text == "Hi the"
        && !report.reply.terminated
        && continuation.is_empty();
    ensure!(
        expected,
        ScenarioFailedSnafu {
            stage: "scenario-cancel-midstream",
            scenario,
            reason: format!("unexpected reply {:?}", report.reply),
        }
    );
    Ok(())
}

async fn run_failure_midstream(base: &EngineSettings) -> RunnerResult<()> {
    let scenario = "failure_midstream";
    let service = Arc::new(
        ScriptedService::with_model_ids([MODEL_ID])
            .with_script(Script::new().chunk("ok").finish_with([5]))
            .with_script(Script::new().chunk("par").fail("connection reset")),
    );
    let orchestrator = harness(base.clone(), service)?;
    send(scenario, &orchestrator, "first").await?;

    let report = send(scenario, &orchestrator, "second").await?;

    let log = active_log(&orchestrator)?;
    let continuation = active_continuation(&orchestrator)?;
    let failure_count = log.iter().filter(|message| message.failed).count();
    println!("failure_midstream_log_len={}", log.len());
    println!("failure_midstream_failure_count={failure_count}");

    let expected = matches!(report.status, TurnStatus::Failed { .. })
        && log.len() == 4
        && failure_count == 1
        && log[3].failed
        && !log[3].text.contains("par")
        && continuation == ContinuationState::from([5]);
    ensure!(
        expected,
        ScenarioFailedSnafu {
            stage: "scenario-failure-midstream",
            scenario,
            reason: format!("unexpected log {log:?} with state {continuation:?}"),
        }
    );
    Ok(())
}

async fn run_retry_rewind(base: &EngineSettings) -> RunnerResult<()> {
    let scenario = "retry_rewind";
    let service = Arc::new(
        ScriptedService::with_model_ids([MODEL_ID])
            .with_script(Script::new().chunk("one").finish_with([1]))
            .with_script(Script::new().chunk("two").finish_with([1, 2]))
            .with_script(Script::new().chunk("two again").finish_with([1, 3])),
    );
    let settings = EngineSettings {
        retry_continuation: RetryContinuation::Rewind,
        ..base.clone()
    };
    let orchestrator = harness(settings, service.clone())?;
    send(scenario, &orchestrator, "first").await?;
    send(scenario, &orchestrator, "second").await?;

    let outcome = orchestrator
        .retry_turn(2, Some(3))
        .await
        .context(EngineSnafu { stage: "retry-turn" })?;
    settled(scenario, outcome)?;

    let sent = service
        .last_request()
        .map(|request| request.continuation)
        .unwrap_or_default();
    println!("retry_rewind_sent_continuation={:?}", sent.tokens());

    ensure!(
        sent == ContinuationState::from([1]),
        ScenarioFailedSnafu {
            stage: "scenario-retry-rewind",
            scenario,
            reason: format!("retry was sent with {sent:?}"),
        }
    );
    Ok(())
}
