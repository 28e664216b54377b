use std::env;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};

use murmur_client::{
    ChatSession, ChatTransport, ClientError, FailureReason, HttpTransport, ServerConfig,
    SessionEvent, SessionHandle, StreamEnd, TransportEvent, TransportHandle, TransportWorker,
    make_transport_stream,
};
use murmur_protocol::{ChatRequest, LineFrameDecoder, MessageAccumulator, MessageId};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    server: Option<(String, u16)>,
    password: String,
    prompt: String,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    FrameReassembly,
    FrameFlush,
    AccumulatorConcat,
    AccumulatorFreeze,
    DecodeRecovery,
    SessionCancel,
    DoubleStart,
    Health,
    Login,
    LiveChat,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "frame_reassembly" => Some(Self::FrameReassembly),
            "frame_flush" => Some(Self::FrameFlush),
            "accumulator_concat" => Some(Self::AccumulatorConcat),
            "accumulator_freeze" => Some(Self::AccumulatorFreeze),
            "decode_recovery" => Some(Self::DecodeRecovery),
            "session_cancel" => Some(Self::SessionCancel),
            "double_start" => Some(Self::DoubleStart),
            "health" => Some(Self::Health),
            "login" => Some(Self::Login),
            "live_chat" => Some(Self::LiveChat),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::FrameReassembly => "frame_reassembly",
            Self::FrameFlush => "frame_flush",
            Self::AccumulatorConcat => "accumulator_concat",
            Self::AccumulatorFreeze => "accumulator_freeze",
            Self::DecodeRecovery => "decode_recovery",
            Self::SessionCancel => "session_cancel",
            Self::DoubleStart => "double_start",
            Self::Health => "health",
            Self::Login => "login",
            Self::LiveChat => "live_chat",
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
    #[snafu(display("invalid server address '{raw}', expected host:port"))]
    InvalidServerAddress { stage: &'static str, raw: String },
    #[snafu(display("missing required --server argument for scenario '{scenario}'"))]
    MissingServerAddress {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("client call failed in scenario '{scenario}': {source}"))]
    ClientCall {
        stage: &'static str,
        scenario: &'static str,
        source: ClientError,
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
        Scenario::FrameReassembly => run_frame_reassembly(),
        Scenario::FrameFlush => run_frame_flush(),
        Scenario::AccumulatorConcat => run_accumulator_concat(),
        Scenario::AccumulatorFreeze => run_accumulator_freeze(),
        Scenario::DecodeRecovery => run_decode_recovery().await,
        Scenario::SessionCancel => run_session_cancel().await,
        Scenario::DoubleStart => run_double_start().await,
        Scenario::Health => run_health(&require_config(&args, "health")?).await,
        Scenario::Login => run_login(&require_config(&args, "login")?).await,
        Scenario::LiveChat => run_live_chat(&require_config(&args, "live_chat")?, &args.prompt).await,
        Scenario::All => run_all(&args).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut server = None;
    let mut password = String::new();
    let mut prompt = "Say hello in one sentence.".to_string();
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
            "--server" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-server-value",
                    arg: "--server",
                })?;
                server = Some(parse_server_address(&value)?);
            }
            "--password" => {
                password = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-password-value",
                    arg: "--password",
                })?;
            }
            "--prompt" => {
                prompt = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-prompt-value",
                    arg: "--prompt",
                })?;
            }
            other => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: other.to_string(),
                }
                .fail();
            }
        }
    }

    let scenario = scenario.context(MissingScenarioSnafu {
        stage: "parse-args-finalize",
    })?;

    Ok(RunnerArgs {
        scenario,
        server,
        password,
        prompt,
    })
}

fn parse_server_address(raw: &str) -> RunnerResult<(String, u16)> {
    let (host, port) = raw.split_once(':').context(InvalidServerAddressSnafu {
        stage: "parse-server-address",
        raw: raw.to_string(),
    })?;

    let port = port.parse::<u16>().ok().context(InvalidServerAddressSnafu {
        stage: "parse-server-port",
        raw: raw.to_string(),
    })?;

    Ok((host.to_string(), port))
}

fn require_config(args: &RunnerArgs, scenario: &'static str) -> RunnerResult<ServerConfig> {
    let (host, port) = args.server.clone().context(MissingServerAddressSnafu {
        stage: "require-server",
        scenario,
    })?;

    Ok(ServerConfig::new(host, port, args.password.clone()))
}

fn ensure_scenario(
    scenario: &'static str,
    condition: bool,
    reason: &str,
) -> RunnerResult<()> {
    if condition {
        Ok(())
    } else {
        ScenarioFailedSnafu {
            stage: "check-scenario",
            scenario,
            reason: reason.to_string(),
        }
        .fail()
    }
}

// ----- pure scenarios -----

fn run_frame_reassembly() -> RunnerResult<()> {
    let payload = "{\"id\":\"m1\",\"content\":\"héllo\"}\n\n{\"id\":\"m1\",\"content\":\"wörld\"}\n";
    let bytes = payload.as_bytes();

    let mut whole = LineFrameDecoder::new();
    let expected = whole.feed(bytes);

    let mut splits_checked = 0usize;
    for split_width in 1..bytes.len() {
        let mut decoder = LineFrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(split_width) {
            frames.extend(decoder.feed(chunk));
        }
        ensure_scenario(
            "frame_reassembly",
            frames == expected,
            &format!("split width {split_width} changed the frame sequence"),
        )?;
        splits_checked += 1;
    }

    println!("frames={}", expected.len());
    println!("splits_checked={splits_checked}");
    println!("runner_ok=true");
    Ok(())
}

fn run_frame_flush() -> RunnerResult<()> {
    let mut decoder = LineFrameDecoder::new();
    let frames = decoder.feed(b"{\"a\":1}\nunterminated tail");
    ensure_scenario("frame_flush", frames.len() == 1, "expected one frame")?;
    ensure_scenario(
        "frame_flush",
        decoder.flush().is_none(),
        "flush surfaced the unterminated tail",
    )?;

    println!("tail_discarded=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_accumulator_concat() -> RunnerResult<()> {
    let mut accumulator = MessageAccumulator::new(MessageId::new(1));
    let mut decoder = LineFrameDecoder::new();
    let frames = decoder.feed(
        b"{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":0,\"content\":\"Hel\"}\n\
          {\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":1,\"content\":\"lo\"}\n\
          {\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":2,\"content\":\"\",\"finish_reason\":\"stop\"}\n",
    );

    for frame in &frames {
        let fragment = murmur_protocol::ChatFragment::parse(frame).map_err(|error| {
            RunnerError::ScenarioFailed {
                stage: "parse-fixture-frame",
                scenario: "accumulator_concat",
                reason: error.to_string(),
            }
        })?;
        accumulator.apply(&fragment);
    }

    ensure_scenario(
        "accumulator_concat",
        accumulator.message().text == "Hello",
        "concatenation diverged",
    )?;
    ensure_scenario(
        "accumulator_concat",
        accumulator.is_complete(),
        "terminal fragment did not complete the message",
    )?;

    println!("text_len={}", accumulator.message().text.len());
    println!("completed=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_accumulator_freeze() -> RunnerResult<()> {
    let mut accumulator = MessageAccumulator::new(MessageId::new(1));
    let terminal = murmur_protocol::ChatFragment {
        id: "m1".to_string(),
        model: "m".to_string(),
        created: 1,
        index: 0,
        role: None,
        content: Some("done".to_string()),
        finish_reason: Some(murmur_protocol::FinishReason::Stop),
    };
    accumulator.apply(&terminal);

    let late = murmur_protocol::ChatFragment {
        content: Some(" extra".to_string()),
        finish_reason: None,
        ..terminal
    };
    accumulator.apply(&late);

    ensure_scenario(
        "accumulator_freeze",
        accumulator.message().text == "done",
        "frozen message accepted a late fragment",
    )?;

    println!("frozen=true");
    println!("runner_ok=true");
    Ok(())
}

// ----- scripted transport scenarios -----

/// Replays a fixed event script through the public transport seam.
struct ScriptedTransport {
    script: Vec<TransportEvent>,
    hold_open: bool,
}

impl ChatTransport for ScriptedTransport {
    fn send_chat(&self, _request: ChatRequest) -> Result<TransportHandle, ClientError> {
        let (event_tx, stream, cancel_rx) = make_transport_stream();
        let script = self.script.clone();
        let hold_open = self.hold_open;
        let worker: TransportWorker = Box::pin(async move {
            for event in script {
                if event_tx.send(event).is_err() {
                    return;
                }
            }
            if hold_open {
                let _ = cancel_rx.await;
            }
        });

        Ok(TransportHandle { stream, worker })
    }
}

fn scripted_body(text: &str) -> TransportEvent {
    TransportEvent::Body(text.as_bytes().to_vec())
}

async fn run_decode_recovery() -> RunnerResult<()> {
    let transport = ScriptedTransport {
        script: vec![
            scripted_body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":0,\"content\":\"Hel\"}\n"),
            scripted_body("garbage that is not json\n"),
            scripted_body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":1,\"content\":\"lo\",\"finish_reason\":\"stop\"}\n"),
            TransportEvent::Closed(StreamEnd::Success),
        ],
        hold_open: false,
    };

    let session = ChatSession::new(Arc::new(transport));
    let SessionHandle {
        mut events, worker, ..
    } = session
        .start(ChatRequest::new("qa"))
        .context(ClientCallSnafu {
            stage: "start-exchange",
            scenario: "decode_recovery",
        })?;
    let join = tokio::spawn(worker);

    let mut partials = 0usize;
    let mut completed_text = None;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Partial(_) => partials += 1,
            SessionEvent::Complete(message) => {
                completed_text = Some(message.text);
                break;
            }
            SessionEvent::Failed(reason) => {
                return ScenarioFailedSnafu {
                    stage: "drain-events",
                    scenario: "decode_recovery",
                    reason: format!("unexpected failure {reason:?}"),
                }
                .fail();
            }
        }
    }
    let _ = join.await;

    ensure_scenario(
        "decode_recovery",
        completed_text.as_deref() == Some("Hello"),
        "decode failure corrupted the accumulated text",
    )?;

    println!("partials={partials}");
    println!("recovered=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_session_cancel() -> RunnerResult<()> {
    let transport = ScriptedTransport {
        script: vec![scripted_body(
            "{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":0,\"content\":\"par\"}\n",
        )],
        hold_open: true,
    };

    let session = ChatSession::new(Arc::new(transport));
    let SessionHandle {
        mut events, worker, ..
    } = session
        .start(ChatRequest::new("qa"))
        .context(ClientCallSnafu {
            stage: "start-exchange",
            scenario: "session_cancel",
        })?;
    let join = tokio::spawn(worker);

    let first = events.recv().await;
    ensure_scenario(
        "session_cancel",
        matches!(first, Some(SessionEvent::Partial(_))),
        "expected a partial before cancelling",
    )?;

    events.cancel();
    let terminal = events.recv().await;
    ensure_scenario(
        "session_cancel",
        matches!(
            terminal,
            Some(SessionEvent::Failed(FailureReason::Cancelled))
        ),
        "cancel did not fail the exchange",
    )?;

    let _ = join.await;
    ensure_scenario(
        "session_cancel",
        !session.is_in_flight(),
        "cancelled exchange left the session in flight",
    )?;

    println!("cancelled=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_double_start() -> RunnerResult<()> {
    let transport = ScriptedTransport {
        script: Vec::new(),
        hold_open: true,
    };

    let session = ChatSession::new(Arc::new(transport));
    let SessionHandle {
        mut events, worker, ..
    } = session
        .start(ChatRequest::new("first"))
        .context(ClientCallSnafu {
            stage: "start-exchange",
            scenario: "double_start",
        })?;
    let join = tokio::spawn(worker);

    let rejected = matches!(
        session.start(ChatRequest::new("second")),
        Err(ClientError::SessionBusy { .. })
    );
    ensure_scenario("double_start", rejected, "second start was not rejected")?;

    events.cancel();
    let _ = events.recv().await;
    let _ = join.await;

    println!("rejected=true");
    println!("runner_ok=true");
    Ok(())
}

// ----- live scenarios -----

async fn run_health(config: &ServerConfig) -> RunnerResult<()> {
    let transport = HttpTransport::new(config.clone()).context(ClientCallSnafu {
        stage: "build-transport",
        scenario: "health",
    })?;

    let health = transport.check_health().await.context(ClientCallSnafu {
        stage: "check-health",
        scenario: "health",
    })?;

    println!("status={}", health.status);
    println!("model_loaded={}", health.model_loaded);
    println!("version={}", health.version);
    println!("runner_ok=true");
    Ok(())
}

async fn run_login(config: &ServerConfig) -> RunnerResult<()> {
    let transport = HttpTransport::new(config.clone()).context(ClientCallSnafu {
        stage: "build-transport",
        scenario: "login",
    })?;

    transport.verify_login().await.context(ClientCallSnafu {
        stage: "verify-login",
        scenario: "login",
    })?;

    println!("login_ok=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_live_chat(config: &ServerConfig, prompt: &str) -> RunnerResult<()> {
    let transport = HttpTransport::new(config.clone()).context(ClientCallSnafu {
        stage: "build-transport",
        scenario: "live_chat",
    })?;

    let session = ChatSession::new(Arc::new(transport));
    let SessionHandle {
        mut events, worker, ..
    } = session
        .start(ChatRequest::new(prompt))
        .context(ClientCallSnafu {
            stage: "start-exchange",
            scenario: "live_chat",
        })?;
    let join = tokio::spawn(worker);

    let mut partials = 0usize;
    let outcome = loop {
        match events.recv().await {
            Some(SessionEvent::Partial(_)) => partials += 1,
            Some(SessionEvent::Complete(message)) => break Ok(message),
            Some(SessionEvent::Failed(reason)) => break Err(reason),
            None => {
                break Err(FailureReason::Network(
                    "event stream ended early".to_string(),
                ));
            }
        }
    };
    let _ = join.await;

    match outcome {
        Ok(message) => {
            println!("partials={partials}");
            println!("final_chars={}", message.text.chars().count());
            println!("completed=true");
            println!("runner_ok=true");
            Ok(())
        }
        Err(reason) => ScenarioFailedSnafu {
            stage: "drain-events",
            scenario: "live_chat",
            reason: format!("{reason:?}"),
        }
        .fail(),
    }
}

async fn run_all(args: &RunnerArgs) -> RunnerResult<()> {
    run_frame_reassembly()?;
    run_frame_flush()?;
    run_accumulator_concat()?;
    run_accumulator_freeze()?;
    run_decode_recovery().await?;
    run_session_cancel().await?;
    run_double_start().await?;

    // Live checks only run when a server address was supplied.
    if args.server.is_some() {
        let config = require_config(args, "all")?;
        run_health(&config).await?;
        run_login(&config).await?;
        run_live_chat(&config, &args.prompt).await?;
    }

    println!("all_passed=true");
    Ok(())
}
