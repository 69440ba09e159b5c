use clap::{Parser, Subcommand};
use lib::config::{AssistantSettings, Config, DiagnosticsConfig};
use lib::diagnostics::{DiagnosticResult, DiagnosticStatus, Diagnostics};
use lib::llm::{DifyClient, DifyError};
use lib::logger::{default_export_name, render, LogFilter, LogFormat, Logger};
use lib::session::{ChatSession, RejectReason, Role, SessionView, TurnOutcome};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "tri-assist")]
#[command(about = "Triathlon storefront shopping assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Print the assistant configuration check (API key, base URL) and exit non-zero when unusable.
    Check {
        /// Config file path (default: TRI_ASSIST_CONFIG_PATH or ~/.tri-assist/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Ask one question; the answer is printed as it streams. Ctrl-C cancels.
    Ask {
        /// Config file path (default: TRI_ASSIST_CONFIG_PATH or ~/.tri-assist/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Continue an existing conversation.
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,

        /// User id sent to the assistant backend (default from config).
        #[arg(long, value_name = "ID")]
        user: Option<String>,

        /// Write the in-memory log buffer here on exit (.json for JSON, otherwise text).
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,

        /// Question text.
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Chat with the assistant (interactive). Commands: /clear /status /test /diagnose /logs /exit
    Chat {
        /// Config file path (default: TRI_ASSIST_CONFIG_PATH or ~/.tri-assist/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// User id sent to the assistant backend (default from config).
        #[arg(long, value_name = "ID")]
        user: Option<String>,

        /// Write the in-memory log buffer here on exit (.json for JSON, otherwise text).
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },

    /// Run the connection diagnostics (network, CORS preflight, API endpoint).
    Diagnose {
        /// Config file path (default: TRI_ASSIST_CONFIG_PATH or ~/.tri-assist/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// List recent conversations for the configured user.
    Conversations {
        /// Config file path (default: TRI_ASSIST_CONFIG_PATH or ~/.tri-assist/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Delete one conversation.
    DeleteConversation {
        /// Config file path (default: TRI_ASSIST_CONFIG_PATH or ~/.tri-assist/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        id: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("tri-assist {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Check { config }) => run_check(config),
        Some(Commands::Ask {
            config,
            conversation,
            user,
            log_file,
            text,
        }) => run_ask(config, conversation, user, log_file, text.join(" ")).await,
        Some(Commands::Chat {
            config,
            user,
            log_file,
        }) => run_chat(config, user, log_file).await,
        Some(Commands::Diagnose { config }) => run_diagnose(config).await,
        Some(Commands::Conversations { config, limit }) => run_conversations(config, limit).await,
        Some(Commands::DeleteConversation { config, id }) => {
            run_delete_conversation(config, id).await
        }
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

type Session = ChatSession<DifyClient>;

struct Context {
    config: Config,
    path: PathBuf,
    settings: AssistantSettings,
    logger: Logger,
}

fn open(config_path: Option<PathBuf>) -> anyhow::Result<Context> {
    open_as(config_path, None)
}

/// Load config; `user` overrides the configured user id.
fn open_as(config_path: Option<PathBuf>, user: Option<String>) -> anyhow::Result<Context> {
    let (config, path) = lib::config::load_config(config_path)?;
    log::debug!("cli: using config {}", path.display());
    let mut settings = lib::config::resolve_assistant(&config);
    if let Some(user) = user.filter(|u| !u.trim().is_empty()) {
        settings = settings.with_user(user.trim());
    }
    let logger = Logger::new(config.log.max_entries);
    Ok(Context {
        config,
        path,
        settings,
        logger,
    })
}

fn run_check(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let ctx = open(config_path)?;
    let check = ctx.settings.check();
    println!("config:   {}", ctx.path.display());
    println!("base url: {}", ctx.settings.base_url);
    println!("user:     {}", ctx.settings.user);
    println!(
        "api key:  {}",
        if check.has_api_key { "set" } else { "missing" }
    );
    for problem in &check.problems {
        println!("- {}", problem);
    }
    if !check.is_configured {
        anyhow::bail!("assistant is not configured");
    }
    Ok(())
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("cli: interrupt received, cancelling");
            token.cancel();
        }
    });
}

async fn run_ask(
    config_path: Option<PathBuf>,
    conversation: Option<String>,
    user: Option<String>,
    log_file: Option<PathBuf>,
    text: String,
) -> anyhow::Result<()> {
    let ctx = open_as(config_path, user)?;
    let client = DifyClient::new(ctx.settings, ctx.logger.clone());
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let mut stdout = io::stdout();
    let stop = cancel.clone();
    // A closed stdout (e.g. `| head`) ends the request.
    let mut on_chunk = move |chunk: &str| {
        if stop.is_cancelled() {
            return;
        }
        if let Err(e) = stdout
            .write_all(chunk.as_bytes())
            .and_then(|_| stdout.flush())
        {
            log::debug!("cli: stdout write failed, stopping stream: {}", e);
            stop.cancel();
        }
    };
    let result = client
        .send_streaming_message_with_cancel(&text, &mut on_chunk, conversation.as_deref(), &cancel)
        .await;
    println!();
    export_logs(&ctx.logger, log_file.as_deref());

    match result {
        Ok(outcome) => {
            if let Some(id) = outcome.conversation_id {
                eprintln!("conversation: {}", id);
            }
            Ok(())
        }
        Err(DifyError::Cancelled) => {
            eprintln!("(cancelled)");
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.guidance());
            Err(e.into())
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

async fn run_chat(
    config_path: Option<PathBuf>,
    user: Option<String>,
    log_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let ctx = open_as(config_path, user)?;
    let logger = ctx.logger.clone();
    let diagnostics = ctx.config.diagnostics.clone();
    let session = ChatSession::new(DifyClient::new(ctx.settings, ctx.logger), logger.clone());
    for problem in session.backend().settings().check().problems {
        eprintln!("! {}", problem);
    }
    println!("Triathlon shopping assistant. /clear /status /test /diagnose /logs /exit (Ctrl-C cancels a reply, or quits when idle)");
    watch_interrupts(session.clone(), logger.clone(), log_file.clone());

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if let Some(command) = input.strip_prefix('/') {
            match run_command(&session, &logger, &diagnostics, command).await? {
                Flow::Exit => break,
                Flow::Continue => continue,
            }
        }
        run_turn(&session, input).await?;
    }

    export_logs(&logger, log_file.as_deref());
    Ok(())
}

/// One Ctrl-C listener for the whole REPL: cancels a streaming reply, otherwise quits.
fn watch_interrupts(session: Session, logger: Logger, log_file: Option<PathBuf>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if session.is_busy() {
                log::info!("cli: interrupt received, cancelling reply");
                session.cancel();
                continue;
            }
            println!();
            export_logs(&logger, log_file.as_deref());
            std::process::exit(130);
        }
    });
}

async fn run_command(
    session: &Session,
    logger: &Logger,
    diagnostics: &DiagnosticsConfig,
    command: &str,
) -> anyhow::Result<Flow> {
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or("") {
        "exit" | "quit" => return Ok(Flow::Exit),
        "clear" => {
            session.clear();
            println!("history cleared");
        }
        "status" => {
            let view = session.view();
            let status = serde_json::json!({
                "configStatus": view.config_status,
                "conversation": view.conversation,
                "messages": view.messages.len(),
                "busy": view.busy,
                "lastError": view.last_error,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "test" => {
            let status = session.test_connection().await;
            println!("connection: {:?}", status);
            if let Some(error) = session.config_status().last_error {
                eprintln!("{}", error);
            }
        }
        "diagnose" => {
            println!("Diagnosing {}", session.backend().settings().base_url);
            session
                .run_diagnostics(diagnostics.clone(), &mut |results: &[DiagnosticResult]| {
                    if let Some(latest) = results.last() {
                        print_result(latest);
                    }
                })
                .await;
        }
        "logs" => match LogsCommand::parse(parts) {
            Ok(LogsCommand::Stats) => print_log_stats(logger),
            Ok(LogsCommand::Clear) => {
                logger.clear();
                println!("log buffer cleared");
            }
            Ok(LogsCommand::Show { filter, format }) => {
                let entries = logger.query(&filter);
                if entries.is_empty() {
                    println!("no matching log entries");
                } else {
                    println!("{}", render(&entries, format)?);
                }
            }
            Err(e) => eprintln!("{}\nusage: /logs [stats|clear] [--level L] [--category C] [--search TEXT] [json|text]", e),
        },
        other => eprintln!("unknown command: /{}", other),
    }
    Ok(Flow::Continue)
}

enum LogsCommand {
    Stats,
    Clear,
    Show { filter: LogFilter, format: LogFormat },
}

impl LogsCommand {
    fn parse<'a>(mut args: impl Iterator<Item = &'a str>) -> Result<Self, String> {
        let mut filter = LogFilter::default();
        let mut format = LogFormat::Text;
        let mut search: Vec<&str> = Vec::new();
        while let Some(arg) = args.next() {
            match arg {
                "stats" => return Ok(LogsCommand::Stats),
                "clear" => return Ok(LogsCommand::Clear),
                "--level" => {
                    let level = args.next().ok_or("--level needs a value")?;
                    filter.level = Some(level.parse()?);
                }
                "--category" => {
                    let category = args.next().ok_or("--category needs a value")?;
                    filter.category = Some(category.to_ascii_uppercase());
                }
                "--search" => search.push(args.next().ok_or("--search needs a value")?),
                other if other.starts_with("--") => return Err(format!("unknown option: {}", other)),
                // Bare words after --search extend the search text, unless they name a format.
                other => match other.parse::<LogFormat>() {
                    Ok(f) => format = f,
                    Err(_) if !search.is_empty() => search.push(other),
                    Err(e) => return Err(e),
                },
            }
        }
        if !search.is_empty() {
            filter.search = Some(search.join(" "));
        }
        Ok(LogsCommand::Show { filter, format })
    }
}

fn print_log_stats(logger: &Logger) {
    let stats = logger.stats();
    println!("total: {}", stats.total);
    for (level, count) in &stats.by_level {
        println!("  {:<6} {}", level, count);
    }
    for (category, count) in &stats.by_category {
        println!("  {:<14} {}", category, count);
    }
}

/// Submit one message and print the reply while it streams.
async fn run_turn(session: &Session, input: &str) -> anyhow::Result<()> {
    let after_id = session.view().messages.last().map(|m| m.id).unwrap_or(0);
    let mut turn = {
        let session = session.clone();
        let text = input.to_string();
        tokio::spawn(async move { session.submit(&text).await })
    };

    let mut stdout = io::stdout();
    let mut printed = 0usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    let outcome = loop {
        tokio::select! {
            joined = &mut turn => break joined?,
            _ = ticker.tick() => print_delta(&session.view(), after_id, &mut printed, &mut stdout)?,
        }
    };

    match outcome {
        TurnOutcome::Answered(answer) => {
            if let Some(rest) = answer.full_text.get(printed..) {
                write!(stdout, "{}", rest)?;
            }
            writeln!(stdout)?;
        }
        TurnOutcome::Cancelled => {
            if printed > 0 {
                writeln!(stdout)?;
            }
            eprintln!("(cancelled)");
        }
        TurnOutcome::Failed(kind) => {
            if printed > 0 {
                writeln!(stdout)?;
            }
            log::debug!("cli: turn failed ({:?})", kind);
            eprintln!("! {}", session.last_error().unwrap_or_default());
        }
        TurnOutcome::Rejected(RejectReason::Empty) => {}
        TurnOutcome::Rejected(RejectReason::NotConfigured) => {
            eprintln!("! {}", session.last_error().unwrap_or_default());
        }
        TurnOutcome::Rejected(RejectReason::Busy) => {
            eprintln!("! a reply is still streaming");
        }
    }
    Ok(())
}

/// Print the streamed text of the reply to the message after `after_id` not yet printed.
fn print_delta(
    view: &SessionView,
    after_id: u64,
    printed: &mut usize,
    out: &mut impl Write,
) -> io::Result<()> {
    if !view.busy {
        return Ok(());
    }
    let Some(reply) = view
        .messages
        .iter()
        .find(|m| m.id > after_id && m.role == Role::Assistant)
    else {
        return Ok(());
    };
    if let Some(delta) = reply.text.get(*printed..) {
        if !delta.is_empty() {
            out.write_all(delta.as_bytes())?;
            out.flush()?;
            *printed = reply.text.len();
        }
    }
    Ok(())
}

async fn run_diagnose(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let ctx = open(config_path)?;
    let diagnostics = Diagnostics::new(ctx.settings.base_url, ctx.config.diagnostics, ctx.logger);
    println!("Diagnosing {}", diagnostics.base_url());
    let mut on_update = |results: &[DiagnosticResult]| {
        if let Some(latest) = results.last() {
            print_result(latest);
        }
    };
    let results = diagnostics.run(&mut on_update).await;
    let failed = results
        .iter()
        .filter(|r| r.status == DiagnosticStatus::Error)
        .count();
    if failed > 0 {
        anyhow::bail!("{} of {} probes failed", failed, results.len());
    }
    Ok(())
}

fn print_result(result: &DiagnosticResult) {
    let mark = match result.status {
        DiagnosticStatus::Pending => "..",
        DiagnosticStatus::Success => "ok",
        DiagnosticStatus::Warning => "!!",
        DiagnosticStatus::Error => "xx",
    };
    println!("[{}] {:<15} {}", mark, result.test_name, result.message);
    if let Some(details) = &result.details {
        for line in details.lines() {
            println!("     {}", line);
        }
    }
}

async fn run_conversations(config_path: Option<PathBuf>, limit: u32) -> anyhow::Result<()> {
    let ctx = open(config_path)?;
    let client = DifyClient::new(ctx.settings, ctx.logger);
    let page = client.list_conversations(limit).await.map_err(|e| {
        eprintln!("{}", e.guidance());
        e
    })?;
    if page.data.is_empty() {
        println!("no conversations");
    }
    for c in &page.data {
        println!("{}  {:<8} {}", c.id, c.status, c.name);
    }
    if page.has_more {
        println!("(more available; raise --limit)");
    }
    Ok(())
}

async fn run_delete_conversation(config_path: Option<PathBuf>, id: String) -> anyhow::Result<()> {
    let ctx = open(config_path)?;
    let client = DifyClient::new(ctx.settings, ctx.logger);
    client.delete_conversation(&id).await.map_err(|e| {
        eprintln!("{}", e.guidance());
        e
    })?;
    println!("deleted {}", id);
    Ok(())
}

/// Write the log buffer to `path`; a directory gets a timestamped file name.
fn export_logs(logger: &Logger, path: Option<&Path>) {
    let Some(path) = path else { return };
    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Text,
    };
    let target = if path.is_dir() {
        path.join(default_export_name(format))
    } else {
        path.to_path_buf()
    };
    match logger.write_to(&target, format) {
        Ok(()) => eprintln!("logs written to {}", target.display()),
        Err(e) => log::error!("cli: {:#}", e),
    }
}
