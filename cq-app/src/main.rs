//! Codequill main binary: a developer assistant that answers in a terminal
//! chat loop and runs local tools on the model's behalf.

mod config;
mod message;
mod orchestrator;
mod prompt;
mod routing;
mod session;
mod store;

use clap::{Parser, Subcommand};
use config::{CodequillConfig, DEFAULT_CONFIG_TEMPLATE};
use cq_llm::ChatClient;
use cq_tools::ToolExecutor;
use orchestrator::{Orchestrator, TurnOutcome};
use routing::ModelRouter;
use session::SessionManager;
use std::path::PathBuf;
use std::sync::Arc;
use store::SessionStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "codequill", version, about = "Codequill developer assistant")]
struct Cli {
    /// Path to the config file (defaults to ~/.codequill/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Working directory for tool execution (defaults to the current dir).
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat session (default).
    Chat {
        /// Pin one model for the whole session, bypassing routing.
        #[arg(long)]
        model: Option<String>,
    },
    /// One-shot question; prints the reply and exits.
    Ask {
        prompt: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Initialize ~/.codequill with a config template (idempotent).
    Init,
    /// Validate config and check provider connectivity.
    Doctor,
    /// List stored sessions, or delete one.
    Sessions {
        /// Delete the session with this id.
        #[arg(long)]
        delete: Option<uuid::Uuid>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Chat { model: None });
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| codequill_home().join("config.toml"));

    match command {
        Command::Chat { model } => {
            let app = App::bootstrap(&config_path, cli.workdir, model)?;
            app.chat_repl().await
        }
        Command::Ask { prompt, model } => {
            let app = App::bootstrap(&config_path, cli.workdir, model)?;
            app.ask(&prompt).await
        }
        Command::Init => init_home(),
        Command::Doctor => doctor(&config_path).await,
        Command::Sessions { delete } => {
            let store = SessionStore::open(&codequill_home().join("sessions.db3"))?;
            let sessions = SessionManager::load_or_new(store)?;
            if let Some(id) = delete {
                if sessions.delete_session(id)? {
                    println!("deleted session {id}");
                } else {
                    println!("no session with id {id}");
                }
                return Ok(());
            }
            let summaries = sessions.list();
            if summaries.is_empty() {
                println!("no stored sessions");
                return Ok(());
            }
            for summary in summaries {
                println!(
                    "{}  {}  ({} messages, last active {})",
                    summary.id,
                    summary.title.as_deref().unwrap_or("(untitled)"),
                    summary.messages,
                    summary.last_active.format("%Y-%m-%d %H:%M"),
                );
            }
            Ok(())
        }
    }
}

struct App {
    orchestrator: Arc<Orchestrator>,
    executor: Arc<ToolExecutor>,
    sessions: Arc<SessionManager>,
    model_override: Option<String>,
}

impl App {
    fn bootstrap(
        config_path: &std::path::Path,
        workdir: Option<PathBuf>,
        model_override: Option<String>,
    ) -> anyhow::Result<Self> {
        let config = load_config(config_path)?;
        let api_key = config.resolve_api_key().ok_or_else(|| {
            anyhow::anyhow!(
                "no API key configured; set keys.api_key in {} or CODEQUILL_API_KEY",
                config_path.display()
            )
        })?;
        let workdir = match workdir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };

        let client = Arc::new(ChatClient::new(
            &config.keys.base_url,
            &api_key,
            config.retry.to_policy(),
        ));
        let (git_tx, mut git_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while git_rx.recv().await.is_some() {
                tracing::debug!("repository state changed by a tool command");
            }
        });
        let executor = Arc::new(
            ToolExecutor::new(
                &workdir,
                config.safety.enabled,
                config.limits.to_executor_limits(),
            )
            .with_git_refresh(git_tx),
        );
        let store = SessionStore::open(&codequill_home().join("sessions.db3"))?;
        let sessions = Arc::new(SessionManager::load_or_new(store)?);
        let router = ModelRouter::new(
            config.general.model.clone(),
            config.models.coding.clone(),
            config.models.reasoning.clone(),
            config.models.vision.clone(),
            config.models.fallbacks.clone(),
        );
        let system_prompt = prompt::system_prompt(&config.general.system_prompt, &workdir);
        let orchestrator = Arc::new(Orchestrator::new(
            client,
            Arc::clone(&executor),
            Arc::clone(&sessions),
            router,
            system_prompt,
            config.limits.max_tool_turns,
        ));
        tracing::info!(
            workdir = %workdir.display(),
            safety_enabled = config.safety.enabled,
            base_url = %config.keys.base_url,
            "codequill ready"
        );
        Ok(Self {
            orchestrator,
            executor,
            sessions,
            model_override,
        })
    }

    fn new_session(&self) -> uuid::Uuid {
        let id = self.sessions.create_session();
        if let Some(model) = &self.model_override {
            self.sessions.with_session_mut(id, |s| {
                s.model_override = Some(model.clone());
            });
        }
        id
    }

    async fn ask(&self, prompt: &str) -> anyhow::Result<()> {
        let session_id = self.new_session();
        match self.orchestrator.run_turn(session_id, prompt, None).await? {
            TurnOutcome::Completed(reply) => {
                println!("{reply}");
                Ok(())
            }
            TurnOutcome::Superseded => Ok(()),
        }
    }

    async fn chat_repl(&self) -> anyhow::Result<()> {
        let mut session_id = self.new_session();
        println!("codequill chat. /new starts a session, /quit exits.");

        let mut status_rx = self.orchestrator.status();
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = status_rx.borrow_and_update().clone();
                if !status.is_empty() {
                    println!("  · {status}");
                }
            }
        });

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        loop {
            print!("you> ");
            use std::io::Write as _;
            std::io::stdout().flush()?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            match input {
                "/quit" | "/exit" => break,
                "/new" => {
                    session_id = self.new_session();
                    println!("started a new session");
                    continue;
                }
                "/servers" => {
                    let servers = self.executor.tracked_servers();
                    if servers.is_empty() {
                        println!("no background servers tracked");
                    }
                    for server in servers {
                        let port = server
                            .port
                            .map(|p| format!("port {p}"))
                            .unwrap_or_else(|| "port unknown".to_string());
                        println!("{}  {}  {}", server.id, port, server.command);
                    }
                    continue;
                }
                "/sessions" => {
                    for summary in self.sessions.list() {
                        println!(
                            "{}  {}",
                            summary.id,
                            summary.title.as_deref().unwrap_or("(untitled)")
                        );
                    }
                    continue;
                }
                _ => {}
            }

            tokio::select! {
                result = self.orchestrator.run_turn(session_id, input, None) => match result {
                    Ok(TurnOutcome::Completed(reply)) => println!("\n{reply}\n"),
                    Ok(TurnOutcome::Superseded) => {}
                    Err(e) => eprintln!("error: {e}"),
                },
                _ = tokio::signal::ctrl_c() => {
                    self.orchestrator.cancel(session_id);
                    println!("(cancelled)");
                }
            }
        }
        Ok(())
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<CodequillConfig> {
    if path.exists() {
        CodequillConfig::load(path)
    } else {
        tracing::debug!(path = %path.display(), "config file absent, using defaults");
        Ok(CodequillConfig::default())
    }
}

fn codequill_home() -> PathBuf {
    if let Ok(home) = std::env::var("CODEQUILL_HOME") {
        return PathBuf::from(home);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".codequill")
}

fn init_home() -> anyhow::Result<()> {
    let root = codequill_home();
    std::fs::create_dir_all(&root)?;
    let config_path = root.join("config.toml");
    if config_path.exists() {
        println!("codequill init: already initialized at {}", root.display());
    } else {
        std::fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE)?;
        println!("codequill init: wrote {}", config_path.display());
    }
    println!("next: set keys.api_key in {}", config_path.display());
    Ok(())
}

async fn doctor(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    println!("config: {}", config_path.display());
    println!("model: {}", config.general.model);
    println!("base_url: {}", config.keys.base_url);
    println!("safety: {}", if config.safety.enabled { "on" } else { "off" });

    let Some(api_key) = config.resolve_api_key() else {
        println!("api key: MISSING (set keys.api_key or CODEQUILL_API_KEY)");
        return Ok(());
    };
    println!("api key: present");

    let client = ChatClient::new(&config.keys.base_url, &api_key, config.retry.to_policy());
    match client.list_models().await {
        Ok(models) => {
            println!("provider: reachable ({} models)", models.len());
            let configured = &config.general.model;
            if models.iter().any(|m| &m.id == configured) {
                println!("model '{configured}': available");
            } else {
                println!("model '{configured}': not listed by provider");
            }
            let mut router = ModelRouter::new(
                configured.clone(),
                config.models.coding.clone(),
                config.models.reasoning.clone(),
                config.models.vision.clone(),
                config.models.fallbacks.clone(),
            );
            router.cache_context_windows(&models);
            if let Some(window) = router.context_window(configured) {
                println!("model '{configured}': context window {window} tokens");
            }
        }
        Err(e) => println!("provider: UNREACHABLE ({e})"),
    }
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new("warn,codequill=info,cq_llm=info,cq_tools=info"),
    };
    let log_format = std::env::var("CODEQUILL_LOG_FORMAT")
        .unwrap_or_else(|_| "compact".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported CODEQUILL_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
