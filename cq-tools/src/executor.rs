use crate::action::ToolAction;
use crate::error::{Result, ToolError};
use crate::safety::validate_command;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

const LOG_BYTES_MAX: usize = 32_000;
const BINARY_SNIFF_BYTES: usize = 1024;
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Dev-server launchers handled with non-blocking monitoring instead of
/// wait-to-completion, with the default port each one binds when the
/// command text names none.
const SERVER_LAUNCHERS: &[(&str, Option<u16>)] = &[
    ("npm run dev", Some(3000)),
    ("npm start", Some(3000)),
    ("yarn dev", Some(3000)),
    ("yarn start", Some(3000)),
    ("pnpm dev", Some(3000)),
    ("npx vite", Some(5173)),
    ("vite", Some(5173)),
    ("next dev", Some(3000)),
    ("python -m http.server", Some(8000)),
    ("python3 -m http.server", Some(8000)),
    ("flask run", Some(5000)),
    ("rails s", Some(3000)),
    ("php -s", Some(8000)),
    ("node server", None),
    ("cargo run", None),
];

/// Commands that invalidate any cached repository status.
const GIT_STATE_PATTERNS: &[&str] = &[
    "git add",
    "git commit",
    "git checkout",
    "git switch",
    "git merge",
    "git rebase",
    "git reset",
    "git restore",
    "git stash",
    "git cherry-pick",
    "git pull",
    "git push",
];

#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    pub command_timeout: Duration,
    pub file_bytes_max: usize,
    pub fetch_bytes_max: usize,
    pub search_results_max: usize,
    pub server_grace: Duration,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            file_bytes_max: 1_000_000,
            fetch_bytes_max: 500_000,
            search_results_max: 5,
            server_grace: Duration::from_secs(3),
        }
    }
}

struct ServerProcess {
    command: String,
    port: Option<u16>,
}

/// Snapshot of one tracked background server, for status listings.
#[derive(Debug, Clone)]
pub struct ServerSummary {
    pub id: String,
    pub command: String,
    pub port: Option<u16>,
}

/// Executes one parsed action against the local environment. Every failure
/// mode becomes descriptive output text, so `execute` itself never fails;
/// that uniform contract is what lets the orchestrator treat all tool
/// outcomes identically.
pub struct ToolExecutor {
    workdir: PathBuf,
    safety_enabled: bool,
    limits: ExecutorLimits,
    http: reqwest::Client,
    servers: Arc<Mutex<HashMap<String, ServerProcess>>>,
    next_server_id: AtomicU64,
    git_refresh: Option<UnboundedSender<()>>,
}

impl ToolExecutor {
    pub fn new(workdir: impl AsRef<Path>, safety_enabled: bool, limits: ExecutorLimits) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            workdir: workdir.as_ref().to_path_buf(),
            safety_enabled,
            limits,
            http,
            servers: Arc::new(Mutex::new(HashMap::new())),
            next_server_id: AtomicU64::new(1),
            git_refresh: None,
        }
    }

    /// Register a channel that is pinged after any git-state-changing
    /// command, so the app layer can refresh its cached repository status.
    pub fn with_git_refresh(mut self, tx: UnboundedSender<()>) -> Self {
        self.git_refresh = Some(tx);
        self
    }

    pub fn tracked_servers(&self) -> Vec<ServerSummary> {
        let Ok(servers) = self.servers.lock() else {
            return Vec::new();
        };
        let mut out: Vec<ServerSummary> = servers
            .iter()
            .map(|(id, process)| ServerSummary {
                id: id.clone(),
                command: process.command.clone(),
                port: process.port,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    #[tracing::instrument(level = "info", skip_all, fields(action = %action.describe()))]
    pub async fn execute(&self, action: &ToolAction) -> String {
        match action {
            ToolAction::Terminal { command } => self.run_terminal(command).await,
            ToolAction::ReadFile { path } => self.read_file(path).await,
            ToolAction::WriteFile { path, content } => self.write_file(path, content).await,
            ToolAction::FetchWeb { url } => self.fetch_web(url).await,
            ToolAction::SearchWeb { query } => self.search_web(query).await,
            ToolAction::OpenUrl { url } => self.open_url(url).await,
            ToolAction::CheckServerStatus { port } => check_server_status(*port).await,
        }
    }

    async fn run_terminal(&self, command: &str) -> String {
        if self.safety_enabled {
            let decision = validate_command(command);
            if !decision.allowed {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "Command blocked".to_string());
                tracing::warn!(command, %reason, "command denied by safety validator");
                return reason;
            }
        }

        let result = if let Some(default_port) = classify_server_command(command) {
            self.run_server_command(command, default_port).await
        } else {
            self.run_foreground(command).await
        };

        if is_git_state_changing(command) {
            if let Some(tx) = &self.git_refresh {
                let _ = tx.send(());
            }
        }

        result
    }

    async fn run_foreground(&self, command: &str) -> String {
        let mut child = match self.spawn_shell(command) {
            Ok(child) => child,
            Err(e) => return format!("Failed to start command: {e}"),
        };

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        if let Some(pipe) = child.stdout.take() {
            spawn_log_collector(pipe, stdout.clone());
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_log_collector(pipe, stderr.clone());
        }

        match tokio::time::timeout(self.limits.command_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let mut out = combine_output(&stdout, &stderr);
                if out.trim().is_empty() {
                    out = format!(
                        "Command completed with exit code {}",
                        status.code().unwrap_or(-1)
                    );
                } else if !status.success() {
                    out = format!(
                        "{out}\n[exit code {}]",
                        status.code().unwrap_or(-1)
                    );
                }
                out
            }
            Ok(Err(e)) => format!("Failed to wait for command: {e}"),
            Err(_) => {
                let _ = child.kill().await;
                let partial = combine_output(&stdout, &stderr);
                let secs = self.limits.command_timeout.as_secs();
                if partial.trim().is_empty() {
                    format!("Command timed out after {secs}s with no output")
                } else {
                    format!("Command timed out after {secs}s. Partial output:\n{partial}")
                }
            }
        }
    }

    async fn run_server_command(&self, command: &str, default_port: Option<u16>) -> String {
        let port = extract_port(command).or(default_port);

        if let Some(port) = port {
            if probe_port(port).await {
                return format!(
                    "Port {port} is already in use; another server may already be running. \
                     Try check_server_status or pick a different port."
                );
            }
        }

        let mut child = match self.spawn_shell(command) {
            Ok(child) => child,
            Err(e) => return format!("Failed to start server: {e}"),
        };

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        if let Some(pipe) = child.stdout.take() {
            spawn_log_collector(pipe, stdout.clone());
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_log_collector(pipe, stderr.clone());
        }

        tokio::time::sleep(self.limits.server_grace).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                let output = combine_output(&stdout, &stderr);
                format!(
                    "Server failed to start (exit code {}).\n{output}",
                    status.code().unwrap_or(-1)
                )
            }
            Err(e) => format!("Failed to check server process: {e}"),
            Ok(None) => {
                let listening = match port {
                    Some(port) => probe_port(port).await,
                    None => false,
                };
                let server_id = format!(
                    "srv-{}",
                    self.next_server_id.fetch_add(1, Ordering::Relaxed)
                );
                if let Ok(mut servers) = self.servers.lock() {
                    servers.insert(
                        server_id.clone(),
                        ServerProcess {
                            command: command.to_string(),
                            port,
                        },
                    );
                }
                // Reap the handle when the server eventually exits so
                // long-lived processes do not leak registry entries.
                let servers = self.servers.clone();
                let reap_id = server_id.clone();
                tokio::spawn(async move {
                    let _ = child.wait().await;
                    if let Ok(mut servers) = servers.lock() {
                        servers.remove(&reap_id);
                    }
                    tracing::debug!(server_id = %reap_id, "background server exited");
                });

                match (port, listening) {
                    (Some(port), true) => format!(
                        "Server started ({server_id}) and is listening on port {port}. \
                         It keeps running in the background; do not wait for it to exit."
                    ),
                    (Some(port), false) => format!(
                        "Server started ({server_id}); port {port} is not answering yet. \
                         It may still be booting. It runs in the background; do not wait for it."
                    ),
                    (None, _) => format!(
                        "Server started ({server_id}) and keeps running in the background; \
                         no port could be detected from the command."
                    ),
                }
            }
        }
    }

    fn spawn_shell(&self, command: &str) -> std::io::Result<tokio::process::Child> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-lc")
            .arg(command)
            .current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn()
    }

    fn resolve_path(&self, user_path: &str) -> Result<PathBuf> {
        let raw = Path::new(user_path);
        if self.safety_enabled {
            for component in raw.components() {
                if matches!(component, Component::ParentDir) {
                    return Err(ToolError::Blocked(format!(
                        "path traversal is not allowed ({user_path})"
                    )));
                }
            }
        }
        if raw.is_absolute() {
            Ok(raw.to_path_buf())
        } else {
            Ok(self.workdir.join(raw))
        }
    }

    async fn read_file(&self, path: &str) -> String {
        let resolved = match self.resolve_path(path) {
            Ok(p) => p,
            Err(e) => return e.to_string(),
        };

        let mut file = match tokio::fs::File::open(&resolved).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return format!("File not found: {path}");
            }
            Err(e) => return format!("Failed to open {path}: {e}"),
        };

        // Bounded read: one byte past the cap tells us whether we truncated.
        let mut bytes = Vec::with_capacity(BINARY_SNIFF_BYTES);
        let mut handle = (&mut file).take(self.limits.file_bytes_max as u64 + 1);
        if let Err(e) = handle.read_to_end(&mut bytes).await {
            return format!("Failed to read {path}: {e}");
        }

        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
        if sniff.contains(&0u8) {
            return format!("{path} appears to be a binary file and cannot be read as text");
        }

        if bytes.len() > self.limits.file_bytes_max {
            bytes.truncate(self.limits.file_bytes_max);
            let text = String::from_utf8_lossy(&bytes);
            return format!(
                "{text}\n...[file truncated: {path} exceeds {} bytes]",
                self.limits.file_bytes_max
            );
        }

        String::from_utf8_lossy(&bytes).to_string()
    }

    async fn write_file(&self, path: &str, content: &str) -> String {
        let resolved = match self.resolve_path(path) {
            Ok(p) => p,
            Err(e) => return e.to_string(),
        };

        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return format!("Failed to create directories for {path}: {e}");
            }
        }

        // Write into a sibling temp file first so a crash mid-write never
        // leaves a half-written target.
        let file_name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let tmp = resolved.with_file_name(format!(".{file_name}.tmp"));
        if let Err(e) = tokio::fs::write(&tmp, content).await {
            return format!("Failed to write {path}: {e}");
        }
        if let Err(e) = tokio::fs::rename(&tmp, &resolved).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return format!("Failed to write {path}: {e}");
        }

        format!("Wrote {} bytes to {path}", content.len())
    }

    async fn fetch_web(&self, url: &str) -> String {
        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return format!("Request to {url} timed out");
            }
            Err(e) => return format!("Failed to fetch {url}: {e}"),
        };
        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return format!("Failed to read response from {url}: {e}"),
        };
        let truncated = bytes.len() > self.limits.fetch_bytes_max;
        let slice = &bytes[..bytes.len().min(self.limits.fetch_bytes_max)];
        let body = String::from_utf8_lossy(slice);
        if truncated {
            format!("[{status}] {body}\n...[response truncated]")
        } else {
            format!("[{status}] {body}")
        }
    }

    async fn search_web(&self, query: &str) -> String {
        let response = match self
            .http
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return format!("Web search for \"{query}\" timed out");
            }
            Err(e) => return format!("Web search for \"{query}\" failed: {e}"),
        };
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return format!("Web search for \"{query}\" failed: {e}"),
        };

        let results = scrape_search_results(&body, self.limits.search_results_max);
        if results.is_empty() {
            return format!("No results found for \"{query}\"");
        }
        let mut out = format!("Search results for \"{query}\":\n");
        for (i, result) in results.iter().enumerate() {
            out.push_str(&format!(
                "{}. {}\n   {}\n   {}\n",
                i + 1,
                result.title,
                result.link,
                result.snippet
            ));
        }
        out
    }

    async fn open_url(&self, url: &str) -> String {
        let parsed = match reqwest::Url::parse(url) {
            Ok(u) => u,
            Err(e) => return format!("Invalid URL {url}: {e}"),
        };

        if is_loopback_host(&parsed) {
            let port = parsed.port_or_known_default().unwrap_or(80);
            if !probe_port(port).await {
                return format!(
                    "Server not running yet: nothing is listening on port {port}. \
                     Start the server first, then open {url}."
                );
            }
        }

        let opener = platform_opener();
        match Command::new(opener).arg(url).spawn() {
            Ok(_) => format!("Opened {url}"),
            Err(e) => format!("Failed to open {url}: {e}"),
        }
    }
}

async fn check_server_status(port: u16) -> String {
    if probe_port(port).await {
        format!("A server is listening on port {port}")
    } else {
        format!("Nothing is listening on port {port}")
    }
}

async fn probe_port(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            PORT_PROBE_TIMEOUT,
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}

fn platform_opener() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    }
}

fn is_loopback_host(url: &reqwest::Url) -> bool {
    match url.host_str() {
        Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1") => true,
        _ => false,
    }
}

/// Matches the command against the server-launcher table; `Some(default
/// port)` means "treat as a long-running server".
fn classify_server_command(command: &str) -> Option<Option<u16>> {
    let normalized = command.trim().to_lowercase();
    SERVER_LAUNCHERS
        .iter()
        .find(|(launcher, _)| {
            normalized.starts_with(launcher) || normalized.contains(&format!(" {launcher}"))
        })
        .map(|(_, port)| *port)
}

fn extract_port(command: &str) -> Option<u16> {
    let re = Regex::new(r"(?:--port[= ]|-p )(\d{2,5})|:(\d{2,5})").ok()?;
    if let Some(caps) = re.captures(command) {
        if let Some(port) = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse().ok())
        {
            return Some(port);
        }
    }
    // launchers like `python3 -m http.server 9000` take the port as a bare
    // trailing argument
    command
        .split_whitespace()
        .next_back()
        .filter(|tok| tok.len() >= 2 && tok.chars().all(|c| c.is_ascii_digit()))
        .and_then(|tok| tok.parse().ok())
}

fn is_git_state_changing(command: &str) -> bool {
    let normalized = command.trim().to_lowercase();
    GIT_STATE_PATTERNS.iter().any(|p| normalized.starts_with(p))
}

struct SearchResult {
    title: String,
    link: String,
    snippet: String,
}

/// Structural scrape of the DuckDuckGo HTML results page: anchor + snippet
/// per result block, provider redirect links unwrapped via their `uddg`
/// parameter.
fn scrape_search_results(html: &str, max_results: usize) -> Vec<SearchResult> {
    let anchor_re = match Regex::new(
        r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#,
    ) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let snippet_re =
        Regex::new(r#"(?s)class="result__snippet"[^>]*>(.*?)</"#).ok();

    let mut snippets = snippet_re
        .as_ref()
        .map(|re| {
            re.captures_iter(html)
                .map(|c| strip_tags(c.get(1).map(|m| m.as_str()).unwrap_or_default()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
        .into_iter();

    let mut out = Vec::new();
    for caps in anchor_re.captures_iter(html) {
        let raw_link = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let title = strip_tags(caps.get(2).map(|m| m.as_str()).unwrap_or_default());
        out.push(SearchResult {
            title,
            link: normalize_redirect_link(raw_link),
            snippet: snippets.next().unwrap_or_default(),
        });
        if out.len() >= max_results {
            break;
        }
    }
    out
}

/// DuckDuckGo wraps result links as `//duckduckgo.com/l/?uddg=<encoded>`;
/// unwrap to the destination URL.
fn normalize_redirect_link(raw: &str) -> String {
    let candidate = if raw.starts_with("//") {
        format!("https:{raw}")
    } else {
        raw.to_string()
    };
    if let Ok(url) = reqwest::Url::parse(&candidate) {
        if url.path().starts_with("/l/") {
            if let Some((_, target)) = url.query_pairs().find(|(k, _)| k == "uddg") {
                return target.to_string();
            }
        }
    }
    candidate
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .trim()
        .to_string()
}

fn spawn_log_collector<R>(reader: R, buffer: Arc<Mutex<Vec<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            append_log(&buffer, line.as_bytes());
            append_log(&buffer, b"\n");
        }
    });
}

fn append_log(buffer: &Arc<Mutex<Vec<u8>>>, bytes: &[u8]) {
    if let Ok(mut guard) = buffer.lock() {
        guard.extend_from_slice(bytes);
        if guard.len() > LOG_BYTES_MAX {
            let drop_len = guard.len() - LOG_BYTES_MAX;
            guard.drain(0..drop_len);
        }
    }
}

fn combine_output(stdout: &Arc<Mutex<Vec<u8>>>, stderr: &Arc<Mutex<Vec<u8>>>) -> String {
    let read = |buffer: &Arc<Mutex<Vec<u8>>>| match buffer.lock() {
        Ok(guard) => String::from_utf8_lossy(&guard).to_string(),
        Err(_) => String::new(),
    };
    let out = read(stdout);
    let err = read(stderr);
    if err.trim().is_empty() {
        out
    } else if out.trim().is_empty() {
        err
    } else {
        format!("{out}\n--- stderr ---\n{err}")
    }
}
