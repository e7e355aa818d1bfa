use anyhow::{Result, anyhow, bail};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;

const TRACE_DIR_NAME: &str = "pyclaude/traces";

/// Kind tags written in the second column of every trace line.
pub mod kind {
    pub const USER_INPUT: &str = "user.in";
    pub const ASSISTANT_TEXT: &str = "ai.text";
    pub const ASSISTANT_REASONING: &str = "ai.think";
    pub const TOOL_CODE: &str = "tool.code";
    pub const TOOL_STDOUT: &str = "tool.out";
    pub const TOOL_ERROR: &str = "tool.err";
    pub const TURN_END: &str = "turn.end";
    pub const SYSTEM_ERROR: &str = "sys.err";
    pub const HTTP_REQUEST: &str = "ai.http.in";
    pub const HTTP_RESPONSE: &str = "ai.http.out";
    pub const HTTP_ERROR: &str = "ai.http.err";
}

/// Append-only per-session log file. Cloning shares the same file handle.
#[derive(Clone)]
pub struct SessionTrace {
    inner: Arc<TraceInner>,
}

struct TraceInner {
    writer: Mutex<BufWriter<File>>,
    file_path: PathBuf,
    write_failed: AtomicBool,
}

impl SessionTrace {
    pub fn create(session_id: &str) -> Result<Self> {
        let trace_dir = resolve_trace_dir_from_env()?;
        Self::create_in_dir(session_id, &trace_dir)
    }

    fn create_in_dir(session_id: &str, trace_dir: &Path) -> Result<Self> {
        fs::create_dir_all(trace_dir).map_err(|err| {
            anyhow!(
                "Failed to create trace directory {}: {err}",
                trace_dir.display()
            )
        })?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_secs());
        let file_name = format!("session-{session_id}-{timestamp}.log");
        let file_path = trace_dir.join(&file_name);
        let file = create_trace_file(&file_path)
            .map_err(|err| anyhow!("Failed to create trace file {}: {err}", file_path.display()))?;

        Ok(Self {
            inner: Arc::new(TraceInner {
                writer: Mutex::new(BufWriter::new(file)),
                file_path,
                write_failed: AtomicBool::new(false),
            }),
        })
    }

    #[cfg(test)]
    pub fn create_in_temp_dir(session_id: &str, trace_dir: &Path) -> Result<Self> {
        Self::create_in_dir(session_id, trace_dir)
    }

    pub fn file_path(&self) -> &Path {
        &self.inner.file_path
    }

    pub fn log_user_input(&self, text: &str) {
        self.log_lines(kind::USER_INPUT, text);
    }

    pub fn log_output(&self, kind: &str, text: &str) {
        self.log_lines(kind, text);
    }

    pub fn log_http_request(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: &str,
    ) {
        self.log_single(kind::HTTP_REQUEST, &format!("{method} {url}"));
        for (name, value) in headers {
            self.log_single(kind::HTTP_REQUEST, &format!("{name}: {value}"));
        }
        self.log_lines(kind::HTTP_REQUEST, body);
    }

    pub fn log_http_response_head(&self, status: u16, headers: &[(String, String)]) {
        self.log_single(kind::HTTP_RESPONSE, &format!("HTTP {status}"));
        for (name, value) in headers {
            self.log_single(kind::HTTP_RESPONSE, &format!("{name}: {value}"));
        }
    }

    pub fn log_http_stream_event(&self, event: &str, data: &str) {
        self.log_single(kind::HTTP_RESPONSE, &format!("[{event}] {data}"));
    }

    pub fn log_http_response_body(&self, body: &str) {
        self.log_lines(kind::HTTP_RESPONSE, body);
    }

    pub fn log_http_error(&self, message: &str) {
        self.log_single(kind::HTTP_ERROR, message);
    }

    fn log_lines(&self, kind: &str, text: &str) {
        if text.is_empty() {
            self.log_single(kind, "<empty>");
            return;
        }

        for line in text.lines() {
            self.log_single(kind, line);
        }
    }

    fn log_single(&self, kind: &str, text: &str) {
        let timestamp = current_timestamp();
        self.write_raw(&format!("[{timestamp}] [{:<11}] {text}\n", kind));
    }

    fn write_raw(&self, text: &str) {
        let Ok(mut writer) = self.inner.writer.lock() else {
            self.report_write_failure("failed to acquire trace writer lock");
            return;
        };

        if writer.write_all(text.as_bytes()).is_err() || writer.flush().is_err() {
            self.report_write_failure("failed to write to trace file");
        }
    }

    fn report_write_failure(&self, message: &str) {
        if !self.inner.write_failed.swap(true, Ordering::Relaxed) {
            eprintln!("pyclaude trace warning: {message}");
        }
    }
}

#[cfg(unix)]
fn create_trace_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_trace_file(path: &Path) -> std::io::Result<File> {
    File::create(path)
}

fn current_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    )
}

pub fn resolve_trace_dir_from_env() -> Result<PathBuf> {
    let xdg_state = env::var("XDG_STATE_HOME").ok();
    let home = dirs::home_dir();
    resolve_trace_dir(xdg_state.as_deref(), home.as_deref())
}

fn resolve_trace_dir(xdg_state_home: Option<&str>, home_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(xdg) = xdg_state_home {
        let trimmed = xdg.trim();
        if trimmed.is_empty() {
            bail!("Failed to resolve trace path: XDG_STATE_HOME is set but empty");
        }
        return Ok(PathBuf::from(trimmed).join(TRACE_DIR_NAME));
    }

    let home = home_dir
        .ok_or_else(|| anyhow!("Failed to resolve trace path: HOME directory is unavailable"))?;
    Ok(home.join(".local/state").join(TRACE_DIR_NAME))
}
