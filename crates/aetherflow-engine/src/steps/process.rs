//! `external.process`: run an external OS-level process.
//!
//! The ops-grade bridge to batch engines and vendor tooling. Per attempt
//! the state machine is: spawn, wait (with terminate-then-kill timeout
//! escalation), exit-code check, atomic-dir promotion, success validation.
//! Retries cover configured exit codes and (optionally) timeouts, with
//! multiplicative backoff. Relative paths resolve against the job
//! artifacts directory.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use aetherflow_types::error::{FlowError, Result};
use aetherflow_types::flow::ConfigMap;

use crate::steps::{
    i64_list, input_bool, input_f64, input_str, input_u64, resolve_path, str_list, Step, StepExec,
    StepInit, StepOutcome,
};

const DEFAULT_KILL_GRACE_SECONDS: u64 = 15;
const DEFAULT_MAX_CAPTURE_KB: u64 = 1024;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    Inherit,
    Capture,
    File,
    Discard,
}

impl StreamMode {
    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inherit" => Ok(Self::Inherit),
            "capture" => Ok(Self::Capture),
            "file" => Ok(Self::File),
            "discard" => Ok(Self::Discard),
            other => Err(FlowError::Step(format!("Unknown log mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
struct LogSpec {
    stdout: StreamMode,
    stderr: StreamMode,
    file_path: Option<String>,
    max_capture_bytes: usize,
}

#[derive(Debug, Clone)]
enum IdempotencySpec {
    None,
    Marker { marker_path: Option<String> },
    AtomicDir { temp_dir: String, final_dir: String },
}

#[derive(Debug, Clone)]
struct SuccessSpec {
    exit_codes: Vec<i64>,
    marker_file: Option<String>,
    required_files: Vec<String>,
    required_globs: Vec<String>,
    forbidden_files: Vec<String>,
}

#[derive(Debug, Clone)]
struct RetrySpec {
    max_attempts: u32,
    backoff_seconds: f64,
    backoff_multiplier: f64,
    max_backoff_seconds: f64,
    retry_on_exit_codes: Vec<i64>,
    retry_on_timeout: bool,
}

pub struct ExternalProcess {
    id: String,
    command: Vec<String>,
    shell: bool,
    cwd: Option<String>,
    timeout: Option<Duration>,
    kill_grace: Duration,
    inherit_env: bool,
    extra_env: BTreeMap<String, String>,
    log: LogSpec,
    idempotency: IdempotencySpec,
    success: SuccessSpec,
    retry: RetrySpec,
    literal_outputs: ConfigMap,
}

fn sub_object<'a>(inputs: &'a ConfigMap, key: &str) -> Result<Option<&'a ConfigMap>> {
    match inputs.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(FlowError::Step(format!(
            "external.process inputs.{key} must be a mapping, got {other}"
        ))),
    }
}

impl ExternalProcess {
    /// Parse `external.process` inputs.
    ///
    /// # Errors
    ///
    /// Fails on a missing/mistyped `command` or inconsistent log and
    /// idempotency configuration.
    pub fn from_init(init: StepInit) -> Result<Self> {
        let inputs = &init.inputs;

        let mut command = match inputs.get("command") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(list @ Value::Array(_)) => str_list(Some(list))?,
            _ => {
                return Err(FlowError::Step(format!(
                    "external.process step '{}' inputs.command must be a string or list",
                    init.id
                )))
            }
        };
        if let Some(args) = inputs.get("args") {
            if !matches!(args, Value::Array(_)) {
                return Err(FlowError::Step(
                    "external.process inputs.args must be a list".to_string(),
                ));
            }
            command.extend(str_list(Some(args))?);
        }

        let log_cfg = sub_object(inputs, "log")?;
        let log = {
            let stdout = log_cfg
                .and_then(|m| input_str(m, "stdout"))
                .map_or(Ok(StreamMode::Inherit), |s| StreamMode::parse(&s))?;
            let stderr = log_cfg
                .and_then(|m| input_str(m, "stderr"))
                .map_or(Ok(StreamMode::Inherit), |s| StreamMode::parse(&s))?;
            let file_path = log_cfg.and_then(|m| input_str(m, "file_path"));
            if (stdout == StreamMode::File || stderr == StreamMode::File) && file_path.is_none() {
                return Err(FlowError::Step(
                    "log.file_path is required when stdout/stderr mode is 'file'".to_string(),
                ));
            }
            let max_kb = log_cfg
                .and_then(|m| input_u64(m, "max_capture_kb"))
                .unwrap_or(DEFAULT_MAX_CAPTURE_KB);
            LogSpec {
                stdout,
                stderr,
                file_path,
                max_capture_bytes: usize::try_from(max_kb.saturating_mul(1024))
                    .unwrap_or(usize::MAX),
            }
        };

        let success_cfg = sub_object(inputs, "success")?;
        let success = {
            let mut exit_codes =
                i64_list(success_cfg.and_then(|m| m.get("exit_codes")))?;
            if exit_codes.is_empty() {
                exit_codes.push(0);
            }
            SuccessSpec {
                exit_codes,
                marker_file: success_cfg.and_then(|m| input_str(m, "marker_file")),
                required_files: str_list(success_cfg.and_then(|m| m.get("required_files")))?,
                required_globs: str_list(success_cfg.and_then(|m| m.get("required_globs")))?,
                forbidden_files: str_list(success_cfg.and_then(|m| m.get("forbidden_files")))?,
            }
        };

        let idem_cfg = sub_object(inputs, "idempotency")?;
        let strategy = idem_cfg
            .and_then(|m| input_str(m, "strategy"))
            .unwrap_or_else(|| "none".to_string());
        let idempotency = match strategy.trim().to_ascii_lowercase().as_str() {
            "none" => IdempotencySpec::None,
            "marker" => IdempotencySpec::Marker {
                marker_path: idem_cfg.and_then(|m| input_str(m, "marker_path")),
            },
            "atomic_dir" => {
                let temp_dir = idem_cfg.and_then(|m| input_str(m, "temp_output_dir"));
                let final_dir = idem_cfg.and_then(|m| input_str(m, "final_output_dir"));
                match (temp_dir, final_dir) {
                    (Some(temp_dir), Some(final_dir)) => IdempotencySpec::AtomicDir {
                        temp_dir,
                        final_dir,
                    },
                    _ => {
                        return Err(FlowError::Step(
                            "atomic_dir requires temp_output_dir and final_output_dir".to_string(),
                        ))
                    }
                }
            }
            other => {
                return Err(FlowError::Step(format!(
                    "Unknown idempotency strategy: {other}"
                )))
            }
        };

        let retry_cfg = sub_object(inputs, "retry")?;
        let retry = {
            let backoff = retry_cfg
                .and_then(|m| input_f64(m, "sleep_seconds").or_else(|| input_f64(m, "backoff_seconds")))
                .unwrap_or(0.0);
            RetrySpec {
                max_attempts: retry_cfg
                    .and_then(|m| input_u64(m, "max_attempts"))
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(1)
                    .max(1),
                backoff_seconds: backoff,
                backoff_multiplier: retry_cfg
                    .and_then(|m| input_f64(m, "backoff_multiplier"))
                    .unwrap_or(1.0),
                max_backoff_seconds: retry_cfg
                    .and_then(|m| input_f64(m, "max_backoff_seconds"))
                    .unwrap_or(0.0),
                retry_on_exit_codes: i64_list(retry_cfg.and_then(|m| m.get("retry_on_exit_codes")))?,
                retry_on_timeout: retry_cfg.is_some_and(|m| input_bool(m, "retry_on_timeout", false)),
            }
        };

        let extra_env = match sub_object(inputs, "env")? {
            Some(map) => map
                .iter()
                .map(|(k, v)| {
                    let text = match v {
                        Value::Null => String::new(),
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), text)
                })
                .collect(),
            None => BTreeMap::new(),
        };

        let literal_outputs = sub_object(inputs, "outputs")?.cloned().unwrap_or_default();

        Ok(Self {
            id: init.id,
            command,
            shell: input_bool(inputs, "shell", false),
            cwd: input_str(inputs, "cwd"),
            timeout: input_f64(inputs, "timeout_seconds").map(Duration::from_secs_f64),
            kill_grace: Duration::from_secs(
                input_u64(inputs, "kill_grace_seconds").unwrap_or(DEFAULT_KILL_GRACE_SECONDS),
            ),
            inherit_env: input_bool(inputs, "inherit_env", true),
            extra_env,
            log,
            idempotency,
            success,
            retry,
            literal_outputs,
        })
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Byte-bounded capture buffer shared with a pump thread.
struct CaptureBuf {
    buf: Vec<u8>,
    max_bytes: usize,
}

impl CaptureBuf {
    fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes,
        }
    }

    fn add(&mut self, data: &[u8]) {
        if self.buf.len() >= self.max_bytes {
            return;
        }
        let remain = self.max_bytes - self.buf.len();
        self.buf.extend_from_slice(&data[..data.len().min(remain)]);
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

fn spawn_pump<R>(
    reader: R,
    cap: Arc<Mutex<CaptureBuf>>,
    stream: &'static str,
    step_id: String,
) -> std::thread::JoinHandle<()>
where
    R: std::io::Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if let Ok(mut cap) = cap.lock() {
                        cap.add(&line);
                    }
                    let msg = String::from_utf8_lossy(&line);
                    let msg = msg.trim_end_matches('\n');
                    if !msg.is_empty() {
                        match stream {
                            "stderr" => {
                                tracing::warn!(step_id = %step_id, "external_process_stderr: {msg}");
                            }
                            _ => {
                                tracing::info!(step_id = %step_id, "external_process_stdout: {msg}");
                            }
                        }
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

fn poll_until_exit(child: &mut Child, deadline: Option<Instant>) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| FlowError::Step(format!("wait failed: {e}")))?
        {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    // SAFETY: plain kill(2) on a pid we own; failure is harmless (the
    // child may already have exited).
    unsafe {
        libc::kill(child.id() as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &Child) {
    let _ = child;
}

/// Graceful-terminate, wait out the grace period, then force-kill.
fn escalate_kill(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    send_terminate(child);
    if let Some(status) = poll_until_exit(child, Some(Instant::now() + grace))? {
        return Ok(status);
    }
    let _ = child.kill();
    child
        .wait()
        .map_err(|e| FlowError::Step(format!("wait after kill failed: {e}")))
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Filename-level wildcard match (`*`, `?`).
fn wildcard_match(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            wildcard_match(&pattern[1..], name)
                || (!name.is_empty() && wildcard_match(pattern, &name[1..]))
        }
        (Some(b'?'), Some(_)) => wildcard_match(&pattern[1..], &name[1..]),
        (Some(p), Some(c)) if p == c => wildcard_match(&pattern[1..], &name[1..]),
        _ => false,
    }
}

fn glob_has_match(resolved: &Path) -> bool {
    let Some(parent) = resolved.parent() else {
        return false;
    };
    let Some(pattern) = resolved.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Ok(entries) = std::fs::read_dir(parent) else {
        return false;
    };
    entries.filter_map(std::result::Result::ok).any(|entry| {
        entry
            .file_name()
            .to_str()
            .is_some_and(|name| wildcard_match(pattern.as_bytes(), name.as_bytes()))
    })
}

fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

/// Move the temp directory into place. `rename` is atomic on one mount;
/// cross-device moves degrade to staged copy + remove.
fn promote_atomic_dir(temp: &Path, final_dir: &Path) -> Result<()> {
    if final_dir.exists() {
        std::fs::remove_dir_all(final_dir)?;
    }
    if std::fs::rename(temp, final_dir).is_ok() {
        return Ok(());
    }
    std::fs::create_dir_all(final_dir)?;
    for entry in std::fs::read_dir(temp)? {
        let entry = entry?;
        let target = final_dir.join(entry.file_name());
        if std::fs::rename(entry.path(), &target).is_err() {
            copy_recursive(&entry.path(), &target)?;
        }
    }
    std::fs::remove_dir_all(temp)?;
    Ok(())
}

/// Evaluate success rules. The first violated rule names the failure.
fn check_success(exec: &StepExec<'_>, spec: &SuccessSpec) -> Result<()> {
    let mut required = spec.required_files.clone();
    if let Some(marker) = &spec.marker_file {
        required.push(marker.clone());
    }
    for path in &required {
        if !resolve_path(exec, path)?.exists() {
            return Err(FlowError::OutputsInvalid(format!(
                "missing_required_file:{path}"
            )));
        }
    }
    for pattern in &spec.required_globs {
        if !glob_has_match(&resolve_path(exec, pattern)?) {
            return Err(FlowError::OutputsInvalid(format!(
                "missing_required_glob:{pattern}"
            )));
        }
    }
    for path in &spec.forbidden_files {
        if resolve_path(exec, path)?.exists() {
            return Err(FlowError::OutputsInvalid(format!(
                "forbidden_file_present:{path}"
            )));
        }
    }
    Ok(())
}

struct AttemptResult {
    timed_out: bool,
    exit_code: i64,
    stdout: Option<String>,
    stderr: Option<String>,
}

impl ExternalProcess {
    fn build_env(&self, exec: &StepExec<'_>, output_dir: Option<&Path>) -> BTreeMap<String, String> {
        let mut env = if self.inherit_env {
            exec.ctx.env.clone()
        } else {
            BTreeMap::new()
        };
        env.entry("AETHERFLOW_FLOW_ID".to_string())
            .or_insert_with(|| exec.ctx.flow_id.clone());
        env.entry("AETHERFLOW_RUN_ID".to_string())
            .or_insert_with(|| exec.ctx.run_id.clone());
        for (k, v) in &self.extra_env {
            env.insert(k.clone(), v.clone());
        }
        if let Some(dir) = output_dir {
            env.entry("AETHERFLOW_OUTPUT_DIR".to_string())
                .or_insert_with(|| dir.to_string_lossy().into_owned());
        }
        env
    }

    fn stdio_for(&self, mode: StreamMode, log_file: Option<&std::fs::File>) -> Result<Stdio> {
        match mode {
            StreamMode::Inherit => Ok(Stdio::inherit()),
            StreamMode::Capture => Ok(Stdio::piped()),
            StreamMode::Discard => Ok(Stdio::null()),
            StreamMode::File => {
                let file = log_file.ok_or_else(|| {
                    FlowError::Step("log.file_path is required for file mode".to_string())
                })?;
                let clone = file
                    .try_clone()
                    .map_err(|e| FlowError::Step(format!("log file clone failed: {e}")))?;
                Ok(Stdio::from(clone))
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_attempt(
        &self,
        exec: &StepExec<'_>,
        attempt: u32,
        output_dir: Option<&Path>,
        log_file_path: Option<&Path>,
    ) -> Result<AttemptResult> {
        let mut command = if self.shell {
            let joined = self
                .command
                .iter()
                .map(|s| shell_quote(s))
                .collect::<Vec<_>>()
                .join(" ");
            let mut c = Command::new("sh");
            c.arg("-c").arg(joined);
            c
        } else {
            let mut c = Command::new(&self.command[0]);
            c.args(&self.command[1..]);
            c
        };

        if let Some(cwd) = &self.cwd {
            command.current_dir(resolve_path(exec, cwd)?);
        }

        command.env_clear();
        command.envs(self.build_env(exec, output_dir));

        let log_file = match log_file_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Some(
                    std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?,
                )
            }
            None => None,
        };

        command.stdin(Stdio::null());
        command.stdout(self.stdio_for(self.log.stdout, log_file.as_ref())?);
        command.stderr(self.stdio_for(self.log.stderr, log_file.as_ref())?);

        tracing::info!(
            step_id = %self.id,
            attempt,
            command = ?self.command,
            "external_process_start"
        );

        let mut child = command.spawn().map_err(|e| {
            FlowError::Step(format!("failed to spawn {:?}: {e}", self.command))
        })?;

        let out_cap = Arc::new(Mutex::new(CaptureBuf::new(self.log.max_capture_bytes)));
        let err_cap = Arc::new(Mutex::new(CaptureBuf::new(self.log.max_capture_bytes)));
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(
                stdout,
                Arc::clone(&out_cap),
                "stdout",
                self.id.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(
                stderr,
                Arc::clone(&err_cap),
                "stderr",
                self.id.clone(),
            ));
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let (status, timed_out) = match poll_until_exit(&mut child, deadline)? {
            Some(status) => (status, false),
            None => (escalate_kill(&mut child, self.kill_grace)?, true),
        };

        for pump in pumps {
            let _ = pump.join();
        }

        let exit_code = i64::from(status.code().unwrap_or(-1));
        let stdout = (self.log.stdout == StreamMode::Capture)
            .then(|| out_cap.lock().map(|c| c.text()).unwrap_or_default());
        let stderr = (self.log.stderr == StreamMode::Capture)
            .then(|| err_cap.lock().map(|c| c.text()).unwrap_or_default());

        Ok(AttemptResult {
            timed_out,
            exit_code,
            stdout,
            stderr,
        })
    }
}

impl Step for ExternalProcess {
    #[allow(clippy::too_many_lines)]
    fn run(&self, exec: &StepExec<'_>) -> Result<StepOutcome> {
        // Marker idempotency: skip without spawning when the marker exists
        // and the success rules already hold.
        if let IdempotencySpec::Marker { marker_path } = &self.idempotency {
            let marker = marker_path
                .clone()
                .or_else(|| self.success.marker_file.clone());
            if let Some(marker) = marker {
                let resolved = resolve_path(exec, &marker)?;
                if resolved.exists() && check_success(exec, &self.success).is_ok() {
                    tracing::info!(step_id = %self.id, marker = %resolved.display(), "marker present, skipping");
                    let mut outputs = ConfigMap::new();
                    outputs.insert("skipped".to_string(), Value::Bool(true));
                    outputs.insert(
                        "marker".to_string(),
                        Value::String(resolved.to_string_lossy().into_owned()),
                    );
                    return Ok(StepOutcome::skipped(outputs, Some("marker_present")));
                }
            }
        }

        // Atomic-dir idempotency: clear the temp directory and expose it to
        // the child.
        let mut atomic_dirs: Option<(PathBuf, PathBuf)> = None;
        if let IdempotencySpec::AtomicDir {
            temp_dir,
            final_dir,
        } = &self.idempotency
        {
            let temp = resolve_path(exec, temp_dir)?;
            if temp.exists() {
                std::fs::remove_dir_all(&temp)?;
            }
            std::fs::create_dir_all(&temp)?;
            atomic_dirs = Some((temp, resolve_path(exec, final_dir)?));
        }

        let log_file_path = match &self.log.file_path {
            Some(path) => Some(resolve_path(exec, path)?),
            None => None,
        };

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 && self.retry.backoff_seconds > 0.0 {
                let mut sleep_s = self.retry.backoff_seconds
                    * self
                        .retry
                        .backoff_multiplier
                        .powi(i32::try_from(attempt).unwrap_or(2) - 2);
                if self.retry.max_backoff_seconds > 0.0 && sleep_s > self.retry.max_backoff_seconds
                {
                    sleep_s = self.retry.max_backoff_seconds;
                }
                std::thread::sleep(Duration::from_secs_f64(sleep_s));
            }

            let result = self.run_attempt(
                exec,
                attempt,
                atomic_dirs.as_ref().map(|(temp, _)| temp.as_path()),
                log_file_path.as_deref(),
            )?;

            if result.timed_out {
                tracing::error!(step_id = %self.id, attempt, "external_process_timeout");
                if self.retry.retry_on_timeout && attempt < self.retry.max_attempts {
                    continue;
                }
                let secs = self.timeout.map_or(0.0, |t| t.as_secs_f64());
                return Err(FlowError::Timeout(format!(
                    "external.process timed out after {secs}s (attempts={attempt})"
                )));
            }

            if !self.success.exit_codes.contains(&result.exit_code) {
                tracing::error!(
                    step_id = %self.id,
                    attempt,
                    exit_code = result.exit_code,
                    "external_process_exit"
                );
                if self.retry.retry_on_exit_codes.contains(&result.exit_code)
                    && attempt < self.retry.max_attempts
                {
                    continue;
                }
                let tail = result.stderr.unwrap_or_default();
                return Err(FlowError::Step(format!(
                    "external.process failed with exit code {} (attempts={attempt})\n{tail}",
                    result.exit_code
                )));
            }

            if let Some((temp, final_dir)) = &atomic_dirs {
                promote_atomic_dir(temp, final_dir)?;
            }

            check_success(exec, &self.success)?;

            let mut outputs = ConfigMap::new();
            outputs.insert("exit_code".to_string(), Value::from(result.exit_code));
            outputs.insert("attempts".to_string(), Value::from(attempt));
            if let Some(stdout) = result.stdout {
                outputs.insert("stdout".to_string(), Value::String(stdout));
            }
            if let Some(stderr) = result.stderr {
                outputs.insert("stderr".to_string(), Value::String(stderr));
            }
            if let Some(path) = &log_file_path {
                if self.log.stdout == StreamMode::File || self.log.stderr == StreamMode::File {
                    outputs.insert(
                        "log_file".to_string(),
                        Value::String(path.to_string_lossy().into_owned()),
                    );
                }
            }
            for (k, v) in &self.literal_outputs {
                outputs.insert(k.clone(), v.clone());
            }

            tracing::info!(
                step_id = %self.id,
                attempt,
                exit_code = result.exit_code,
                "external_process_success"
            );
            return Ok(StepOutcome::success(outputs));
        }

        Err(FlowError::Step(
            "external.process exhausted retries".to_string(),
        ))
    }
}
