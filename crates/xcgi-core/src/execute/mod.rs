//! Script execution.
//!
//! Each request runs one shell script as the leader of a fresh process
//! group, under a shared concurrency ceiling. Standard output becomes the
//! response body, standard error goes to the log, and the exit code picks
//! the HTTP status.

mod admission;
mod group;

pub use admission::{Admission, AdmissionPermit};
pub use group::{GroupGuard, ProcessGroups, kill_group};

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::env::Environment;
use crate::error::{Error, Result};

/// HTTP status selected by each script exit code, indexed by the code.
pub const SCRIPT_STATUS_CODES: [u16; 9] = [200, 400, 404, 201, 204, 304, 403, 409, 401];

/// Status used when a script exits with a code outside the table.
pub const INVALID_EXIT_STATUS: u16 = 500;

pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Concurrent scripts allowed per CPU when no ceiling is configured.
const INSTANCES_PER_CPU: usize = 16;

/// Default concurrency ceiling: CPU count times 16.
pub fn default_max_instances() -> usize {
    std::thread::available_parallelism().map_or(1, usize::from) * INSTANCES_PER_CPU
}

/// Map a script exit code to an HTTP status.
///
/// Returns `None` for codes no process can report normally (negative or
/// 256 and up). Codes past the table map to 500.
pub fn status_for_exit_code(code: i32) -> Option<u16> {
    if !(0..256).contains(&code) {
        return None;
    }
    let status = SCRIPT_STATUS_CODES
        .get(code as usize)
        .copied()
        .unwrap_or(INVALID_EXIT_STATUS);
    Some(status)
}

/// Content type implied by the first byte of a script's output.
pub fn infer_content_type(body: &[u8]) -> Option<&'static str> {
    body.first().map(|byte| match byte {
        b'{' | b'[' => CONTENT_TYPE_JSON,
        b'<' => CONTENT_TYPE_HTML,
        _ => CONTENT_TYPE_TEXT,
    })
}

/// One script invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Working directory of the process.
    pub work_dir: PathBuf,
    /// Script file, relative to `work_dir`.
    pub script: String,
    pub env: Environment,
}

impl ExecutionRequest {
    pub fn script_path(&self) -> PathBuf {
        self.work_dir.join(&self.script)
    }
}

/// Buffered result of a script that exited normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub status: u16,
    /// `None` when the script printed nothing.
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl ScriptOutput {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Runs scripts through a shell under the admission ceiling.
#[derive(Debug, Clone)]
pub struct Executor {
    shell: PathBuf,
    admission: Admission,
    groups: ProcessGroups,
}

impl Executor {
    /// Create an executor running scripts with `shell`, at most
    /// `max_instances` at a time.
    pub fn new(shell: impl Into<PathBuf>, max_instances: usize) -> Self {
        Self {
            shell: shell.into(),
            admission: Admission::new(max_instances),
            groups: ProcessGroups::new(),
        }
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Process groups of scripts still running, for shutdown cleanup.
    pub fn groups(&self) -> &ProcessGroups {
        &self.groups
    }

    /// Run a script to completion and buffer its output.
    ///
    /// Dropping the returned future before it resolves kills the script's
    /// whole process group.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ScriptOutput> {
        let _permit = self.admission.acquire().await;
        let script_path = request.script_path();

        let mut command = Command::new(&self.shell);
        command
            .arg(&request.script)
            .current_dir(&request.work_dir)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            path: script_path.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(Error::AbnormalExit {
                script: script_path,
                detail: "exited before it could be tracked".to_string(),
            });
        };
        let mut group = self.groups.track(pid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_stdout = async {
            let mut body = Vec::new();
            if let Some(mut stdout) = stdout {
                stdout.read_to_end(&mut body).await?;
            }
            Ok::<_, std::io::Error>(body)
        };
        let log_stderr = async {
            if let Some(stderr) = stderr {
                log_stderr_lines(&script_path, BufReader::new(stderr)).await;
            }
        };

        // Output ending and the process exiting are separate events; the
        // response is only complete once both have happened.
        let (body, (), status) = tokio::join!(read_stdout, log_stderr, child.wait());
        let status = status?;
        group.exited();
        let body = body?;

        let status = map_exit_status(&script_path, status)?;
        Ok(ScriptOutput {
            status,
            content_type: infer_content_type(&body),
            body,
        })
    }
}

/// Log every line a script writes to stderr.
///
/// The pipe is read to EOF whatever it carries: closing it early would kill
/// the script with SIGPIPE on its next write.
async fn log_stderr_lines<R>(script: &Path, mut reader: BufReader<R>)
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::warn!(
                    script = %script.display(),
                    "stderr: {}",
                    text.trim_end_matches(['\n', '\r'])
                );
            }
            Err(e) => {
                tracing::debug!(script = %script.display(), "stderr unreadable, discarding: {}", e);
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }
}

fn map_exit_status(script: &Path, status: ExitStatus) -> Result<u16> {
    let Some(code) = status.code() else {
        return Err(Error::AbnormalExit {
            script: script.to_path_buf(),
            detail: status.to_string(),
        });
    };
    match status_for_exit_code(code) {
        Some(INVALID_EXIT_STATUS) => {
            tracing::warn!(
                script = %script.display(),
                "invalid script exit code {}, answering 500",
                code
            );
            Ok(INVALID_EXIT_STATUS)
        }
        Some(http_status) => Ok(http_status),
        None => Err(Error::AbnormalExit {
            script: script.to_path_buf(),
            detail: format!("exit code {code} out of range"),
        }),
    }
}
