//! The two interchangeable ways to ask nginx to test
//! and reload its configuration. `tokio::process::Command` is used instead
//! of the blocking `std::process::Command` so a reload never stalls the
//! async runtime it shares with every other worker.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{NginxConfig, NginxMode};
use crate::error::{EngineError, Result};

pub struct OpOutcome {
    pub ok: bool,
    pub output: String,
}

pub struct StatusOutcome {
    pub running: bool,
    pub version: Option<String>,
}

pub enum NginxOps {
    Direct(DirectOps),
    SignalFile(SignalFileOps),
}

impl NginxOps {
    pub fn new(cfg: &NginxConfig) -> Result<Self> {
        match cfg.mode {
            NginxMode::Direct => Ok(NginxOps::Direct(DirectOps {
                binary_path: cfg.binary_path.clone(),
                test_timeout: Duration::from_secs(cfg.test_timeout_seconds),
                reload_timeout: Duration::from_secs(cfg.reload_timeout_seconds),
            })),
            NginxMode::SignalFile => {
                let dir = cfg.signal_dir.clone().ok_or_else(|| {
                    EngineError::Internal("signal_dir required for signal_file mode".into())
                })?;
                Ok(NginxOps::SignalFile(SignalFileOps {
                    dir: PathBuf::from(dir),
                    poll_interval: Duration::from_millis(cfg.poll_interval_ms),
                    timeout: Duration::from_secs(cfg.test_timeout_seconds.max(cfg.reload_timeout_seconds)),
                }))
            }
        }
    }

    pub async fn test(&self) -> Result<OpOutcome> {
        match self {
            NginxOps::Direct(d) => d.test().await,
            NginxOps::SignalFile(s) => s.signal("test", ".nginx-test-result").await,
        }
    }

    pub async fn reload(&self) -> Result<OpOutcome> {
        match self {
            NginxOps::Direct(d) => d.reload().await,
            NginxOps::SignalFile(s) => s.signal("reload", ".nginx-reload-result").await,
        }
    }

    pub async fn status(&self) -> Result<StatusOutcome> {
        match self {
            NginxOps::Direct(d) => d.status().await,
            NginxOps::SignalFile(_) => Ok(StatusOutcome {
                running: true,
                version: None,
            }),
        }
    }

    /// Chains `test()` then `reload()`, reporting which step failed.
    pub async fn safe_reload(&self) -> Result<OpOutcome> {
        let test_outcome = self.test().await?;
        if !test_outcome.ok {
            return Err(EngineError::NginxTestFailed(test_outcome.output));
        }
        self.reload().await
    }
}

pub struct DirectOps {
    binary_path: String,
    test_timeout: Duration,
    reload_timeout: Duration,
}

impl DirectOps {
    async fn run(&self, args: &[&str], deadline: Duration) -> Result<OpOutcome> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(args);
        let output = timeout(deadline, cmd.output())
            .await
            .map_err(|_| EngineError::TransientFailure(format!("{} timed out", args.join(" "))))?
            .map_err(|e| EngineError::ExternalFailure(format!("failed to spawn nginx: {e}")))?;
        let ok = output.status.success();
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(OpOutcome { ok, output: combined })
    }

    async fn test(&self) -> Result<OpOutcome> {
        self.run(&["-t"], self.test_timeout).await
    }

    async fn reload(&self) -> Result<OpOutcome> {
        self.run(&["-s", "reload"], self.reload_timeout).await
    }

    async fn status(&self) -> Result<StatusOutcome> {
        let output = self.run(&["-v"], self.test_timeout).await?;
        Ok(StatusOutcome {
            running: output.ok,
            version: output.ok.then(|| output.output.trim().to_string()),
        })
    }
}

pub struct SignalFileOps {
    dir: PathBuf,
    poll_interval: Duration,
    timeout: Duration,
}

impl SignalFileOps {
    /// Writes `<data>/.nginx-reload-signal` atomically, then polls for
    /// `<data>/.nginx-test-result`/`.nginx-reload-result` at the configured
    /// cadence. Returns the last 10 lines of the result file as output.
    async fn signal(&self, command: &str, result_filename: &str) -> Result<OpOutcome> {
        let signal_path = self.dir.join(".nginx-reload-signal");
        let tmp_path = self.dir.join(format!(".nginx-reload-signal.tmp.{}", std::process::id()));
        {
            let mut f = tokio::fs::File::create(&tmp_path).await?;
            f.write_all(command.as_bytes()).await?;
            f.flush().await?;
        }
        tokio::fs::rename(&tmp_path, &signal_path).await?;

        let result_path = self.dir.join(result_filename);
        let _ = tokio::fs::remove_file(&result_path).await;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::TransientFailure(format!(
                    "timed out waiting for {result_filename}"
                )));
            }
            if let Ok(contents) = tokio::fs::read_to_string(&result_path).await {
                let tail: String = contents
                    .lines()
                    .rev()
                    .take(10)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join("\n");
                let ok = contents.lines().next().map(str::trim) == Some("OK");
                return Ok(OpOutcome { ok, output: tail });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_file_mode_times_out_when_no_watcher_responds() {
        let dir = tempfile::tempdir().unwrap();
        let ops = SignalFileOps {
            dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
        };
        let result = ops.signal("test", ".nginx-test-result").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn signal_file_mode_reads_ok_result() {
        let dir = tempfile::tempdir().unwrap();
        let result_path = dir.path().join(".nginx-test-result");
        let watcher_dir = dir.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::fs::write(watcher_dir.join(".nginx-test-result"), "OK\nsyntax is ok\n")
                .await
                .unwrap();
        });
        let ops = SignalFileOps {
            dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(500),
        };
        let outcome = ops.signal("test", ".nginx-test-result").await.unwrap();
        assert!(outcome.ok);
        let _ = result_path;
    }
}
