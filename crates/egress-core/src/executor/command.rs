use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{PipelineContext, PipelineExecutor};
use crate::error::PipelineFailure;

/// Upper bound on reading reports still buffered after the process exits.
const EXIT_DRAIN: Duration = Duration::from_secs(1);

/// Runs an external pipeline program per job.
///
/// Protocol: the start request is written to stdin as one JSON line; stdout
/// lines `active` and `ending` are reported; `stop` is written to stdin on a
/// cooperative stop; exit status 0 means success, otherwise the last stderr
/// line becomes the failure detail.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `None` when `command` is empty.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait::async_trait]
impl PipelineExecutor for CommandExecutor {
    async fn run(&self, ctx: PipelineContext) -> Result<(), PipelineFailure> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("EGRESS_ID", ctx.egress_id())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(
            egress_id = %ctx.egress_id(),
            program = %self.program,
            pid = ?child.id(),
            "pipeline process spawned"
        );

        let mut stdin = child.stdin.take();
        if let Some(w) = stdin.as_mut() {
            let mut body = serde_json::to_vec(ctx.request())
                .map_err(|e| PipelineFailure::new(format!("encode request: {e}")))?;
            body.push(b'\n');
            w.write_all(&body).await?;
            w.flush().await?;
        }

        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                let mut last: Option<String> = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        last = Some(line);
                    }
                }
                last
            })
        });
        let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        let mut stop_sent = false;

        loop {
            tokio::select! {
                line = async {
                    match stdout.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match line {
                        Ok(Some(line)) => dispatch(&ctx, &line),
                        Ok(None) | Err(_) => stdout = None,
                    }
                }
                _ = ctx.stop_requested(), if !stop_sent => {
                    stop_sent = true;
                    if let Some(w) = stdin.as_mut() {
                        if let Err(err) = w.write_all(b"stop\n").await {
                            warn!(
                                egress_id = %ctx.egress_id(),
                                %err,
                                "failed to signal pipeline stop"
                            );
                        }
                        let _ = w.flush().await;
                    }
                }
                _ = ctx.killed() => {
                    let _ = child.kill().await;
                    return Err(PipelineFailure::new("pipeline killed"));
                }
                status = child.wait() => {
                    let status = status?;
                    if let Some(lines) = stdout.take() {
                        drain_reports(&ctx, lines).await;
                    }
                    let last_err = match stderr_task {
                        Some(task) => task.await.ok().flatten(),
                        None => None,
                    };
                    return if status.success() {
                        Ok(())
                    } else {
                        Err(PipelineFailure::new(
                            last_err.unwrap_or_else(|| format!("pipeline exited with {status}")),
                        ))
                    };
                }
            }
        }
    }
}

fn dispatch(ctx: &PipelineContext, line: &str) {
    match line.trim() {
        "active" => ctx.report_active(),
        "ending" => ctx.report_ending(),
        other => debug!(egress_id = %ctx.egress_id(), line = other, "pipeline output"),
    }
}

/// Report whatever the exited process left in its stdout pipe.
async fn drain_reports(ctx: &PipelineContext, mut lines: Lines<BufReader<ChildStdout>>) {
    let drained = tokio::time::timeout(EXIT_DRAIN, async {
        while let Ok(Some(line)) = lines.next_line().await {
            dispatch(ctx, &line);
        }
    })
    .await;
    if drained.is_err() {
        warn!(egress_id = %ctx.egress_id(), "pipeline stdout still open after exit");
    }
}
