//! Spawns one training process per device and supervises them.
//!
//! Every rank receives the same run configuration. The first rank to fail
//! takes the rest down with it; nothing is retried.

use crate::artifacts::RunId;
use crate::backend::{self, BackendConfig};
use crate::config::LaunchConfig;
use crate::devices::DeviceProbe;
use crate::error::{LaunchError, LaunchResult};
use crate::layout::OutputLayout;
use crate::procedure::{ProcessSpec, TrainingProcedure};
use crate::progress::{OutputStream, ProgressEvent, ProgressSink};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

pub const RUN_ID_ENV: &str = "EMBER_RUN_ID";

/// Result of the checks that run before anything is spawned.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub available_devices: usize,
    pub effective_batch_size: u64,
    pub backend: Option<(PathBuf, BackendConfig)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankOutcome {
    pub rank: usize,
    pub pid: Option<u32>,
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub success: bool,
    /// Killed by the launcher after another rank failed.
    pub terminated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub run_id: RunId,
    pub ranks: Vec<RankOutcome>,
    pub elapsed: Duration,
    pub interrupted: bool,
    /// The rank whose failure triggered the abort.
    pub failed_rank: Option<usize>,
}

impl LaunchReport {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.interrupted && self.ranks.iter().all(|r| r.success)
    }

    /// The rank that brought the run down, if any.
    ///
    /// Other ranks may also have failed on their own before the abort reached
    /// them; the rank recorded when the abort was triggered wins.
    #[must_use]
    pub fn first_failure(&self) -> Option<&RankOutcome> {
        let failed = self.failed_rank?;
        self.ranks.iter().find(|r| r.rank == failed)
    }

    /// Turn a failed report into the error the operator sees.
    pub fn into_result(self) -> LaunchResult<Self> {
        if self.interrupted {
            return Err(LaunchError::Interrupted);
        }
        if let Some(failed) = self.first_failure() {
            return Err(LaunchError::RankFailed { rank: failed.rank, code: failed.code.unwrap_or(1) });
        }
        Ok(self)
    }
}

pub struct Launcher {
    procedure: Box<dyn TrainingProcedure>,
    probe: Box<dyn DeviceProbe>,
    allow_cpu: bool,
}

impl Launcher {
    #[must_use]
    pub fn new(procedure: impl TrainingProcedure + 'static, probe: impl DeviceProbe + 'static) -> Self {
        Self { procedure: Box::new(procedure), probe: Box::new(probe), allow_cpu: false }
    }

    /// Run on CPU when no accelerator is present: every requested rank is allowed.
    #[must_use]
    pub fn allow_cpu(mut self, allow: bool) -> Self {
        self.allow_cpu = allow;
        self
    }

    #[must_use]
    pub fn procedure_id(&self) -> &str {
        self.procedure.id()
    }

    /// Validate everything that can be checked without spawning.
    pub fn preflight(&self, launch: &LaunchConfig) -> LaunchResult<Preflight> {
        launch.validate()?;

        let probed = self.probe.available_devices();
        let available = if self.allow_cpu && probed == 0 { launch.nproc_per_node } else { probed };
        if launch.nproc_per_node > available {
            return Err(LaunchError::InsufficientDevices { requested: launch.nproc_per_node, available });
        }

        let backend = backend::preflight(launch)?;
        if let Some((ref path, ref cfg)) = backend {
            tracing::info!(path = %path.display(), zero_stage = cfg.zero_stage(), "backend config ok");
        }

        OutputLayout::new(&launch.run.output_dir).ensure_root()?;

        Ok(Preflight { available_devices: available, effective_batch_size: launch.effective_batch_size(), backend })
    }

    /// Spawn every rank and wait for all of them.
    ///
    /// Returns a report even when ranks fail; see [`LaunchReport::into_result`].
    pub async fn launch(&self, launch: &LaunchConfig, sink: Arc<dyn ProgressSink>) -> LaunchResult<LaunchReport> {
        let preflight = self.preflight(launch)?;
        let world_size = launch.nproc_per_node;
        let run_id = RunId::new();
        let started = Instant::now();

        tracing::info!(
            %run_id,
            world_size,
            procedure = self.procedure.id(),
            effective_batch_size = preflight.effective_batch_size,
            "launching"
        );
        sink.on_event(ProgressEvent::Started { run_id: run_id.clone(), world_size });

        let (abort_tx, abort_rx) = watch::channel(false);
        let mut set = JoinSet::new();

        for rank in 0..world_size {
            let spec = self.procedure.process_spec(launch, rank);
            let child = match spawn_rank(&spec, &run_id) {
                Ok(child) => child,
                Err(source) => {
                    let _ = abort_tx.send(true);
                    while set.join_next().await.is_some() {}
                    return Err(LaunchError::Spawn { rank, source });
                }
            };
            let pid = child.id();
            tracing::debug!(rank, ?pid, program = %spec.program.display(), "rank spawned");
            sink.on_event(ProgressEvent::RankSpawned { rank, pid });
            set.spawn(supervise_rank(rank, child, abort_rx.clone(), Arc::clone(&sink)));
        }

        let mut outcomes = Vec::with_capacity(world_size);
        let mut failed_rank = None;
        let mut interrupted = false;

        loop {
            tokio::select! {
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    let outcome = joined.map_err(|e| LaunchError::Other(anyhow::anyhow!("rank task panicked: {e}")))?;
                    sink.on_event(ProgressEvent::RankExited {
                        rank: outcome.rank,
                        code: outcome.code,
                        success: outcome.success,
                    });
                    if !outcome.success && !outcome.terminated && failed_rank.is_none() {
                        failed_rank = Some(outcome.rank);
                        tracing::error!(rank = outcome.rank, code = ?outcome.code, "rank failed; aborting run");
                        sink.on_event(ProgressEvent::Aborting { failed_rank: outcome.rank });
                        let _ = abort_tx.send(true);
                    }
                    outcomes.push(outcome);
                }
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    tracing::warn!("interrupted; terminating all ranks");
                    let _ = abort_tx.send(true);
                }
            }
        }

        outcomes.sort_by_key(|o| o.rank);
        let report = LaunchReport {
            run_id: run_id.clone(),
            ranks: outcomes,
            elapsed: started.elapsed(),
            interrupted,
            failed_rank,
        };
        sink.on_event(ProgressEvent::Finished { run_id, success: report.success() });
        tracing::info!(success = report.success(), elapsed_ms = report.elapsed.as_millis() as u64, "launch finished");
        Ok(report)
    }
}

fn spawn_rank(spec: &ProcessSpec, run_id: &RunId) -> std::io::Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env(RUN_ID_ENV, &run_id.0)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn()
}

fn forward_lines<R>(rank: usize, stream: OutputStream, reader: Option<R>, sink: Arc<dyn ProgressSink>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reader = reader?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.on_event(ProgressEvent::Output { rank, stream, line }),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(rank, "failed to read rank output: {e}");
                    break;
                }
            }
        }
    }))
}

async fn abort_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn supervise_rank(
    rank: usize,
    mut child: Child,
    mut abort: watch::Receiver<bool>,
    sink: Arc<dyn ProgressSink>,
) -> RankOutcome {
    let pid = child.id();
    let readers = [
        forward_lines(rank, OutputStream::Stdout, child.stdout.take(), Arc::clone(&sink)),
        forward_lines(rank, OutputStream::Stderr, child.stderr.take(), Arc::clone(&sink)),
    ];

    let (status, terminated) = tokio::select! {
        status = child.wait() => (status, false),
        () = abort_requested(&mut abort) => {
            if let Err(e) = child.kill().await {
                tracing::warn!(rank, "failed to kill rank: {e}");
            }
            (child.wait().await, true)
        }
    };

    for reader in readers.into_iter().flatten() {
        let _ = reader.await;
    }

    match status {
        Ok(status) => RankOutcome { rank, pid, code: status.code(), success: status.success(), terminated },
        Err(e) => {
            tracing::error!(rank, "failed to wait for rank: {e}");
            RankOutcome { rank, pid, code: None, success: false, terminated }
        }
    }
}
