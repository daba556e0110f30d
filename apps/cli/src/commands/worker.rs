//! `worker`: the bundled reference training procedure, one process per rank.

use crate::commands::types::WorkerArgs;
use anyhow::Result;
use ember_training::{ConfigError, LaunchError, WorkerContext, assemble, pairs_from_args, run_worker};
use std::path::PathBuf;

/// Rank that should exit with [`INJECTED_FAILURE_CODE`] right after start.
pub const FAIL_RANK_ENV: &str = "EMBER_WORKER_FAIL_RANK";
pub const INJECTED_FAILURE_CODE: i32 = 3;

fn injected_failure(rank: usize) -> bool {
    std::env::var(FAIL_RANK_ENV).ok().and_then(|raw| raw.trim().parse::<usize>().ok()) == Some(rank)
}

/// Split `--local_rank` off the run flags; the last occurrence wins.
fn split_local_rank(pairs: Vec<(String, String)>) -> Result<(Option<usize>, Vec<(String, String)>), ConfigError> {
    let mut local_rank = None;
    let mut run = Vec::with_capacity(pairs.len());
    for (name, value) in pairs {
        if name == "local_rank" {
            let rank = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("local_rank", &value, "expected a non-negative integer"))?;
            local_rank = Some(rank);
        } else {
            run.push((name, value));
        }
    }
    Ok((local_rank, run))
}

pub async fn execute(args: WorkerArgs, workspace: PathBuf) -> Result<()> {
    let pairs = pairs_from_args(&args.flags).map_err(LaunchError::from)?;
    let (local_rank, pairs) = split_local_rank(pairs).map_err(LaunchError::from)?;
    let config = assemble(pairs, &workspace).map_err(LaunchError::from)?;
    let ctx = WorkerContext::from_env(local_rank)?;

    if injected_failure(ctx.rank) {
        tracing::error!("rank {}/{} failing on request ({})", ctx.rank, ctx.world_size, FAIL_RANK_ENV);
        return Err(LaunchError::RankFailed { rank: ctx.rank, code: INJECTED_FAILURE_CODE }.into());
    }

    let summary = tokio::task::spawn_blocking(move || run_worker(&config, &ctx, &workspace)).await??;
    tracing::debug!(
        global_step = summary.global_step,
        total_steps = summary.total_steps,
        final_loss = summary.final_loss,
        "worker summary"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_local_rank() {
        let pairs = pairs_from_args(&["--local_rank=2", "--seed", "7", "--local-rank", "3"]).unwrap();
        let (rank, rest) = split_local_rank(pairs).unwrap();
        assert_eq!(rank, Some(3));
        assert_eq!(rest, vec![("seed".to_string(), "7".to_string())]);

        let (rank, _) = split_local_rank(Vec::new()).unwrap();
        assert_eq!(rank, None);

        let pairs = pairs_from_args(&["--local-rank", "x"]).unwrap();
        assert!(split_local_rank(pairs).is_err());
    }
}
