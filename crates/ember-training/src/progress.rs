use crate::artifacts::RunId;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { run_id: RunId, world_size: usize },
    RankSpawned { rank: usize, pid: Option<u32> },
    Output { rank: usize, stream: OutputStream, line: String },
    RankExited { rank: usize, code: Option<i32>, success: bool },
    Aborting { failed_rank: usize },
    Finished { run_id: RunId, success: bool },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Prints rank-tagged output the way `torchrun --tee` does.
#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { run_id, world_size } => {
                println!("[launch:{run_id}] starting {world_size} rank(s)");
            }
            ProgressEvent::RankSpawned { rank, pid } => match pid {
                Some(pid) => println!("[launch] rank {rank} spawned (pid {pid})"),
                None => println!("[launch] rank {rank} spawned"),
            },
            ProgressEvent::Output { rank, stream: OutputStream::Stdout, line } => println!("[rank {rank}] {line}"),
            ProgressEvent::Output { rank, stream: OutputStream::Stderr, line } => eprintln!("[rank {rank}] {line}"),
            ProgressEvent::RankExited { rank, code, success } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                if success {
                    println!("[launch] rank {rank} exited ({code})");
                } else {
                    eprintln!("[launch] rank {rank} failed ({code})");
                }
            }
            ProgressEvent::Aborting { failed_rank } => {
                eprintln!("[launch] rank {failed_rank} failed; terminating remaining ranks");
            }
            ProgressEvent::Finished { run_id, success } => {
                println!("[launch:{run_id}] finished ({})", if success { "ok" } else { "failed" });
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgressSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Output lines emitted by one rank, in order.
    #[must_use]
    pub fn lines_for(&self, rank: usize) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Output { rank: r, line, .. } if r == rank => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for CollectingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink_filters_by_rank() {
        let sink = CollectingProgressSink::new();
        sink.on_event(ProgressEvent::Output { rank: 0, stream: OutputStream::Stdout, line: "a".to_string() });
        sink.on_event(ProgressEvent::Output { rank: 1, stream: OutputStream::Stderr, line: "b".to_string() });
        sink.on_event(ProgressEvent::RankExited { rank: 1, code: Some(0), success: true });

        assert_eq!(sink.lines_for(1), vec!["b".to_string()]);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(ProgressEvent::Aborting { failed_rank: 2 }).unwrap();
        assert_eq!(json["type"], "aborting");
        assert_eq!(json["failed_rank"], 2);
    }
}
