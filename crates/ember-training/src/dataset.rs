use crate::error::{LaunchError, LaunchResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

/// One raw supervised fine-tuning record (`{"instruction": ..., "output": ...}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftRecord {
    pub instruction: String,
    pub output: String,
}

/// A record rendered into prompt and target text.
///
/// Only the target contributes to the loss; the prompt span is masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftExample {
    pub prompt: String,
    pub target: String,
}

pub const DEFAULT_EOS_TOKEN: &str = "<|endoftext|>";

#[must_use]
pub fn build_instruction_prompt(instruction: &str) -> String {
    format!("# This is the assembly code:\n{instruction}\n# What is the source code?\n")
}

impl SftRecord {
    #[must_use]
    pub fn render(&self, eos_token: &str) -> SftExample {
        SftExample {
            prompt: build_instruction_prompt(&self.instruction),
            target: format!("{}\n{eos_token}", self.output),
        }
    }
}

/// Where the dataset identifier points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    /// A JSONL file on the local filesystem.
    Local(PathBuf),
    /// A hub/registry name; fetching it is the training procedure's job.
    Registry(String),
}

impl DatasetSource {
    /// Classify `data_path`, resolving relative paths against `base_dir`.
    #[must_use]
    pub fn from_identifier(data_path: &str, base_dir: &Path) -> Self {
        let candidate = Path::new(data_path);
        let candidate = if candidate.is_absolute() { candidate.to_path_buf() } else { base_dir.join(candidate) };
        if candidate.is_file() {
            Self::Local(candidate)
        } else {
            Self::Registry(data_path.to_string())
        }
    }
}

/// Read a JSONL file of records. Blank lines are skipped.
pub fn read_jsonl_records(path: &Path) -> LaunchResult<Vec<SftRecord>> {
    let file = std::fs::File::open(path)
        .map_err(|e| LaunchError::Dataset(format!("failed to open {}: {e}", path.display())))?;
    let mut out = Vec::new();
    for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SftRecord = serde_json::from_str(&line)
            .map_err(|e| LaunchError::Dataset(format!("{}:{}: {e}", path.display(), idx + 1)))?;
        out.push(record);
    }
    Ok(out)
}

pub fn validate_records(records: &[SftRecord]) -> LaunchResult<()> {
    if records.is_empty() {
        return Err(LaunchError::Dataset("dataset must not be empty".to_string()));
    }
    for (idx, rec) in records.iter().enumerate() {
        if rec.instruction.trim().is_empty() {
            return Err(LaunchError::Dataset(format!("record[{idx}] instruction is empty")));
        }
        if rec.output.trim().is_empty() {
            return Err(LaunchError::Dataset(format!("record[{idx}] output is empty")));
        }
    }
    Ok(())
}

pub fn compute_dataset_id(records: &[SftRecord]) -> LaunchResult<DatasetId> {
    let mut hasher = Sha256::new();
    for rec in records {
        hasher.update(serde_json::to_vec(rec)?);
        hasher.update(b"\n");
    }
    Ok(DatasetId(hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(instruction: &str, output: &str) -> SftRecord {
        SftRecord { instruction: instruction.to_string(), output: output.to_string() }
    }

    #[test]
    fn test_render_uses_prompt_template() {
        let ex = record("mov eax, 1\nret", "int f() { return 1; }").render("</s>");
        assert_eq!(ex.prompt, "# This is the assembly code:\nmov eax, 1\nret\n# What is the source code?\n");
        assert_eq!(ex.target, "int f() { return 1; }\n</s>");
    }

    #[test]
    fn test_validate_records() {
        assert!(validate_records(&[]).is_err());
        assert!(validate_records(&[record("a", " ")]).is_err());
        assert!(validate_records(&[record("a", "b")]).is_ok());
    }

    #[test]
    fn test_read_jsonl_and_classify() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.jsonl");
        std::fs::write(
            &path,
            "{\"instruction\":\"a\",\"output\":\"b\"}\n\n{\"instruction\":\"c\",\"output\":\"d\",\"extra\":1}\n",
        )
        .unwrap();

        assert_eq!(DatasetSource::from_identifier("train.jsonl", temp.path()), DatasetSource::Local(path.clone()));
        assert_eq!(
            DatasetSource::from_identifier("org/decompile-bench", temp.path()),
            DatasetSource::Registry("org/decompile-bench".to_string())
        );

        let records = read_jsonl_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(compute_dataset_id(&records).unwrap(), compute_dataset_id(&records).unwrap());
    }

    #[test]
    fn test_read_jsonl_reports_line_number() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.jsonl");
        std::fs::write(&path, "{\"instruction\":\"a\",\"output\":\"b\"}\n{oops}\n").unwrap();
        let err = read_jsonl_records(&path).unwrap_err();
        assert!(err.to_string().contains("bad.jsonl:2"));
    }
}
