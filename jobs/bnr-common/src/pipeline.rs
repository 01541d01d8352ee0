use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::Result;

/// Environment variable naming the file the pipeline reads step outputs from.
pub const OUTPUT_FILE_ENV: &str = "GITHUB_OUTPUT";

/// Key/value outputs handed back to the invoking pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    path: Option<PathBuf>,
}

impl PipelineOutput {
    pub fn from_env() -> Self {
        Self {
            path: std::env::var_os(OUTPUT_FILE_ENV).map(PathBuf::from),
        }
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Outputs are only logged.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Appends `key=value` as a line to the output file.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let Some(path) = &self.path else {
            warn!("{} is not set, output {}={} not exported", OUTPUT_FILE_ENV, key, value);
            return Ok(());
        };

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{key}={value}")?;
        info!("Exported pipeline output {}={}", key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outputs_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output");
        std::fs::write(&path, "Existing=1\n").unwrap();

        let output = PipelineOutput::to_file(&path);
        output.set("TargetTableName", "restored_orders_01-02-2025-10-00-00").unwrap();
        output.set("Keyspaces", "app,audit").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "Existing=1\nTargetTableName=restored_orders_01-02-2025-10-00-00\nKeyspaces=app,audit\n"
        );
    }

    #[test]
    fn test_disabled_output_is_a_no_op() {
        assert!(PipelineOutput::disabled().set("TargetTableName", "x").is_ok());
    }
}
