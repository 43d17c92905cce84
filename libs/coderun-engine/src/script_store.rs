/// Transient Script Store
///
/// **Responsibility:**
/// Materialize submitted source text as a uniquely named file right before
/// launch, and remove it once the job is terminal.
///
/// Removal happens on every path: the coordinator calls [`TemporaryScript::remove`]
/// to observe cleanup errors, and the underlying `TempPath` deletes the file
/// on drop if the job task unwinds or is aborted first.

use crate::error::LaunchError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempPath};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ScriptStore {
    dir: Option<PathBuf>,
    extension: String,
}

impl ScriptStore {
    pub fn new(dir: Option<PathBuf>, extension: &str) -> Self {
        Self {
            dir,
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    /// Write `source` to a fresh file named after the job.
    pub fn persist(&self, job_id: Uuid, source: &str) -> Result<TemporaryScript, LaunchError> {
        let prefix = format!("coderun-{}-", job_id.simple());
        let suffix = if self.extension.is_empty() {
            String::new()
        } else {
            format!(".{}", self.extension)
        };

        let mut builder = Builder::new();
        builder.prefix(&prefix).suffix(&suffix);

        let mut file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(LaunchError::Storage)?;

        file.write_all(source.as_bytes()).map_err(LaunchError::Storage)?;
        file.as_file().sync_all().map_err(LaunchError::Storage)?;

        // Close our handle so the interpreter is the only reader.
        Ok(TemporaryScript {
            path: file.into_temp_path(),
        })
    }
}

#[derive(Debug)]
pub struct TemporaryScript {
    path: TempPath,
}

impl TemporaryScript {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now, surfacing any error to the caller.
    pub fn remove(self) -> std::io::Result<()> {
        self.path.close()
    }
}
