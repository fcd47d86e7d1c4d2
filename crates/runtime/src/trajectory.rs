use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use serde::Serialize;
use types::{AgentStep, RunOutcome, TrajectoryError, TrajectorySink};

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TrajectoryLine<'a> {
    Step(&'a AgentStep),
    Outcome(&'a RunOutcome),
}

/// Append-only JSON-lines trajectory.
///
/// Each recorded step is one self-contained JSON object tagged
/// `"kind":"step"`; `finalize` appends a `"kind":"outcome"` summary line and
/// flushes. File writes run on the blocking pool.
#[derive(Debug)]
pub struct JsonlTrajectory {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl JsonlTrajectory {
    /// Opens `path` for appending, creating missing parent directories.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, TrajectoryError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| TrajectoryError::Open {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TrajectoryError::Open {
                path: path.display().to_string(),
                source,
            })?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &TrajectoryLine<'_>, sync: bool) -> Result<(), TrajectoryError> {
        let mut encoded = serde_json::to_string(line)?;
        encoded.push('\n');
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            file.write_all(encoded.as_bytes())?;
            if sync {
                file.flush()?;
                file.sync_data()?;
            }
            Ok(())
        })
        .await
        .map_err(io::Error::other)??;
        Ok(())
    }
}

#[async_trait]
impl TrajectorySink for JsonlTrajectory {
    async fn record(&self, step: &AgentStep) -> Result<(), TrajectoryError> {
        self.append(&TrajectoryLine::Step(step), false).await
    }

    async fn finalize(&self, outcome: &RunOutcome) -> Result<(), TrajectoryError> {
        self.append(&TrajectoryLine::Outcome(outcome), true).await
    }
}
