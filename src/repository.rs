//! Persistence collaborator: stores workplans and instance snapshots.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::engine::InstanceSnapshot;
use crate::error::RepositoryError;
use crate::workplan::Workplan;

const WORKPLANS: &str = "workplans";
const SNAPSHOTS: &str = "snapshots";

/// Storage of workplan graphs and the snapshots needed to resume instances
/// after a restart.
pub trait WorkplanRepository: Send + Sync {
    fn load(&self, id: Uuid) -> Result<Workplan, RepositoryError>;

    fn save(&self, workplan: &Workplan) -> Result<(), RepositoryError>;

    /// Ids of every stored workplan, sorted.
    fn list(&self) -> Result<Vec<Uuid>, RepositoryError>;

    fn save_snapshot(&self, snapshot: &InstanceSnapshot) -> Result<(), RepositoryError>;

    fn load_snapshot(&self, instance: Uuid) -> Result<InstanceSnapshot, RepositoryError>;
}

/// One pretty-printed JSON file per entry under `workplans/` and
/// `snapshots/` of the root directory.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    root: PathBuf,
}

impl JsonFileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry(&self, kind: &str, id: Uuid) -> PathBuf {
        self.root.join(kind).join(format!("{id}.json"))
    }

    fn write<T: Serialize>(&self, kind: &str, id: Uuid, value: &T) -> Result<(), RepositoryError> {
        let path = self.entry(kind, id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        // Write beside the target and rename so readers never see half a file.
        let partial = path.with_extension("json.partial");
        fs::write(&partial, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&partial, &path)?;
        debug!(path = %path.display(), "stored");
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, kind: &str, id: Uuid) -> Result<T, RepositoryError> {
        let path = self.entry(kind, id);
        if !path.exists() {
            return Err(RepositoryError::NotFound(format!("{kind}/{id}")));
        }
        read_json(&path)
    }
}

/// Read a workplan from an arbitrary JSON file.
pub fn read_workplan(path: &Path) -> Result<Workplan, RepositoryError> {
    if !path.exists() {
        return Err(RepositoryError::NotFound(path.display().to_string()));
    }
    read_json(path)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, RepositoryError> {
    let contents = fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

impl WorkplanRepository for JsonFileRepository {
    fn load(&self, id: Uuid) -> Result<Workplan, RepositoryError> {
        self.read(WORKPLANS, id)
    }

    fn save(&self, workplan: &Workplan) -> Result<(), RepositoryError> {
        self.write(WORKPLANS, workplan.id, workplan)
    }

    fn list(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let dir = self.root.join(WORKPLANS);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(id) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| Uuid::parse_str(stem).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn save_snapshot(&self, snapshot: &InstanceSnapshot) -> Result<(), RepositoryError> {
        self.write(SNAPSHOTS, snapshot.instance, snapshot)
    }

    fn load_snapshot(&self, instance: Uuid) -> Result<InstanceSnapshot, RepositoryError> {
        self.read(SNAPSHOTS, instance)
    }
}
