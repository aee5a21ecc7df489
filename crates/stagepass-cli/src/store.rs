//! File-backed entity store for the CLI
//!
//! Reconciled snapshots land as one JSON file per record under
//! `records/<entity_type>/<entity_id>.json`. Client apps plug their own
//! databases into the engine; the CLI only needs something durable and
//! inspectable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use stagepass_core::error::{Error, Result};
use stagepass_core::models::EntitySnapshot;
use stagepass_core::transport::EntityStore;

pub struct FileEntityStore {
    root: PathBuf,
}

impl FileEntityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, entity_type: &str, entity_id: &str) -> Result<PathBuf> {
        // Ids come from the server or local UUIDs; refuse anything that
        // could escape the records directory
        for part in [entity_type, entity_id] {
            if part.is_empty() || part.contains(['/', '\\', '.']) {
                return Err(Error::Validation(format!("unsafe record path part: {part}")));
            }
        }
        Ok(self
            .root
            .join(entity_type)
            .join(format!("{entity_id}.json")))
    }
}

#[async_trait]
impl EntityStore for FileEntityStore {
    async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntitySnapshot>> {
        let path = self.record_path(entity_type, entity_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn apply(&self, snapshot: &EntitySnapshot) -> Result<()> {
        let path = self.record_path(&snapshot.entity_type, &snapshot.entity_id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write-then-rename keeps a crash from leaving a torn record
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn remove(&self, entity_type: &str, entity_id: &str) -> Result<()> {
        let path = self.record_path(entity_type, entity_id)?;
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("stagepass"))
        .ok_or_else(|| Error::Config("could not determine a data directory".into()))
}

pub fn records_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("records")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn snapshot(entity_id: &str) -> EntitySnapshot {
        EntitySnapshot::from_payload(
            "tickets",
            entity_id,
            Some(1_000),
            &json!({"status": "valid"}),
        )
    }

    #[tokio::test]
    async fn test_apply_get_remove_round_trip() {
        let tmp = tempdir().unwrap();
        let store = FileEntityStore::new(tmp.path());

        let snap = snapshot("t-1");
        store.apply(&snap).await.unwrap();
        assert_eq!(store.get("tickets", "t-1").await.unwrap(), Some(snap));

        store.remove("tickets", "t-1").await.unwrap();
        assert_eq!(store.get("tickets", "t-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let tmp = tempdir().unwrap();
        let store = FileEntityStore::new(tmp.path());
        assert!(store.get("tickets", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_escapes() {
        let tmp = tempdir().unwrap();
        let store = FileEntityStore::new(tmp.path());
        assert!(store.get("tickets", "../secrets").await.is_err());
        assert!(store.get("", "t-1").await.is_err());
    }
}
