//! File snapshots taken before mutating workflow steps.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// The saved bytes of one path, or the fact that it did not exist.
///
/// Keyed by its path inside [`Checkpoint::file_snapshots`]; the persisted
/// form is `{path → base64}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// File bytes at capture time; `None` records "did not exist", so a
    /// rollback removes the file.
    #[serde(with = "base64_bytes")]
    pub contents: Option<Vec<u8>>,
    /// SHA-256 of the contents, for integrity checks on reload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl FileSnapshot {
    /// Capture the current state of one path.
    pub async fn capture(path: &Path) -> Result<Self> {
        let contents = match tokio::fs::read(path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("snapshot read failed: {}", path.display()))
            }
        };

        let digest = contents
            .as_ref()
            .map(|bytes| format!("{:x}", Sha256::digest(bytes)));

        Ok(Self { contents, digest })
    }

    /// Put `path` back the way the snapshot recorded it.
    pub async fn restore(&self, path: &Path) -> Result<()> {
        match &self.contents {
            Some(bytes) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.with_context(|| {
                        format!("restore mkdir failed: {}", parent.display())
                    })?;
                }
                tokio::fs::write(path, bytes)
                    .await
                    .with_context(|| format!("restore write failed: {}", path.display()))
            }
            None => match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    Err(e).with_context(|| format!("restore remove failed: {}", path.display()))
                }
            },
        }
    }
}

/// Snapshot set taken immediately before one mutating step.
///
/// Created before the step's first attempt; retries reuse it. Discarded
/// only after the plan terminates successfully, consulted in reverse
/// order on rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id.
    pub id: Uuid,
    /// Plan the checkpoint belongs to.
    pub plan_id: Uuid,
    /// Step the checkpoint guards.
    pub step_id: Uuid,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// One snapshot per declared path, keyed by the canonical path.
    pub file_snapshots: BTreeMap<PathBuf, FileSnapshot>,
}

impl Checkpoint {
    /// Snapshot every path the step declares it will touch.
    pub async fn capture(plan_id: Uuid, step_id: Uuid, paths: &[PathBuf]) -> Result<Self> {
        let mut file_snapshots = BTreeMap::new();
        for path in paths {
            file_snapshots.insert(path.clone(), FileSnapshot::capture(path).await?);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            plan_id,
            step_id,
            created_at: Utc::now(),
            file_snapshots,
        })
    }

    /// Restore every snapshot in this checkpoint.
    pub async fn restore(&self) -> Result<()> {
        for (path, snapshot) in &self.file_snapshots {
            snapshot.restore(path).await?;
        }
        Ok(())
    }
}

/// Base64 (de)serialisation for optional snapshot bytes, keeping the
/// persisted workflow state readable JSON.
mod base64_bytes {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_restores_overwritten_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        tokio::fs::write(&path, "original").await.unwrap();

        let snapshot = FileSnapshot::capture(&path).await.unwrap();
        assert!(snapshot.digest.is_some());

        tokio::fs::write(&path, "clobbered").await.unwrap();
        snapshot.restore(&path).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "original");
    }

    #[tokio::test]
    async fn snapshot_of_missing_file_removes_it_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.txt");

        let snapshot = FileSnapshot::capture(&path).await.unwrap();
        assert!(snapshot.contents.is_none());

        tokio::fs::write(&path, "created later").await.unwrap();
        snapshot.restore(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn checkpoint_serialises_as_a_path_keyed_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin.dat");
        tokio::fs::write(&path, [0u8, 159, 146, 150]).await.unwrap();

        let checkpoint = Checkpoint::capture(Uuid::new_v4(), Uuid::new_v4(), &[path.clone()])
            .await
            .unwrap();

        let json = serde_json::to_value(&checkpoint).unwrap();
        // file_snapshots is a {path -> snapshot} object, not an array,
        // and the payload is base64 text rather than raw bytes
        let snapshots = json["file_snapshots"].as_object().unwrap();
        let entry = &snapshots[&path.display().to_string()];
        assert_eq!(
            entry["contents"],
            serde_json::Value::String(BASE64.encode([0u8, 159, 146, 150]))
        );

        let back: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
