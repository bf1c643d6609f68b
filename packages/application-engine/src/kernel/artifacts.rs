//! Diagnostic artifacts on the local filesystem.
//!
//! Layout: `<root>/<application_id>/<timestamp>-<suffix>.json`, plus a sibling `.png`
//! when the snapshot carries a screenshot. The returned reference is the JSON
//! file's path.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::traits::BaseArtifactStore;
use crate::common::ApplicationId;
use crate::domains::automation::DiagnosticSnapshot;

#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a stored snapshot back by reference.
    pub async fn load(&self, reference: &str) -> Result<DiagnosticSnapshot> {
        let bytes = tokio::fs::read(reference)
            .await
            .with_context(|| format!("Failed to read artifact {reference}"))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Corrupt artifact {reference}"))
    }
}

#[async_trait]
impl BaseArtifactStore for FileArtifactStore {
    async fn store(
        &self,
        application_id: ApplicationId,
        snapshot: &DiagnosticSnapshot,
    ) -> Result<String> {
        let dir = self.root.join(application_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create artifact directory {}", dir.display()))?;

        // Two failures in the same millisecond must not overwrite each other
        let stem = format!(
            "{}-{}",
            snapshot.captured_at.format("%Y%m%dT%H%M%S%.3fZ"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let json_path = dir.join(format!("{stem}.json"));

        let body = serde_json::to_vec_pretty(snapshot).context("Failed to encode snapshot")?;
        tokio::fs::write(&json_path, body)
            .await
            .with_context(|| format!("Failed to write {}", json_path.display()))?;

        if let Some(png) = &snapshot.screenshot_png {
            let png_path = dir.join(format!("{stem}.png"));
            tokio::fs::write(&png_path, png)
                .await
                .with_context(|| format!("Failed to write {}", png_path.display()))?;
        }

        tracing::debug!(
            application_id = %application_id,
            path = %json_path.display(),
            "Stored diagnostic artifact"
        );
        Ok(json_path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_snapshot_and_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let id = ApplicationId::new();

        let snapshot = DiagnosticSnapshot {
            url: Some("https://jobs.example/apply".into()),
            html: Some("<form></form>".into()),
            screenshot_png: Some(vec![0x89, b'P', b'N', b'G']),
            note: Some("submit failed".into()),
            ..DiagnosticSnapshot::note_only("")
        };

        let reference = store.store(id, &snapshot).await.unwrap();
        assert!(reference.starts_with(&dir.path().join(id.to_string()).to_string_lossy().into_owned()));

        let loaded = store.load(&reference).await.unwrap();
        assert_eq!(loaded.note.as_deref(), Some("submit failed"));
        assert_eq!(loaded.html.as_deref(), Some("<form></form>"));
        assert!(loaded.screenshot_png.is_none());

        let png = PathBuf::from(reference.replace(".json", ".png"));
        assert_eq!(tokio::fs::read(png).await.unwrap(), vec![0x89, b'P', b'N', b'G']);
    }

    #[tokio::test]
    async fn unwritable_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        tokio::fs::write(&file, b"x").await.unwrap();

        let store = FileArtifactStore::new(&file);
        let err = store
            .store(ApplicationId::new(), &DiagnosticSnapshot::note_only("n"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("artifact directory"));
    }
}
