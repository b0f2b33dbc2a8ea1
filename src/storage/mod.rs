use crate::core::config::Settings;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Where fetched pages and index payloads land. The crawl record stores the
/// returned paths, so the indexer never needs to know which variant it is
/// reading from.
pub enum PageArchive {
    Disabled,
    Local { root: PathBuf },
}

impl PageArchive {
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.object_store_upload {
            // The object-store uplink is an external collaborator; without
            // one wired in we keep the data local rather than dropping it.
            warn!(
                "R2_UPLOAD is set but no object-store client is configured; \
                 archiving to {} instead",
                settings.crawl_storage_dir
            );
        }
        if settings.crawl_storage_dir.trim().is_empty() {
            return PageArchive::Disabled;
        }
        PageArchive::Local {
            root: PathBuf::from(&settings.crawl_storage_dir),
        }
    }

    pub fn enabled(&self) -> bool {
        matches!(self, PageArchive::Local { .. })
    }

    async fn write(&self, relative: &str, contents: String) -> Result<Option<String>> {
        let PageArchive::Local { root } = self else {
            return Ok(None);
        };
        let path = root.join(relative);
        let display = path.to_string_lossy().to_string();
        // Blocking filesystem work stays off the async runtime threads.
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::write(&path, contents.as_bytes())
                .with_context(|| format!("writing {}", path.display()))?;
            Ok(())
        })
        .await
        .context("archive write task failed")??;
        Ok(Some(display))
    }

    /// Archive the raw fetched HTML; returns the recorded `raw_path`.
    pub async fn store_raw_html(&self, doc_id: i64, html: &str) -> Result<Option<String>> {
        self.write(&format!("raw/{doc_id}.html"), html.to_string())
            .await
    }

    /// Side-channel clean text blob written at index time.
    pub async fn store_clean_text(&self, doc_id: i64, text: &str) -> Result<Option<String>> {
        self.write(&format!("clean/{doc_id}.txt"), text.to_string())
            .await
    }

    /// Side-channel JSON index payload written at index time.
    pub async fn store_payload(
        &self,
        doc_id: i64,
        payload: &serde_json::Value,
    ) -> Result<Option<String>> {
        self.write(&format!("payload/{doc_id}.json"), payload.to_string())
            .await
    }
}

/// Contents of an archived file, or "" when the path is blank or missing —
/// the shape the indexer wants when deciding between raw and cleaned HTML.
pub async fn read_text(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    if !Path::new(path).exists() {
        return String::new();
    }
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_archive_round_trips() {
        let root = std::env::temp_dir().join(format!("engverse-archive-{}", std::process::id()));
        let archive = PageArchive::Local { root: root.clone() };
        let path = archive
            .store_raw_html(7, "<html>hi</html>")
            .await
            .unwrap()
            .unwrap();
        assert!(path.ends_with("raw/7.html"));
        assert_eq!(read_text(&path).await, "<html>hi</html>");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn disabled_archive_stores_nothing() {
        let archive = PageArchive::Disabled;
        assert!(!archive.enabled());
        assert_eq!(archive.store_raw_html(1, "x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_text_on_missing_path_is_empty() {
        assert_eq!(read_text("").await, "");
        assert_eq!(read_text("/definitely/not/here.txt").await, "");
    }
}
