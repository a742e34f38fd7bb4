use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{WorkflowError, WorkflowResult};

/// Upper bound for a single attachment.
pub const MAX_ATTACHMENT_BYTES: usize = 20 * 1024 * 1024;

/// Blob storage for SPM attachments. The workflow only keeps the returned
/// reference; content never passes through the document store.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Store `content` for `document_id` and return a reference to it.
    async fn store(&self, document_id: Uuid, file_name: &str, content: &[u8]) -> WorkflowResult<String>;

    async fn retrieve(&self, reference: &str) -> WorkflowResult<Vec<u8>>;

    /// Drop a stored blob whose reference never made it into the store.
    async fn remove(&self, reference: &str) -> WorkflowResult<()>;
}

/// Strip everything but a plain file name. Rejects names that would escape
/// the document's directory.
pub fn sanitize_file_name(file_name: &str) -> WorkflowResult<String> {
    let name = file_name.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(WorkflowError::validation(
            "file_name",
            format!("`{file_name}` is not a plain file name"),
        ));
    }
    Ok(name
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect())
}

/// Stores attachments under `<root>/<document id>/<uuid>-<name>`.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, reference: &str) -> WorkflowResult<PathBuf> {
        let mut parts = reference.splitn(2, '/');
        let (Some(dir), Some(file)) = (parts.next(), parts.next()) else {
            return Err(WorkflowError::validation("reference", format!("malformed reference `{reference}`")));
        };
        let dir = Uuid::parse_str(dir)
            .map_err(|_| WorkflowError::validation("reference", format!("malformed reference `{reference}`")))?;
        let file = sanitize_file_name(file)?;
        Ok(self.root.join(dir.to_string()).join(file))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn store(&self, document_id: Uuid, file_name: &str, content: &[u8]) -> WorkflowResult<String> {
        let name = sanitize_file_name(file_name)?;
        if content.is_empty() {
            return Err(WorkflowError::validation("content", "attachment is empty"));
        }
        if content.len() > MAX_ATTACHMENT_BYTES {
            return Err(WorkflowError::validation(
                "content",
                format!("attachment exceeds {MAX_ATTACHMENT_BYTES} bytes"),
            ));
        }

        let dir = self.root.join(document_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WorkflowError::FileStorage(format!("create {}: {e}", dir.display())))?;

        let stored_name = format!("{}-{name}", Uuid::new_v4());
        let path = dir.join(&stored_name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| WorkflowError::FileStorage(format!("write {}: {e}", path.display())))?;

        debug!(document = %document_id, path = %path.display(), bytes = content.len(), "Attachment stored");
        Ok(format!("{document_id}/{stored_name}"))
    }

    async fn retrieve(&self, reference: &str) -> WorkflowResult<Vec<u8>> {
        let path = self.resolve(reference)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| WorkflowError::FileStorage(format!("read {}: {e}", path.display())))
    }

    async fn remove(&self, reference: &str) -> WorkflowResult<()> {
        let path = self.resolve(reference)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| WorkflowError::FileStorage(format!("remove {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Attachment removed");
        Ok(())
    }
}
