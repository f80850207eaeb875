//! Attachment Staging
//!
//! Downloads the files attached to a message into a private temporary
//! directory so the automation can read them. The directory and everything in
//! it is removed when the [`StagedFiles`] value is dropped.

use std::path::{Path, PathBuf};

use reqwest::Response;
use sy_common::{Attachment, AttachmentKind};
use tempfile::TempDir;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::ingest::router::MAX_ATTACHMENT_BYTES;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("exceeds_size_limit")]
    TooLarge,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A downloaded attachment on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub name: String,
    pub kind: AttachmentKind,
}

/// Files staged for one run, plus the attachments that could not be fetched.
#[derive(Debug, Default)]
pub struct StagedFiles {
    dir: Option<TempDir>,
    pub files: Vec<StagedFile>,
    /// Attachment name and the reason it was skipped.
    pub failures: Vec<(String, FetchError)>,
}

impl StagedFiles {
    /// Directory holding the files, if any attachment was requested.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }
}

/// Fetches private attachment URLs with the bot token.
#[derive(Debug, Clone)]
pub struct AttachmentFetcher {
    http: reqwest::Client,
    max_bytes: u64,
}

impl AttachmentFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            max_bytes: MAX_ATTACHMENT_BYTES,
        }
    }

    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Download `attachments` into a fresh `0700` directory.
    ///
    /// A single failed download is recorded in [`StagedFiles::failures`] and
    /// the rest still run. Only failing to create the directory is an error.
    pub async fn stage(
        &self,
        token: &str,
        attachments: &[Attachment],
    ) -> Result<StagedFiles, FetchError> {
        if attachments.is_empty() {
            return Ok(StagedFiles::default());
        }

        let dir = private_dir()?;
        let mut staged = StagedFiles {
            dir: None,
            files: Vec::with_capacity(attachments.len()),
            failures: Vec::new(),
        };

        for attachment in attachments {
            let path = dir.path().join(local_name(attachment));
            match self.download(token, &attachment.url, &path).await {
                Ok(bytes) => {
                    debug!(file = %attachment.name, bytes, "Attachment staged");
                    staged.files.push(StagedFile {
                        path,
                        name: attachment.name.clone(),
                        kind: attachment.kind,
                    });
                }
                Err(e) => {
                    warn!(file = %attachment.name, error = %e, "Failed to download attachment");
                    staged.failures.push((attachment.name.clone(), e));
                }
            }
        }

        staged.dir = Some(dir);
        Ok(staged)
    }

    async fn download(&self, token: &str, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut response = self.http.get(url).bearer_auth(token).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(FetchError::TooLarge);
        }

        let mut file = File::create(dest).await?;
        let written = copy_capped(&mut response, &mut file, self.max_bytes).await;
        drop(file);
        if written.is_err() {
            if let Err(e) = tokio::fs::remove_file(dest).await {
                warn!(path = %dest.display(), error = %e, "Failed to remove partial download");
            }
        }
        written
    }
}

/// Stream the body into `file`, stopping once more than `max_bytes` arrived.
async fn copy_capped(
    response: &mut Response,
    file: &mut File,
    max_bytes: u64,
) -> Result<u64, FetchError> {
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(FetchError::TooLarge);
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}

fn private_dir() -> std::io::Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("switchyard_").tempdir()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}

/// File name inside the staging directory. Path components in the reported
/// name are dropped; the file id keeps names unique.
fn local_name(attachment: &Attachment) -> String {
    let base = Path::new(&attachment.name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("attachment");
    format!("{}_{base}", attachment.id)
}
