use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tokio::fs::{create_dir_all, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

/// Directory holding uploaded photo content, one flat file per photo.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    root: PathBuf,
}

impl PhotoStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self) -> anyhow::Result<()> {
        create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating photo directory {}", self.root.display()))
    }

    pub fn path_of(&self, stored_name: &str) -> PathBuf {
        self.root.join(stored_name)
    }

    /// Writes `bytes` under a freshly generated name that keeps the extension
    /// of `original_name`, and returns that name.
    pub async fn save(&self, original_name: &str, bytes: &[u8]) -> anyhow::Result<String> {
        let stored_name = generated_name(original_name);
        let path = self.path_of(&stored_name);
        if path.exists() {
            bail!("File already exists!")
        }
        let file = File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(stored_name)
    }

    /// Best-effort delete. A missing file yields `Ok(false)`; any other
    /// filesystem fault is returned.
    pub async fn remove(&self, stored_name: &str) -> anyhow::Result<bool> {
        let path = self.path_of(stored_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::warn!("Photo file {} was already gone", path.display());
                Ok(false)
            }
            Err(err) => {
                Err(anyhow::Error::from(err).context(format!("removing {}", path.display())))
            }
        }
    }

    /// Removes every listed file, ignoring failures. Used to roll back writes
    /// whose rows never got committed.
    pub async fn discard(&self, stored_names: &[String]) {
        for name in stored_names {
            if let Err(err) = self.remove(name).await {
                log::warn!("Could not discard photo {}: {:#}", name, err);
            }
        }
    }
}

/// Everything after the last `.` of the uploaded name is the extension, so
/// `.png` keeps `png`. Names ending in `.` or without one get a bare id.
fn generated_name(original_name: &str) -> String {
    let id = Uuid::new_v4();
    let base = original_name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    match base.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => format!("{}.{}", id, ext),
        _ => id.to_string(),
    }
}
