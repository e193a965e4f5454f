//! Append-only, line-counted counter files (spec §4.1/§4.8): each counter
//! is a file whose line count *is* the counter, so a crashed run can
//! recover its count by just counting lines rather than trusting a
//! separately-written number.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

pub struct CounterFile {
    path: PathBuf,
}

impl CounterFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn increment(&self) -> std::io::Result<u64> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(b"1\n").await?;
        file.flush().await?;
        self.count().await
    }

    pub async fn count(&self) -> std::io::Result<u64> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents.lines().count() as u64),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn increment_grows_line_count() {
        let dir = tempdir().unwrap();
        let counter = CounterFile::new(dir.path().join("submitted_jobs.count"));
        assert_eq!(counter.count().await.unwrap(), 0);
        counter.increment().await.unwrap();
        counter.increment().await.unwrap();
        assert_eq!(counter.count().await.unwrap(), 2);
    }
}
