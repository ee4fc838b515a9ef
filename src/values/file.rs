//! Static file-backed values provider.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use super::ValuesProvider;
use crate::Error;

/// Values read once from a file at construction time.
pub struct FileValues {
    path: String,
    data: Vec<u8>,
}

impl FileValues {
    /// Read the values file; fails if the path is empty or unreadable.
    pub fn new(path: &str) -> Result<Self, Error> {
        if path.is_empty() {
            return Err(Error::validation("values file path is required"));
        }
        let data = std::fs::read(path)
            .map_err(|e| Error::validation(format!("read values file {path}: {e}")))?;
        Ok(Self {
            path: path.to_string(),
            data,
        })
    }
}

#[async_trait]
impl ValuesProvider for FileValues {
    async fn start(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn values(&self) -> Result<Vec<u8>, Error> {
        Ok(self.data.clone())
    }

    async fn owner_reference(&self) -> Option<OwnerReference> {
        None
    }

    fn description(&self) -> String {
        format!("file:{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_file_contents_once() {
        let tmp = tempfile_path("values");
        std::fs::File::create(&tmp)
            .and_then(|mut f| f.write_all(b"app: sandbox\n"))
            .unwrap();

        let provider = FileValues::new(tmp.to_str().unwrap()).unwrap();
        assert_eq!(provider.values().await.unwrap(), b"app: sandbox\n");
        assert!(provider.owner_reference().await.is_none());
        assert!(provider.description().starts_with("file:"));

        // deep copy: mutating the returned buffer leaves the provider intact
        let mut copy = provider.values().await.unwrap();
        copy[0] = b'X';
        assert_eq!(provider.values().await.unwrap(), b"app: sandbox\n");

        let _ = std::fs::remove_file(&tmp);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        assert!(FileValues::new("/definitely/not/here.yaml").is_err());
        assert!(FileValues::new("").is_err());
    }

    fn tempfile_path(prefix: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("claim-controller-{prefix}-{}", std::process::id()));
        path
    }
}
