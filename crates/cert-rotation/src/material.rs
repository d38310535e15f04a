//! Certificate bundles handed to the rotation

use crate::{Error, Result};
use session_executor::Password;
use std::fmt;
use std::path::{Path, PathBuf};

/// A PKCS#12 bundle (certificate plus private key) and its password
#[derive(Clone)]
pub struct CredentialMaterial {
    source: PathBuf,
    bytes: Vec<u8>,
    password: Password,
}

impl CredentialMaterial {
    /// Read a bundle from disk
    pub fn load(path: impl AsRef<Path>, password: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| Error::Material {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(path, bytes, password)
    }

    /// Wrap an in-memory bundle; `source` is informational
    pub fn from_bytes(
        source: impl Into<PathBuf>,
        bytes: Vec<u8>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let source = source.into();
        if bytes.is_empty() {
            return Err(Error::Material {
                path: source.display().to_string(),
                reason: "file is empty".to_string(),
            });
        }
        Ok(Self {
            source,
            bytes,
            password: Password::new(password),
        })
    }

    /// Where the bundle came from
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Raw bundle bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bundle password
    pub fn password(&self) -> &Password {
        &self.password
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("source", &self.source)
            .field("len", &self.bytes.len())
            .field("password", &self.password)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_and_redact() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x30, 0x82, 0x01, 0x02]).unwrap();

        let material = CredentialMaterial::load(file.path(), "pfx-secret").unwrap();
        assert_eq!(material.bytes().len(), 4);
        assert_eq!(material.password().expose(), "pfx-secret");

        let debug = format!("{:?}", material);
        assert!(!debug.contains("pfx-secret"));
        assert!(debug.contains("len: 4"));
    }

    #[test]
    fn test_missing_or_empty_bundle() {
        let err = CredentialMaterial::load("/nonexistent/cert.pfx", "x").unwrap_err();
        assert!(matches!(err, Error::Material { .. }));

        let file = NamedTempFile::new().unwrap();
        let err = CredentialMaterial::load(file.path(), "x").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
