//! Moving certificate bundles onto nodes
//!
//! Remote nodes receive the bundle as base64 chunks written by a staging
//! script through the session; the chunk is a bound parameter, never part of
//! the script text. Local nodes get an ordinary temp file.

use crate::material::CredentialMaterial;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use session_executor::{Parameters, RemoteExecutionSession};
use std::path::PathBuf;
use tracing::debug;

/// Raw bytes per staging call
pub const CHUNK_SIZE: usize = 48 * 1024;

const CREATE_SCRIPT: &str = r#"param([string]$Name)
$path = Join-Path ([System.IO.Path]::GetTempPath()) $Name
[System.IO.File]::WriteAllBytes($path, [byte[]]@())
[pscustomobject]@{ path = $path }
"#;

const DISCARD_SCRIPT: &str = r#"param([string]$Name)
$path = Join-Path ([System.IO.Path]::GetTempPath()) $Name
if (Test-Path -LiteralPath $path) { Remove-Item -LiteralPath $path -Force }
"#;

const APPEND_SCRIPT: &str = r#"param([string]$Path, [string]$Chunk)
$bytes = [System.Convert]::FromBase64String($Chunk)
$stream = [System.IO.File]::Open($Path, [System.IO.FileMode]::Append)
try { $stream.Write($bytes, 0, $bytes.Length) } finally { $stream.Dispose() }
[pscustomobject]@{ length = (Get-Item -LiteralPath $Path).Length }
"#;

const REMOVE_SCRIPT: &str = r#"param([string]$Path)
if (Test-Path -LiteralPath $Path) { Remove-Item -LiteralPath $Path -Force }
"#;

#[derive(Debug, Deserialize)]
struct CreatedFile {
    path: String,
}

#[derive(Debug, Deserialize)]
struct AppendedChunk {
    length: u64,
}

/// A bundle copy sitting on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedFile {
    /// Written to the orchestrating machine's temp directory
    Local(PathBuf),
    /// Written to the node's temp directory through its session
    Remote {
        /// Node name
        node: String,
        /// Node-local path
        path: String,
    },
}

impl StagedFile {
    /// Path as the node sees it
    pub fn path(&self) -> String {
        match self {
            StagedFile::Local(path) => path.display().to_string(),
            StagedFile::Remote { path, .. } => path.clone(),
        }
    }
}

/// Stages and removes bundle copies
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialTransfer;

impl CredentialTransfer {
    /// Put a copy of `material` where the session's node can read it
    pub async fn stage(
        &self,
        session: &mut RemoteExecutionSession,
        material: &CredentialMaterial,
        file_name: &str,
    ) -> Result<StagedFile> {
        if session.is_local() {
            return Self::stage_local(material, file_name);
        }

        let node = session.node().name().to_string();
        let created = session
            .run_script(CREATE_SCRIPT, Parameters::new().with("Name", file_name))
            .await?;
        let path = match single_record::<CreatedFile>(created.records, "create") {
            Ok(created) => created.path,
            Err(e) => {
                session
                    .run_script(DISCARD_SCRIPT, Parameters::new().with("Name", file_name))
                    .await
                    .ok();
                return Err(e);
            }
        };
        let staged = StagedFile::Remote {
            node: node.clone(),
            path: path.clone(),
        };

        let bytes = material.bytes();
        let mut written = 0u64;
        for chunk in bytes.chunks(CHUNK_SIZE) {
            let params = Parameters::new()
                .with("Path", path.as_str())
                .with("Chunk", STANDARD.encode(chunk));
            let appended = match session.run_script(APPEND_SCRIPT, params).await {
                Ok(result) => single_record::<AppendedChunk>(result.records, "append"),
                Err(e) => Err(e.into()),
            };
            match appended {
                Ok(appended) => written = appended.length,
                Err(e) => {
                    self.remove(session, &staged).await.ok();
                    return Err(e);
                }
            }
        }

        if written != bytes.len() as u64 {
            self.remove(session, &staged).await.ok();
            return Err(Error::Staging(format!(
                "{} bytes staged on {}, expected {}",
                written,
                node,
                bytes.len()
            )));
        }
        debug!(node = %node, path = %path, bytes = written, "staged certificate bundle");
        Ok(staged)
    }

    fn stage_local(material: &CredentialMaterial, file_name: &str) -> Result<StagedFile> {
        use std::io::Write;

        let stem = file_name.strip_suffix(".pfx").unwrap_or(file_name);
        let mut file = tempfile::Builder::new()
            .prefix(stem)
            .suffix(".pfx")
            .tempfile()?;
        file.write_all(material.bytes())?;
        file.flush()?;
        let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
        debug!(path = %path.display(), "staged certificate bundle locally");
        Ok(StagedFile::Local(path))
    }

    /// Delete a staged copy
    pub async fn remove(
        &self,
        session: &mut RemoteExecutionSession,
        staged: &StagedFile,
    ) -> Result<()> {
        match staged {
            StagedFile::Local(path) => match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            StagedFile::Remote { path, .. } => {
                session
                    .run_script(REMOVE_SCRIPT, Parameters::new().with("Path", path.as_str()))
                    .await?;
                Ok(())
            }
        }
    }
}

fn single_record<T: serde::de::DeserializeOwned>(
    records: Vec<serde_json::Value>,
    step: &str,
) -> Result<T> {
    let record = records
        .into_iter()
        .next()
        .ok_or_else(|| Error::Staging(format!("{} step returned no record", step)))?;
    serde_json::from_value(record).map_err(|e| Error::Staging(format!("{} step: {}", step, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use session_executor::testing::Script;
    use session_executor::{NodeIdentity, OperationResult};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Emulates the node's temp directory
    fn staging_script(files: Arc<Mutex<HashMap<String, Vec<u8>>>>) -> Script {
        Script::new().on_script(move |call| {
            let mut files = files.lock().unwrap();
            let text = call.script.unwrap_or_default();
            if text.contains("WriteAllBytes") {
                let path = format!("C:\\Temp\\{}", call.parameters.get_str("Name").unwrap());
                files.insert(path.clone(), Vec::new());
                Ok(OperationResult::from_records(vec![json!({"path": path})]))
            } else if text.contains("FromBase64String") {
                let path = call.parameters.get_str("Path").unwrap();
                let chunk = STANDARD.decode(call.parameters.get_str("Chunk").unwrap()).unwrap();
                let file = files.get_mut(path).unwrap();
                file.extend_from_slice(&chunk);
                Ok(OperationResult::from_records(vec![json!({"length": file.len()})]))
            } else {
                files.remove(call.parameters.get_str("Path").unwrap());
                Ok(OperationResult::from_records(vec![]))
            }
        })
    }

    fn library() -> Arc<session_executor::OperationLibrary> {
        Arc::new(crate::operations::bundled_library().unwrap())
    }

    #[smol_potat::test]
    async fn test_remote_staging_in_chunks() {
        let files = Arc::new(Mutex::new(HashMap::new()));
        let script = staging_script(files.clone());
        let mut session = RemoteExecutionSession::new(
            NodeIdentity::new("adfs02"),
            Box::new(script.transport("adfs02")),
            library(),
        );
        session.initialize().await.unwrap();

        let bytes: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let material = CredentialMaterial::from_bytes("bundle.pfx", bytes.clone(), "pw").unwrap();

        let staged = CredentialTransfer
            .stage(&mut session, &material, "rotation-1.pfx")
            .await
            .unwrap();
        assert_eq!(staged.path(), "C:\\Temp\\rotation-1.pfx");
        assert_eq!(files.lock().unwrap()[&staged.path()], bytes);
        // One create plus three appends
        assert_eq!(script.log().count("<script>"), 4);

        // Script text never carries the payload
        for event in script.log().calls_to("<script>") {
            assert!(event.1.get("Path").is_some() || event.1.get("Name").is_some());
        }

        CredentialTransfer.remove(&mut session, &staged).await.unwrap();
        assert!(files.lock().unwrap().is_empty());
        session.terminate().await;
    }

    #[smol_potat::test]
    async fn test_local_staging_uses_temp_file() {
        let script = Script::new();
        let mut session = RemoteExecutionSession::new(
            NodeIdentity::local("adfs01"),
            Box::new(script.local_transport("adfs01")),
            library(),
        );
        session.initialize().await.unwrap();

        let material = CredentialMaterial::from_bytes("bundle.pfx", vec![1, 2, 3], "pw").unwrap();
        let staged = CredentialTransfer
            .stage(&mut session, &material, "rotation-1.pfx")
            .await
            .unwrap();
        let path = match &staged {
            StagedFile::Local(path) => path.clone(),
            other => panic!("expected local staging, got {:?}", other),
        };
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("rotation-1"));
        assert!(name.ends_with(".pfx"));
        assert_eq!(name.matches(".pfx").count(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert_eq!(script.log().count("<script>"), 0);

        CredentialTransfer.remove(&mut session, &staged).await.unwrap();
        assert!(!path.exists());
        // Removing twice is fine
        CredentialTransfer.remove(&mut session, &staged).await.unwrap();
        session.terminate().await;
    }

    #[smol_potat::test]
    async fn test_short_write_is_staging_error() {
        let script = Script::new().on_script(|call| {
            let text = call.script.unwrap_or_default();
            if text.contains("WriteAllBytes") {
                Ok(OperationResult::from_records(vec![json!({"path": "C:\\Temp\\x.pfx"})]))
            } else if text.contains("FromBase64String") {
                Ok(OperationResult::from_records(vec![json!({"length": 1})]))
            } else {
                Ok(OperationResult::from_records(vec![]))
            }
        });
        let mut session = RemoteExecutionSession::new(
            NodeIdentity::new("adfs02"),
            Box::new(script.transport("adfs02")),
            library(),
        );
        session.initialize().await.unwrap();

        let material = CredentialMaterial::from_bytes("bundle.pfx", vec![0; 10], "pw").unwrap();
        let err = CredentialTransfer.stage(&mut session, &material, "x.pfx").await.unwrap_err();
        assert!(matches!(err, Error::Staging(_)));
        // The partial copy was cleaned up
        assert_eq!(script.log().count("<script>"), 3);
        session.terminate().await;
    }

    #[smol_potat::test]
    async fn test_malformed_append_reply_removes_partial_copy() {
        let files = Arc::new(Mutex::new(HashMap::<String, Vec<u8>>::new()));
        let inner = files.clone();
        let script = Script::new().on_script(move |call| {
            let mut files = inner.lock().unwrap();
            let text = call.script.unwrap_or_default();
            if text.contains("WriteAllBytes") {
                files.insert("C:\\Temp\\x.pfx".to_string(), Vec::new());
                Ok(OperationResult::from_records(vec![json!({"path": "C:\\Temp\\x.pfx"})]))
            } else if text.contains("FromBase64String") {
                Ok(OperationResult::from_records(vec![json!({})]))
            } else {
                files.remove(call.parameters.get_str("Path").unwrap());
                Ok(OperationResult::from_records(vec![]))
            }
        });
        let mut session = RemoteExecutionSession::new(
            NodeIdentity::new("adfs02"),
            Box::new(script.transport("adfs02")),
            library(),
        );
        session.initialize().await.unwrap();

        let material = CredentialMaterial::from_bytes("bundle.pfx", vec![0; 10], "pw").unwrap();
        let err = CredentialTransfer.stage(&mut session, &material, "x.pfx").await.unwrap_err();
        assert!(matches!(err, Error::Staging(ref m) if m.contains("append")));
        // Create, append, remove
        assert_eq!(script.log().count("<script>"), 3);
        assert!(files.lock().unwrap().is_empty());
        session.terminate().await;
    }

    #[smol_potat::test]
    async fn test_malformed_create_reply_discards_by_name() {
        let script = Script::new().on_script(|call| {
            let text = call.script.unwrap_or_default();
            if text.contains("WriteAllBytes") {
                Ok(OperationResult::from_records(vec![]))
            } else {
                Ok(OperationResult::default())
            }
        });
        let mut session = RemoteExecutionSession::new(
            NodeIdentity::new("adfs02"),
            Box::new(script.transport("adfs02")),
            library(),
        );
        session.initialize().await.unwrap();

        let material = CredentialMaterial::from_bytes("bundle.pfx", vec![0; 10], "pw").unwrap();
        let err = CredentialTransfer.stage(&mut session, &material, "x.pfx").await.unwrap_err();
        assert!(matches!(err, Error::Staging(ref m) if m.contains("create")));

        let calls = script.log().calls_to("<script>");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1.get_str("Name"), Some("x.pfx"));
        session.terminate().await;
    }
}
