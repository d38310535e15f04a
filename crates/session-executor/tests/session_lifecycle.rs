//! End-to-end session tests against a stand-in execution host
//!
//! The stand-in is a small shell script that speaks the host's line protocol,
//! so these tests exercise process spawning, the handshake, id matching and
//! shutdown without needing PowerShell installed.

#![cfg(unix)]

use serde::Deserialize;
use session_executor::{
    Error, HostProgram, LocalTarget, NodeIdentity, OperationLibrary, Parameters,
    PowerShellTransport, RemoteExecutionSession, RemoteOperation, SessionState,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const SERVING_HOST: &str = r#"#!/bin/sh
read init
echo "WARNING: profile banner"
echo '{"id":0,"ready":true}'
while read line; do
  case "$line" in
    *'"kind":"exit"'*) exit 0 ;;
  esac
  id=$(printf '%s' "$line" | sed -n 's/^{"id":\([0-9]*\).*/\1/p')
  echo "{\"id\":$((id - 1)),\"records\":[{\"stale\":true}]}"
  case "$line" in
    *'"name":"Fail-Op"'*) echo "{\"id\":$id,\"records\":[],\"errors\":\"Access is denied.\"}" ;;
    *) echo "{\"id\":$id,\"records\":{\"name\":\"web01\",\"is_primary\":true}}" ;;
  esac
done
"#;

const REJECTING_HOST: &str = r#"#!/bin/sh
read init
echo '{"id":0,"ready":false,"stage":"connect","error":"Access is denied."}'
exit 2
"#;

const CRASHING_HOST: &str = r#"#!/bin/sh
read init
echo '{"id":0,"ready":true}'
read line
exit 9
"#;

#[derive(Debug, Deserialize)]
struct Member {
    name: String,
    is_primary: bool,
}

struct ListMembers;

impl RemoteOperation for ListMembers {
    type Output = Member;
    const NAME: &'static str = "Get-FleetNodes";

    fn parameters(&self) -> Parameters {
        Parameters::new()
    }
}

fn write_host(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-host.sh");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn session_with_host(host: &Path) -> RemoteExecutionSession {
    let library = OperationLibrary::from_source(
        "FleetRotation.ps1",
        "# operation-library-version: 1\n",
        "1",
    )
    .unwrap();
    let transport = PowerShellTransport::with_program(
        LocalTarget::new("web01"),
        HostProgram::new(host.to_string_lossy()),
    );
    RemoteExecutionSession::new(NodeIdentity::local("web01"), Box::new(transport), Arc::new(library))
}

#[smol_potat::test]
async fn test_round_trip_through_host_process() {
    let dir = TempDir::new().unwrap();
    let host = write_host(dir.path(), SERVING_HOST);
    let mut session = session_with_host(&host);

    session.initialize().await.unwrap();
    assert!(session.is_local());

    // Stale envelopes and banner noise are skipped
    let members = session.call(&ListMembers).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].name, "web01");
    assert!(members[0].is_primary);

    let again = session.call(&ListMembers).await.unwrap();
    assert_eq!(again.len(), 1);

    let err = session.run_operation("Fail-Op", Parameters::new()).await.unwrap_err();
    assert!(err.is_operation());
    assert_eq!(err.remote_message(), Some("Access is denied."));

    session.terminate().await;
    assert_eq!(session.state(), SessionState::Terminated);
}

#[smol_potat::test]
async fn test_rejected_handshake_is_authentication_failure() {
    let dir = TempDir::new().unwrap();
    let host = write_host(dir.path(), REJECTING_HOST);
    let mut session = session_with_host(&host);

    let err = session.initialize().await.unwrap_err();
    assert!(err.is_transport());
    match err {
        Error::SessionInitialization { source, .. } => {
            assert!(matches!(*source, Error::Authentication { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Terminated);
}

#[smol_potat::test]
async fn test_host_exit_mid_session_is_transport_failure() {
    let dir = TempDir::new().unwrap();
    let host = write_host(dir.path(), CRASHING_HOST);
    let mut session = session_with_host(&host);

    session.initialize().await.unwrap();
    let err = session.call(&ListMembers).await.unwrap_err();
    assert!(matches!(err, Error::HostExited { .. }));
    assert!(err.is_transport());

    session.terminate().await;
}
