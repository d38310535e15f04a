//! PowerShell execution host driven over stdin/stdout
//!
//! Every transport runs the same long-lived host process. The first line on
//! stdin is an init payload (connection settings, credential, library
//! source); the host answers with a ready envelope and then serves one JSON
//! request per line, answering each with one JSON envelope per line:
//!
//! ```text
//! -> {"mode":"winrm","computer":"web01",...,"library":"..."}
//! <- {"id":0,"ready":true}
//! -> {"id":1,"kind":"operation","name":"Get-FleetNodes","parameters":{}}
//! <- {"id":1,"records":[...],"errors":[]}
//! -> {"id":2,"kind":"exit"}
//! ```
//!
//! Secrets only travel over stdin, never on the command line.

use crate::error::{Error, Result};
use crate::operation::{Invocation, OperationResult, Parameters};
use async_process::{Child, ChildStdin, ChildStdout, Stdio};
use futures_lite::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use futures_lite::{StreamExt, future};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a closing host may take before it is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Host-side request loop
const HOST_SCRIPT: &str = r#"$ErrorActionPreference = 'Stop'
$session = $null

function Send-Envelope {
    param([hashtable]$Envelope)
    [Console]::Out.WriteLine(($Envelope | ConvertTo-Json -Compress -Depth 8))
    [Console]::Out.Flush()
}

function ConvertTo-Splat {
    param($Source)
    $splat = @{}
    if ($null -ne $Source) {
        foreach ($property in $Source.PSObject.Properties) { $splat[$property.Name] = $property.Value }
    }
    $splat
}

$runner = {
    param($kind, $target, $arguments)
    if ($kind -eq 'script') {
        $block = [ScriptBlock]::Create($target)
        & $block @arguments
    } else {
        & $target @arguments
    }
}

try {
    $init = [Console]::In.ReadLine() | ConvertFrom-Json
    try {
        if ($init.mode -ne 'local') {
            $connect = @{ ErrorAction = 'Stop' }
            if ($init.mode -eq 'ssh') {
                $connect.HostName = $init.computer
                $connect.Port = $init.port
                if ($init.username) { $connect.UserName = $init.username }
                if ($init.key_file) { $connect.KeyFilePath = $init.key_file }
            } else {
                $connect.ComputerName = $init.computer
                $connect.Port = $init.port
                if ($init.use_ssl) { $connect.UseSSL = $true }
                if ($init.include_port_in_spn) { $connect.SessionOption = New-PSSessionOption -IncludePortInSPN }
                if ($init.username) {
                    $secret = ConvertTo-SecureString -String $init.password -AsPlainText -Force
                    $connect.Credential = New-Object System.Management.Automation.PSCredential($init.username, $secret)
                }
            }
            $session = New-PSSession @connect
        }
    } catch {
        Send-Envelope @{ id = 0; ready = $false; stage = 'connect'; error = $_.Exception.Message }
        exit 2
    }

    try {
        $load = @{ ScriptBlock = { param($source) . ([ScriptBlock]::Create($source)) }; ArgumentList = @($init.library); ErrorAction = 'Stop' }
        if ($session) { $load.Session = $session; Invoke-Command @load } else { . ([ScriptBlock]::Create($init.library)) }
    } catch {
        Send-Envelope @{ id = 0; ready = $false; stage = 'library'; error = $_.Exception.Message }
        exit 3
    }
    Send-Envelope @{ id = 0; ready = $true }

    while ($null -ne ($line = [Console]::In.ReadLine())) {
        $request = $line | ConvertFrom-Json
        if ($request.kind -eq 'exit') { break }
        $target = if ($request.kind -eq 'script') { $request.text } else { $request.name }
        $failures = @()
        $records = @()
        $invoke = @{
            ScriptBlock = $runner
            ArgumentList = @($request.kind, $target, (ConvertTo-Splat $request.parameters))
            ErrorAction = 'SilentlyContinue'
            ErrorVariable = 'failures'
        }
        if ($session) { $invoke.Session = $session }
        try {
            $records = @(Invoke-Command @invoke)
        } catch {
            $failures = @($failures) + $_
        }
        $clean = @($records | Select-Object -Property * -ExcludeProperty PSComputerName, RunspaceId, PSShowComputerName, PSSourceJobInstanceId)
        Send-Envelope @{ id = $request.id; records = $clean; errors = @($failures | ForEach-Object { "$_" }) }
    }
} finally {
    if ($session) { Remove-PSSession -Session $session -ErrorAction SilentlyContinue }
}
"#;

/// Executable used to run the host script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProgram {
    program: String,
}

impl HostProgram {
    /// Use a specific executable (`pwsh`, `powershell.exe`, absolute path)
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Executable name
    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> async_process::Command {
        let mut cmd = async_process::Command::new(&self.program);
        cmd.arg("-NoLogo")
            .arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-Command")
            .arg(HOST_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for HostProgram {
    fn default() -> Self {
        if cfg!(windows) {
            Self::new("powershell.exe")
        } else {
            Self::new("pwsh")
        }
    }
}

/// Init payload, the first line sent to the host
#[derive(Serialize)]
pub struct HostInit<'a> {
    /// `local`, `winrm` or `ssh`
    pub mode: &'static str,
    /// Machine to open a remote session to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computer: Option<&'a str>,
    /// Remote port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// WinRM over HTTPS
    pub use_ssl: bool,
    /// Embed the port in the SPN
    pub include_port_in_spn: bool,
    /// Account name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<&'a str>,
    /// Account secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<&'a str>,
    /// SSH private key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<&'a str>,
    /// Operation library source
    pub library: &'a str,
}

impl<'a> HostInit<'a> {
    /// In-process init payload
    pub fn local(library: &'a str) -> Self {
        Self {
            mode: "local",
            computer: None,
            port: None,
            use_ssl: false,
            include_port_in_spn: false,
            username: None,
            password: None,
            key_file: None,
            library,
        }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a Parameters>,
}

impl<'a> Request<'a> {
    fn from_invocation(id: u64, invocation: &'a Invocation) -> Self {
        match invocation {
            Invocation::Operation { name, parameters } => Self {
                id,
                kind: "operation",
                name: Some(name),
                text: None,
                parameters: Some(parameters),
            },
            Invocation::Script { text, parameters } => Self {
                id,
                kind: "script",
                name: None,
                text: Some(text),
                parameters: Some(parameters),
            },
        }
    }

    fn exit(id: u64) -> Self {
        Self {
            id,
            kind: "exit",
            name: None,
            text: None,
            parameters: None,
        }
    }
}

/// One response line from the host
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub id: u64,
    #[serde(default)]
    pub ready: Option<bool>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub records: Vec<Value>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub errors: Vec<Value>,
}

/// PowerShell unrolls single-element arrays; accept a bare value or null too
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    })
}

impl Envelope {
    pub(crate) fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    pub(crate) fn into_result(self) -> OperationResult {
        let errors = self
            .errors
            .into_iter()
            .map(|e| match e {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        OperationResult::new(self.records, errors)
    }
}

/// Classify a failed handshake
pub(crate) fn handshake_error(host: &str, stage: Option<&str>, message: String) -> Error {
    match stage {
        Some("library") => Error::LibraryUnavailable {
            path: format!("{}:<session scope>", host),
            reason: message,
        },
        _ if looks_like_auth_failure(&message) => Error::Authentication {
            host: host.to_string(),
            reason: message,
        },
        _ => Error::Connection {
            host: host.to_string(),
            reason: message,
        },
    }
}

fn looks_like_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "access is denied",
        "access denied",
        "user name or password is incorrect",
        "logon failure",
        "authentication scheme",
        "trustedhosts",
        "permission denied",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// A running host process bound to one machine
pub struct HostProcess {
    host: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl std::fmt::Debug for HostProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProcess")
            .field("host", &self.host)
            .field("pid", &self.child.id())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl HostProcess {
    /// Spawn the host process
    pub fn spawn(program: &HostProgram, host: &str) -> Result<Self> {
        let mut child = program.command().spawn().map_err(|e| {
            Error::spawn_failed(format!("failed to spawn {}: {}", program.program(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::spawn_failed("host stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .map(|s| BufReader::new(s).lines())
            .ok_or_else(|| Error::spawn_failed("host stdout not captured"))?;

        Ok(Self {
            host: host.to_string(),
            child,
            stdin: Some(stdin),
            stdout,
            next_id: 1,
        })
    }

    /// Send the init payload and wait for the ready envelope
    pub async fn handshake(&mut self, init: &HostInit<'_>) -> Result<()> {
        let line = serde_json::to_string(init)?;
        self.write_line(&line).await?;

        let envelope = self.read_envelope(0).await?;
        match envelope.ready {
            Some(true) => Ok(()),
            _ => {
                let message = envelope
                    .error
                    .unwrap_or_else(|| "host did not become ready".to_string());
                Err(handshake_error(&self.host, envelope.stage.as_deref(), message))
            }
        }
    }

    /// Run one invocation
    pub async fn request(&mut self, invocation: &Invocation) -> Result<OperationResult> {
        let id = self.next_id;
        self.next_id += 1;

        let line = serde_json::to_string(&Request::from_invocation(id, invocation))?;
        self.write_line(&line).await?;

        let envelope = self.read_envelope(id).await?;
        Ok(envelope.into_result())
    }

    /// Ask the host to exit and reap it, killing it after a grace period
    pub async fn shutdown(&mut self) -> Result<()> {
        let id = self.next_id;
        if self.stdin.is_some() {
            let line = serde_json::to_string(&Request::exit(id))?;
            if let Err(e) = self.write_line(&line).await {
                debug!(host = %self.host, "exit request not delivered: {}", e);
            }
        }
        // Closing stdin ends the request loop even if the exit line was lost
        self.stdin.take();

        let exited = future::or(
            async { self.child.status().await.map(Some) },
            async {
                async_io::Timer::after(SHUTDOWN_GRACE).await;
                Ok::<_, std::io::Error>(None)
            },
        )
        .await?;

        if exited.is_none() {
            warn!(host = %self.host, "execution host did not exit in time, killing it");
            self.child.kill()?;
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| Error::HostExited {
            host: self.host.clone(),
            reason: "stdin already closed".to_string(),
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read until the envelope for `id`, skipping noise and stale responses
    async fn read_envelope(&mut self, id: u64) -> Result<Envelope> {
        while let Some(line) = self.stdout.next().await {
            let line = line?;
            match Envelope::parse(&line) {
                Some(envelope) if envelope.id == id => return Ok(envelope),
                Some(envelope) if envelope.id < id => {
                    debug!(host = %self.host, stale = envelope.id, expected = id, "discarding stale response");
                }
                Some(envelope) => {
                    return Err(Error::protocol(format!(
                        "response id {} is ahead of request id {}",
                        envelope.id, id
                    )));
                }
                None => {
                    if !line.trim().is_empty() {
                        debug!(host = %self.host, "ignoring host output: {}", line.trim());
                    }
                }
            }
        }

        let reason = match self.child.try_status() {
            Ok(Some(status)) => format!("exited with {}", status),
            Ok(None) => "closed its output".to_string(),
            Err(e) => e.to_string(),
        };
        Err(Error::HostExited {
            host: self.host.clone(),
            reason,
        })
    }
}
