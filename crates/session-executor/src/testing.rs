//! Scripted in-memory transport for tests
//!
//! A [`Script`] is a table of responders keyed by operation name, shared by
//! every transport it hands out, so one script can emulate a whole fleet.
//! All traffic is recorded in a [`CallLog`].

use crate::error::{Error, Result};
use crate::operation::{Invocation, OperationLibrary, OperationResult, Parameters};
use crate::transport::SessionTransport;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// One call as seen by a responder
#[derive(Debug)]
pub struct ScriptedCall<'a> {
    /// Host the transport was created for
    pub host: &'a str,
    /// Operation name, or `<script>`
    pub label: &'a str,
    /// Bound parameters
    pub parameters: &'a Parameters,
    /// Script text for inline scripts
    pub script: Option<&'a str>,
}

type Responder = dyn Fn(&ScriptedCall<'_>) -> Result<OperationResult> + Send + Sync;

/// Something that happened on a scripted transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Transport opened
    Opened {
        /// Host
        host: String,
    },
    /// Invocation run
    Invoked {
        /// Host
        host: String,
        /// Operation name, or `<script>`
        label: String,
        /// Bound parameters
        parameters: Parameters,
    },
    /// Transport closed
    Closed {
        /// Host
        host: String,
    },
}

/// Shared record of transport traffic
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<TransportEvent>>>);

impl CallLog {
    fn push(&self, event: TransportEvent) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event);
        }
    }

    /// All events in order
    pub fn events(&self) -> Vec<TransportEvent> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Labels of invocations run against `host`
    pub fn invocations(&self, host: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Invoked { host: h, label, .. } if h == host => Some(label),
                _ => None,
            })
            .collect()
    }

    /// Parameters of every call to `label`, with the host it ran on
    pub fn calls_to(&self, label: &str) -> Vec<(String, Parameters)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Invoked {
                    host,
                    label: l,
                    parameters,
                } if l == label => Some((host, parameters)),
                _ => None,
            })
            .collect()
    }

    /// Number of calls to `label` on any host
    pub fn count(&self, label: &str) -> usize {
        self.calls_to(label).len()
    }

    /// Number of times a transport to `host` was opened
    pub fn opens(&self, host: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TransportEvent::Opened { host: h } if h == host))
            .count()
    }

    /// Number of times a transport to `host` was closed
    pub fn closes(&self, host: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TransportEvent::Closed { host: h } if h == host))
            .count()
    }
}

/// Responder table shared by scripted transports
#[derive(Clone, Default)]
pub struct Script {
    responders: HashMap<String, Arc<Responder>>,
    script: Option<Arc<Responder>>,
    unreachable: HashSet<String>,
    log: CallLog,
}

impl Script {
    /// An empty script; every operation is unknown
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer calls to `name` with `responder`
    pub fn on<F>(mut self, name: &str, responder: F) -> Self
    where
        F: Fn(&ScriptedCall<'_>) -> Result<OperationResult> + Send + Sync + 'static,
    {
        self.responders.insert(name.to_string(), Arc::new(responder));
        self
    }

    /// Answer inline scripts with `responder`
    pub fn on_script<F>(mut self, responder: F) -> Self
    where
        F: Fn(&ScriptedCall<'_>) -> Result<OperationResult> + Send + Sync + 'static,
    {
        self.script = Some(Arc::new(responder));
        self
    }

    /// Make opening a transport to `host` fail with a connection error
    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_ascii_lowercase());
        self
    }

    /// Traffic log shared by all transports from this script
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// A remote transport for `host`
    pub fn transport(&self, host: &str) -> ScriptedTransport {
        ScriptedTransport {
            host: host.to_string(),
            local: false,
            open: false,
            script: self.clone(),
        }
    }

    /// A local transport for `host`
    pub fn local_transport(&self, host: &str) -> ScriptedTransport {
        ScriptedTransport {
            local: true,
            ..self.transport(host)
        }
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.responders.keys().collect();
        names.sort();
        f.debug_struct("Script").field("operations", &names).finish()
    }
}

/// Transport answering from a [`Script`]
#[derive(Debug)]
pub struct ScriptedTransport {
    host: String,
    local: bool,
    open: bool,
    script: Script,
}

#[async_trait]
impl SessionTransport for ScriptedTransport {
    fn describe(&self) -> String {
        let scheme = if self.local { "local" } else { "scripted" };
        format!("{}://{}", scheme, self.host)
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn open(&mut self, _library: &OperationLibrary) -> Result<()> {
        if self.script.unreachable.contains(&self.host.to_ascii_lowercase()) {
            return Err(Error::Connection {
                host: self.host.clone(),
                reason: "WinRM cannot complete the operation".to_string(),
            });
        }
        self.open = true;
        self.script.log.push(TransportEvent::Opened {
            host: self.host.clone(),
        });
        Ok(())
    }

    async fn invoke(&mut self, invocation: &Invocation) -> Result<OperationResult> {
        if !self.open {
            return Err(Error::HostExited {
                host: self.host.clone(),
                reason: "transport not open".to_string(),
            });
        }

        let label = invocation.label();
        self.script.log.push(TransportEvent::Invoked {
            host: self.host.clone(),
            label: label.to_string(),
            parameters: invocation.parameters().clone(),
        });

        let (responder, script) = match invocation {
            Invocation::Operation { name, .. } => (self.script.responders.get(name), None),
            Invocation::Script { text, .. } => (self.script.script.as_ref(), Some(text.as_str())),
        };
        let call = ScriptedCall {
            host: &self.host,
            label,
            parameters: invocation.parameters(),
            script,
        };
        match responder {
            Some(responder) => responder(&call),
            None => Ok(OperationResult::failed(format!(
                "The term '{}' is not recognized as a name of a cmdlet, function, script file, or executable program.",
                label
            ))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.script.log.push(TransportEvent::Closed {
            host: self.host.clone(),
        });
        Ok(())
    }
}
