//! Named operations, their parameters and their results
//!
//! The operation library is the only executable surface a session exposes.
//! Callers name an operation and hand over a typed parameter set; values are
//! marshalled as JSON and bound to the operation's parameters on the far side,
//! never spliced into script text.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Marker line every library file must carry
pub const LIBRARY_VERSION_MARKER: &str = "# operation-library-version:";

/// Parameter set for one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, Value>);

impl Parameters {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Set a parameter only when a value is present
    pub fn set_opt<V: Into<Value>>(&mut self, name: impl Into<String>, value: Option<V>) -> &mut Self {
        if let Some(value) = value {
            self.set(name, value);
        }
        self
    }

    /// Builder-style [`Parameters::set`]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Look up a parameter
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Look up a string parameter
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over parameters in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// What the host is asked to run
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// A function from the operation library
    Operation {
        /// Library function name
        name: String,
        /// Bound parameters
        parameters: Parameters,
    },
    /// Ad hoc script text with bound parameters
    Script {
        /// Script body; must declare a `param()` block for its parameters
        text: String,
        /// Bound parameters
        parameters: Parameters,
    },
}

impl Invocation {
    /// Label used in logs and errors
    pub fn label(&self) -> &str {
        match self {
            Invocation::Operation { name, .. } => name,
            Invocation::Script { .. } => "<script>",
        }
    }

    /// Parameters bound to this invocation
    pub fn parameters(&self) -> &Parameters {
        match self {
            Invocation::Operation { parameters, .. } | Invocation::Script { parameters, .. } => {
                parameters
            }
        }
    }
}

/// A typed entry in the operation library
pub trait RemoteOperation: Send + Sync {
    /// Record type produced by the operation
    type Output: DeserializeOwned + Send;

    /// Library function name
    const NAME: &'static str;

    /// Parameter set for this call
    fn parameters(&self) -> Parameters;

    /// Build the invocation for this call
    fn invocation(&self) -> Invocation {
        Invocation::Operation {
            name: Self::NAME.to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Records and error-channel output of one invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationResult {
    /// Records in output order
    pub records: Vec<Value>,
    /// Whether anything was written to the error channel
    pub had_errors: bool,
    /// Error-channel output joined by newlines
    pub error_text: Option<String>,
}

impl OperationResult {
    /// A successful result
    pub fn from_records(records: Vec<Value>) -> Self {
        Self {
            records,
            had_errors: false,
            error_text: None,
        }
    }

    /// Build a result from records plus raw error-channel lines
    pub fn new(records: Vec<Value>, errors: Vec<String>) -> Self {
        let errors: Vec<String> = errors
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if errors.is_empty() {
            Self::from_records(records)
        } else {
            Self {
                records,
                had_errors: true,
                error_text: Some(errors.join("\n")),
            }
        }
    }

    /// A result that only carries error text
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Vec::new(), vec![message.into()])
    }

    /// Turn error-channel output into an aggregated operation error
    pub fn into_checked(self, operation: &str) -> Result<Self> {
        if self.had_errors {
            let message = self
                .error_text
                .unwrap_or_else(|| "operation reported errors".to_string());
            return Err(Error::operation(operation, message));
        }
        Ok(self)
    }

    /// Validate and decode the records; refuses results that had errors
    pub fn decode<T: DeserializeOwned>(self, operation: &str) -> Result<Vec<T>> {
        let checked = self.into_checked(operation)?;
        checked
            .records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                serde_json::from_value(record).map_err(|e| Error::Decode {
                    operation: operation.to_string(),
                    reason: format!("record {}: {}", index, e),
                })
            })
            .collect()
    }
}

/// The fixed library of named operations loaded into every session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationLibrary {
    path: PathBuf,
    version: String,
    contents: String,
}

impl OperationLibrary {
    /// Locate and load the library, checking its version marker
    pub fn load(path: impl AsRef<Path>, expected_version: &str) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |reason: String| Error::LibraryUnavailable {
            path: path.display().to_string(),
            reason,
        };

        let contents = std::fs::read_to_string(path).map_err(|e| unavailable(e.to_string()))?;
        Self::from_source(path, contents, expected_version).map_err(|e| match e {
            Error::LibraryUnavailable { reason, .. } => unavailable(reason),
            other => other,
        })
    }

    /// Build a library from in-memory source (the path is informational)
    pub fn from_source(
        path: impl Into<PathBuf>,
        contents: impl Into<String>,
        expected_version: &str,
    ) -> Result<Self> {
        let path = path.into();
        let contents = contents.into();
        let version = contents
            .lines()
            .find_map(|line| line.trim().strip_prefix(LIBRARY_VERSION_MARKER))
            .map(|v| v.trim().to_string())
            .ok_or_else(|| Error::LibraryUnavailable {
                path: path.display().to_string(),
                reason: "missing version marker".to_string(),
            })?;

        if version != expected_version {
            return Err(Error::LibraryUnavailable {
                path: path.display().to_string(),
                reason: format!("version {} found, {} required", version, expected_version),
            });
        }

        Ok(Self {
            path,
            version,
            contents,
        })
    }

    /// Where the library was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Library version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Library source text
    pub fn contents(&self) -> &str {
        &self.contents
    }
}
