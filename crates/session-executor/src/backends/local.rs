//! In-process execution on the orchestrating machine

use super::HostTarget;
use crate::host::HostInit;

/// Runs operations inside the host process itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    name: String,
}

impl LocalTarget {
    /// Create a local target; `name` is only used for logs
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl HostTarget for LocalTarget {
    fn host_name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        format!("local://{}", self.name)
    }

    fn is_local(&self) -> bool {
        true
    }

    fn init<'a>(&'a self, library: &'a str) -> HostInit<'a> {
        HostInit::local(library)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_init_has_no_connection_fields() {
        let target = LocalTarget::new("web01");
        let init = serde_json::to_value(target.init("lib")).unwrap();
        assert_eq!(init["mode"], "local");
        assert!(init.get("computer").is_none());
        assert!(init.get("password").is_none());
    }
}
