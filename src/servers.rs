use std::collections::HashMap;

use crate::error::{Result, ScmError};

/// Placeholder in a prefix template replaced by the resource module name
pub const MODULE_PLACEHOLDER: &str = "{module}";

/// Known API hosts and their path roots
pub const DEFAULT_SERVERS: &[(&str, &str)] = &[
    ("api.sase.paloaltonetworks.com", "/sse/config/v1"),
    ("api.strata.paloaltonetworks.com", "/config/{module}/v1"),
];

/// ServerTable maps API hostnames to the path prefix their resources live under.
///
/// One table is owned by the client and shared by every resource service.
#[derive(Debug, Clone)]
pub struct ServerTable {
    prefixes: HashMap<String, String>,
}

impl ServerTable {
    /// An empty table; every host is unknown
    pub fn empty() -> Self {
        ServerTable {
            prefixes: HashMap::new(),
        }
    }

    /// Register (or replace) the prefix template for `host`
    pub fn insert(&mut self, host: impl Into<String>, prefix: impl Into<String>) -> Option<String> {
        self.prefixes
            .insert(host.into().to_ascii_lowercase(), prefix.into())
    }

    /// Builder-style [`ServerTable::insert`]
    pub fn with(mut self, host: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.insert(host, prefix);
        self
    }

    pub fn contains(&self, host: &str) -> bool {
        self.prefixes.contains_key(&host.to_ascii_lowercase())
    }

    /// Path prefix for `module` on `host`, without a trailing slash
    pub fn resolve(&self, host: &str, module: &str) -> Result<String> {
        let template = self
            .prefixes
            .get(&host.to_ascii_lowercase())
            .ok_or_else(|| ScmError::UnknownHost(host.to_string()))?;
        let prefix = template.replace(MODULE_PLACEHOLDER, module);
        Ok(prefix.trim_end_matches('/').to_string())
    }
}

impl Default for ServerTable {
    fn default() -> Self {
        let mut table = ServerTable::empty();
        for (host, prefix) in DEFAULT_SERVERS {
            table.insert(*host, *prefix);
        }
        table
    }
}
