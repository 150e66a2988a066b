//! Server tool indexes
//!
//! Tool descriptions are looked up to give the verifier context for
//! description-poisoning checks. Two indexes exist: tools of servers the
//! client has registered, and tools of servers installed behind the
//! protecting proxy. Registered tools take precedence.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::types::{ServerInfo, VerificationError, VerificationResult};

/// Tool as advertised by an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema: None,
        }
    }
}

/// Which index a server's tools belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolIndex {
    Registered,
    Protected,
}

/// On-disk form: server name -> tools, per index
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    registered: HashMap<String, Vec<ToolDescriptor>>,
    #[serde(default)]
    protected: HashMap<String, Vec<ToolDescriptor>>,
}

/// Registered-server and protected-server tool indexes
#[derive(Debug, Default)]
pub struct ToolRegistry {
    registered: DashMap<String, Vec<ToolDescriptor>>,
    protected: DashMap<String, Vec<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load both indexes from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> VerificationResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            VerificationError::Configuration(format!(
                "Failed to read tool registry {}: {}",
                path.display(),
                e
            ))
        })?;
        let file: RegistryFile = serde_json::from_str(&content).map_err(|e| {
            VerificationError::Configuration(format!("Invalid tool registry: {}", e))
        })?;

        let registry = Self::new();
        for (server, tools) in file.registered {
            registry.set_tools(ToolIndex::Registered, server, tools);
        }
        for (server, tools) in file.protected {
            registry.set_tools(ToolIndex::Protected, server, tools);
        }
        Ok(registry)
    }

    /// Replace the tool list of a server in one index.
    pub fn set_tools(&self, index: ToolIndex, server: impl Into<String>, tools: Vec<ToolDescriptor>) {
        let server = server.into();
        tracing::debug!(server = %server, count = tools.len(), ?index, "Indexed server tools");
        self.index(index).insert(server, tools);
    }

    pub fn remove_server(&self, index: ToolIndex, server: &str) -> bool {
        self.index(index).remove(server).is_some()
    }

    fn index(&self, index: ToolIndex) -> &DashMap<String, Vec<ToolDescriptor>> {
        match index {
            ToolIndex::Registered => &self.registered,
            ToolIndex::Protected => &self.protected,
        }
    }

    fn find(
        index: &DashMap<String, Vec<ToolDescriptor>>,
        server: Option<&str>,
        tool_name: &str,
    ) -> Option<String> {
        match server {
            Some(server) => index.get(server).and_then(|tools| {
                tools
                    .iter()
                    .find(|t| t.name == tool_name)
                    .and_then(|t| t.description.clone())
            }),
            None => index.iter().find_map(|entry| {
                entry
                    .value()
                    .iter()
                    .find(|t| t.name == tool_name)
                    .and_then(|t| t.description.clone())
            }),
        }
    }

    /// Description of a tool: registered servers first, then protected
    /// servers. Without server info any server's tool of that name matches.
    pub fn describe(&self, server_info: Option<&ServerInfo>, tool_name: &str) -> Option<String> {
        let server = server_info
            .map(|info| info.server_name.as_str())
            .filter(|name| !name.is_empty());

        Self::find(&self.registered, server, tool_name)
            .or_else(|| Self::find(&self.protected, server, tool_name))
    }

    pub fn server_count(&self) -> usize {
        self.registered.len() + self.protected.len()
    }
}
