//! Agent Documents - `kind: Agent` definitions
//!
//! Agent implementations live outside the engine. These documents only
//! describe them, which is enough to bind mock agents for dry runs.

use serde::Deserialize;

use crate::error::MaestroError;
use crate::util::API_VERSION_PREFIX;

use super::workflow::Metadata;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDoc {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: AgentDocSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentDocSpec {
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl AgentDoc {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Parse a (possibly multi-document) agent definitions file
pub fn parse_agent_docs(yaml: &str) -> Result<Vec<AgentDoc>, MaestroError> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let doc = AgentDoc::deserialize(document)?;
        if !doc.api_version.starts_with(API_VERSION_PREFIX) {
            return Err(MaestroError::InvalidApiVersion {
                version: doc.api_version,
            });
        }
        if doc.kind != "Agent" {
            return Err(MaestroError::InvalidDocument {
                reason: format!(
                    "expected kind 'Agent' for '{}', got '{}'",
                    doc.metadata.name, doc.kind
                ),
            });
        }
        docs.push(doc);
    }
    Ok(docs)
}
