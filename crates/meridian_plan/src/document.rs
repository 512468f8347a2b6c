//! Declared stack documents.
//!
//! A stack document is the JSON form of a desired state:
//!
//! ```json
//! { "stack": "ecs-cloudmap",
//!   "resources": [ { "id": "vpc", "kind": "network" } ] }
//! ```

use crate::error::GraphError;
use crate::graph::Graph;
use meridian_core::{ResourceNode, StackId};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Error loading a stack document
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Document path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Document is not valid JSON for a stack
    #[error("Failed to parse stack document: {0}")]
    Parse(#[from] serde_json::Error),

    /// Document parsed but its graph is invalid
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A declared stack: identity plus the desired resource set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDocument {
    /// Stack identity, keys persisted state
    pub stack: StackId,
    /// Declared resources, in any order
    #[serde(default)]
    pub resources: Vec<ResourceNode>,
}

impl StackDocument {
    /// Create a document
    #[must_use]
    pub fn new(stack: StackId, resources: Vec<ResourceNode>) -> Self {
        Self { stack, resources }
    }

    /// Parse from a JSON string
    ///
    /// # Errors
    ///
    /// Returns error if the JSON does not describe a stack
    pub fn from_json_str(json: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Build the dependency graph of the declared resources
    ///
    /// # Errors
    ///
    /// Returns error if references dangle, ids repeat or a cycle exists
    pub fn to_graph(&self) -> Result<Graph, DocumentError> {
        Ok(Graph::build(self.resources.iter().cloned())?)
    }
}
