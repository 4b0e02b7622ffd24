//! Pipeline exchange document.
//!
//! The portable form of a pipeline used for backup, import and export. It is
//! versioned so that readers can reject documents written by a newer format,
//! and it carries a content checksum for change detection under version
//! control.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::pipeline::{PipelineDefinition, Step, Visibility};

/// Current document format version
pub const FORMAT_VERSION: u32 = 1;

/// Serialized pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDocument {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub owner_id: String,
    #[serde(default)]
    pub visibility: Visibility,
    pub steps: Vec<Step>,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl PipelineDocument {
    /// Build a document; steps are written in execution order
    pub fn from_definition(pipeline: &PipelineDefinition) -> Self {
        let mut steps = pipeline.steps.clone();
        steps.sort_by_key(|s| s.order);

        Self {
            format_version: FORMAT_VERSION,
            id: pipeline.id.clone(),
            name: pipeline.name.clone(),
            description: pipeline.description.clone(),
            tags: pipeline.tags.clone(),
            owner_id: pipeline.owner_id.clone(),
            visibility: pipeline.visibility,
            steps,
        }
    }

    /// Convert back into a definition, checking the format version
    pub fn into_definition(self) -> Result<PipelineDefinition> {
        if self.format_version > FORMAT_VERSION {
            anyhow::bail!(
                "Unsupported document format version {} (max {})",
                self.format_version,
                FORMAT_VERSION
            );
        }

        let pipeline = PipelineDefinition {
            id: self.id,
            name: self.name,
            description: self.description,
            tags: self.tags,
            owner_id: self.owner_id,
            visibility: self.visibility,
            steps: self.steps,
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize pipeline document")
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline document YAML")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize pipeline document")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse pipeline document JSON")
    }

    /// Parse either format, trying JSON first
    pub fn parse(content: &str) -> Result<Self> {
        Self::from_json(content).or_else(|_| Self::from_yaml(content))
    }

    /// SHA-256 of the canonical JSON encoding
    pub fn checksum(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self).context("Failed to serialize pipeline document")?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}
