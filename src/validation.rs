//! Ingress validation
//!
//! Structural checks applied ahead of the rate-limit gate, on both the
//! admin HTTP path and the session handshake. Task descriptions and
//! metadata are opaque to the core, so validation is shape and size
//! only; ill-typed payloads never reach a component actor.

use regex::Regex;

use crate::models::SubmitTaskParams;
use crate::{HubError, Result};

/// Size ceiling for a task description.
pub const MAX_DESCRIPTION_LENGTH: usize = 16_384;
/// Ceiling on distinct metadata keys per task.
pub const MAX_METADATA_ENTRIES: usize = 64;
/// Ceiling on the serialized size of a single metadata value.
pub const MAX_METADATA_VALUE_LENGTH: usize = 4_096;
/// Ceiling on capability tags per task or agent.
pub const MAX_CAPABILITY_TAGS: usize = 32;

static AGENT_ID_PATTERN: &str = r"^[a-zA-Z0-9][a-zA-Z0-9._-]{0,63}$";
static CAPABILITY_PATTERN: &str = r"^[a-z][a-z0-9_-]{0,31}$";

#[derive(Debug, Clone)]
pub struct IngressValidator {
    agent_id_regex: Regex,
    capability_regex: Regex,
}

impl IngressValidator {
    pub fn new() -> Result<Self> {
        let agent_id_regex = Regex::new(AGENT_ID_PATTERN)
            .map_err(|e| HubError::Configuration(format!("invalid agent id pattern: {e}")))?;
        let capability_regex = Regex::new(CAPABILITY_PATTERN)
            .map_err(|e| HubError::Configuration(format!("invalid capability pattern: {e}")))?;
        Ok(Self {
            agent_id_regex,
            capability_regex,
        })
    }

    pub fn validate_agent_id(&self, agent_id: &str) -> Result<()> {
        if self.agent_id_regex.is_match(agent_id) {
            Ok(())
        } else {
            Err(HubError::InvalidArgs(format!(
                "agent id must match {AGENT_ID_PATTERN}"
            )))
        }
    }

    pub fn validate_capability(&self, tag: &str) -> Result<()> {
        if self.capability_regex.is_match(tag) {
            Ok(())
        } else {
            Err(HubError::InvalidArgs(format!(
                "capability tag {tag:?} must match {CAPABILITY_PATTERN}"
            )))
        }
    }

    pub fn validate_capabilities<'a>(
        &self,
        tags: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        let mut count = 0;
        for tag in tags {
            self.validate_capability(tag)?;
            count += 1;
        }
        if count > MAX_CAPABILITY_TAGS {
            return Err(HubError::InvalidArgs(format!(
                "at most {MAX_CAPABILITY_TAGS} capability tags allowed"
            )));
        }
        Ok(())
    }

    /// Full structural check for a task submission.
    pub fn validate_submit(&self, params: &SubmitTaskParams) -> Result<()> {
        let description = params.description.trim();
        if description.is_empty() {
            return Err(HubError::InvalidArgs("description is required".to_string()));
        }
        if description.len() > MAX_DESCRIPTION_LENGTH {
            return Err(HubError::InvalidArgs(format!(
                "description exceeds {MAX_DESCRIPTION_LENGTH} bytes"
            )));
        }
        self.validate_capabilities(&params.needed_capabilities)?;

        if params.metadata.len() > MAX_METADATA_ENTRIES {
            return Err(HubError::InvalidArgs(format!(
                "at most {MAX_METADATA_ENTRIES} metadata entries allowed"
            )));
        }
        for (key, value) in &params.metadata {
            if key.is_empty() || key.len() > 128 {
                return Err(HubError::InvalidArgs(format!(
                    "metadata key {key:?} must be 1..=128 bytes"
                )));
            }
            let serialized = serde_json::to_string(value)?;
            if serialized.len() > MAX_METADATA_VALUE_LENGTH {
                return Err(HubError::InvalidArgs(format!(
                    "metadata value for {key:?} exceeds {MAX_METADATA_VALUE_LENGTH} bytes"
                )));
            }
        }
        Ok(())
    }
}
