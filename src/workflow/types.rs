/// Workflow definitions mirrored from the remote engine
///
/// Rows are written by the metadata sync layer; the scheduling core only reads
/// them to resolve the remote id and check the input/output wiring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Local workflow identifier (e.g., "wf-daily-report")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Identifier of the flow on the remote engine
    pub remote_id: String,
    /// Component receiving the task input; required to run
    pub input_component: Option<String>,
    /// Component producing the task output; required to run
    pub output_component: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        remote_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            remote_id: remote_id.into(),
            input_component: None,
            output_component: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach input/output components
    pub fn with_components(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input_component = Some(input.into());
        self.output_component = Some(output.into());
        self
    }

    /// Name of the first missing side of the wiring, if any
    pub fn missing_component(&self) -> Option<&'static str> {
        if self.input_component.as_deref().map_or(true, str::is_empty) {
            Some("input")
        } else if self.output_component.as_deref().map_or(true, str::is_empty) {
            Some("output")
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiring_requires_both_components() {
        let now = Utc::now();
        let bare = Workflow::new("wf-1", "Report", "remote-1", now);
        assert_eq!(bare.missing_component(), Some("input"));

        let mut half = bare.clone();
        half.input_component = Some("ChatInput-1".to_string());
        assert_eq!(half.missing_component(), Some("output"));

        let wired = bare.with_components("ChatInput-1", "ChatOutput-1");
        assert_eq!(wired.missing_component(), None);
    }
}
