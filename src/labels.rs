//! Resource label constants for runway
//!
//! Every resource runway creates is labelled so that deployments can be
//! discovered, audited, and torn down even when local state is lost.
//!
//! ## Label Schema
//!
//! | Label Key | Description |
//! |-----------|-------------|
//! | `runway-tool` | Static identifier ("runway") |
//! | `runway-deployment` | Deployment name (the naming prefix) |
//! | `runway-created-at` | Creation timestamp (label-safe format) |

/// Label key for tool identification - all runway resources carry this
pub const LABEL_TOOL: &str = "runway-tool";

/// Label value for tool identification
pub const LABEL_TOOL_VALUE: &str = "runway";

/// Label key for the deployment this resource belongs to
pub const LABEL_DEPLOYMENT: &str = "runway-deployment";

/// Label key for creation timestamp
pub const LABEL_CREATED_AT: &str = "runway-created-at";

/// Format a creation timestamp for use as a label value.
///
/// Google Cloud label values only allow lowercase letters, digits, `-` and
/// `_`, so RFC 3339 is flattened to `yyyy-mm-dd_hh-mm-ss`.
pub fn format_created_at(time: chrono::DateTime<chrono::Utc>) -> String {
    time.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Standard labels for a resource created now.
pub fn standard_labels(deployment: &str) -> Vec<(String, String)> {
    vec![
        (LABEL_TOOL.to_string(), LABEL_TOOL_VALUE.to_string()),
        (LABEL_DEPLOYMENT.to_string(), deployment.to_string()),
        (
            LABEL_CREATED_AT.to_string(),
            format_created_at(chrono::Utc::now()),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_at_is_label_safe() {
        let formatted = format_created_at(chrono::Utc::now());
        assert!(formatted
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'));
    }

    #[test]
    fn standard_labels_include_tool_and_deployment() {
        let labels = standard_labels("prod-n8n");
        assert!(labels.contains(&(LABEL_TOOL.into(), LABEL_TOOL_VALUE.into())));
        assert!(labels.contains(&(LABEL_DEPLOYMENT.into(), "prod-n8n".into())));
    }
}
