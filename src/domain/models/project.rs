//! Reusable project descriptors referenced when creating tasks.
//!
//! Projects are read-only input to the engine: the control surface resolves
//! them into per-task attachments at creation time and never writes back.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::task::{ProjectAccess, ProjectAttachment};

/// Broad classification of a project, used by front-ends for display and
/// default tooling; the engine treats it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectKind {
    Rpc,
    Web,
    Idl,
    Sdk,
    Other,
}

impl Default for ProjectKind {
    fn default() -> Self {
        Self::Other
    }
}

/// A reusable workspace descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    /// One or more checkout roots
    pub paths: Vec<String>,
    pub default_branch: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: ProjectKind,
    /// Opaque configuration bag, preserved verbatim
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

impl ProjectSpec {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            paths: vec![path.into()],
            default_branch: None,
            kind: ProjectKind::default(),
            config: HashMap::new(),
        }
    }

    /// Primary checkout root.
    pub fn primary_path(&self) -> Option<&str> {
        self.paths.first().map(String::as_str)
    }

    /// Resolve this descriptor into a per-task attachment. `None` when the
    /// descriptor has no checkout root.
    pub fn to_attachment(&self, access: ProjectAccess) -> Option<ProjectAttachment> {
        let path = self.primary_path()?.to_string();
        let context = self
            .config
            .get("context")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Some(ProjectAttachment {
            name: self.name.clone(),
            path,
            access,
            context,
            extra: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_defaults_to_other() {
        let spec: ProjectSpec =
            serde_json::from_str(r#"{"name":"api","paths":["/repo/api"]}"#).unwrap();
        assert_eq!(spec.kind, ProjectKind::Other);
        assert_eq!(spec.primary_path(), Some("/repo/api"));
    }

    #[test]
    fn test_config_bag_preserved() {
        let json = r#"{"name":"api","paths":["/r"],"type":"sdk","config":{"lang":"rust"}}"#;
        let spec: ProjectSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kind, ProjectKind::Sdk);
        assert_eq!(spec.config.get("lang").unwrap(), "rust");
    }

    #[test]
    fn test_to_attachment() {
        let json =
            r#"{"name":"api","paths":["/repo/api"],"config":{"context":"REST backend"}}"#;
        let spec: ProjectSpec = serde_json::from_str(json).unwrap();
        let attachment = spec.to_attachment(ProjectAccess::Write).unwrap();
        assert_eq!(attachment.name, "api");
        assert_eq!(attachment.path, "/repo/api");
        assert_eq!(attachment.context.as_deref(), Some("REST backend"));

        let empty = ProjectSpec {
            paths: Vec::new(),
            ..spec
        };
        assert!(empty.to_attachment(ProjectAccess::Read).is_none());
    }
}
