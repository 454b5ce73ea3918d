//! Route catalog: enriched tool definitions for the backend feed service
//!
//! A route definition describes one backend endpoint: its path template with
//! colon-prefixed parameter slots, platform/entity-type metadata, and typed
//! parameter descriptors. Definitions are produced by an enrichment step over
//! a raw catalog file, snapshotted into the vector store, and replaced
//! atomically on re-index. Consumers read platform and entity-type from the
//! metadata, never by re-parsing the path template.

use crate::error::OmniError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod enrich;
pub mod store;

pub use enrich::{enrich_catalog, RawRouteEntry};
pub use store::CatalogStore;

/// How a parameter's value should be interpreted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    /// The value may be a human-friendly name requiring resolution to an
    /// identifier through the subscription index.
    EntityRef,
    /// The value is used verbatim.
    Literal,
    /// The value must be one of a fixed set; used verbatim.
    Enum,
}

/// Descriptor for one slot in a route's path template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    /// Slot name as it appears in the template (without the colon)
    pub name: String,
    /// Human-readable description shown to the extraction model
    pub description: String,
    /// Example value shown to the extraction model
    #[serde(default)]
    pub example: Option<String>,
    /// Type tag; absent tags trigger the resolver's fallback heuristic
    #[serde(default)]
    pub parameter_type: Option<ParameterType>,
    /// Key under which a subscription stores this parameter's identifier
    #[serde(default)]
    pub entity_field: Option<String>,
    /// Whether the slot must be filled for the route to execute
    #[serde(default)]
    pub required: bool,
}

/// An immutable record describing one backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Stable identifier, unique across the catalog
    pub id: String,
    /// Display name
    pub name: String,
    /// Path template with colon-prefixed slots, e.g. `/bilibili/user/video/:uid`
    pub path_template: String,
    /// Platform tag, e.g. "bilibili"
    pub platform: String,
    /// Entity-type tag, e.g. "user"
    pub entity_type: String,
    /// Parameter descriptors, one per template slot
    pub parameters: Vec<ParameterDescriptor>,
    /// Names of parameters that must be authentic identifiers before a path
    /// may be generated
    #[serde(default)]
    pub required_identifiers: Vec<String>,
    /// Free-text description used for retrieval
    pub description: String,
    /// Set when platform/entity-type were inferred heuristically rather than
    /// human-authored
    #[serde(default)]
    pub low_confidence: bool,
}

impl RouteDefinition {
    /// Extract the slot names from a path template, in order of appearance.
    pub fn template_slots(template: &str) -> Vec<String> {
        template
            .split('/')
            .filter_map(|seg| seg.strip_prefix(':'))
            .map(|s| s.to_string())
            .collect()
    }

    /// Verify the definition's invariants:
    /// every template slot has a descriptor, required identifiers are a
    /// subset of descriptor names, and both tags are non-empty.
    pub fn validate(&self) -> Result<(), OmniError> {
        if self.platform.is_empty() {
            return Err(OmniError::catalog(format!("route {}: empty platform", self.id)));
        }
        if self.entity_type.is_empty() {
            return Err(OmniError::catalog(format!(
                "route {}: empty entity_type",
                self.id
            )));
        }
        let descriptor_names: Vec<&str> =
            self.parameters.iter().map(|p| p.name.as_str()).collect();
        for slot in Self::template_slots(&self.path_template) {
            if !descriptor_names.contains(&slot.as_str()) {
                return Err(OmniError::catalog(format!(
                    "route {}: template slot :{} has no parameter descriptor",
                    self.id, slot
                )));
            }
        }
        for required in &self.required_identifiers {
            if !descriptor_names.contains(&required.as_str()) {
                return Err(OmniError::catalog(format!(
                    "route {}: required identifier {} is not a declared parameter",
                    self.id, required
                )));
            }
        }
        Ok(())
    }

    /// Fill the path template with parameter values. Fails if any slot is
    /// left without a value; a generated path never contains a placeholder.
    pub fn fill_path(&self, values: &IndexMap<String, String>) -> Result<String, OmniError> {
        let mut segments = Vec::new();
        for seg in self.path_template.split('/') {
            match seg.strip_prefix(':') {
                Some(slot) => {
                    let value = values.get(slot).ok_or_else(|| {
                        OmniError::catalog(format!(
                            "route {}: no value for template slot :{}",
                            self.id, slot
                        ))
                    })?;
                    segments.push(value.clone());
                }
                None => segments.push(seg.to_string()),
            }
        }
        Ok(segments.join("/"))
    }

    /// Look up a parameter descriptor by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterDescriptor> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Serialize this definition for an LLM prompt, truncated to at most
    /// `budget` characters.
    pub fn to_prompt_json(&self, budget: usize) -> String {
        let mut json = serde_json::json!({
            "id": self.id,
            "name": self.name,
            "path_template": self.path_template,
            "platform": self.platform,
            "entity_type": self.entity_type,
            "description": self.description,
            "parameters": self.parameters,
            "required_identifiers": self.required_identifiers,
        })
        .to_string();
        if json.len() > budget {
            json.truncate(budget);
        }
        json
    }
}

#[cfg(test)]
pub(crate) fn test_route() -> RouteDefinition {
    RouteDefinition {
        id: "bilibili-user-video".to_string(),
        name: "Bilibili user uploads".to_string(),
        path_template: "/bilibili/user/video/:uid".to_string(),
        platform: "bilibili".to_string(),
        entity_type: "user".to_string(),
        parameters: vec![ParameterDescriptor {
            name: "uid".to_string(),
            description: "Numeric user id".to_string(),
            example: Some("1566847".to_string()),
            parameter_type: Some(ParameterType::EntityRef),
            entity_field: Some("uid".to_string()),
            required: true,
        }],
        required_identifiers: vec!["uid".to_string()],
        description: "Latest video uploads of a bilibili user".to_string(),
        low_confidence: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_slots() {
        assert_eq!(
            RouteDefinition::template_slots("/github/issue/:owner/:repo"),
            vec!["owner", "repo"]
        );
        assert!(RouteDefinition::template_slots("/static/path").is_empty());
    }

    #[test]
    fn test_validate_accepts_well_formed_route() {
        assert!(test_route().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_undeclared_slot() {
        let mut route = test_route();
        route.path_template = "/bilibili/user/video/:uid/:extra".to_string();
        assert!(route.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_required_identifier() {
        let mut route = test_route();
        route.required_identifiers.push("missing".to_string());
        assert!(route.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_platform() {
        let mut route = test_route();
        route.platform.clear();
        assert!(route.validate().is_err());
    }

    #[test]
    fn test_fill_path() {
        let route = test_route();
        let mut values = IndexMap::new();
        values.insert("uid".to_string(), "1566847".to_string());
        assert_eq!(
            route.fill_path(&values).unwrap(),
            "/bilibili/user/video/1566847"
        );
    }

    #[test]
    fn test_fill_path_refuses_missing_slot() {
        let route = test_route();
        assert!(route.fill_path(&IndexMap::new()).is_err());
    }

    #[test]
    fn test_prompt_json_respects_budget() {
        let route = test_route();
        let json = route.to_prompt_json(50);
        assert!(json.len() <= 50);
    }
}
