//! Catalog enrichment
//!
//! The raw catalog file carries path templates and parameter descriptions but
//! may omit platform, entity-type, and parameter type tags. Enrichment fills
//! those in, preferring human-authored tags and falling back to naming
//! heuristics. Heuristic entries are marked low-confidence and logged so a
//! maintainer can author the tags properly.

use super::{ParameterDescriptor, ParameterType, RouteDefinition};
use crate::error::OmniError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A catalog entry as authored, before enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRouteEntry {
    pub id: String,
    pub name: String,
    pub path_template: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
    #[serde(default)]
    pub required_identifiers: Vec<String>,
    pub description: String,
}

/// Infer the platform from the first path segment, e.g.
/// `/bilibili/user/video/:uid` → `bilibili`.
fn infer_platform(path_template: &str) -> Option<String> {
    path_template
        .split('/')
        .find(|seg| !seg.is_empty())
        .filter(|seg| !seg.starts_with(':'))
        .map(|seg| seg.to_string())
}

/// Infer the entity type from parameter-name conventions.
fn infer_entity_type(parameters: &[ParameterDescriptor]) -> Option<String> {
    let names: Vec<&str> = parameters.iter().map(|p| p.name.as_str()).collect();
    if names.contains(&"owner") && names.contains(&"repo") {
        return Some("repo".to_string());
    }
    for name in names {
        match name {
            "uid" | "user_id" | "username" => return Some("user".to_string()),
            "column_id" => return Some("column".to_string()),
            "room_id" => return Some("room".to_string()),
            "channel_id" => return Some("channel".to_string()),
            "keyword" | "query" => return Some("search".to_string()),
            _ => {}
        }
    }
    None
}

/// Infer a parameter's type tag from its name when the author left it out.
fn infer_parameter_type(name: &str) -> ParameterType {
    match name {
        "uid" | "user_id" | "username" | "owner" | "repo" | "column_id" | "room_id"
        | "channel_id" => ParameterType::EntityRef,
        "sort" | "order" | "type" | "category" | "lang" => ParameterType::Enum,
        _ => ParameterType::Literal,
    }
}

/// Enrich one raw entry into a full route definition.
///
/// Human-authored tags always win; heuristics only fill gaps, and any
/// heuristic use marks the definition low-confidence.
pub fn enrich_entry(raw: RawRouteEntry) -> Result<RouteDefinition, OmniError> {
    let mut low_confidence = false;

    let platform = match raw.platform {
        Some(p) if !p.is_empty() => p,
        _ => {
            let inferred = infer_platform(&raw.path_template).ok_or_else(|| {
                OmniError::catalog(format!(
                    "route {}: cannot infer platform from template {}",
                    raw.id, raw.path_template
                ))
            })?;
            debug!(route = %raw.id, platform = %inferred, "inferred platform from path");
            low_confidence = true;
            inferred
        }
    };

    let entity_type = match raw.entity_type {
        Some(e) if !e.is_empty() => e,
        _ => {
            let inferred =
                infer_entity_type(&raw.parameters).unwrap_or_else(|| "feed".to_string());
            debug!(route = %raw.id, entity_type = %inferred, "inferred entity type from parameters");
            low_confidence = true;
            inferred
        }
    };

    let parameters = raw
        .parameters
        .into_iter()
        .map(|mut descriptor| {
            if descriptor.parameter_type.is_none() {
                let inferred = infer_parameter_type(&descriptor.name);
                debug!(
                    route = %raw.id,
                    parameter = %descriptor.name,
                    ?inferred,
                    "inferred parameter type"
                );
                descriptor.parameter_type = Some(inferred);
                low_confidence = true;
            }
            if descriptor.entity_field.is_none()
                && descriptor.parameter_type == Some(ParameterType::EntityRef)
            {
                descriptor.entity_field = Some(descriptor.name.clone());
            }
            descriptor
        })
        .collect();

    let definition = RouteDefinition {
        id: raw.id,
        name: raw.name,
        path_template: raw.path_template,
        platform,
        entity_type,
        parameters,
        required_identifiers: raw.required_identifiers,
        description: raw.description,
        low_confidence,
    };
    if definition.low_confidence {
        warn!(route = %definition.id, "catalog entry enriched heuristically; consider authoring tags");
    }
    definition.validate()?;
    Ok(definition)
}

/// Enrich a whole raw catalog. Entries that fail validation are skipped with
/// a warning rather than poisoning the rebuild.
pub fn enrich_catalog(raw: Vec<RawRouteEntry>) -> Vec<RouteDefinition> {
    let mut enriched = Vec::with_capacity(raw.len());
    for entry in raw {
        let id = entry.id.clone();
        match enrich_entry(entry) {
            Ok(definition) => enriched.push(definition),
            Err(e) => warn!(route = %id, error = %e, "skipping invalid catalog entry"),
        }
    }
    enriched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_entry() -> RawRouteEntry {
        RawRouteEntry {
            id: "bilibili-user-video".to_string(),
            name: "Bilibili user uploads".to_string(),
            path_template: "/bilibili/user/video/:uid".to_string(),
            platform: None,
            entity_type: None,
            parameters: vec![ParameterDescriptor {
                name: "uid".to_string(),
                description: "Numeric user id".to_string(),
                example: None,
                parameter_type: None,
                entity_field: None,
                required: true,
            }],
            required_identifiers: vec!["uid".to_string()],
            description: "Latest uploads".to_string(),
        }
    }

    #[test]
    fn test_infers_platform_from_first_segment() {
        let definition = enrich_entry(raw_entry()).unwrap();
        assert_eq!(definition.platform, "bilibili");
        assert!(definition.low_confidence);
    }

    #[test]
    fn test_uid_implies_user_entity() {
        let definition = enrich_entry(raw_entry()).unwrap();
        assert_eq!(definition.entity_type, "user");
    }

    #[test]
    fn test_owner_repo_implies_repo_entity() {
        let mut raw = raw_entry();
        raw.path_template = "/github/issue/:owner/:repo".to_string();
        raw.parameters = ["owner", "repo"]
            .iter()
            .map(|n| ParameterDescriptor {
                name: n.to_string(),
                description: String::new(),
                example: None,
                parameter_type: None,
                entity_field: None,
                required: true,
            })
            .collect();
        raw.required_identifiers = vec!["owner".to_string(), "repo".to_string()];
        let definition = enrich_entry(raw).unwrap();
        assert_eq!(definition.entity_type, "repo");
    }

    #[test]
    fn test_column_id_implies_column_entity() {
        let mut raw = raw_entry();
        raw.path_template = "/zhihu/zhuanlan/:column_id".to_string();
        raw.parameters[0].name = "column_id".to_string();
        raw.required_identifiers = vec!["column_id".to_string()];
        let definition = enrich_entry(raw).unwrap();
        assert_eq!(definition.entity_type, "column");
    }

    #[test]
    fn test_human_authored_tags_win() {
        let mut raw = raw_entry();
        raw.platform = Some("bili".to_string());
        raw.entity_type = Some("uploader".to_string());
        raw.parameters[0].parameter_type = Some(ParameterType::EntityRef);
        let definition = enrich_entry(raw).unwrap();
        assert_eq!(definition.platform, "bili");
        assert_eq!(definition.entity_type, "uploader");
        assert!(!definition.low_confidence);
    }

    #[test]
    fn test_entity_field_defaults_to_name() {
        let definition = enrich_entry(raw_entry()).unwrap();
        assert_eq!(
            definition.parameters[0].entity_field.as_deref(),
            Some("uid")
        );
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let mut bad = raw_entry();
        bad.parameters.clear(); // leaves :uid slot undescribed
        let enriched = enrich_catalog(vec![bad, raw_entry()]);
        assert_eq!(enriched.len(), 1);
    }
}
