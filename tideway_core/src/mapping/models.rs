use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::Error;

/// A leaf of the mapping tree: either a raw query expression or a structured
/// filter rule. Tagged so the partition recursion is exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingLeaf {
    Filter(FilterRule),
    Expr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    And,
    Or,
}

/// A boolean combinator over a list of rules, each rule possibly nesting
/// another combinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub combinator: Combinator,
    pub rules: Vec<FilterNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    Nested(FilterRule),
    Condition(FilterCondition),
}

/// One comparison inside a filter rule. `value` is a query expression
/// resolved against the same document as the rest of the mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub property: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Declarative mapping from a raw item to a normalized entity.
///
/// Built once per sync configuration, read-only thereafter. Leaves are query
/// expressions (or filter rules); interior structure is fixed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<MappingLeaf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<MappingLeaf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<MappingLeaf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<MappingLeaf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<MappingLeaf>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, MappingLeaf>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub relations: HashMap<String, MappingLeaf>,
}

impl ResourceMapping {
    pub fn is_empty(&self) -> bool {
        self.identifier.is_none()
            && self.blueprint.is_none()
            && self.title.is_none()
            && self.icon.is_none()
            && self.team.is_none()
            && self.properties.is_empty()
            && self.relations.is_empty()
    }

    /// Every (field path, leaf) pair in the tree, for validation and
    /// partition-totality checks.
    pub fn leaves(&self) -> Vec<(String, &MappingLeaf)> {
        let mut out = Vec::new();
        for (name, leaf) in [
            ("identifier", &self.identifier),
            ("blueprint", &self.blueprint),
            ("title", &self.title),
            ("icon", &self.icon),
            ("team", &self.team),
        ] {
            if let Some(leaf) = leaf {
                out.push((name.to_string(), leaf));
            }
        }
        for (key, leaf) in &self.properties {
            out.push((format!("properties.{key}"), leaf));
        }
        for (key, leaf) in &self.relations {
            out.push((format!("relations.{key}"), leaf));
        }
        out
    }
}

/// The normalized output of evaluating a mapping against one raw item.
/// Ephemeral: constructed per batch, not retained by this core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub identifier: serde_json::Value,
    pub blueprint: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub relations: HashMap<String, serde_json::Value>,
}

/// Per-batch outcome: entities partitioned by the selector, plus
/// misconfiguration diagnostics.
#[derive(Debug, Default)]
pub struct CalculationResult {
    /// Entities whose selector evaluated true, in input item order.
    pub passed: Vec<Entity>,
    /// Entities whose selector evaluated false (or errored), in input order.
    pub failed: Vec<Entity>,
    /// Field paths whose value came back empty/null/erroring for at least one
    /// item, mapped to the original expression.
    pub misconfigured: BTreeMap<String, String>,
    /// Per-item evaluation errors. Never abort the batch.
    pub errors: Vec<Error>,
    /// Representative raw items for the misconfigured fields, bounded by the
    /// evaluator's configured example count.
    pub examples: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mapping_deserializes_expression_and_filter_leaves() {
        let raw = json!({
            "identifier": ".item.id",
            "blueprint": "\"service\"",
            "properties": {
                "tag": "\"static\"",
                "owner": {
                    "combinator": "and",
                    "rules": [
                        { "property": "name", "operator": "=", "value": ".item.owner" },
                        {
                            "combinator": "or",
                            "rules": [
                                { "property": "team", "operator": "in", "value": ".teams" }
                            ]
                        }
                    ]
                }
            }
        });

        let mapping: ResourceMapping = serde_json::from_value(raw).unwrap();
        assert_eq!(
            mapping.identifier,
            Some(MappingLeaf::Expr(".item.id".to_string()))
        );
        match mapping.properties.get("owner") {
            Some(MappingLeaf::Filter(rule)) => {
                assert_eq!(rule.combinator, Combinator::And);
                assert_eq!(rule.rules.len(), 2);
                assert!(matches!(rule.rules[1], FilterNode::Nested(_)));
            }
            other => panic!("expected filter leaf, got {other:?}"),
        }
    }

    #[test]
    fn leaves_enumerates_every_field_path() {
        let mapping: ResourceMapping = serde_json::from_value(json!({
            "identifier": ".item.id",
            "title": ".item.name",
            "properties": { "tag": "\"x\"" },
            "relations": { "owner": ".item.owner" }
        }))
        .unwrap();

        let mut paths: Vec<String> = mapping.leaves().into_iter().map(|(p, _)| p).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["identifier", "properties.tag", "relations.owner", "title"]
        );
    }
}
