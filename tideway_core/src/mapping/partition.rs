//! Three-way partition of a mapping by evaluation class.
//!
//! Computed once per mapping definition and reused for every batch processed
//! under it; it depends only on the mapping's static text, never on data.

use crate::mapping::models::{FilterNode, FilterRule, MappingLeaf, ResourceMapping};
use crate::query::classify::{classify, EvaluationClass};

/// The same mapping tree shape split into disjoint class-specific trees.
/// Every leaf of the input appears in exactly one of the three.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionedMapping {
    pub single: ResourceMapping,
    pub all: ResourceMapping,
    pub none: ResourceMapping,
}

impl PartitionedMapping {
    fn tree_mut(&mut self, class: EvaluationClass) -> &mut ResourceMapping {
        match class {
            EvaluationClass::Single => &mut self.single,
            EvaluationClass::All => &mut self.all,
            EvaluationClass::None => &mut self.none,
        }
    }
}

/// Split `mapping` into single/all/none trees relative to `bound_name`.
#[tracing::instrument(level = "debug", skip(mapping))]
pub fn partition(mapping: &ResourceMapping, bound_name: &str) -> PartitionedMapping {
    let mut out = PartitionedMapping::default();

    {
        let scalars: [(&Option<MappingLeaf>, fn(&mut ResourceMapping) -> &mut Option<MappingLeaf>); 5] = [
            (&mapping.identifier, |m| &mut m.identifier),
            (&mapping.blueprint, |m| &mut m.blueprint),
            (&mapping.title, |m| &mut m.title),
            (&mapping.icon, |m| &mut m.icon),
            (&mapping.team, |m| &mut m.team),
        ];
        for (leaf, slot) in scalars {
            if let Some(leaf) = leaf {
                let class = classify_leaf(leaf, bound_name);
                *slot(out.tree_mut(class)) = Some(leaf.clone());
            }
        }
    }

    for (key, leaf) in &mapping.properties {
        let class = classify_leaf(leaf, bound_name);
        out.tree_mut(class)
            .properties
            .insert(key.clone(), leaf.clone());
    }
    for (key, leaf) in &mapping.relations {
        let class = classify_leaf(leaf, bound_name);
        out.tree_mut(class)
            .relations
            .insert(key.clone(), leaf.clone());
    }

    out
}

/// Classify one leaf. A filter rule is classified as a whole and placed
/// whole, never split field-by-field.
pub fn classify_leaf(leaf: &MappingLeaf, bound_name: &str) -> EvaluationClass {
    match leaf {
        MappingLeaf::Expr(expr) => classify(expr, Some(bound_name)),
        MappingLeaf::Filter(rule) => classify_filter(rule, bound_name),
    }
}

fn classify_filter(rule: &FilterRule, bound_name: &str) -> EvaluationClass {
    let mut saw_data_access = false;
    if filter_has_single(rule, bound_name, &mut saw_data_access) {
        EvaluationClass::Single
    } else if saw_data_access {
        EvaluationClass::All
    } else {
        EvaluationClass::None
    }
}

fn filter_has_single(rule: &FilterRule, bound_name: &str, saw_data_access: &mut bool) -> bool {
    for node in &rule.rules {
        match node {
            FilterNode::Nested(inner) => {
                if filter_has_single(inner, bound_name, saw_data_access) {
                    return true;
                }
            }
            FilterNode::Condition(cond) => {
                if let Some(value) = &cond.value {
                    match classify(value, Some(bound_name)) {
                        EvaluationClass::Single => return true,
                        EvaluationClass::All => *saw_data_access = true,
                        EvaluationClass::None => {}
                    }
                }
            }
        }
    }
    false
}
