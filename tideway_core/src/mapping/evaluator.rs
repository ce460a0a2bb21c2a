//! Applies a partitioned mapping to batches of raw items.
//!
//! The three-way split is the whole point: the `None` tree is computed once
//! per batch, the `Single` tree once per item against just that item, and the
//! `All` tree once per item against the full payload.

use crate::mapping::models::{
    CalculationResult, Entity, FilterNode, FilterRule, MappingLeaf, ResourceMapping,
};
use crate::mapping::partition::{partition, PartitionedMapping};
use crate::query::classify::{classify, EvaluationClass};
use crate::query::engine::QueryEngine;
use crate::{Error, Result};
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

const DEFAULT_MAX_IN_FLIGHT: usize = 10;
const DEFAULT_EXAMPLE_COUNT: usize = 1;

/// Evaluates mappings against raw item batches via an external query engine.
pub struct EntityEvaluator {
    engine: Arc<dyn QueryEngine>,
    max_in_flight: usize,
    example_count: usize,
}

#[derive(Default)]
struct EvalState {
    misconfigured: BTreeMap<String, String>,
    errors: Vec<Error>,
}

struct ItemOutcome {
    entity: Entity,
    pass: bool,
    state: EvalState,
}

impl EntityEvaluator {
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            engine,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            example_count: DEFAULT_EXAMPLE_COUNT,
        }
    }

    /// Cap on concurrently in-flight engine calls across items of one batch.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// How many representative raw items to attach when fields come back
    /// empty or misconfigured.
    pub fn with_example_count(mut self, example_count: usize) -> Self {
        self.example_count = example_count;
        self
    }

    /// Evaluate `mapping` against one batch.
    ///
    /// `items_to_parse` selects the item sequence out of `payload`; without
    /// it the payload elements themselves are the items. `selector` decides
    /// pass/fail per entity; empty means every entity passes.
    #[tracing::instrument(level = "debug", skip(self, mapping, payload))]
    pub async fn evaluate(
        &self,
        mapping: &ResourceMapping,
        bound_name: &str,
        payload: &Value,
        selector: &str,
        items_to_parse: Option<&str>,
    ) -> Result<CalculationResult> {
        self.validate(mapping, selector, items_to_parse)?;

        let items: Vec<Value> = match items_to_parse {
            Some(expr) => match self.engine.evaluate(payload, expr).await? {
                Value::Array(items) => items,
                other => {
                    return Err(Error::InvalidConfiguration(format!(
                        "items_to_parse expression {expr:?} yielded {}, expected an array",
                        value_kind(&other)
                    )))
                }
            },
            None => match payload {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            },
        };

        let parts = partition(mapping, bound_name);
        let selector_class = if selector.trim().is_empty() {
            None
        } else {
            Some(classify(selector, Some(bound_name)))
        };

        // Item-independent work happens exactly once per batch.
        let mut batch_state = EvalState::default();
        let mut template = Entity::default();
        if !parts.none.is_empty() {
            self.project(&parts.none, &Value::Null, &mut template, &mut batch_state)
                .await;
        }

        let constant_pass = match selector_class {
            Some(EvaluationClass::None) => {
                match self.engine.evaluate_bool(&Value::Null, selector).await {
                    Ok(pass) => Some(pass),
                    Err(err) => {
                        batch_state.errors.push(err);
                        Some(false)
                    }
                }
            }
            _ => None,
        };

        let outcomes: Vec<ItemOutcome> = stream::iter(items.iter())
            .map(|item| {
                self.evaluate_item(
                    &parts,
                    bound_name,
                    payload,
                    item,
                    selector,
                    selector_class,
                    &template,
                    constant_pass,
                )
            })
            .buffered(self.max_in_flight)
            .collect()
            .await;

        let mut result = CalculationResult {
            misconfigured: batch_state.misconfigured,
            errors: batch_state.errors,
            ..CalculationResult::default()
        };

        for (item, outcome) in items.iter().zip(outcomes) {
            if !outcome.state.misconfigured.is_empty() && result.examples.len() < self.example_count
            {
                result.examples.push(item.clone());
            }
            result.misconfigured.extend(outcome.state.misconfigured);
            result.errors.extend(outcome.state.errors);
            if outcome.pass {
                result.passed.push(outcome.entity);
            } else {
                result.failed.push(outcome.entity);
            }
        }

        // Batch-constant misconfigurations still deserve an example item.
        if !result.misconfigured.is_empty() && result.examples.is_empty() {
            result
                .examples
                .extend(items.iter().take(self.example_count).cloned());
        }

        if !result.misconfigured.is_empty() {
            tracing::warn!(
                fields = ?result.misconfigured.keys().collect::<Vec<_>>(),
                "mapped fields resolved empty for at least one item"
            );
        }

        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_item(
        &self,
        parts: &PartitionedMapping,
        bound_name: &str,
        payload: &Value,
        item: &Value,
        selector: &str,
        selector_class: Option<EvaluationClass>,
        template: &Entity,
        constant_pass: Option<bool>,
    ) -> ItemOutcome {
        let mut state = EvalState::default();
        let mut entity = template.clone();

        let single_doc = bound_document(bound_name, item);
        let all_doc = all_document(payload, bound_name, item);

        self.project(&parts.single, &single_doc, &mut entity, &mut state)
            .await;
        self.project(&parts.all, &all_doc, &mut entity, &mut state)
            .await;

        let pass = match selector_class {
            None => true,
            Some(EvaluationClass::None) => constant_pass.unwrap_or(false),
            Some(class) => {
                let doc = if class == EvaluationClass::Single {
                    &single_doc
                } else {
                    &all_doc
                };
                match self.engine.evaluate_bool(doc, selector).await {
                    Ok(pass) => pass,
                    Err(err) => {
                        state.errors.push(err);
                        false
                    }
                }
            }
        };

        ItemOutcome {
            entity,
            pass,
            state,
        }
    }

    /// Evaluate one class tree against `doc`, writing resolved values into
    /// `entity` and recording empty/erroring fields.
    async fn project(
        &self,
        portion: &ResourceMapping,
        doc: &Value,
        entity: &mut Entity,
        state: &mut EvalState,
    ) {
        if let Some(leaf) = &portion.identifier {
            entity.identifier = self.resolve_leaf("identifier", leaf, doc, state).await;
        }
        if let Some(leaf) = &portion.blueprint {
            entity.blueprint = self.resolve_leaf("blueprint", leaf, doc, state).await;
        }
        if let Some(leaf) = &portion.title {
            entity.title = Some(self.resolve_leaf("title", leaf, doc, state).await);
        }
        if let Some(leaf) = &portion.icon {
            entity.icon = Some(self.resolve_leaf("icon", leaf, doc, state).await);
        }
        if let Some(leaf) = &portion.team {
            entity.team = Some(self.resolve_leaf("team", leaf, doc, state).await);
        }
        for (key, leaf) in &portion.properties {
            let field = format!("properties.{key}");
            let value = self.resolve_leaf(&field, leaf, doc, state).await;
            entity.properties.insert(key.clone(), value);
        }
        for (key, leaf) in &portion.relations {
            let field = format!("relations.{key}");
            let value = self.resolve_leaf(&field, leaf, doc, state).await;
            entity.relations.insert(key.clone(), value);
        }
    }

    async fn resolve_leaf(
        &self,
        field: &str,
        leaf: &MappingLeaf,
        doc: &Value,
        state: &mut EvalState,
    ) -> Value {
        match leaf {
            MappingLeaf::Expr(expr) => match self.engine.evaluate(doc, expr).await {
                Ok(value) => {
                    if is_empty_value(&value) {
                        state.misconfigured.insert(field.to_string(), expr.clone());
                    }
                    value
                }
                Err(err) => {
                    state.misconfigured.insert(field.to_string(), expr.clone());
                    state.errors.push(Error::evaluation(field, err.to_string()));
                    Value::Null
                }
            },
            MappingLeaf::Filter(rule) => self.resolve_rule(field, rule, doc, state).await,
        }
    }

    /// Resolve a filter rule by evaluating each condition's value expression
    /// and emitting the rule with literal values in place. Rules may nest, so
    /// the recursion is boxed.
    fn resolve_rule<'a>(
        &'a self,
        field: &'a str,
        rule: &'a FilterRule,
        doc: &'a Value,
        state: &'a mut EvalState,
    ) -> Pin<Box<dyn Future<Output = Value> + Send + 'a>> {
        Box::pin(async move {
            let mut rules = Vec::with_capacity(rule.rules.len());
            for node in &rule.rules {
                match node {
                    FilterNode::Nested(inner) => {
                        rules.push(self.resolve_rule(field, inner, doc, state).await);
                    }
                    FilterNode::Condition(cond) => {
                        let mut obj = serde_json::Map::new();
                        obj.insert("property".to_string(), Value::String(cond.property.clone()));
                        obj.insert("operator".to_string(), Value::String(cond.operator.clone()));
                        if let Some(expr) = &cond.value {
                            let value = match self.engine.evaluate(doc, expr).await {
                                Ok(value) => value,
                                Err(err) => {
                                    state.misconfigured.insert(field.to_string(), expr.clone());
                                    state.errors.push(Error::evaluation(field, err.to_string()));
                                    Value::Null
                                }
                            };
                            obj.insert("value".to_string(), value);
                        }
                        rules.push(Value::Object(obj));
                    }
                }
            }
            json!({ "combinator": rule.combinator, "rules": rules })
        })
    }

    /// Compile-check every expression up front. Parse failures are
    /// configuration errors, fatal to the mapping, never deferred to
    /// per-item evaluation.
    fn validate(
        &self,
        mapping: &ResourceMapping,
        selector: &str,
        items_to_parse: Option<&str>,
    ) -> Result<()> {
        for (field, leaf) in mapping.leaves() {
            self.compile_leaf(&field, leaf)?;
        }
        if !selector.trim().is_empty() {
            self.engine.compile(selector).map_err(|err| {
                Error::InvalidConfiguration(format!("selector failed to compile: {err}"))
            })?;
        }
        if let Some(expr) = items_to_parse {
            self.engine.compile(expr).map_err(|err| {
                Error::InvalidConfiguration(format!("items_to_parse failed to compile: {err}"))
            })?;
        }
        Ok(())
    }

    fn compile_leaf(&self, field: &str, leaf: &MappingLeaf) -> Result<()> {
        match leaf {
            MappingLeaf::Expr(expr) => self.engine.compile(expr).map_err(|err| {
                Error::InvalidConfiguration(format!(
                    "'{field}' expression {expr:?} failed to compile: {err}"
                ))
            }),
            MappingLeaf::Filter(rule) => self.compile_rule(field, rule),
        }
    }

    fn compile_rule(&self, field: &str, rule: &FilterRule) -> Result<()> {
        for node in &rule.rules {
            match node {
                FilterNode::Nested(inner) => self.compile_rule(field, inner)?,
                FilterNode::Condition(cond) => {
                    if let Some(expr) = &cond.value {
                        self.engine.compile(expr).map_err(|err| {
                            Error::InvalidConfiguration(format!(
                                "'{field}' rule expression {expr:?} failed to compile: {err}"
                            ))
                        })?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Document for the `Single` class: just the current item, bound under
/// `bound_name`.
fn bound_document(bound_name: &str, item: &Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(bound_name.to_string(), item.clone());
    Value::Object(map)
}

/// Document for the `All` class: the entire payload, with the current item
/// bound under `bound_name` when the payload is an object so expressions can
/// reach both. Non-object payloads (a bare batch array) are passed whole;
/// sibling data stays reachable, and expressions that need the current item
/// alongside it require an object payload.
fn all_document(payload: &Value, bound_name: &str, item: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert(bound_name.to_string(), item.clone());
            Value::Object(map)
        }
        _ => payload.clone(),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
