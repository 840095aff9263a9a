//! Segment resolution: compiles a rule tree and streams matching leads.
//!
//! Compilation validates the tree up front; anything malformed compiles to a
//! match-nothing evaluator so a broken segment can never fan out to the whole
//! lead table. Resolution walks the lead table in id order with keyset
//! pagination and applies the compiled predicate per page, so memory stays
//! bounded regardless of audience size.

use serde_json::Value;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{GroupOp, Lead, PredicateOp, Segment, SegmentNode};
use crate::store::Database;

/// A validated, ready-to-evaluate segment rule tree.
#[derive(Debug, Clone)]
pub struct CompiledSegment {
    root: CompiledNode,
}

#[derive(Debug, Clone)]
enum CompiledNode {
    Group {
        op: GroupOp,
        children: Vec<CompiledNode>,
    },
    Predicate {
        field: String,
        op: PredicateOp,
        value: Value,
    },
    /// Fail-closed sink for empty or malformed trees.
    MatchNothing,
}

impl CompiledSegment {
    /// Whether a lead satisfies the segment rules.
    pub fn matches(&self, lead: &Lead) -> bool {
        eval(&self.root, lead)
    }

    /// A segment that matches no lead.
    pub fn match_nothing() -> Self {
        Self {
            root: CompiledNode::MatchNothing,
        }
    }
}

fn eval(node: &CompiledNode, lead: &Lead) -> bool {
    match node {
        CompiledNode::Group { op, children } => match op {
            GroupOp::And => children.iter().all(|c| eval(c, lead)),
            GroupOp::Or => children.iter().any(|c| eval(c, lead)),
        },
        CompiledNode::Predicate { field, op, value } => {
            eval_predicate(lead.attribute(field).as_ref(), *op, value)
        }
        CompiledNode::MatchNothing => false,
    }
}

fn eval_predicate(attr: Option<&Value>, op: PredicateOp, value: &Value) -> bool {
    match op {
        PredicateOp::Exists => attr.is_some_and(|v| !v.is_null()),
        PredicateOp::NotExists => !attr.is_some_and(|v| !v.is_null()),
        PredicateOp::Eq => attr.is_some_and(|v| values_equal(v, value)),
        PredicateOp::NotEq => !attr.is_some_and(|v| values_equal(v, value)),
        PredicateOp::In => match (attr, value.as_array()) {
            (Some(v), Some(candidates)) => candidates.iter().any(|c| values_equal(v, c)),
            _ => false,
        },
        PredicateOp::Gt => compare(attr, value).is_some_and(|o| o == std::cmp::Ordering::Greater),
        PredicateOp::Gte => compare(attr, value).is_some_and(|o| o != std::cmp::Ordering::Less),
        PredicateOp::Lt => compare(attr, value).is_some_and(|o| o == std::cmp::Ordering::Less),
        PredicateOp::Lte => compare(attr, value).is_some_and(|o| o != std::cmp::Ordering::Greater),
        PredicateOp::Contains => match (attr.and_then(Value::as_str), value.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
    }
}

/// Loose equality: numbers compare numerically, everything else structurally.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for Gt/Gte/Lt/Lte. Numbers compare numerically, strings
/// lexicographically; mixed or non-comparable types yield `None` (no match).
fn compare(attr: Option<&Value>, value: &Value) -> Option<std::cmp::Ordering> {
    let attr = attr?;
    if let (Some(x), Some(y)) = (attr.as_f64(), value.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (attr.as_str(), value.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

/// Compiles segment rule trees and streams recipient pages.
pub struct SegmentResolver;

impl SegmentResolver {
    /// Validate and compile a segment's rule tree.
    ///
    /// Malformed trees (empty groups, blank fields, type-invalid operands)
    /// compile to a match-nothing evaluator rather than an error, and the
    /// rejection is logged once here.
    pub fn compile(segment: &Segment) -> CompiledSegment {
        match compile_node(&segment.rules) {
            Ok(root) => CompiledSegment { root },
            Err(reason) => {
                tracing::warn!(
                    segment = %segment.id,
                    %reason,
                    "Segment rules invalid; matching no leads"
                );
                CompiledSegment::match_nothing()
            }
        }
    }

    /// One page of matching leads in stable id-ascending order, starting
    /// strictly after `after`.
    ///
    /// Returns the matches plus the cursor for the next call; a `None` cursor
    /// means the lead table is exhausted. A page may be empty while the cursor
    /// is still `Some` when no lead in the underlying page matched.
    pub async fn resolve_page(
        db: &dyn Database,
        tenant_id: Uuid,
        compiled: &CompiledSegment,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<(Vec<Lead>, Option<Uuid>), DatabaseError> {
        let page = db.list_leads_page(tenant_id, after, limit).await?;
        let cursor = if page.len() < limit {
            None
        } else {
            page.last().map(|l| l.id)
        };
        let matches = page.into_iter().filter(|l| compiled.matches(l)).collect();
        Ok((matches, cursor))
    }
}

fn compile_node(node: &SegmentNode) -> Result<CompiledNode, String> {
    match node {
        SegmentNode::Group { op, children } => {
            if children.is_empty() {
                return Err("empty group".into());
            }
            let children = children
                .iter()
                .map(compile_node)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CompiledNode::Group { op: *op, children })
        }
        SegmentNode::Predicate { field, op, value } => {
            if field.trim().is_empty() {
                return Err("predicate with blank field".into());
            }
            match op {
                PredicateOp::In if !value.is_array() => {
                    return Err(format!("'in' operand for {field} must be an array"));
                }
                PredicateOp::Contains if !value.is_string() => {
                    return Err(format!("'contains' operand for {field} must be a string"));
                }
                PredicateOp::Gt | PredicateOp::Gte | PredicateOp::Lt | PredicateOp::Lte
                    if !value.is_number() && !value.is_string() =>
                {
                    return Err(format!("comparison operand for {field} must be number or string"));
                }
                _ => {}
            }
            Ok(CompiledNode::Predicate {
                field: field.clone(),
                op: *op,
                value: value.clone(),
            })
        }
    }
}
