//! Segment data model: declarative AND/OR rule trees over lead attributes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Boolean combinator for a rule group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOp {
    And,
    Or,
}

/// Comparison operator for a leaf predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    NotEq,
    /// Value must be an array; matches when the attribute is one of its elements.
    In,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Attribute is present and non-null.
    Exists,
    /// Attribute is absent or null.
    NotExists,
    /// Substring match on string attributes.
    Contains,
}

/// One node of a segment rule tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentNode {
    Group {
        op: GroupOp,
        children: Vec<SegmentNode>,
    },
    Predicate {
        field: String,
        op: PredicateOp,
        #[serde(default)]
        value: serde_json::Value,
    },
}

impl SegmentNode {
    /// Convenience constructor for an AND group.
    pub fn all(children: Vec<SegmentNode>) -> Self {
        Self::Group {
            op: GroupOp::And,
            children,
        }
    }

    /// Convenience constructor for an OR group.
    pub fn any(children: Vec<SegmentNode>) -> Self {
        Self::Group {
            op: GroupOp::Or,
            children,
        }
    }

    /// Convenience constructor for a leaf predicate.
    pub fn predicate(field: impl Into<String>, op: PredicateOp, value: serde_json::Value) -> Self {
        Self::Predicate {
            field: field.into(),
            op,
            value,
        }
    }
}

/// A named audience definition.
///
/// Rules are re-evaluated fresh on every generation pass; membership is never
/// snapshotted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub rules: SegmentNode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Segment {
    pub fn new(tenant_id: Uuid, name: impl Into<String>, rules: SegmentNode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            rules,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_tree_serde_roundtrip() {
        let rules = SegmentNode::all(vec![
            SegmentNode::predicate("status", PredicateOp::Eq, serde_json::json!("open")),
            SegmentNode::any(vec![
                SegmentNode::predicate("plan", PredicateOp::In, serde_json::json!(["pro", "max"])),
                SegmentNode::predicate("score", PredicateOp::Gte, serde_json::json!(50)),
            ]),
        ]);

        let json = serde_json::to_string(&rules).unwrap();
        let back: SegmentNode = serde_json::from_str(&json).unwrap();
        let SegmentNode::Group { op, children } = back else {
            panic!("expected group");
        };
        assert_eq!(op, GroupOp::And);
        assert_eq!(children.len(), 2);
    }
}
