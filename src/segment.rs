use lazy_static::lazy_static;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::constraint::{Constraint, Operator};
use crate::flag::Strategy;
use crate::store::Store;

pub type SegmentId = i32;

/// The id of the sentinel returned for segment references that cannot be resolved. Servers only
/// hand out positive ids, so it never collides with a real segment.
pub const DENY_SEGMENT_ID: SegmentId = -9999;

lazy_static! {
    /// Stands in for any segment a strategy references but the current dataset does not contain.
    /// Its only constraint asks for membership in an empty set, which no context satisfies.
    pub static ref DENY_SEGMENT: Segment = Segment {
        id: DENY_SEGMENT_ID,
        name: "deny".to_string(),
        description: Some("Stands in for a segment that could not be found".to_string()),
        constraints: vec![Constraint::new("deny", Operator::In, vec![])],
        created_by: None,
        created_at: None,
    };
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: SegmentId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Segment {
    pub fn new(id: SegmentId, name: impl Into<String>, constraints: Vec<Constraint>) -> Self {
        Segment {
            id,
            name: name.into(),
            description: None,
            constraints,
            created_by: None,
            created_at: None,
        }
    }

    pub fn is_deny_sentinel(&self) -> bool {
        self.id == DENY_SEGMENT_ID
    }
}

/// Resolves a segment reference against `store`, falling back to [DENY_SEGMENT].
pub fn resolve_segment(store: &dyn Store, id: SegmentId) -> &Segment {
    match store.segment(id) {
        Some(segment) => segment,
        None => {
            debug!("segment {} is not known, substituting the deny segment", id);
            &DENY_SEGMENT
        }
    }
}

/// Returns the constraints in effect for `strategy`: its own constraints followed by the
/// constraints of every segment it references, in reference order.
///
/// Segments are looked up on every call rather than joined into strategies when a dataset is
/// loaded, so the result always reflects the segments of the dataset `store` represents.
pub fn merge_constraints<'a>(store: &'a dyn Store, strategy: &'a Strategy) -> Vec<&'a Constraint> {
    strategy
        .constraints
        .iter()
        .chain(
            strategy
                .segments
                .iter()
                .flat_map(|id| resolve_segment(store, *id).constraints.iter()),
        )
        .collect()
}
