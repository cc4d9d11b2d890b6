use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::util::is_false;

/// A single condition on a context attribute.
///
/// Constraints are carried as data only: deciding whether one is satisfied by a context is the
/// job of the evaluation engine that consumes this crate.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub context_name: String,
    pub operator: Operator,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub inverted: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub case_insensitive: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    In,
    NotIn,
    StrEndsWith,
    StrStartsWith,
    StrContains,
    NumEq,
    NumGt,
    NumGte,
    NumLt,
    NumLte,
    DateAfter,
    DateBefore,
    SemverEq,
    SemverGt,
    SemverLt,
    // Operators added by newer servers must not make the whole payload undecodable.
    #[serde(other)]
    Unknown,
}

impl Constraint {
    pub fn new(
        context_name: impl Into<String>,
        operator: Operator,
        values: Vec<String>,
    ) -> Self {
        Constraint {
            context_name: context_name.into(),
            operator,
            values,
            value: None,
            inverted: false,
            case_insensitive: false,
        }
    }

    pub fn with_value(
        context_name: impl Into<String>,
        operator: Operator,
        value: impl Into<String>,
    ) -> Self {
        Constraint {
            value: Some(value.into()),
            ..Constraint::new(context_name, operator, vec![])
        }
    }
}
