use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::bucket::{default_identifier, normalized_number, random_identifier};
use crate::context::Context;

pub type VariantWeight = u32;

const DEFAULT_STICKINESS: &str = "default";
const DISABLED_VARIANT: &str = "disabled";

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantDefinition {
    pub name: String,
    pub weight: VariantWeight,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stickiness: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<VariantOverride>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Pins every context whose `context_name` attribute is one of `values` to the owning variant.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantOverride {
    pub context_name: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub values: Vec<String>,
}

/// The outcome of a variant selection, as handed to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Variant {
    pub name: String,
    pub payload: Option<Payload>,
    pub enabled: bool,
}

impl Variant {
    /// The variant callers get when nothing is selectable.
    pub fn disabled() -> Self {
        Variant {
            name: DISABLED_VARIANT.to_string(),
            payload: None,
            enabled: false,
        }
    }
}

impl VariantDefinition {
    pub fn new(name: impl Into<String>, weight: VariantWeight) -> Self {
        VariantDefinition {
            name: name.into(),
            weight,
            payload: None,
            stickiness: None,
            overrides: vec![],
        }
    }

    pub fn to_variant(&self) -> Variant {
        Variant {
            name: self.name.clone(),
            payload: self.payload.clone(),
            enabled: true,
        }
    }

    fn custom_stickiness(&self) -> Option<&str> {
        self.stickiness
            .as_deref()
            .filter(|stickiness| *stickiness != DEFAULT_STICKINESS)
    }
}

impl VariantOverride {
    fn matches(&self, context: &Context) -> bool {
        // An absent attribute compares as the empty string.
        let value = context.value_of(&self.context_name).unwrap_or("");
        self.values.iter().any(|v| v == value)
    }
}

/// Selects one of `variants` for `context`, bucketing within `group_id`.
///
/// The order of `variants` is significant and must be kept as received: an override match wins
/// outright, otherwise the context's bucket in `1..=total weight` is located by walking the
/// cumulative weights. Zero-weight variants keep their position but can never be chosen. Returns
/// `None` when the total weight is zero or does not fit a [VariantWeight], leaving the caller to
/// apply its default.
pub fn select_variant<'a>(
    variants: &'a [VariantDefinition],
    group_id: &str,
    context: &Context,
) -> Option<&'a VariantDefinition> {
    let total_weight = variants
        .iter()
        .try_fold(0 as VariantWeight, |sum, v| sum.checked_add(v.weight))?;
    if total_weight == 0 {
        return None;
    }

    if let Some(overridden) = variants
        .iter()
        .find(|v| v.overrides.iter().any(|o| o.matches(context)))
    {
        return Some(overridden);
    }

    let seed = stickiness_seed(variants, context);
    let target = normalized_number(&seed, group_id, total_weight);

    // Partial sums never exceed the total, so the walk cannot overflow.
    let mut counter: VariantWeight = 0;
    for variant in variants {
        if variant.weight == 0 {
            continue;
        }
        counter += variant.weight;
        if counter >= target {
            return Some(variant);
        }
    }
    None
}

// Only the first custom stickiness declared across the list is honoured.
fn stickiness_seed(variants: &[VariantDefinition], context: &Context) -> String {
    match variants.iter().find_map(VariantDefinition::custom_stickiness) {
        Some(field) => context
            .value_of(field)
            .map(str::to_string)
            .unwrap_or_else(random_identifier),
        None => default_identifier(context),
    }
}
