use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::constraint::Constraint;
use crate::context::Context;
use crate::segment::SegmentId;
use crate::util::is_false;
use crate::variant::{select_variant, Variant, VariantDefinition};

const GROUP_ID_PARAMETER: &str = "groupId";

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggle {
    pub name: String,
    pub enabled: bool,

    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub strategies: Vec<Strategy>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<VariantDefinition>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<FeatureDependency>,

    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, skip_serializing_if = "is_false")]
    pub impression_data: bool,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub name: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<SegmentId>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<VariantDefinition>,
}

/// A parent feature the owning feature depends on.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FeatureDependency {
    pub feature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variants: Option<Vec<String>>,
}

impl FeatureToggle {
    pub fn new(name: impl Into<String>, enabled: bool, strategies: Vec<Strategy>) -> Self {
        FeatureToggle {
            name: name.into(),
            enabled,
            strategies,
            variants: vec![],
            dependencies: vec![],
            impression_data: false,
        }
    }

    /// Picks one of the feature's variants for `context`, grouping by the feature name.
    ///
    /// Falls back to [Variant::disabled] when the feature is off or has no selectable variant.
    pub fn variant(&self, context: &Context) -> Variant {
        if !self.enabled {
            return Variant::disabled();
        }
        select_variant(&self.variants, &self.name, context)
            .map(VariantDefinition::to_variant)
            .unwrap_or_else(Variant::disabled)
    }
}

impl Strategy {
    pub fn new(name: impl Into<String>) -> Self {
        Strategy {
            name: name.into(),
            parameters: HashMap::new(),
            constraints: vec![],
            segments: vec![],
            variants: vec![],
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// The grouping key used when bucketing for this strategy: the `groupId` parameter if the
    /// server sent one, otherwise the name of the feature the strategy belongs to.
    pub fn group_id<'a>(&'a self, feature_name: &'a str) -> &'a str {
        match self.parameter(GROUP_ID_PARAMETER) {
            Some(group_id) => group_id,
            None => feature_name,
        }
    }

    /// Picks one of the strategy's own variants for `context`.
    pub fn variant(&self, feature_name: &str, context: &Context) -> Option<Variant> {
        select_variant(&self.variants, self.group_id(feature_name), context)
            .map(VariantDefinition::to_variant)
    }
}

impl FeatureDependency {
    pub fn new(feature: impl Into<String>) -> Self {
        FeatureDependency {
            feature: feature.into(),
            enabled: None,
            variants: None,
        }
    }

    /// Whether the parent must be enabled. Defaults to true when the server omits it.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// The variants the parent must resolve to; empty means any variant is acceptable.
    pub fn variants(&self) -> &[String] {
        self.variants.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use maplit::hashmap;
    use spectral::prelude::*;

    #[test]
    fn parses_feature() {
        let feature: FeatureToggle = serde_json::from_str(
            r#"{
                "name": "Test.variants",
                "description": null,
                "enabled": true,
                "strategies": [
                    {
                        "name": "flexibleRollout",
                        "parameters": {"rollout": "50", "stickiness": "default", "groupId": "Test"},
                        "constraints": [{"contextName": "environment", "operator": "IN", "values": ["prod"]}],
                        "segments": [1, 2]
                    }
                ],
                "variants": [
                    {"name": "variant1", "weight": 50},
                    {"name": "variant2", "weight": 50}
                ],
                "dependencies": [
                    {"feature": "parent", "variants": ["blue"]},
                    {"feature": "other-parent", "enabled": false}
                ],
                "impressionData": true
            }"#,
        )
        .expect("should parse");

        assert_eq!(feature.name, "Test.variants");
        assert!(feature.enabled);
        assert!(feature.impression_data);
        assert_that!(feature.variants).has_length(2);

        let strategy = &feature.strategies[0];
        assert_eq!(strategy.name, "flexibleRollout");
        assert_that!(strategy.parameters).is_equal_to(hashmap! {
            "rollout".to_string() => "50".to_string(),
            "stickiness".to_string() => "default".to_string(),
            "groupId".to_string() => "Test".to_string(),
        });
        assert_that!(strategy.segments).is_equal_to(vec![1, 2]);
        assert_that!(strategy.constraints).has_length(1);

        assert_that!(feature.dependencies).has_length(2);
        assert!(feature.dependencies[0].is_enabled());
        assert_that!(feature.dependencies[0].variants()).is_equal_to(&["blue".to_string()][..]);
        assert!(!feature.dependencies[1].is_enabled());
        assert!(feature.dependencies[1].variants().is_empty());
    }

    #[test]
    fn null_collections_parse_as_empty() {
        let feature: FeatureToggle = serde_json::from_str(
            r#"{
                "name": "nulls",
                "enabled": false,
                "strategies": [{"name": "default", "parameters": null, "constraints": null, "segments": null}],
                "variants": null,
                "impressionData": null
            }"#,
        )
        .expect("should parse");

        assert!(!feature.impression_data);
        assert_that!(feature.variants).is_empty();
        assert_that!(feature.strategies[0].parameters).is_empty();
        assert_that!(feature.strategies[0].constraints).is_empty();
        assert_that!(feature.strategies[0].segments).is_empty();
    }

    #[test]
    fn group_id_falls_back_to_feature_name() {
        let mut strategy = Strategy::new("flexibleRollout");
        assert_eq!(strategy.group_id("my-feature"), "my-feature");

        strategy
            .parameters
            .insert("groupId".to_string(), "shared-group".to_string());
        assert_eq!(strategy.group_id("my-feature"), "shared-group");
    }

    #[test]
    fn disabled_feature_yields_disabled_variant() {
        let mut feature = FeatureToggle::new("off", false, vec![Strategy::new("default")]);
        feature.variants = vec![VariantDefinition::new("only", 100)];

        let context = Context::builder().user_id("1").build();
        assert_that!(feature.variant(&context)).is_equal_to(Variant::disabled());

        feature.enabled = true;
        assert_eq!(feature.variant(&context).name, "only");
    }
}
