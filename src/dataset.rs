use std::collections::HashMap;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DefaultOnNull};

use crate::flag::{FeatureToggle, Strategy};
use crate::segment::{Segment, SegmentId};
use crate::store::Store;

/// The format version written by this crate.
pub const CURRENT_FORMAT_VERSION: u32 = 2;

/// Dataset is the immutable snapshot of feature toggles and segments the client evaluates against.
///
/// Features keep the order in which they were received. A dataset is never mutated after it has
/// been published; a refresh builds a new one and swaps it in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    features: IndexMap<String, FeatureToggle>,
    segments: HashMap<SegmentId, Segment>,
}

impl Dataset {
    pub fn new(features: Vec<FeatureToggle>, segments: Vec<Segment>) -> Self {
        Dataset {
            features: features
                .into_iter()
                .map(|feature| (feature.name.clone(), feature))
                .collect(),
            segments: segments
                .into_iter()
                .map(|segment| (segment.id, segment))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.features.keys().cloned().collect()
    }

    pub fn features(&self) -> impl Iterator<Item = &FeatureToggle> {
        self.features.values()
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// The snapshot form of this dataset, in the current format version.
    pub fn to_client_features(&self) -> ClientFeatures {
        let mut segments: Vec<Segment> = self.segments.values().cloned().collect();
        segments.sort_by_key(|segment| segment.id);
        ClientFeatures {
            version: CURRENT_FORMAT_VERSION,
            features: self.features.values().cloned().collect(),
            segments,
        }
    }
}

impl Store for Dataset {
    fn feature(&self, name: &str) -> Option<&FeatureToggle> {
        self.features.get(name)
    }

    fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(&id)
    }
}

impl From<ClientFeatures> for Dataset {
    fn from(client_features: ClientFeatures) -> Self {
        Dataset::new(client_features.features, client_features.segments)
    }
}

/// ClientFeatures is the document served by the features endpoint and written to backups.
///
/// Three format versions are understood when reading:
/// - version 0 has no `version` key and every feature carries a single `strategy` name with its
///   `parameters`;
/// - version 1 has a `features` list of full toggles;
/// - version 2 adds the `segments` list.
///
/// Unknown versions above 2 are read as version 2. Serialization always writes the current
/// version.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientFeatures {
    pub version: u32,
    pub features: Vec<FeatureToggle>,
    pub segments: Vec<Segment>,
}

#[serde_as]
#[derive(Deserialize)]
struct RawClientFeatures {
    #[serde(default)]
    version: Option<u32>,
    features: Option<Vec<Value>>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    segments: Vec<Segment>,
}

#[serde_as]
#[derive(Deserialize)]
struct LegacyFeature {
    name: String,
    enabled: bool,
    strategy: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    parameters: HashMap<String, String>,
}

impl From<LegacyFeature> for FeatureToggle {
    fn from(legacy: LegacyFeature) -> Self {
        let strategy = Strategy {
            parameters: legacy.parameters,
            ..Strategy::new(legacy.strategy)
        };
        FeatureToggle::new(legacy.name, legacy.enabled, vec![strategy])
    }
}

impl<'de> Deserialize<'de> for ClientFeatures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawClientFeatures::deserialize(deserializer)?;
        let features = raw
            .features
            .ok_or_else(|| D::Error::missing_field("features"))?;
        let version = raw.version.unwrap_or(0);

        let features = features
            .into_iter()
            .map(|feature| match version {
                0 => serde_json::from_value::<LegacyFeature>(feature).map(FeatureToggle::from),
                _ => serde_json::from_value::<FeatureToggle>(feature),
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(D::Error::custom)?;

        Ok(ClientFeatures {
            version,
            features,
            segments: raw.segments,
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("malformed features payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Turns the body of a features response into a [Dataset].
pub trait DatasetDecoder: Send + Sync {
    fn decode(&self, payload: &str) -> Result<Dataset, DecodeError>;
}

/// Decodes the JSON features document in any of its format versions.
#[derive(Clone, Debug, Default)]
pub struct JsonDecoder;

impl DatasetDecoder for JsonDecoder {
    fn decode(&self, payload: &str) -> Result<Dataset, DecodeError> {
        let client_features: ClientFeatures = serde_json::from_str(payload)?;
        Ok(client_features.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Operator;
    use crate::test_common::{FIVE_FEATURES_V2, ONE_FEATURE_V0, TWO_FEATURES_V1};
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use spectral::prelude::*;

    #[test]
    fn decodes_version_two_with_segments() {
        let dataset = JsonDecoder.decode(FIVE_FEATURES_V2).expect("should decode");

        assert_that!(dataset.len()).is_equal_to(5);
        assert_that!(dataset.segment(1)).is_some();
        let feature = dataset.feature("featureX").expect("featureX should exist");
        assert!(feature.enabled);
        assert_eq!(feature.strategies[0].segments, vec![1]);
    }

    #[test]
    fn decodes_version_one_without_segments() {
        let dataset = JsonDecoder.decode(TWO_FEATURES_V1).expect("should decode");

        assert_that!(dataset.len()).is_equal_to(2);
        assert_that!(dataset.segments().count()).is_equal_to(0);
    }

    #[test]
    fn decodes_version_zero_single_strategy() {
        let dataset = JsonDecoder.decode(ONE_FEATURE_V0).expect("should decode");

        let feature = dataset.feature("featureLegacy").expect("featureLegacy should exist");
        assert!(feature.enabled);
        assert_that!(feature.strategies).has_length(1);
        assert_eq!(feature.strategies[0].name, "gradualRolloutRandom");
        assert_that!(feature.strategies[0].parameter("percentage")).contains_value("50");
    }

    #[test]
    fn keeps_feature_order() {
        let dataset = JsonDecoder.decode(FIVE_FEATURES_V2).expect("should decode");
        assert_that!(dataset.feature_names()).is_equal_to(vec![
            "featureX".to_string(),
            "featureY".to_string(),
            "featureZ".to_string(),
            "featureVariants".to_string(),
            "featureDependent".to_string(),
        ]);
    }

    #[test]
    fn document_without_features_is_rejected() {
        assert_that!(JsonDecoder.decode(r#"{"version": 2, "segments": []}"#)).is_err();
        assert_that!(JsonDecoder.decode("not json")).is_err();
        assert_that!(JsonDecoder.decode("")).is_err();
    }

    #[test]
    fn unknown_operator_does_not_break_decoding() {
        let dataset = JsonDecoder
            .decode(
                r#"{"version": 2, "features": [], "segments": [
                    {"id": 4, "name": "new", "constraints": [
                        {"contextName": "x", "operator": "REGEX_MATCH", "values": []}
                    ]}
                ]}"#,
            )
            .expect("should decode");
        let segment = dataset.segment(4).expect("segment 4 should exist");
        assert_eq!(segment.constraints[0].operator, Operator::Unknown);
    }

    #[test]
    fn snapshot_is_written_as_current_version() {
        let dataset = Dataset::new(
            vec![FeatureToggle::new("a", true, vec![Strategy::new("default")])],
            vec![Segment::new(2, "second", vec![]), Segment::new(1, "first", vec![])],
        );

        let written = serde_json::to_value(dataset.to_client_features()).expect("should encode");
        assert_json_eq!(
            written,
            json!({
                "version": 2,
                "features": [
                    {"name": "a", "enabled": true, "strategies": [{"name": "default", "parameters": {}}]}
                ],
                "segments": [
                    {"id": 1, "name": "first", "constraints": []},
                    {"id": 2, "name": "second", "constraints": []}
                ]
            })
        );
    }

    #[test]
    fn snapshot_reads_back_as_equal_dataset() {
        let dataset = JsonDecoder.decode(FIVE_FEATURES_V2).expect("should decode");
        let written = serde_json::to_string(&dataset.to_client_features()).expect("should encode");
        let read = JsonDecoder.decode(&written).expect("should decode");

        assert_that!(read).is_equal_to(dataset);
    }
}
