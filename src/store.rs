use crate::flag::FeatureToggle;
use crate::segment::{Segment, SegmentId};

/// Store is an interface for a data store that holds feature toggles and segments received by
/// the client.
///
/// Ordinarily, the only implementation of this interface is [crate::Dataset], the immutable
/// snapshot published by the [crate::SyncController].
pub trait Store {
    /// Retrieve the feature toggle named `name`.
    fn feature(&self, name: &str) -> Option<&FeatureToggle>;

    /// Retrieve the segment with id `id`.
    fn segment(&self, id: SegmentId) -> Option<&Segment>;
}
