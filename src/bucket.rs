use murmur3::murmur3_32;
use rand::Rng;

use crate::context::Context;

/// The number of buckets a percentage rollout distributes identifiers over.
pub const ROLLOUT_BUCKETS: u32 = 100;

const HASH_SEED: u32 = 0;

/// Maps `identifier` within `group_id` to a bucket in `1..=normalizer`.
///
/// This is the assignment every client of the ecosystem agrees on: MurmurHash3 (x86, 32 bit,
/// seed 0) over the UTF-8 bytes of `"{group_id}:{identifier}"`, reduced modulo `normalizer` and
/// shifted to be 1-based. Any deviation here silently moves users between buckets compared to
/// other clients, so the inputs must not be normalized or trimmed.
///
/// Returns 0 for a `normalizer` of 0, which no caller should pass.
pub fn normalized_number(identifier: &str, group_id: &str, normalizer: u32) -> u32 {
    if normalizer == 0 {
        return 0;
    }
    let key = format!("{}:{}", group_id, identifier);
    let hash = murmur3_32(&mut key.as_bytes(), HASH_SEED)
        .expect("reading from an in-memory buffer cannot fail");
    hash % normalizer + 1
}

/// Whether `identifier` falls inside the first `percentage` buckets of `group_id`.
pub fn is_in_rollout(identifier: &str, group_id: &str, percentage: u32) -> bool {
    percentage > 0 && normalized_number(identifier, group_id, ROLLOUT_BUCKETS) <= percentage
}

/// Reads a percentage strategy parameter. Anything that is not a whole number counts as 0.
pub fn parse_percentage(value: Option<&str>) -> u32 {
    value
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

/// The context attribute used to seed an assignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stickiness {
    /// userId, then sessionId, then a random value.
    Default,
    /// A fresh random value on every call.
    Random,
    /// The named context attribute, with no fallback.
    Field(String),
}

impl Stickiness {
    pub fn parse(value: Option<&str>) -> Stickiness {
        match value {
            None | Some("") | Some("default") => Stickiness::Default,
            Some("random") => Stickiness::Random,
            Some(field) => Stickiness::Field(field.to_string()),
        }
    }

    /// Resolves the identifier a percentage rollout buckets on. `None` means the context lacks
    /// the requested attribute and the rollout does not apply.
    pub fn resolve(&self, context: &Context) -> Option<String> {
        match self {
            Stickiness::Default => Some(
                context
                    .user_id()
                    .or_else(|| context.session_id())
                    .map(str::to_string)
                    .unwrap_or_else(random_identifier),
            ),
            Stickiness::Random => Some(random_identifier()),
            Stickiness::Field(name) => context.value_of(name).map(str::to_string),
        }
    }
}

/// The identifier variant selection buckets on when no custom stickiness is configured.
pub fn default_identifier(context: &Context) -> String {
    context
        .user_id()
        .or_else(|| context.session_id())
        .or_else(|| context.remote_address())
        .map(str::to_string)
        .unwrap_or_else(random_identifier)
}

pub(crate) fn random_identifier() -> String {
    rand::thread_rng().gen::<f64>().to_string()
}
