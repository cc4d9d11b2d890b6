use rand::Rng;

pub(crate) fn is_false(b: &bool) -> bool {
    !(*b)
}

/// The instance id a client reports when none was configured: the host name (as far as the
/// environment tells us) followed by a random suffix, so two processes on one host still differ.
pub(crate) fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default();
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}-generated-{}", host, suffix)
}
