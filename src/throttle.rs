use log::{error, info};

/// Throttler decides how many refresh cycles to sit out after the server reported a problem.
///
/// It keeps two counters: the number of consecutive failures and the number of cycles still to
/// be skipped. Skips never exceed `max_skips`, which is how many poll intervals fit into the
/// longest interval the client is willing to go without a refresh.
#[derive(Debug)]
pub struct Throttler {
    max_skips: u32,
    interval_secs: u64,
    skips: u32,
    failures: u32,
    target: String,
}

impl Throttler {
    pub fn new(interval_secs: u64, longest_acceptable_interval_secs: u64, target: impl Into<String>) -> Self {
        let max_skips = (longest_acceptable_interval_secs / interval_secs.max(1)).max(1);
        Throttler {
            max_skips: u32::try_from(max_skips).unwrap_or(u32::MAX),
            interval_secs,
            skips: 0,
            failures: 0,
            target: target.into(),
        }
    }

    /// Whether the current cycle should go ahead.
    pub fn perform_action(&self) -> bool {
        self.skips == 0
    }

    /// Records a cycle that was sat out.
    pub fn skipped(&mut self) {
        self.skips = self.skips.saturating_sub(1);
    }

    /// Records a successful cycle. One success only takes one failure off the count, so polling
    /// speeds up gradually after a run of errors.
    pub fn decrement_failure_count_and_reset_skips(&mut self) {
        if self.failures > 0 {
            self.failures -= 1;
            self.skips = self.failures.min(self.max_skips);
        }
    }

    /// Backs off one step further, up to `max_skips`.
    pub fn increase_skip_count(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.skips = self.failures.min(self.max_skips);
    }

    /// Backs off as far as possible. Used for responses that will not change by retrying.
    pub fn maximize_skips(&mut self) {
        self.skips = self.max_skips;
        self.failures = self.failures.saturating_add(1);
    }

    /// Classifies an unsuccessful response status and backs off accordingly.
    ///
    /// 401, 403 and 404 back off to the maximum at once; 429 and 5xx back off one step at a time.
    /// Anything else leaves the counters alone.
    pub fn handle_http_error(&mut self, status: u16) {
        match status {
            401 | 403 => {
                self.maximize_skips();
                error!(
                    "Client was not authorized to talk to the Unleash API at {}. Backing off to {} times our poll interval (of {} seconds) to avoid overloading server",
                    self.target, self.max_skips, self.interval_secs
                );
            }
            404 => {
                self.maximize_skips();
                error!(
                    "Server said that the endpoint at {} does not exist. Backing off to {} times our poll interval (of {} seconds) to avoid overloading server",
                    self.target, self.max_skips, self.interval_secs
                );
            }
            429 => {
                self.increase_skip_count();
                info!(
                    "RATE LIMITED for the {}. time. Further backing off. Current backoff at {} times our interval (of {} seconds)",
                    self.failures, self.skips, self.interval_secs
                );
            }
            status if status >= 500 => {
                self.increase_skip_count();
                info!(
                    "Server failed with a {} status code. Backing off. Current backoff at {} times our poll interval (of {} seconds)",
                    status, self.skips, self.interval_secs
                );
            }
            _ => {}
        }
    }

    pub fn skips(&self) -> u32 {
        self.skips
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_skips(&self) -> u32 {
        self.max_skips
    }
}
