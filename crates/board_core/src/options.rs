use std::time::Duration;

use crate::{distributor::DefaultColumnPolicy, policy::ContactDatePolicy};

pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Runtime knobs of a mounted board.
#[derive(Debug, Clone)]
pub struct BoardOptions {
    pub default_column: DefaultColumnPolicy,
    pub contact_policy: ContactDatePolicy,
    /// Upper bound on a single stage update; expiry counts as failure.
    pub persist_timeout: Duration,
    /// How long a dropped card stays marked as settling.
    pub settle_delay: Duration,
}

impl Default for BoardOptions {
    fn default() -> Self {
        Self {
            default_column: DefaultColumnPolicy::default(),
            contact_policy: ContactDatePolicy::default(),
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}
