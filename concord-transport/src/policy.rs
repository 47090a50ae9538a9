// SPDX-License-Identifier: MIT

use std::time::Duration;

/// Delivery policy: a message is attempted up to `max_attempts` times with
/// linear backoff (`attempt * backoff_unit` after the attempt fails), and
/// each acknowledged send waits at most `ack_timeout` for the ack frame.
#[derive(Clone, Debug)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
    pub ack_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

impl DeliveryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}
