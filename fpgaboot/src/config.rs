//! Timing configuration for bootloader transactions.

use std::time::Duration;

/// Timeouts, settle delays and retry budgets used by
/// [`crate::Flasher`] and [`crate::Updater`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FlasherConfig {
    /// Wait for a plain acknowledgement (WRITE, NEXT_SET, SAVE_BRICK, ...).
    pub ack_timeout: Duration,
    /// Wait for the acknowledgement of one sector erase.
    pub erase_timeout: Duration,
    /// Pause after each erase acknowledgement while the sector is erased.
    pub erase_settle: Duration,
    /// Silence that ends a READ reply.
    pub read_idle: Duration,
    /// Silence that ends an INFO or JUMP reply.
    pub reply_idle: Duration,
    /// Silence that ends a CHECK reply.
    pub check_idle: Duration,
    /// SAVE_BRICK attempts while moving into boot mode.
    pub brick_attempts: u32,
    /// Spacing between SAVE_BRICK attempts.
    pub brick_interval: Duration,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(1),
            erase_timeout: Duration::from_secs(3),
            erase_settle: Duration::from_millis(500),
            read_idle: Duration::from_millis(100),
            reply_idle: Duration::from_millis(100),
            check_idle: Duration::from_secs(1),
            brick_attempts: 10,
            brick_interval: Duration::from_millis(100),
        }
    }
}

impl FlasherConfig {
    /// Set the acknowledgement timeout.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the per-sector erase timeout.
    #[must_use]
    pub fn with_erase_timeout(mut self, timeout: Duration) -> Self {
        self.erase_timeout = timeout;
        self
    }

    /// Set the delay after each erase acknowledgement.
    #[must_use]
    pub fn with_erase_settle(mut self, settle: Duration) -> Self {
        self.erase_settle = settle;
        self
    }

    /// Set the READ idle timeout.
    #[must_use]
    pub fn with_read_idle(mut self, idle: Duration) -> Self {
        self.read_idle = idle;
        self
    }

    /// Set the INFO/JUMP idle timeout.
    #[must_use]
    pub fn with_reply_idle(mut self, idle: Duration) -> Self {
        self.reply_idle = idle;
        self
    }

    /// Set the CHECK idle timeout.
    #[must_use]
    pub fn with_check_idle(mut self, idle: Duration) -> Self {
        self.check_idle = idle;
        self
    }

    /// Set the SAVE_BRICK retry budget.
    #[must_use]
    pub fn with_brick_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.brick_attempts = attempts;
        self.brick_interval = interval;
        self
    }
}
