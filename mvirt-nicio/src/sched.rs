//! TX scheduling configuration.
//!
//! Policies and rate limits are validated here and enforced by the device;
//! nothing is metered in software.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Arbitration policy of a TX queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchedPolicy {
    /// Strict priority.
    #[default]
    Fixed,
    /// Weighted round robin; weight in 1..=255.
    Weighted(u16),
}

impl SchedPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            SchedPolicy::Fixed => Ok(()),
            SchedPolicy::Weighted(0) => Err(ConfigError::ZeroWeight),
            SchedPolicy::Weighted(w) if w > 255 => Err(ConfigError::WeightOutOfRange(w)),
            SchedPolicy::Weighted(_) => Ok(()),
        }
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedPolicy::Fixed => write!(f, "fixed"),
            SchedPolicy::Weighted(w) => write!(f, "wrr({w})"),
        }
    }
}

/// Token-bucket parameters programmed into the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub rate_kbps: u32,
    pub burst_bytes: u32,
}

impl RateLimit {
    pub fn new(rate_kbps: u32, burst_bytes: u32) -> Result<Self, ConfigError> {
        let limit = Self {
            rate_kbps,
            burst_bytes,
        };
        limit.validate()?;
        Ok(limit)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_kbps == 0 {
            return Err(ConfigError::InvalidRate);
        }
        if self.burst_bytes == 0 {
            return Err(ConfigError::InvalidBurst);
        }
        Ok(())
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} kbps, burst {} B", self.rate_kbps, self.burst_bytes)
    }
}

/// Parameter change for one TX queue. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct TxQueueParams {
    /// Ring size; only changeable while the port is stopped.
    pub size: Option<usize>,
    pub policy: Option<SchedPolicy>,
    pub rate: Option<RateLimit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_validation() {
        assert!(SchedPolicy::Fixed.validate().is_ok());
        assert!(SchedPolicy::Weighted(1).validate().is_ok());
        assert!(SchedPolicy::Weighted(255).validate().is_ok());
        assert!(matches!(
            SchedPolicy::Weighted(0).validate(),
            Err(ConfigError::ZeroWeight)
        ));
        assert!(matches!(
            SchedPolicy::Weighted(256).validate(),
            Err(ConfigError::WeightOutOfRange(256))
        ));
    }

    #[test]
    fn test_rate_limit_validation() {
        assert!(RateLimit::new(1000, 1500).is_ok());
        assert!(matches!(RateLimit::new(0, 1500), Err(ConfigError::InvalidRate)));
        assert!(matches!(RateLimit::new(1000, 0), Err(ConfigError::InvalidBurst)));
    }
}
