//! # Controller Configuration
//!
//! ```ignore
//! let config = FsmConfig::default()
//!     .with_event_watchdog(Duration::from_secs(2))
//!     .with_boot_timeout(Duration::from_secs(60))
//!     .with_flashless(true);
//! config.validate()?;
//! ```

use std::time::Duration;

use mdfsm_handshake::{FeatureDescriptor, FeatureId, FeatureSet, SupportLevel};
use mdfsm_hal::Endpoint;

use crate::error::{Error, Result};

/// Per-endpoint feature sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFeatures {
    /// Features the host asks the device for
    pub requested: FeatureSet,
    /// Features the host can provide to the device
    pub supported: FeatureSet,
}

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsmConfig {
    /// Per-event dispatch watchdog (diagnostic only)
    pub event_watchdog: Duration,
    /// Blocking submit waits this many watchdog periods
    pub blocking_wait_factor: u32,
    /// Boot-stage register poll interval
    pub boot_poll_interval: Duration,
    /// Dump diagnostics if the OS stage is not reached within this time
    pub boot_timeout: Duration,
    /// Dump diagnostics if exception handling has not passed within this time
    pub mdee_dump_delay: Duration,
    /// Transition history depth
    pub history_depth: usize,
    /// MD endpoint features
    pub md: EndpointFeatures,
    /// SAP endpoint features
    pub sap: EndpointFeatures,
    /// Override the hardware-reported flashless variant
    pub flashless: Option<bool>,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            event_watchdog: Duration::from_secs(5),
            blocking_wait_factor: 2,
            boot_poll_interval: Duration::from_millis(20),
            boot_timeout: Duration::from_secs(60),
            mdee_dump_delay: Duration::from_secs(5),
            history_depth: 32,
            md: EndpointFeatures {
                requested: single(FeatureId::MD_PORT_ENUM),
                supported: single(FeatureId::MD_PORT_CFG),
            },
            sap: EndpointFeatures {
                requested: single(FeatureId::SAP_PORT_ENUM),
                supported: FeatureSet::empty(),
            },
            flashless: None,
        }
    }
}

fn single(id: FeatureId) -> FeatureSet {
    FeatureSet::new(vec![FeatureDescriptor::new(id, SupportLevel::MustSupport, 0)])
        .unwrap_or_default()
}

impl FsmConfig {
    /// Set the dispatch watchdog
    pub fn with_event_watchdog(mut self, d: Duration) -> Self {
        self.event_watchdog = d;
        self
    }

    /// Set the blocking-submit wait factor
    pub fn with_blocking_wait_factor(mut self, factor: u32) -> Self {
        self.blocking_wait_factor = factor;
        self
    }

    /// Set the boot-stage poll interval
    pub fn with_boot_poll_interval(mut self, d: Duration) -> Self {
        self.boot_poll_interval = d;
        self
    }

    /// Set the boot timeout
    pub fn with_boot_timeout(mut self, d: Duration) -> Self {
        self.boot_timeout = d;
        self
    }

    /// Set the exception dump delay
    pub fn with_mdee_dump_delay(mut self, d: Duration) -> Self {
        self.mdee_dump_delay = d;
        self
    }

    /// Set the history depth
    pub fn with_history_depth(mut self, depth: usize) -> Self {
        self.history_depth = depth;
        self
    }

    /// Set the feature sets of one endpoint
    pub fn with_features(
        mut self,
        endpoint: Endpoint,
        requested: FeatureSet,
        supported: FeatureSet,
    ) -> Self {
        *self.features_mut(endpoint) = EndpointFeatures {
            requested,
            supported,
        };
        self
    }

    /// Force the flashless variant on or off
    pub fn with_flashless(mut self, flashless: bool) -> Self {
        self.flashless = Some(flashless);
        self
    }

    /// Feature sets of one endpoint
    pub fn features(&self, endpoint: Endpoint) -> &EndpointFeatures {
        match endpoint {
            Endpoint::Md => &self.md,
            Endpoint::Sap => &self.sap,
        }
    }

    fn features_mut(&mut self, endpoint: Endpoint) -> &mut EndpointFeatures {
        match endpoint {
            Endpoint::Md => &mut self.md,
            Endpoint::Sap => &mut self.sap,
        }
    }

    /// Time a blocking submitter waits for its event
    pub fn blocking_timeout(&self) -> Duration {
        self.event_watchdog
            .saturating_mul(self.blocking_wait_factor)
    }

    /// Check the configuration for values the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.event_watchdog.is_zero() {
            return Err(Error::InvalidConfig("event watchdog must be non-zero"));
        }
        if self.blocking_wait_factor == 0 {
            return Err(Error::InvalidConfig("blocking wait factor must be at least 1"));
        }
        if self.boot_poll_interval.is_zero() {
            return Err(Error::InvalidConfig("boot poll interval must be non-zero"));
        }
        if self.boot_timeout < self.boot_poll_interval {
            return Err(Error::InvalidConfig("boot timeout shorter than poll interval"));
        }
        if self.history_depth == 0 {
            return Err(Error::InvalidConfig("history depth must be non-zero"));
        }
        Ok(())
    }
}
