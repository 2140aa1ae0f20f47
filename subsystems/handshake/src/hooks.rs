//! # Feature Hooks
//!
//! Consumers receive the peer's runtime data for a negotiated feature during
//! stage 2. Providers fill the host's runtime data during stage 3. Each
//! endpoint owns one [`FeatureHooks`] table; at most one consumer and one
//! provider may be registered per feature.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::RwLock;

use crate::error::{HandshakeError, HandshakeResult};
use crate::feature::FeatureId;

/// Refusal returned by a hook; aborts the endpoint's handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookError(pub &'static str);

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Receives peer runtime data for a negotiated feature
pub trait FeatureConsumer: Send + Sync {
    /// Accept or reject the peer's payload
    fn consume(&self, feature: FeatureId, payload: &[u8]) -> Result<(), HookError>;
}

/// Produces host runtime data for a negotiated feature
pub trait FeatureProvider: Send + Sync {
    /// Append the payload to `out`
    fn provide(&self, feature: FeatureId, out: &mut Vec<u8>) -> Result<(), HookError>;
}

impl<F> FeatureConsumer for F
where
    F: Fn(FeatureId, &[u8]) -> Result<(), HookError> + Send + Sync,
{
    fn consume(&self, feature: FeatureId, payload: &[u8]) -> Result<(), HookError> {
        self(feature, payload)
    }
}

impl<F> FeatureProvider for F
where
    F: Fn(FeatureId, &mut Vec<u8>) -> Result<(), HookError> + Send + Sync,
{
    fn provide(&self, feature: FeatureId, out: &mut Vec<u8>) -> Result<(), HookError> {
        self(feature, out)
    }
}

/// Per-endpoint hook table
#[derive(Default)]
pub struct FeatureHooks {
    consumers: RwLock<BTreeMap<FeatureId, Arc<dyn FeatureConsumer>>>,
    providers: RwLock<BTreeMap<FeatureId, Arc<dyn FeatureProvider>>>,
}

impl FeatureHooks {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the consumer for `feature`
    pub fn register_consumer(
        &self,
        feature: FeatureId,
        consumer: Arc<dyn FeatureConsumer>,
    ) -> HandshakeResult<()> {
        let mut map = self.consumers.write();
        if map.contains_key(&feature) {
            return Err(HandshakeError::HookExists(feature));
        }
        map.insert(feature, consumer);
        Ok(())
    }

    /// Remove the consumer for `feature`
    pub fn unregister_consumer(&self, feature: FeatureId) -> HandshakeResult<()> {
        self.consumers
            .write()
            .remove(&feature)
            .map(|_| ())
            .ok_or(HandshakeError::HookMissing(feature))
    }

    /// Register the provider for `feature`
    pub fn register_provider(
        &self,
        feature: FeatureId,
        provider: Arc<dyn FeatureProvider>,
    ) -> HandshakeResult<()> {
        let mut map = self.providers.write();
        if map.contains_key(&feature) {
            return Err(HandshakeError::HookExists(feature));
        }
        map.insert(feature, provider);
        Ok(())
    }

    /// Remove the provider for `feature`
    pub fn unregister_provider(&self, feature: FeatureId) -> HandshakeResult<()> {
        self.providers
            .write()
            .remove(&feature)
            .map(|_| ())
            .ok_or(HandshakeError::HookMissing(feature))
    }

    /// Consumer for `feature`, cloned out so the lock is not held across the call
    pub fn consumer(&self, feature: FeatureId) -> Option<Arc<dyn FeatureConsumer>> {
        self.consumers.read().get(&feature).cloned()
    }

    /// Provider for `feature`
    pub fn provider(&self, feature: FeatureId) -> Option<Arc<dyn FeatureProvider>> {
        self.providers.read().get(&feature).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_once() {
        let hooks = FeatureHooks::new();
        let c: Arc<dyn FeatureConsumer> = Arc::new(|_: FeatureId, _: &[u8]| Ok::<(), HookError>(()));
        hooks
            .register_consumer(FeatureId::MD_PORT_ENUM, c.clone())
            .unwrap();
        assert_eq!(
            hooks.register_consumer(FeatureId::MD_PORT_ENUM, c).err(),
            Some(HandshakeError::HookExists(FeatureId::MD_PORT_ENUM))
        );
        assert!(hooks.consumer(FeatureId::MD_PORT_ENUM).is_some());
        hooks.unregister_consumer(FeatureId::MD_PORT_ENUM).unwrap();
        assert!(hooks.consumer(FeatureId::MD_PORT_ENUM).is_none());
        assert_eq!(
            hooks.unregister_consumer(FeatureId::MD_PORT_ENUM),
            Err(HandshakeError::HookMissing(FeatureId::MD_PORT_ENUM))
        );
    }

    #[test]
    fn test_provider_writes() {
        let hooks = FeatureHooks::new();
        hooks
            .register_provider(
                FeatureId::MD_PORT_CFG,
                Arc::new(|_: FeatureId, out: &mut Vec<u8>| {
                    out.extend_from_slice(&[7, 7]);
                    Ok::<(), HookError>(())
                }),
            )
            .unwrap();
        let mut buf = Vec::new();
        hooks
            .provider(FeatureId::MD_PORT_CFG)
            .unwrap()
            .provide(FeatureId::MD_PORT_CFG, &mut buf)
            .unwrap();
        assert_eq!(buf, [7, 7]);
    }
}
