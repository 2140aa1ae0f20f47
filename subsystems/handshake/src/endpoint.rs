//! # Endpoint Handshake
//!
//! One [`HandshakeInfo`] per control endpoint drives the four-stage
//! negotiation:
//!
//! 1. host → device: feature query (what the host requests)
//! 2. device → host: device query plus runtime data; every requested feature
//!    is negotiated and handed to its consumer
//! 3. host → device: host runtime data for every feature the device asked for
//! 4. device → host: acknowledgement (flashless variants only)
//!
//! Stages advance strictly in order. Re-observing a completed stage is a
//! no-op; a failed stage aborts the endpoint until [`HandshakeInfo::reset`].

use alloc::sync::Arc;
use alloc::vec::Vec;

use mdfsm_hal::{ControlChannel, D2hEvent, Endpoint};

use crate::error::{HandshakeError, HandshakeResult};
use crate::feature::{negotiate, FeatureDescriptor, FeatureId, FeatureSet, SupportLevel};
use crate::hooks::FeatureHooks;
use crate::wire::{self, FeatureEntry, FeatureQuery, Hs2Message, FEATURE_COUNT, RT_DATA_BUDGET};

bitflags::bitflags! {
    /// Progress of one endpoint's handshake
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StageFlags: u8 {
        /// Stage-1 query sent
        const HS1_SENT = 1 << 0;
        /// Stage-2 response consumed
        const HS2_DONE = 1 << 1;
        /// Stage-3 runtime data sent
        const HS3_SENT = 1 << 2;
        /// Stage-4 acknowledgement seen
        const HS4_DONE = 1 << 3;
        /// Handshake failed this session
        const ABORTED  = 1 << 7;
    }
}

/// Result of driving a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage ran to completion now
    Completed,
    /// Stage had already completed; nothing was done
    AlreadyDone,
}

/// Per-endpoint handshake state
pub struct HandshakeInfo {
    endpoint: Endpoint,
    channel: Arc<dyn ControlChannel>,
    event_source: D2hEvent,
    requested: FeatureSet,
    supported: FeatureSet,
    hooks: Arc<FeatureHooks>,
    stages: StageFlags,
    /// Outcome per requested feature
    negotiated: Vec<FeatureDescriptor>,
}

impl HandshakeInfo {
    /// Create state for one endpoint
    pub fn new(
        channel: Arc<dyn ControlChannel>,
        event_source: D2hEvent,
        requested: FeatureSet,
        supported: FeatureSet,
        hooks: Arc<FeatureHooks>,
    ) -> Self {
        Self {
            endpoint: channel.endpoint(),
            channel,
            event_source,
            requested,
            supported,
            hooks,
            stages: StageFlags::empty(),
            negotiated: Vec::new(),
        }
    }

    /// Endpoint this state drives
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Out-of-band event that announces the device side is ready
    pub fn event_source(&self) -> D2hEvent {
        self.event_source
    }

    /// Control channel
    pub fn channel(&self) -> &Arc<dyn ControlChannel> {
        &self.channel
    }

    /// Hook table for this endpoint
    pub fn hooks(&self) -> &Arc<FeatureHooks> {
        &self.hooks
    }

    /// Stage progress
    pub fn stages(&self) -> StageFlags {
        self.stages
    }

    /// Negotiated level for `id`
    pub fn negotiated_level(&self, id: FeatureId) -> SupportLevel {
        self.negotiated
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.level)
            .unwrap_or(SupportLevel::NotExist)
    }

    fn check_live(&self) -> HandshakeResult<()> {
        if self.stages.contains(StageFlags::ABORTED) {
            return Err(HandshakeError::Aborted(self.endpoint));
        }
        Ok(())
    }

    fn require(&self, prior: StageFlags, stage: u8) -> HandshakeResult<()> {
        self.check_live()?;
        if !self.stages.contains(prior) {
            return Err(HandshakeError::OutOfOrder {
                endpoint: self.endpoint,
                stage,
            });
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: HandshakeError) -> HandshakeResult<T> {
        self.abort();
        Err(err)
    }

    // -------------------------------------------------------------------------
    // Stage 1
    // -------------------------------------------------------------------------

    /// Send the host feature query
    pub fn start(&mut self) -> HandshakeResult<StageOutcome> {
        self.check_live()?;
        if self.stages.contains(StageFlags::HS1_SENT) {
            return Ok(StageOutcome::AlreadyDone);
        }

        let msg = wire::build_hs1(self.requested.to_table());
        if let Err(e) = self.channel.write(&msg) {
            return self.fail(e.into());
        }

        self.stages.insert(StageFlags::HS1_SENT);
        log::debug!(
            target: "mdfsm::handshake",
            "{}: stage 1 sent ({} features requested)",
            self.endpoint,
            self.requested.len()
        );
        Ok(StageOutcome::Completed)
    }

    // -------------------------------------------------------------------------
    // Stages 2 + 3
    // -------------------------------------------------------------------------

    /// Consume the device's stage-2 message and answer with stage 3
    pub fn on_response(&mut self, msg: &[u8]) -> HandshakeResult<StageOutcome> {
        if self.stages.contains(StageFlags::HS2_DONE) {
            return Ok(StageOutcome::AlreadyDone);
        }
        self.require(StageFlags::HS1_SENT, 2)?;

        let result = Hs2Message::parse(msg).and_then(|hs2| {
            self.consume_runtime_data(&hs2)?;
            self.send_runtime_data(&hs2.query)
        });

        match result {
            Ok(sent) => {
                self.stages
                    .insert(StageFlags::HS2_DONE | StageFlags::HS3_SENT);
                log::debug!(
                    target: "mdfsm::handshake",
                    "{}: stage 2 consumed, stage 3 sent ({} bytes)",
                    self.endpoint,
                    sent
                );
                Ok(StageOutcome::Completed)
            },
            Err(e) => self.fail(e),
        }
    }

    fn consume_runtime_data(&mut self, hs2: &Hs2Message<'_>) -> HandshakeResult<()> {
        self.negotiated.clear();
        for req in self.requested.iter() {
            let (offer, payload): (FeatureDescriptor, &[u8]) = match hs2.entry(req.id) {
                Some(e) => (e.descriptor()?, e.data),
                None => (FeatureDescriptor::absent(req.id), &[]),
            };
            let level = negotiate(req, &offer)?;
            self.negotiated
                .push(FeatureDescriptor::new(req.id, level, offer.version));

            if level != SupportLevel::MustSupport {
                log::trace!(
                    target: "mdfsm::handshake",
                    "{}: feature {} negotiated {:?}",
                    self.endpoint,
                    req.id,
                    level
                );
                continue;
            }
            if let Some(consumer) = self.hooks.consumer(req.id) {
                if let Err(e) = consumer.consume(req.id, payload) {
                    log::warn!(
                        target: "mdfsm::handshake",
                        "{}: consumer for {} rejected payload: {}",
                        self.endpoint,
                        req.id,
                        e
                    );
                    return Err(HandshakeError::ConsumerRejected(req.id));
                }
            }
        }
        Ok(())
    }

    fn send_runtime_data(&self, device_query: &FeatureQuery) -> HandshakeResult<usize> {
        let mut block = Vec::new();
        let mut payload = Vec::new();

        for idx in 0..FEATURE_COUNT {
            let id = FeatureId(idx as u8);
            let asked = device_query.descriptor(id)?;
            if asked.level == SupportLevel::NotExist {
                continue;
            }
            let ours = self.supported.get_or_absent(id);
            let level = negotiate(&asked, &ours)?;

            payload.clear();
            if level == SupportLevel::MustSupport {
                if let Some(provider) = self.hooks.provider(id) {
                    provider
                        .provide(id, &mut payload)
                        .map_err(|_| HandshakeError::ProviderFailed(id))?;
                }
            }

            let entry = FeatureEntry {
                id,
                info: FeatureDescriptor::new(id, level, ours.version).info_byte(),
                data: &payload,
            };
            if block.len() + entry.encoded_len() > RT_DATA_BUDGET {
                return Err(HandshakeError::PayloadOverflow {
                    budget: RT_DATA_BUDGET,
                });
            }
            entry.encode_into(&mut block);
        }

        let msg = wire::build_hs3(&block);
        self.channel.write(&msg)?;
        Ok(msg.len())
    }

    // -------------------------------------------------------------------------
    // Stage 4
    // -------------------------------------------------------------------------

    /// Record the device acknowledgement
    pub fn on_ack(&mut self) -> HandshakeResult<StageOutcome> {
        if self.stages.contains(StageFlags::HS4_DONE) {
            return Ok(StageOutcome::AlreadyDone);
        }
        self.require(StageFlags::HS3_SENT, 4)?;
        self.stages.insert(StageFlags::HS4_DONE);
        log::debug!(target: "mdfsm::handshake", "{}: stage 4 acknowledged", self.endpoint);
        Ok(StageOutcome::Completed)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Abandon the handshake for this session
    pub fn abort(&mut self) {
        if !self.stages.contains(StageFlags::ABORTED) {
            log::warn!(
                target: "mdfsm::handshake",
                "{}: handshake aborted at {:?}",
                self.endpoint,
                self.stages
            );
        }
        self.stages.insert(StageFlags::ABORTED);
    }

    /// Forget all progress; called when the device leaves the session
    pub fn reset(&mut self) {
        self.negotiated.clear();
        self.stages = StageFlags::empty();
    }
}
