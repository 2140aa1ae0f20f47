//! # Event Source Routing
//!
//! Line interrupts, doorbells and control-channel frames are turned into
//! queued events here. Every callback runs in the producer's context and
//! only submits with [`SubmitMode::ATOMIC`]; nothing here touches FSM state.

use std::sync::Arc;

use mdfsm_handshake::wire::CtrlHeader;
use mdfsm_handshake::{CtrlMsgId, HandshakeInfo};
use mdfsm_hal::{ControlChannel, D2hEvent, Endpoint, IrqSource, ModemHal};

use crate::dispatcher::EventSubmitter;
use crate::error::Result;
use crate::event::{EventFlag, EventId, SubmitMode};
use crate::timer::TimerHandle;

/// Exception and boot doorbells shared by both endpoints
pub(crate) const DEVICE_EVENTS: D2hEvent = D2hEvent::EXCEPT_INIT
    .union(D2hEvent::EXCEPT_CLEARQ_DONE)
    .union(D2hEvent::EXCEPT_ALLQ_RESET)
    .union(D2hEvent::BOOT_FLOW_SYNC);

/// Doorbell announcing that an endpoint is ready for stage 1
pub(crate) const fn hs_notify(endpoint: Endpoint) -> D2hEvent {
    match endpoint {
        Endpoint::Md => D2hEvent::ASYNC_HS_NOTIFY_MD,
        Endpoint::Sap => D2hEvent::ASYNC_HS_NOTIFY_SAP,
    }
}

const fn hs_start(endpoint: Endpoint) -> EventFlag {
    match endpoint {
        Endpoint::Md => EventFlag::MD_HS_START,
        Endpoint::Sap => EventFlag::SAP_HS_START,
    }
}

const fn hs2_done(endpoint: Endpoint) -> EventFlag {
    match endpoint {
        Endpoint::Md => EventFlag::MD_HS2_DONE,
        Endpoint::Sap => EventFlag::SAP_HS2_DONE,
    }
}

fn queue(submitter: &EventSubmitter, id: EventId, flag: EventFlag, data: &[u8]) {
    if let Err(e) = submitter.submit(id, flag, data, SubmitMode::ATOMIC) {
        log::warn!(target: "mdfsm::dispatch", "dropped {} {:?}: {}", id, flag, e);
    }
}

/// Route device-to-host doorbells
pub(crate) fn route_device_events(submitter: &EventSubmitter, poll_now: &TimerHandle, events: D2hEvent) {
    for ep in Endpoint::ALL {
        if events.contains(hs_notify(ep)) {
            queue(submitter, EventId::Startup, hs_start(ep), &[]);
        }
    }
    let except = [
        (D2hEvent::EXCEPT_INIT, EventFlag::MDEE_INIT),
        (D2hEvent::EXCEPT_CLEARQ_DONE, EventFlag::MDEE_CLEARQ_DONE),
        (D2hEvent::EXCEPT_ALLQ_RESET, EventFlag::MDEE_ALLQ_RESET),
    ];
    for (bit, flag) in except {
        if events.contains(bit) {
            queue(submitter, EventId::Mdee, flag, &[]);
        }
    }
    if events.contains(D2hEvent::BOOT_FLOW_SYNC) {
        poll_now.arm(std::time::Duration::ZERO);
    }
}

/// Route one received control frame
pub(crate) fn route_ctrl_msg(
    submitter: &EventSubmitter,
    endpoint: Endpoint,
    flashless: bool,
    msg: &[u8],
) {
    let id = match CtrlHeader::parse(msg).and_then(|(hdr, _)| hdr.msg_id()) {
        Ok(id) => id,
        Err(e) => {
            log::warn!(target: "mdfsm::handshake", "{}: dropped malformed frame: {}", endpoint, e);
            return;
        },
    };
    log::trace!(target: "mdfsm::handshake", "{}: rx {:?} ({} bytes)", endpoint, id, msg.len());

    let (event, flag) = match (id, endpoint) {
        (CtrlMsgId::Hs2, ep) => (EventId::Startup, hs2_done(ep)),
        (CtrlMsgId::Hs4, Endpoint::Md) if flashless => (EventId::Startup, EventFlag::MD_HS4_DONE),
        (CtrlMsgId::Mdee, _) => (EventId::Mdee, EventFlag::MDEE_MSG),
        (CtrlMsgId::MdeeRecOk, _) => (EventId::Mdee, EventFlag::MDEE_RECV_OK),
        (CtrlMsgId::MdeePass, _) => (EventId::Mdee, EventFlag::MDEE_PASS),
        (other, ep) => {
            log::debug!(target: "mdfsm::handshake", "{}: ignoring {:?}", ep, other);
            return;
        },
    };
    queue(submitter, event, flag, msg);
}

/// Registrations made on the HAL and control channels for one session
pub(crate) struct Sources {
    hal: Arc<dyn ModemHal>,
    channels: [Arc<dyn ControlChannel>; 2],
    hs_events: [D2hEvent; 2],
    submitter: EventSubmitter,
    poll_now: TimerHandle,
    flashless: bool,
    registered: bool,
}

impl Sources {
    pub(crate) fn new(
        hal: Arc<dyn ModemHal>,
        endpoints: &[HandshakeInfo; 2],
        submitter: EventSubmitter,
        poll_now: TimerHandle,
        flashless: bool,
    ) -> Self {
        Self {
            hal,
            channels: [endpoints[0].channel().clone(), endpoints[1].channel().clone()],
            hs_events: [endpoints[0].event_source(), endpoints[1].event_source()],
            submitter,
            poll_now,
            flashless,
            registered: false,
        }
    }

    fn all_events(&self) -> D2hEvent {
        DEVICE_EVENTS | self.hs_events[0] | self.hs_events[1]
    }

    /// Install every handler; all sources stay masked
    pub(crate) fn register(&mut self) -> Result<()> {
        if self.registered {
            return Ok(());
        }
        if let Err(e) = self.try_register() {
            self.release();
            return Err(e);
        }
        self.registered = true;
        Ok(())
    }

    fn try_register(&self) -> Result<()> {
        for src in IrqSource::ALL {
            let submitter = self.submitter.clone();
            self.hal.register_irq(
                src,
                Arc::new(move |src: IrqSource| {
                    log::warn!(target: "mdfsm::dispatch", "reset requested by device ({:?})", src);
                    queue(&submitter, EventId::DevResetReq, EventFlag::RESET_BY_DEVICE, &[]);
                }),
            )?;
        }

        for &event in &self.hs_events {
            let submitter = self.submitter.clone();
            let poll_now = self.poll_now.clone();
            self.hal.register_ext_evt(
                event,
                Arc::new(move |events: D2hEvent| route_device_events(&submitter, &poll_now, events)),
            )?;
        }

        let submitter = self.submitter.clone();
        let poll_now = self.poll_now.clone();
        self.hal.register_ext_evt(
            DEVICE_EVENTS,
            Arc::new(move |events: D2hEvent| route_device_events(&submitter, &poll_now, events)),
        )?;

        for channel in &self.channels {
            let submitter = self.submitter.clone();
            let endpoint = channel.endpoint();
            let flashless = self.flashless;
            channel.set_rx_handler(Some(Arc::new(move |msg: &[u8]| {
                route_ctrl_msg(&submitter, endpoint, flashless, msg)
            })));
        }
        Ok(())
    }

    /// Best-effort removal of whatever is installed
    fn release(&self) {
        for channel in &self.channels {
            channel.set_rx_handler(None);
        }
        for src in IrqSource::ALL {
            let _ = self.hal.unregister_irq(src);
        }
        for &event in &self.hs_events {
            let _ = self.hal.unregister_ext_evt(event);
        }
        let _ = self.hal.unregister_ext_evt(DEVICE_EVENTS);
    }

    /// Mask and drop every handler
    pub(crate) fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        self.mask_all();
        self.release();
        self.registered = false;
    }

    /// Clear latched events and unmask everything
    pub(crate) fn unmask_all(&self) -> Result<()> {
        let events = self.all_events();
        self.hal.clear_ext_evt(events)?;
        self.hal.unmask_ext_evt(events)?;
        for src in IrqSource::ALL {
            self.hal.clear_irq(src)?;
            self.hal.unmask_irq(src)?;
        }
        Ok(())
    }

    /// Mask everything; failures are logged since the link may be gone
    pub(crate) fn mask_all(&self) {
        if let Err(e) = self.hal.mask_ext_evt(self.all_events()) {
            log::warn!(target: "mdfsm::fsm", "masking doorbells failed: {}", e);
        }
        for src in IrqSource::ALL {
            if let Err(e) = self.hal.mask_irq(src) {
                log::warn!(target: "mdfsm::fsm", "masking {:?} failed: {}", src, e);
            }
        }
    }
}
