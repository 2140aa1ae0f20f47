//! # Boot-Stage Watcher
//!
//! Polls the device-state register while the device boots and turns stage
//! changes into `Download`/`Postdump` events. Polling stops once the device
//! reports the OS stage; a device that has not got there within the boot
//! timeout gets one diagnostic dump.
//!
//! | Stage        | Field value        | Event                        |
//! |--------------|--------------------|------------------------------|
//! | BROM         | `JumpBl`           | `Download(DL_JUMP_BL)`       |
//! | BROM         | `TimeOut`          | `Download(DL_TIMEOUT)`       |
//! | BROM         | `JumpDa`           | `Download(DL_JUMP_DA)`       |
//! | BROM         | `CreateDlPort`     | `Download(DL_PORT_CREATE)`   |
//! | BROM         | `StartDl`          | `Download(DL_PRIMARY_LOADER)`|
//! | LK           | `CreatePdPort`     | `Download(DL_JUMP_LK)`       |
//! | LK           | `CreateReboot/RemotePort` | `Download(DL_FALLBACK_PORT)` |
//! | LK           | `DumpInfo/CreateDumpPort` | `Postdump`            |

use std::sync::Arc;
use std::time::{Duration, Instant};

use mdfsm_hal::device::layout;
use mdfsm_hal::{
    BootStage, BromEvent, DevState, ExceptionKind, ExceptionReporter, LkEvent, ModemHal,
};

use crate::dispatcher::EventSubmitter;
use crate::error::Result;
use crate::event::{EventFlag, EventId, SubmitMode};
use crate::timer::{Timer, TimerControl, TimerHandle};

const PROGRESS_MASK: u32 = layout::STAGE_MASK
    | (layout::EVT_MASK << layout::BROM_EVT_SHIFT)
    | (layout::EVT_MASK << layout::LK_EVT_SHIFT);

#[derive(Debug, Default)]
struct Progress {
    last: Option<u32>,
    started: Option<Instant>,
    timeout_reported: bool,
}

/// Event implied by a device-state reading
pub(crate) fn classify(state: DevState) -> Option<(EventId, EventFlag)> {
    let dl = |flag| Some((EventId::Download, flag));
    match state.stage() {
        BootStage::Brom1 | BootStage::Brom2 => match state.brom_event() {
            BromEvent::JumpBl => dl(EventFlag::DL_JUMP_BL),
            BromEvent::TimeOut => dl(EventFlag::DL_TIMEOUT),
            BromEvent::JumpDa => dl(EventFlag::DL_JUMP_DA),
            BromEvent::CreateDlPort => dl(EventFlag::DL_PORT_CREATE),
            BromEvent::StartDl => dl(EventFlag::DL_PRIMARY_LOADER),
            BromEvent::Normal | BromEvent::Unknown => None,
        },
        BootStage::Lk => match state.lk_event() {
            LkEvent::CreatePdPort => dl(EventFlag::DL_JUMP_LK),
            LkEvent::CreateRebootPort | LkEvent::CreateRemotePort => {
                dl(EventFlag::DL_FALLBACK_PORT)
            },
            LkEvent::DumpInfo | LkEvent::CreateDumpPort => {
                Some((EventId::Postdump, EventFlag::empty()))
            },
            LkEvent::Normal | LkEvent::Unknown => None,
        },
        BootStage::Init | BootStage::Linux | BootStage::Unknown => None,
    }
}

struct PollContext {
    hal: Arc<dyn ModemHal>,
    submitter: EventSubmitter,
    reporter: Option<Arc<dyn ExceptionReporter>>,
    progress: Arc<spin::Mutex<Progress>>,
    interval: Duration,
    timeout: Duration,
}

impl PollContext {
    fn submit(&self, id: EventId, flag: EventFlag) {
        if let Err(e) = self
            .submitter
            .submit(id, flag, &[], SubmitMode::ATOMIC)
        {
            log::warn!(target: "mdfsm::watcher", "could not queue {}: {}", id, e);
        }
    }

    fn poll(&self) -> TimerControl {
        let state = self.hal.get_dev_state();
        if state.is_link_down() {
            log::error!(target: "mdfsm::watcher", "device-state read returned all ones");
            if let Some(r) = &self.reporter {
                r.report(ExceptionKind::LinkDown);
            }
            self.submit(EventId::Linkdown, EventFlag::empty());
            return TimerControl::Stop;
        }

        let (changed, overdue) = {
            let mut p = self.progress.lock();
            let key = state.raw() & PROGRESS_MASK;
            let changed = p.last != Some(key);
            p.last = Some(key);
            let overdue = !p.timeout_reported
                && p.started.map_or(false, |t| t.elapsed() >= self.timeout);
            if overdue {
                p.timeout_reported = true;
            }
            (changed, overdue)
        };

        if changed {
            log::debug!(target: "mdfsm::watcher", "device state {:?}", state);
            if let Some((id, flag)) = classify(state) {
                self.submit(id, flag);
            }
        }

        if state.stage() == BootStage::Linux {
            log::info!(target: "mdfsm::watcher", "device reached OS stage");
            return TimerControl::Stop;
        }

        if overdue {
            log::warn!(
                target: "mdfsm::watcher",
                "device stuck at {:?} after {:?}",
                state.stage(),
                self.timeout
            );
            self.hal.dbg_dump();
            if let Some(r) = &self.reporter {
                r.report(ExceptionKind::BootTimeout);
            }
        }

        TimerControl::Rearm(self.interval)
    }
}

/// Periodic device-state poller
pub(crate) struct BootWatcher {
    timer: Timer,
    progress: Arc<spin::Mutex<Progress>>,
}

impl BootWatcher {
    pub(crate) fn spawn(
        hal: Arc<dyn ModemHal>,
        submitter: EventSubmitter,
        reporter: Option<Arc<dyn ExceptionReporter>>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let progress = Arc::new(spin::Mutex::new(Progress::default()));
        let ctx = PollContext {
            hal,
            submitter,
            reporter,
            progress: progress.clone(),
            interval,
            timeout,
        };
        let timer = Timer::spawn("mdfsm-watcher", move || ctx.poll())?;
        Ok(Self { timer, progress })
    }

    /// Forget earlier readings and poll immediately
    pub(crate) fn start(&self) {
        *self.progress.lock() = Progress {
            started: Some(Instant::now()),
            ..Progress::default()
        };
        self.timer.arm(Duration::ZERO);
    }

    /// Stop polling
    pub(crate) fn stop(&self) {
        self.timer.cancel();
    }

    /// Handle used to force an immediate poll
    pub(crate) fn poll_handle(&self) -> TimerHandle {
        self.timer.handle()
    }
}
