//! Register write protocol and the deferred write queue between the control and render sides
//!
//! A [`RegisterPort`] is the control side: it latches a register index on even addresses and
//! forwards values written to odd addresses. Writes that affect audio are sent down a channel and
//! only applied when the owning chip drains its [`CommandQueue`] at the start of a render call, so
//! the render side never observes a write halfway through a tick. OPL2 timer registers are stored
//! immediately in shared atomics instead.

use opl_common::num::GetBit;
use std::sync::atomic::{AtomicI16, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

pub const DEFAULT_OUTPUT_RANGE: i16 = 4096;

// Status registers are not emulated
const READ_PLACEHOLDER: u8 = 0xFF;

const OPL2_TIMER_1: u8 = 0x02;
const OPL2_TIMER_2: u8 = 0x03;
const OPL2_TIMER_CONTROL: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub register: u8,
    pub value: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Personality {
    Opl2,
    Opll,
}

/// Registers that both sides may touch without going through the queue
#[derive(Debug)]
pub(crate) struct SharedRegisters {
    timers: [AtomicU8; 2],
    timer_control: AtomicU8,
    output_range: AtomicI16,
    pending_writes: AtomicUsize,
}

impl SharedRegisters {
    fn new() -> Self {
        Self {
            timers: [AtomicU8::new(0), AtomicU8::new(0)],
            timer_control: AtomicU8::new(0),
            output_range: AtomicI16::new(DEFAULT_OUTPUT_RANGE),
            pending_writes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn output_range(&self) -> i16 {
        self.output_range.load(Ordering::Relaxed)
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        self.pending_writes.load(Ordering::Acquire) != 0
    }
}

/// Control-side handle to a chip's registers. Every clone has its own register latch but feeds
/// the same queue.
#[derive(Debug, Clone)]
pub struct RegisterPort {
    personality: Personality,
    selected_register: u8,
    sender: Sender<RegisterWrite>,
    shared: Arc<SharedRegisters>,
}

/// Render-side end of the deferred write queue
#[derive(Debug)]
pub(crate) struct CommandQueue {
    receiver: Receiver<RegisterWrite>,
    shared: Arc<SharedRegisters>,
}

pub(crate) fn new_queue(personality: Personality) -> (RegisterPort, CommandQueue) {
    let (sender, receiver) = mpsc::channel();
    let shared = Arc::new(SharedRegisters::new());

    let port = RegisterPort { personality, selected_register: 0, sender, shared: Arc::clone(&shared) };
    let queue = CommandQueue { receiver, shared };
    (port, queue)
}

impl RegisterPort {
    /// Even addresses select a register, odd addresses write to the selected register.
    pub fn write(&mut self, address: u16, value: u8) {
        if address.bit(0) {
            self.write_register(self.selected_register, value);
        } else {
            self.selected_register = value;
        }
    }

    pub fn write_register(&self, register: u8, value: u8) {
        log::trace!("Register write: {register:02X} {value:02X}");

        if self.personality == Personality::Opl2 {
            let timer_register = match register {
                OPL2_TIMER_1 => Some(&self.shared.timers[0]),
                OPL2_TIMER_2 => Some(&self.shared.timers[1]),
                OPL2_TIMER_CONTROL => Some(&self.shared.timer_control),
                _ => None,
            };
            if let Some(timer_register) = timer_register {
                timer_register.store(value, Ordering::Relaxed);
                return;
            }
        }

        self.shared.pending_writes.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(RegisterWrite { register, value }).is_err() {
            // Chip has been dropped; nothing left to apply the write to
            self.shared.pending_writes.fetch_sub(1, Ordering::AcqRel);
            log::debug!("Register write {register:02X} {value:02X} dropped, chip no longer exists");
        }
    }

    #[must_use]
    pub fn read(&self, _address: u16) -> u8 {
        READ_PLACEHOLDER
    }

    #[must_use]
    pub fn selected_register(&self) -> u8 {
        self.selected_register
    }

    /// OPL2 timer 1 or 2 reload value, as last written
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not 0 or 1.
    #[must_use]
    pub fn timer(&self, timer: usize) -> u8 {
        self.shared.timers[timer].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn timer_control(&self) -> u8 {
        self.shared.timer_control.load(Ordering::Relaxed)
    }

    /// Set the linear output scale; every rendered sample is `level * range >> 12`.
    pub fn set_output_scale(&self, range: i16) {
        self.shared.output_range.store(range, Ordering::Relaxed);
    }
}

impl CommandQueue {
    pub(crate) fn shared(&self) -> &SharedRegisters {
        &self.shared
    }

    /// Apply every queued write in submission order.
    pub(crate) fn drain(&self, mut apply: impl FnMut(RegisterWrite)) {
        while let Ok(write) = self.receiver.try_recv() {
            self.shared.pending_writes.fetch_sub(1, Ordering::AcqRel);
            apply(write);
        }
    }
}
