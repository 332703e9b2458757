//! Press Disambiguator
//!
//! Turns a stream of raw button signals into single/double presses. A second
//! signal for the same raw command inside the timeout window yields a DOUBLE
//! immediately; otherwise a SINGLE fires once the window has elapsed.

use crate::domain::models::{PressEvent, PressType, RawCommand};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

struct PendingSingle {
    ticket: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TapSlot {
    last_seen: Option<Instant>,
    next_ticket: u64,
    pending: Option<PendingSingle>,
}

type Slots = Arc<Mutex<HashMap<RawCommand, TapSlot>>>;

pub struct PressDisambiguator {
    timeout: Duration,
    slots: Slots,
    sink: mpsc::UnboundedSender<PressEvent>,
}

impl PressDisambiguator {
    pub fn new(timeout: Duration, sink: mpsc::UnboundedSender<PressEvent>) -> Self {
        Self {
            timeout,
            slots: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Feed one raw signal. Must be called from within a tokio runtime.
    pub fn handle(&self, command: RawCommand) {
        let now = Instant::now();
        let mut slots = lock(&self.slots);
        let slot = slots.entry(command).or_default();

        let within_window = slot
            .last_seen
            .map_or(false, |last| now.duration_since(last) <= self.timeout);
        slot.last_seen = Some(now);

        if within_window {
            if let Some(pending) = slot.pending.take() {
                pending.task.abort();
            }
            trace!("Double press on {}", command);
            emit(&self.sink, command, PressType::Double);
            return;
        }

        // A SINGLE whose window already closed but whose timer has not run
        // yet is still owed.
        if let Some(overdue) = slot.pending.take() {
            overdue.task.abort();
            emit(&self.sink, command, PressType::Single);
        }

        let ticket = slot.next_ticket;
        slot.next_ticket = slot.next_ticket.wrapping_add(1);
        let task = tokio::spawn(fire_single(
            self.slots.clone(),
            self.sink.clone(),
            command,
            ticket,
            self.timeout,
        ));
        slot.pending = Some(PendingSingle { ticket, task });
    }

    /// Number of raw commands with a SINGLE still waiting on its window.
    pub fn pending_count(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| slot.pending.is_some())
            .count()
    }
}

impl Drop for PressDisambiguator {
    fn drop(&mut self) {
        for slot in lock(&self.slots).values_mut() {
            if let Some(pending) = slot.pending.take() {
                pending.task.abort();
            }
        }
    }
}

async fn fire_single(
    slots: Slots,
    sink: mpsc::UnboundedSender<PressEvent>,
    command: RawCommand,
    ticket: u64,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;

    let mut slots = lock(&slots);
    let Some(slot) = slots.get_mut(&command) else {
        return;
    };
    let still_pending = slot
        .pending
        .as_ref()
        .map_or(false, |pending| pending.ticket == ticket);
    if still_pending {
        slot.pending = None;
        emit(&sink, command, PressType::Single);
    }
}

fn emit(sink: &mpsc::UnboundedSender<PressEvent>, command: RawCommand, press: PressType) {
    if sink.send(PressEvent { command, press }).is_err() {
        debug!("Press receiver gone, dropping {:?} on {}", press, command);
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<RawCommand, TapSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
