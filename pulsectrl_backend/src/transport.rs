//! Access to the delay and clock cards.
//!
//! [`CardTransport`] lists the card operations the pulser needs. [`RulbusTransport`]
//! (feature `rulbus`) implements them on top of the card driver library; [`RecordingTransport`]
//! keeps everything in memory and logs each call, for test runs and tests.
//!
//! [`RulbusTransport`]: crate::rulbus::RulbusTransport

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;

use pulsecompiler_backend::{ClockFreq, OutputPulse, Polarity, Slope, Ticks};

use crate::error::TransportError;

pub type CardHandle = i32;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

pub trait CardTransport {
    fn open(&mut self, name: &str) -> TransportResult<CardHandle>;
    fn close(&mut self, handle: CardHandle) -> TransportResult<()>;

    /// Writes a delay; with `wait_ready` the driver first waits for a running delay to end.
    fn set_raw_delay(
        &mut self,
        handle: CardHandle,
        ticks: Ticks,
        wait_ready: bool,
    ) -> TransportResult<()>;
    fn set_output_pulse(
        &mut self,
        handle: CardHandle,
        which: OutputPulse,
        polarity: Polarity,
    ) -> TransportResult<()>;
    /// Connects the card's end pulse to output line `line` (phase cards).
    fn route_output(&mut self, handle: CardHandle, line: u8) -> TransportResult<()>;
    fn set_trigger_slope(&mut self, handle: CardHandle, slope: Slope) -> TransportResult<()>;
    fn is_busy(&mut self, handle: CardHandle) -> TransportResult<bool>;
    fn software_start(&mut self, handle: CardHandle) -> TransportResult<()>;
    fn set_clock_frequency(&mut self, handle: CardHandle, freq: ClockFreq) -> TransportResult<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportCall {
    Open(String),
    Close(String),
    SetDelay { card: String, ticks: Ticks, wait_ready: bool },
    SetOutput { card: String, which: OutputPulse, polarity: Polarity },
    Route { card: String, line: u8 },
    SetSlope { card: String, slope: Slope },
    IsBusy(String),
    SoftwareStart(String),
    SetClock { card: String, freq: ClockFreq },
}

impl TransportCall {
    pub fn card(&self) -> &str {
        match self {
            TransportCall::Open(card)
            | TransportCall::Close(card)
            | TransportCall::IsBusy(card)
            | TransportCall::SoftwareStart(card) => card,
            TransportCall::SetDelay { card, .. }
            | TransportCall::SetOutput { card, .. }
            | TransportCall::Route { card, .. }
            | TransportCall::SetSlope { card, .. }
            | TransportCall::SetClock { card, .. } => card,
        }
    }

    /// True for calls that change the state of a card.
    pub fn is_write(&self) -> bool {
        !matches!(self, TransportCall::IsBusy(_) | TransportCall::Open(_) | TransportCall::Close(_))
    }
}

/// Shared view into a [`RecordingTransport`], usable after the transport was handed to a
/// pulser.
#[derive(Clone, Debug, Default)]
pub struct TransportProbe {
    calls: Rc<RefCell<Vec<TransportCall>>>,
    busy_polls: Rc<Cell<usize>>,
    fail_op: Rc<RefCell<Option<String>>>,
}

impl TransportProbe {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.borrow().clone()
    }

    pub fn writes(&self) -> Vec<TransportCall> {
        self.calls.borrow().iter().filter(|c| c.is_write()).cloned().collect()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Makes the next `polls` busy queries report a busy card.
    pub fn set_busy_polls(&self, polls: usize) {
        self.busy_polls.set(polls);
    }

    /// Makes every call of the given operation (e.g. `"set_raw_delay"`) fail.
    pub fn fail_on(&self, op: Option<&str>) {
        *self.fail_op.borrow_mut() = op.map(str::to_string);
    }
}

/// In-memory card transport logging every call.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    probe: TransportProbe,
    cards: IndexMap<CardHandle, String>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> TransportProbe {
        self.probe.clone()
    }

    fn record<F>(&mut self, op: &str, call: F, handle: CardHandle) -> TransportResult<()>
    where
        F: FnOnce(String) -> TransportCall,
    {
        let name = self
            .cards
            .get(&handle)
            .cloned()
            .ok_or_else(|| TransportError::new(-1, format!("invalid card handle {handle}")))?;
        if self.probe.fail_op.borrow().as_deref() == Some(op) {
            return Err(TransportError::new(-2, format!("{op} rejected by card {name}")));
        }
        self.probe.calls.borrow_mut().push(call(name));
        Ok(())
    }
}

impl CardTransport for RecordingTransport {
    fn open(&mut self, name: &str) -> TransportResult<CardHandle> {
        if self.probe.fail_op.borrow().as_deref() == Some("open") {
            return Err(TransportError::new(-2, format!("no card named {name}")));
        }
        let handle = self.cards.len() as CardHandle;
        self.cards.insert(handle, name.to_string());
        self.probe.calls.borrow_mut().push(TransportCall::Open(name.to_string()));
        Ok(handle)
    }

    fn close(&mut self, handle: CardHandle) -> TransportResult<()> {
        self.record("close", TransportCall::Close, handle)
    }

    fn set_raw_delay(
        &mut self,
        handle: CardHandle,
        ticks: Ticks,
        wait_ready: bool,
    ) -> TransportResult<()> {
        self.record(
            "set_raw_delay",
            |card| TransportCall::SetDelay { card, ticks, wait_ready },
            handle,
        )
    }

    fn set_output_pulse(
        &mut self,
        handle: CardHandle,
        which: OutputPulse,
        polarity: Polarity,
    ) -> TransportResult<()> {
        self.record(
            "set_output_pulse",
            |card| TransportCall::SetOutput { card, which, polarity },
            handle,
        )
    }

    fn route_output(&mut self, handle: CardHandle, line: u8) -> TransportResult<()> {
        self.record("route_output", |card| TransportCall::Route { card, line }, handle)
    }

    fn set_trigger_slope(&mut self, handle: CardHandle, slope: Slope) -> TransportResult<()> {
        self.record("set_trigger_slope", |card| TransportCall::SetSlope { card, slope }, handle)
    }

    fn is_busy(&mut self, handle: CardHandle) -> TransportResult<bool> {
        self.record("is_busy", TransportCall::IsBusy, handle)?;
        let polls = self.probe.busy_polls.get();
        if polls > 0 {
            self.probe.busy_polls.set(polls - 1);
        }
        Ok(polls > 0)
    }

    fn software_start(&mut self, handle: CardHandle) -> TransportResult<()> {
        self.record("software_start", TransportCall::SoftwareStart, handle)
    }

    fn set_clock_frequency(&mut self, handle: CardHandle, freq: ClockFreq) -> TransportResult<()> {
        self.record("set_clock_frequency", |card| TransportCall::SetClock { card, freq }, handle)
    }
}
