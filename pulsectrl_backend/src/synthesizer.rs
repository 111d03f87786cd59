//! The RF synthesizer producing the RF pulses.
//!
//! The synthesizer is a separate instrument triggered by the RF delay card. It is bound to the
//! pulser at setup; the pulser only uses it through the operations below.

use std::cell::RefCell;
use std::rc::Rc;

use pulsecompiler_backend::Slope;

use crate::error::TransportError;
use crate::transport::TransportResult;

pub trait RfSynthesizer {
    fn set_pulse_width(&mut self, width: f64) -> TransportResult<()>;
    /// Delay of the second pulse in double-pulse mode.
    fn set_pulse_delay(&mut self, delay: f64) -> TransportResult<()>;
    fn set_trigger_slope(&mut self, slope: Slope) -> TransportResult<()>;
    fn set_output(&mut self, on: bool) -> TransportResult<()>;
    fn set_double_mode(&mut self, on: bool) -> TransportResult<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum SynthCall {
    PulseWidth(f64),
    PulseDelay(f64),
    TriggerSlope(Slope),
    Output(bool),
    DoubleMode(bool),
}

/// Synthesizer stand-in logging every call.
#[derive(Clone, Debug, Default)]
pub struct RecordingSynthesizer {
    calls: Rc<RefCell<Vec<SynthCall>>>,
    /// Rejects pulse widths above this, like a real device with a limited range.
    pub max_width: Option<f64>,
}

impl RecordingSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls so far; clones share the log.
    pub fn calls(&self) -> Vec<SynthCall> {
        self.calls.borrow().clone()
    }

    fn record(&mut self, call: SynthCall) -> TransportResult<()> {
        self.calls.borrow_mut().push(call);
        Ok(())
    }
}

impl RfSynthesizer for RecordingSynthesizer {
    fn set_pulse_width(&mut self, width: f64) -> TransportResult<()> {
        if self.max_width.is_some_and(|max| width > max) {
            return Err(TransportError::new(-1, format!("pulse width {width} s out of range")));
        }
        self.record(SynthCall::PulseWidth(width))
    }

    fn set_pulse_delay(&mut self, delay: f64) -> TransportResult<()> {
        self.record(SynthCall::PulseDelay(delay))
    }

    fn set_trigger_slope(&mut self, slope: Slope) -> TransportResult<()> {
        self.record(SynthCall::TriggerSlope(slope))
    }

    fn set_output(&mut self, on: bool) -> TransportResult<()> {
        self.record(SynthCall::Output(on))
    }

    fn set_double_mode(&mut self, on: bool) -> TransportResult<()> {
        self.record(SynthCall::DoubleMode(on))
    }
}
