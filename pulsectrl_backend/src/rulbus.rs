//! Minimal rust wrapper for the parts of the Rulbus C library used by the pulser.
//!
//! ## Overview
//!
//! [`RulbusTransport`] implements [`CardTransport`] by calling the RB8514 delay card and RB8515
//! clock card functions of `librulbus`. Every driver call goes through [`rulbus_call`], which
//! turns a negative return code into a [`TransportError`] carrying the driver's error string,
//! so failures reach the pulser's failure handling instead of aborting the process.
//!
//! ## Cleanup and Resource Management
//!
//! The library is opened by [`RulbusTransport::new`] and closed again when the transport is
//! dropped; card handles are closed by the pulser at the end of the experiment.
//!
//! ## Example
//!
//! ```ignore
//! # use pulsectrl_backend::*;
//! let mut transport = RulbusTransport::new()?;
//! let handle = transport.open("MW_GAP_0")?;
//! transport.set_raw_delay(handle, 14, true)?;
//! ```

use std::ffi::{CStr, CString};

use pulsecompiler_backend::{ClockFreq, OutputPulse, Polarity, Slope, Ticks};

use crate::error::TransportError;
use crate::transport::{CardHandle, CardTransport, TransportResult};

type CConstStr = *const libc::c_char;
type CInt = libc::c_int;
type CULong = libc::c_ulong;

pub const RULBUS_OK: CInt = 0;
pub const RB8514_DELAY_OUTPUT_1: CInt = 1;
pub const RB8514_DELAY_OUTPUT_2: CInt = 2;
pub const RB8514_DELAY_START_PULSE: CInt = 4;
pub const RB8514_DELAY_END_PULSE: CInt = 8;
pub const RB8514_DELAY_PULSE_NONE: CInt = 0;
pub const RB8514_DELAY_POLARITY_NEGATIVE: CInt = 1;
pub const RB8514_DELAY_POLARITY_POSITIVE: CInt = 2;
pub const RB8514_DELAY_FALLING_EDGE: CInt = 0;
pub const RB8514_DELAY_RAISING_EDGE: CInt = 1;
pub const RB8515_CLOCK_FREQ_OFF: CInt = 0;

#[link(name = "rulbus")]
extern "C" {
    fn rulbus_open(flags: CInt) -> CInt;
    fn rulbus_close();
    fn rulbus_strerror() -> CConstStr;

    fn rulbus_card_open(name: CConstStr) -> CInt;
    fn rulbus_card_close(handle: CInt) -> CInt;

    fn rulbus_rb8514_delay_set_raw_delay(handle: CInt, delay: CULong, force: CInt) -> CInt;
    fn rulbus_rb8514_delay_set_output_pulse(handle: CInt, output: CInt, pulse_type: CInt) -> CInt;
    fn rulbus_rb8514_delay_set_output_pulse_polarity(
        handle: CInt,
        output: CInt,
        polarity: CInt,
    ) -> CInt;
    fn rulbus_rb8514_delay_set_trigger(handle: CInt, edge: CInt) -> CInt;
    fn rulbus_rb8514_delay_busy(handle: CInt) -> CInt;
    fn rulbus_rb8514_software_start(handle: CInt) -> CInt;

    fn rulbus_rb8515_clock_set_frequency(handle: CInt, freq: CInt) -> CInt;
}

/// Calls a Rulbus C-function and converts a negative return code into an error.
///
/// The error message is the driver's description of its last error.
pub fn rulbus_call<F: FnOnce() -> CInt>(func: F) -> TransportResult<CInt> {
    let code = func();
    if code < RULBUS_OK {
        let msg = unsafe {
            let ptr = rulbus_strerror();
            if ptr.is_null() {
                String::from("unknown error")
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        };
        return Err(TransportError::new(code, msg));
    }
    Ok(code)
}

fn to_cstring(s: &str) -> TransportResult<CString> {
    CString::new(s).map_err(|_| TransportError::new(-1, format!("invalid card name {s:?}")))
}

fn clock_selector(freq: ClockFreq) -> CInt {
    // selectors count down from 100 MHz (1) to 1 Hz (9), 0 switches the clock off
    ClockFreq::ALL
        .iter()
        .position(|f| *f == freq)
        .map_or(RB8515_CLOCK_FREQ_OFF, |i| i as CInt + 1)
}

pub struct RulbusTransport {
    _private: (),
}

impl RulbusTransport {
    pub fn new() -> TransportResult<Self> {
        rulbus_call(|| unsafe { rulbus_open(0) })?;
        Ok(Self { _private: () })
    }
}

impl Drop for RulbusTransport {
    fn drop(&mut self) {
        unsafe { rulbus_close() };
    }
}

impl CardTransport for RulbusTransport {
    fn open(&mut self, name: &str) -> TransportResult<CardHandle> {
        let name_cstr = to_cstring(name)?;
        rulbus_call(|| unsafe { rulbus_card_open(name_cstr.as_ptr()) })
    }

    fn close(&mut self, handle: CardHandle) -> TransportResult<()> {
        rulbus_call(|| unsafe { rulbus_card_close(handle) }).map(|_| ())
    }

    fn set_raw_delay(
        &mut self,
        handle: CardHandle,
        ticks: Ticks,
        wait_ready: bool,
    ) -> TransportResult<()> {
        let ticks = CULong::try_from(ticks)
            .map_err(|_| TransportError::new(-1, format!("invalid delay of {ticks} ticks")))?;
        let force = wait_ready as CInt;
        rulbus_call(|| unsafe { rulbus_rb8514_delay_set_raw_delay(handle, ticks, force) })
            .map(|_| ())
    }

    fn set_output_pulse(
        &mut self,
        handle: CardHandle,
        which: OutputPulse,
        polarity: Polarity,
    ) -> TransportResult<()> {
        let pulse = match which {
            OutputPulse::Start => RB8514_DELAY_START_PULSE,
            OutputPulse::End => RB8514_DELAY_END_PULSE,
        };
        let (pulse, polarity) = match polarity {
            Polarity::Off => (RB8514_DELAY_PULSE_NONE, RB8514_DELAY_POLARITY_POSITIVE),
            Polarity::Positive => (pulse, RB8514_DELAY_POLARITY_POSITIVE),
            Polarity::Negative => (pulse, RB8514_DELAY_POLARITY_NEGATIVE),
        };
        for output in [RB8514_DELAY_OUTPUT_1, RB8514_DELAY_OUTPUT_2] {
            rulbus_call(|| unsafe { rulbus_rb8514_delay_set_output_pulse(handle, output, pulse) })?;
            rulbus_call(|| unsafe {
                rulbus_rb8514_delay_set_output_pulse_polarity(handle, output, polarity)
            })?;
        }
        Ok(())
    }

    fn route_output(&mut self, handle: CardHandle, line: u8) -> TransportResult<()> {
        // lines 0-3: end pulse on output 1 or 2, positive or negative
        let routed = if line % 2 == 0 { RB8514_DELAY_OUTPUT_1 } else { RB8514_DELAY_OUTPUT_2 };
        let polarity = if line < 2 {
            RB8514_DELAY_POLARITY_POSITIVE
        } else {
            RB8514_DELAY_POLARITY_NEGATIVE
        };
        for output in [RB8514_DELAY_OUTPUT_1, RB8514_DELAY_OUTPUT_2] {
            let pulse = if output == routed {
                RB8514_DELAY_END_PULSE
            } else {
                RB8514_DELAY_PULSE_NONE
            };
            rulbus_call(|| unsafe { rulbus_rb8514_delay_set_output_pulse(handle, output, pulse) })?;
        }
        rulbus_call(|| unsafe {
            rulbus_rb8514_delay_set_output_pulse_polarity(handle, routed, polarity)
        })
        .map(|_| ())
    }

    fn set_trigger_slope(&mut self, handle: CardHandle, slope: Slope) -> TransportResult<()> {
        let edge = match slope {
            Slope::Positive => RB8514_DELAY_RAISING_EDGE,
            Slope::Negative => RB8514_DELAY_FALLING_EDGE,
        };
        rulbus_call(|| unsafe { rulbus_rb8514_delay_set_trigger(handle, edge) }).map(|_| ())
    }

    fn is_busy(&mut self, handle: CardHandle) -> TransportResult<bool> {
        rulbus_call(|| unsafe { rulbus_rb8514_delay_busy(handle) }).map(|busy| busy != 0)
    }

    fn software_start(&mut self, handle: CardHandle) -> TransportResult<()> {
        rulbus_call(|| unsafe { rulbus_rb8514_software_start(handle) }).map(|_| ())
    }

    fn set_clock_frequency(&mut self, handle: CardHandle, freq: ClockFreq) -> TransportResult<()> {
        let selector = clock_selector(freq);
        rulbus_call(|| unsafe { rulbus_rb8515_clock_set_frequency(handle, selector) }).map(|_| ())
    }
}
