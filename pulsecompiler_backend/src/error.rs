//! Error type shared by every compile-time operation of the pulser.
//!
//! All variants describe validation failures: a time that cannot be expressed at the
//! current timebase, misuse of the pulse registry, or a pulse configuration the card
//! chain cannot produce. They are all detected while computing card delays, before a
//! single hardware call is issued, so an `Err` never leaves the hardware half-programmed.

use thiserror::Error;

use crate::function::FunctionId;
use crate::ticks::Ticks;

/// Pulse numbers: user pulses are non-negative, internally generated pulses negative.
pub type PulseNum = i64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PulserError {
    #[error("time of {value} s is not an integer multiple of the timebase of {timebase} s")]
    PrecisionError { value: f64, timebase: f64 },

    #[error("time of {value} s is out of range, maximum is {max} s")]
    RangeError { value: f64, max: f64 },

    #[error("timebase of {0} s does not match any frequency of the timebase clock card")]
    InvalidTimebase(f64),

    #[error("pulse #{0} already exists")]
    DuplicatePulse(PulseNum),

    #[error("pulse #{0} does not exist")]
    UnknownPulse(PulseNum),

    #[error("invalid pulse number {0}, user pulse numbers must be non-negative")]
    InvalidPulseNumber(PulseNum),

    #[error("{property} of pulse #{pulse} has already been set")]
    AlreadySet {
        pulse: PulseNum,
        property: &'static str,
    },

    #[error("pulse #{0} is active but has not been assigned a function")]
    MissingFunction(PulseNum),

    #[error("pulse #{pulse} can't be used with function {function}: {reason}")]
    InvalidFunction {
        pulse: PulseNum,
        function: FunctionId,
        reason: String,
    },

    #[error("unknown function name '{0}'")]
    UnknownFunction(String),

    #[error("invalid value for pulse #{pulse}: {reason}")]
    InvalidValue { pulse: PulseNum, reason: String },

    #[error("defense pulse #{pulse} is fixed at {fixed} s, can't move it to {requested} s")]
    PositionFixed {
        pulse: PulseNum,
        fixed: f64,
        requested: f64,
    },

    #[error("{property} delta of pulse #{pulse} has never been set")]
    DeltaNotSet {
        pulse: PulseNum,
        property: &'static str,
    },

    #[error("phase cycle {0} does not exist")]
    UnknownPhaseCycle(usize),

    #[error("a phase cycle needs at least one phase")]
    EmptyPhaseCycle,

    #[error("unknown phase '{0}', expected one of +X, -X, +Y, -Y")]
    UnknownPhase(String),

    #[error("{function} pulse #{pulse} starts too early: {detail}")]
    TooEarly {
        function: FunctionId,
        pulse: PulseNum,
        detail: String,
    },

    #[error("{function} pulse #{pulse} is too close to the previous pulse: {detail}")]
    TooClose {
        function: FunctionId,
        pulse: PulseNum,
        detail: String,
    },

    #[error("{function} pulse #{pulse} starts too late: {detail}")]
    TooLate {
        function: FunctionId,
        pulse: PulseNum,
        detail: String,
    },

    #[error("{function} pulse #{pulse} needs {ticks} ticks, more than a card can count")]
    TooLong {
        function: FunctionId,
        pulse: PulseNum,
        ticks: Ticks,
    },

    #[error("function {function} has {requested} active pulses, its cards support {max}")]
    TooManyPulses {
        function: FunctionId,
        requested: usize,
        max: usize,
    },

    #[error("pulse sequence of {length} s is longer than the repetition time of {rep_time} s")]
    SequenceTooLong { length: f64, rep_time: f64 },
}

pub type Result<T, E = PulserError> = std::result::Result<T, E>;
