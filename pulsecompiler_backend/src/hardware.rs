//! Fixed properties of the pulser hardware: RB8514 delay cards, RB8515 clock cards and the
//! RF synthesizer used in double-pulse mode.

use std::fmt;

use crate::ticks::Ticks;

/// Largest delay a RB8514 delay card can count (24 bit counter).
pub const MAX_TICKS: Ticks = 0xFF_FFFF;

/// Latency between trigger input and output of a RB8514 card, used when no per-card
/// value is configured.
pub const DEFAULT_INTRINSIC_DELAY: f64 = 20e-9;

/// Number of gap/length card pairs in the microwave chain.
pub const MW_MAX_PULSES: usize = 3;
/// The synthesizer produces at most two pulses per trigger.
pub const RF_MAX_PULSES: usize = 2;
pub const LASER_MAX_PULSES: usize = 1;
pub const DETECTION_MAX_PULSES: usize = 1;
pub const DEFENSE_MAX_PULSES: usize = 1;

/// Minimum distance between the starts of two RF pulses in double-pulse mode.
pub const SYNTH_MIN_PULSE_SEPARATION: f64 = 100e-9;

/// Shortest pulse a phase card may output.
pub const PHASE_MIN_PULSE_LENGTH: f64 = 20e-9;

/// Frequencies selectable on a RB8515 clock card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClockFreq {
    F100MHz,
    F10MHz,
    F1MHz,
    F100kHz,
    F10kHz,
    F1kHz,
    F100Hz,
    F10Hz,
    F1Hz,
}

impl ClockFreq {
    /// All selectors, fastest first.
    pub const ALL: [ClockFreq; 9] = [
        ClockFreq::F100MHz,
        ClockFreq::F10MHz,
        ClockFreq::F1MHz,
        ClockFreq::F100kHz,
        ClockFreq::F10kHz,
        ClockFreq::F1kHz,
        ClockFreq::F100Hz,
        ClockFreq::F10Hz,
        ClockFreq::F1Hz,
    ];

    pub fn frequency(&self) -> f64 {
        match self {
            ClockFreq::F100MHz => 1e8,
            ClockFreq::F10MHz => 1e7,
            ClockFreq::F1MHz => 1e6,
            ClockFreq::F100kHz => 1e5,
            ClockFreq::F10kHz => 1e4,
            ClockFreq::F1kHz => 1e3,
            ClockFreq::F100Hz => 1e2,
            ClockFreq::F10Hz => 1e1,
            ClockFreq::F1Hz => 1e0,
        }
    }

    pub fn period(&self) -> f64 {
        1.0 / self.frequency()
    }

    /// The selector whose period equals `timebase` within 1 %.
    pub fn from_period(timebase: f64) -> Option<ClockFreq> {
        ClockFreq::ALL
            .into_iter()
            .find(|freq| ((freq.period() - timebase) / freq.period()).abs() < 1e-2)
    }

    /// The fastest selector that can count `duration` within a single card.
    pub fn fastest_for(duration: f64) -> Option<ClockFreq> {
        ClockFreq::ALL
            .into_iter()
            .find(|freq| (duration / freq.period()).round() <= MAX_TICKS as f64)
    }
}

impl fmt::Display for ClockFreq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} Hz", self.frequency())
    }
}

/// Edge a card or the synthesizer reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slope {
    Positive,
    Negative,
}

/// Output connectors of a delay card.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputPulse {
    Start,
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    Off,
    Positive,
    Negative,
}
