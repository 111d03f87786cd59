//! In-code configuration of the pulser.
//!
//! A [`PulserConfig`] is built once, before any pulse is created, and is frozen as soon as it
//! is handed to a [`PulserState`](crate::state::PulserState). It replaces the device
//! configuration file of the instrument: timebase, trigger source, per-function propagation
//! delays, the intrinsic latency of every delay card and the tuning constants of the derived
//! phase and defense channels.
//!
//! ```
//! use pulsecompiler_backend::config::*;
//! use pulsecompiler_backend::function::FunctionId;
//!
//! let config = PulserConfig::new(1e-8)
//!     .unwrap()
//!     .cfg_internal_trigger(1e-3)
//!     .unwrap()
//!     .cfg_function_delay(FunctionId::Laser, -30e-9)
//!     .cfg_defense_min_distance(50e-9);
//! assert_eq!(config.trigger_mode, TriggerMode::Internal);
//! ```

use std::collections::HashMap;

use maplit::hashmap;

use crate::card::{default_intrinsic_delays, CardId};
use crate::error::*;
use crate::function::FunctionId;
use crate::hardware::{ClockFreq, Slope};
use crate::ticks::Ticks;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    /// The repetition delay card retriggers itself every repetition period.
    Internal,
    /// Every sequence is started by an edge on the trigger input.
    External(Slope),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefenseMode {
    /// The defense pulse is derived from the microwave pulses.
    Automatic,
    /// The user owns the defense pulse; only its length can be chosen.
    Manual,
}

pub const DEFAULT_PHASE_SWITCH_DELAY: f64 = 20e-9;
pub const DEFAULT_GRACE_PERIOD: f64 = 10e-9;
pub const DEFAULT_DEFENSE_MIN_DISTANCE: f64 = 50e-9;
pub const DEFAULT_DEFENSE_GRANULARITY: Ticks = 10;

#[derive(Clone, Debug)]
pub struct PulserConfig {
    pub timebase: f64,
    pub trigger_mode: TriggerMode,
    pub rep_time: Option<f64>,
    pub function_delays: HashMap<FunctionId, f64>,
    pub intrinsic_delays: HashMap<CardId, f64>,
    pub defense_mode: DefenseMode,
    /// Time the defense pulse has to extend past the end of the last microwave pulse.
    pub defense_min_distance: f64,
    /// Defense card delays are rounded up to a multiple of this many ticks.
    pub defense_granularity: Ticks,
    /// Time the phase switch needs between its trigger and a settled phase.
    pub phase_switch_delay: f64,
    /// Minimum time between the end of a microwave pulse and the next phase switch.
    pub grace_period: f64,
    pub synth_trigger_slope: Slope,
}

impl PulserConfig {
    /// Fails with [`PulserError::InvalidTimebase`] unless `timebase` is the period of one of
    /// the timebase clock card's frequencies.
    pub fn new(timebase: f64) -> Result<Self> {
        if !(timebase > 0.) || ClockFreq::from_period(timebase).is_none() {
            return Err(PulserError::InvalidTimebase(timebase));
        }
        Ok(Self {
            timebase,
            trigger_mode: TriggerMode::External(Slope::Positive),
            rep_time: None,
            function_delays: hashmap! {},
            intrinsic_delays: default_intrinsic_delays(),
            defense_mode: DefenseMode::Automatic,
            defense_min_distance: DEFAULT_DEFENSE_MIN_DISTANCE,
            defense_granularity: DEFAULT_DEFENSE_GRANULARITY,
            phase_switch_delay: DEFAULT_PHASE_SWITCH_DELAY,
            grace_period: DEFAULT_GRACE_PERIOD,
            synth_trigger_slope: Slope::Positive,
        })
    }

    /// Switches to internal triggering with the given repetition period.
    ///
    /// The period must be countable by the repetition delay card at some clock frequency.
    pub fn cfg_internal_trigger(mut self, rep_time: f64) -> Result<Self> {
        if !(rep_time > 0.) || ClockFreq::fastest_for(rep_time).is_none() {
            return Err(PulserError::RangeError {
                value: rep_time,
                max: ClockFreq::F1Hz.period() * crate::hardware::MAX_TICKS as f64,
            });
        }
        self.trigger_mode = TriggerMode::Internal;
        self.rep_time = Some(rep_time);
        Ok(self)
    }

    pub fn cfg_external_trigger(mut self, slope: Slope) -> Self {
        self.trigger_mode = TriggerMode::External(slope);
        self.rep_time = None;
        self
    }

    pub fn cfg_function_delay(mut self, function: FunctionId, delay: f64) -> Self {
        self.function_delays.insert(function, delay);
        self
    }

    /// Replaces intrinsic latencies of individual cards, keeping the defaults for the rest.
    pub fn cfg_intrinsic_delays(mut self, delays: HashMap<CardId, f64>) -> Self {
        self.intrinsic_delays.extend(delays);
        self
    }

    pub fn cfg_defense_mode(mut self, mode: DefenseMode) -> Self {
        self.defense_mode = mode;
        self
    }

    pub fn cfg_defense_min_distance(mut self, distance: f64) -> Self {
        self.defense_min_distance = distance;
        self
    }

    pub fn cfg_defense_granularity(mut self, ticks: Ticks) -> Self {
        self.defense_granularity = ticks.max(1);
        self
    }

    pub fn cfg_phase_switch_delay(mut self, delay: f64) -> Self {
        self.phase_switch_delay = delay;
        self
    }

    pub fn cfg_grace_period(mut self, grace: f64) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn cfg_synth_trigger_slope(mut self, slope: Slope) -> Self {
        self.synth_trigger_slope = slope;
        self
    }

    pub fn function_delay(&self, function: FunctionId) -> f64 {
        self.function_delays.get(&function).copied().unwrap_or(0.)
    }

    pub fn tb_clock_freq(&self) -> Option<ClockFreq> {
        ClockFreq::from_period(self.timebase)
    }

    /// Clock of the repetition delay card, only defined with internal triggering.
    pub fn ert_clock_freq(&self) -> Option<ClockFreq> {
        self.rep_time.and_then(ClockFreq::fastest_for)
    }

    /// Repetition period in ticks of the repetition card's clock.
    pub fn rep_ticks(&self) -> Option<Ticks> {
        let freq = self.ert_clock_freq()?;
        self.rep_time.map(|rep| (rep / freq.period()).round() as Ticks)
    }
}
