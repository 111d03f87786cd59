//! User-facing pulse operations.
//!
//! [`BasePulser`] is the trait every pulser front end implements. An implementor only
//! provides access to its [`PulserState`] through [`state`](BasePulser::state) and
//! [`state_`](BasePulser::state_); every pulse operation is a default method on top of that.
//! The [`impl_pulser_boilerplate`] macro writes the two accessors for a struct with a
//! `state: PulserState` field.
//!
//! Times are given in seconds and lengths are converted to ticks on entry, so a value that
//! does not fit the timebase is rejected when it is set, not when the sequence is computed.
//!
//! [`Pulser`] is the hardware-free implementor: its [`update`](Pulser::update) computes the
//! sequence and reports the commit plan without executing it, which is what a test run does.
//!
//! # Example
//! ```
//! use pulsecompiler_backend::*;
//!
//! let mut pulser = Pulser::new(PulserConfig::new(1e-8).unwrap()).unwrap();
//! pulser.create_pulse(1, Some(FunctionId::Mw)).unwrap();
//! pulser.set_position(1, 200e-9).unwrap();
//! pulser.set_length(1, 100e-9).unwrap();
//! let plan = pulser.update().unwrap();
//! assert!(plan.contains(&CommitAction::Activate { card: CardId::MwGap0, ticks: 14 }));
//! ```

use std::io;

use log::{debug, warn};
use ndarray::Array2;

use crate::card::PhaseLabel;
use crate::commit::{commit_plan, CommitAction};
use crate::config::{DefenseMode, PulserConfig};
use crate::dump;
use crate::error::*;
use crate::function::FunctionId;
use crate::pulse::Pulse;
use crate::state::PulserState;
use crate::ticks::*;

pub trait BasePulser {
    // FIELD methods
    fn state(&self) -> &PulserState;
    fn state_(&mut self) -> &mut PulserState;

    /// Runs `f` on pulse `num`, failing with [`PulserError::UnknownPulse`] if there is no
    /// such user pulse.
    fn pulse_op<F, R>(&mut self, num: PulseNum, f: F) -> Result<R>
    where
        F: FnOnce(&mut Pulse) -> Result<R>,
    {
        f(self.state_().pulses.user_pulse_(num)?)
    }

    fn pulse(&self, num: PulseNum) -> Result<&Pulse> {
        if num < 0 {
            return Err(PulserError::UnknownPulse(num));
        }
        self.state().pulses.get(num)
    }

    fn create_pulse(&mut self, num: PulseNum, function: Option<FunctionId>) -> Result<()> {
        self.state_().pulses.create(num)?;
        match function {
            Some(function) => self.set_function(num, function),
            None => Ok(()),
        }
    }

    /// Assigns pulse `num` to `function`. Phase pulses are always derived, and so is the
    /// defense pulse in automatic defense mode.
    fn set_function(&mut self, num: PulseNum, function: FunctionId) -> Result<()> {
        let derived = match function {
            FunctionId::Phase => Some("phase pulses are derived from the microwave pulses"),
            FunctionId::Defense if self.state().config.defense_mode == DefenseMode::Automatic => {
                Some("the defense pulse is created automatically")
            }
            _ => None,
        };
        if let Some(reason) = derived {
            return Err(PulserError::InvalidFunction {
                pulse: num,
                function,
                reason: reason.to_string(),
            });
        }
        if let Some(cycle) = self.pulse(num)?.phase_cycle {
            if function != FunctionId::Mw {
                return Err(PulserError::InvalidFunction {
                    pulse: num,
                    function,
                    reason: format!("only microwave pulses can use phase cycle {cycle}"),
                });
            }
        }
        self.pulse_op(num, |p| p.set_function(function))?;
        let func = self.state_().function_(function);
        func.declare();
        func.add_pulse(num);
        Ok(())
    }

    fn set_position(&mut self, num: PulseNum, pos: f64) -> Result<()> {
        let pos = self.checked_position(num, pos)?;
        self.pulse_op(num, |p| p.set_position(pos))
    }

    fn set_length(&mut self, num: PulseNum, len: f64) -> Result<()> {
        let len = self.checked_length(num, len)?;
        self.pulse_op(num, |p| p.set_length(len))
    }

    fn set_position_delta(&mut self, num: PulseNum, dpos: f64) -> Result<()> {
        let dpos = self.checked_position_delta(num, dpos)?;
        self.pulse_op(num, |p| p.set_position_delta(dpos))
    }

    fn set_length_delta(&mut self, num: PulseNum, dlen: f64) -> Result<()> {
        let dlen = to_ticks(dlen, self.state().timebase())?;
        self.pulse_op(num, |p| p.set_length_delta(dlen))
    }

    fn set_phase_cycle(&mut self, num: PulseNum, cycle: usize) -> Result<()> {
        if cycle >= self.state().phase_cycles.len() {
            return Err(PulserError::UnknownPhaseCycle(cycle));
        }
        if let Some(function) = self.pulse(num)?.function.filter(|f| *f != FunctionId::Mw) {
            return Err(PulserError::InvalidFunction {
                pulse: num,
                function,
                reason: "only microwave pulses can be phase cycled".to_string(),
            });
        }
        self.pulse_op(num, |p| p.set_phase_cycle(cycle))
    }

    fn get_function(&self, num: PulseNum) -> Result<Option<FunctionId>> {
        Ok(self.pulse(num)?.function)
    }

    fn get_position(&self, num: PulseNum) -> Result<Option<f64>> {
        Ok(self.pulse(num)?.pos)
    }

    /// Length in seconds.
    fn get_length(&self, num: PulseNum) -> Result<Option<f64>> {
        let timebase = self.state().timebase();
        Ok(self.pulse(num)?.len.map(|len| to_seconds(len, timebase)))
    }

    fn get_position_delta(&self, num: PulseNum) -> Result<Option<f64>> {
        Ok(self.pulse(num)?.dpos)
    }

    fn get_length_delta(&self, num: PulseNum) -> Result<Option<f64>> {
        let timebase = self.state().timebase();
        Ok(self.pulse(num)?.dlen.map(|dlen| to_seconds(dlen, timebase)))
    }

    fn get_phase_cycle(&self, num: PulseNum) -> Result<Option<usize>> {
        Ok(self.pulse(num)?.phase_cycle)
    }

    /// Overwrites the position during the experiment; returns whether it changed.
    fn change_position(&mut self, num: PulseNum, pos: f64) -> Result<bool> {
        let pos = self.checked_position(num, pos)?;
        let timebase = self.state().timebase();
        self.pulse_op(num, |p| Ok(p.change_position(pos, timebase)))
    }

    fn change_length(&mut self, num: PulseNum, len: f64) -> Result<bool> {
        let len = self.checked_length(num, len)?;
        self.pulse_op(num, |p| Ok(p.change_length(len)))
    }

    fn change_position_delta(&mut self, num: PulseNum, dpos: f64) -> Result<bool> {
        let dpos = self.checked_position_delta(num, dpos)?;
        let timebase = self.state().timebase();
        self.pulse_op(num, |p| Ok(p.change_position_delta(dpos, timebase)))
    }

    fn change_length_delta(&mut self, num: PulseNum, dlen: f64) -> Result<bool> {
        let dlen = to_ticks(dlen, self.state().timebase())?;
        self.pulse_op(num, |p| Ok(p.change_length_delta(dlen)))
    }

    /// Moves the given pulses by their position deltas; no pulses means every pulse that has
    /// a position delta.
    fn shift(&mut self, nums: &[PulseNum]) -> Result<()> {
        let nums = self.selected_pulses(nums, |p| p.dpos.is_some());
        for num in nums {
            self.pulse_op(num, Pulse::shift)?;
        }
        Ok(())
    }

    /// Lengthens the given pulses by their length deltas; no pulses means every pulse that has
    /// a length delta.
    fn increment(&mut self, nums: &[PulseNum]) -> Result<()> {
        let nums = self.selected_pulses(nums, |p| p.dlen.is_some());
        for num in nums {
            self.pulse_op(num, Pulse::increment)?;
        }
        Ok(())
    }

    /// Restores the initial settings of the given pulses (all pulses if none are given) and
    /// goes back to the first phase.
    fn reset(&mut self, nums: &[PulseNum]) -> Result<()> {
        let nums = self.selected_pulses(nums, |_| true);
        for num in nums {
            self.pulse_op(num, |p| {
                p.reset();
                Ok(())
            })?;
        }
        self.state_().phase_reset();
        Ok(())
    }

    fn add_phase_cycle(&mut self, labels: Vec<PhaseLabel>) -> Result<usize> {
        self.state_().add_phase_cycle(labels)
    }

    fn next_phase(&mut self) {
        self.state_().next_phase();
    }

    fn phase_reset(&mut self) {
        self.state_().phase_reset();
    }

    /// Computes all card delays without programming anything.
    fn compute(&mut self) -> Result<()> {
        self.state_().compute()
    }

    fn dump_pulses<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        dump::dump_pulses(self.state(), out)
    }

    fn pulse_table(&self) -> Array2<i64> {
        dump::pulse_table(self.state())
    }

    /// Closes the test run; see [`PulserState::end_test_run`].
    fn end_test_run(&mut self) {
        self.state_().end_test_run();
    }

    // Helpers for the setters above

    fn selected_pulses<F>(&self, nums: &[PulseNum], filter: F) -> Vec<PulseNum>
    where
        F: Fn(&Pulse) -> bool,
    {
        if !nums.is_empty() {
            return nums.to_vec();
        }
        self.state()
            .pulses
            .iter()
            .filter(|p| !p.is_internal() && filter(p))
            .map(|p| p.num)
            .collect()
    }

    fn checked_position(&self, num: PulseNum, pos: f64) -> Result<f64> {
        let state = self.state();
        if pos < 0. {
            return Err(PulserError::InvalidValue {
                pulse: num,
                reason: format!("negative position of {pos} s"),
            });
        }
        to_ticks(pos, state.timebase())?;
        if self.pulse(num)?.function == Some(FunctionId::Defense) {
            let fixed = state.defense_start();
            if !times_equal(pos, fixed, state.timebase()) {
                return Err(PulserError::PositionFixed {
                    pulse: num,
                    fixed,
                    requested: pos,
                });
            }
        }
        Ok(pos)
    }

    fn checked_length(&self, num: PulseNum, len: f64) -> Result<Ticks> {
        if len < 0. {
            return Err(PulserError::InvalidValue {
                pulse: num,
                reason: format!("negative length of {len} s"),
            });
        }
        let ticks = to_ticks(len, self.state().timebase())?;
        if ticks > 1 && self.pulse(num)?.function == Some(FunctionId::Detection) {
            warn!("Length of DETECTION pulse #{num} set to 1 tick, the trigger has a fixed length");
            return Ok(1);
        }
        Ok(ticks)
    }

    fn checked_position_delta(&self, num: PulseNum, dpos: f64) -> Result<f64> {
        to_ticks(dpos, self.state().timebase())?;
        if let Some(function @ FunctionId::Defense) = self.pulse(num)?.function {
            return Err(PulserError::InvalidFunction {
                pulse: num,
                function,
                reason: "the defense pulse can't be shifted".to_string(),
            });
        }
        Ok(dpos)
    }
}

/// Writes the [`BasePulser`] field accessors for a struct with a `state: PulserState` field.
///
/// ```
/// use pulsecompiler_backend::*;
///
/// struct LoggingPulser {
///     state: PulserState,
/// }
/// impl_pulser_boilerplate!(LoggingPulser);
/// ```
#[macro_export]
macro_rules! impl_pulser_boilerplate {
    ($pulser_type: ty) => {
        impl $crate::pulser::BasePulser for $pulser_type {
            fn state(&self) -> &$crate::state::PulserState {
                &self.state
            }
            fn state_(&mut self) -> &mut $crate::state::PulserState {
                &mut self.state
            }
        }
    };
}

/// Pulser without hardware access.
pub struct Pulser {
    state: PulserState,
}

impl_pulser_boilerplate!(Pulser);

impl Pulser {
    pub fn new(config: PulserConfig) -> Result<Self> {
        Ok(Self {
            state: PulserState::new(config)?,
        })
    }

    /// Computes the sequence and records the result as committed, returning the hardware
    /// operations a real pulser would have issued.
    pub fn update(&mut self) -> Result<Vec<CommitAction>> {
        self.state.compute()?;
        let plan = commit_plan(&self.state);
        for action in &plan {
            debug!("test run: {action}");
        }
        self.state.mark_committed();
        Ok(plan)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::card::CardId;

    fn pulser() -> Pulser {
        Pulser::new(PulserConfig::new(1e-8).unwrap()).unwrap()
    }

    mod setters {
        use super::*;

        #[test]
        fn precision_and_range() {
            let mut p = pulser();
            p.create_pulse(1, Some(FunctionId::Mw)).unwrap();
            assert!(matches!(p.set_position(1, 205e-9), Err(PulserError::PrecisionError { .. })));
            assert!(matches!(p.set_position(1, -1e-8), Err(PulserError::InvalidValue { .. })));
            assert!(matches!(p.set_length(1, 1.), Err(PulserError::RangeError { .. })));
            p.set_position(1, 200e-9).unwrap();
            assert!(matches!(
                p.set_position(1, 300e-9),
                Err(PulserError::AlreadySet { pulse: 1, .. })
            ));
            assert_eq!(p.get_position(1), Ok(Some(200e-9)));
            assert_eq!(p.get_length(1), Ok(None));
        }

        #[test]
        fn derived_functions_are_rejected() {
            let mut p = pulser();
            assert!(matches!(
                p.create_pulse(1, Some(FunctionId::Phase)),
                Err(PulserError::InvalidFunction { .. })
            ));
            p.create_pulse(2, None).unwrap();
            assert!(matches!(
                p.set_function(2, FunctionId::Defense),
                Err(PulserError::InvalidFunction { .. })
            ));
            assert!(matches!(p.get_function(-1), Err(PulserError::UnknownPulse(-1))));
        }

        #[test]
        fn phase_cycles() {
            let mut p = pulser();
            p.create_pulse(1, Some(FunctionId::Laser)).unwrap();
            assert_eq!(p.set_phase_cycle(1, 0), Err(PulserError::UnknownPhaseCycle(0)));
            let cycle = p.add_phase_cycle(vec![PhaseLabel::PlusX]).unwrap();
            assert!(matches!(
                p.set_phase_cycle(1, cycle),
                Err(PulserError::InvalidFunction { .. })
            ));
            p.create_pulse(2, None).unwrap();
            p.set_phase_cycle(2, cycle).unwrap();
            assert!(p.set_function(2, FunctionId::Rf).is_err());
            p.set_function(2, FunctionId::Mw).unwrap();
            assert!(p.state().function(FunctionId::Mw).is_declared);
            assert!(!p.state().function(FunctionId::Rf).is_declared);
        }

        #[test]
        fn detection_length() {
            let mut p = pulser();
            p.create_pulse(4, Some(FunctionId::Detection)).unwrap();
            p.set_length(4, 100e-9).unwrap();
            assert_eq!(p.pulse(4).unwrap().len, Some(1));
        }

        #[test]
        fn manual_defense_position() {
            let config = PulserConfig::new(1e-8)
                .unwrap()
                .cfg_defense_mode(DefenseMode::Manual);
            let mut p = Pulser::new(config).unwrap();
            p.create_pulse(3, Some(FunctionId::Defense)).unwrap();
            assert!(matches!(
                p.set_position(3, 100e-9),
                Err(PulserError::PositionFixed { pulse: 3, .. })
            ));
            p.set_position(3, 40e-9).unwrap();
            assert!(p.set_position_delta(3, 10e-9).is_err());
        }

        #[test]
        fn manual_defense_position_includes_negative_delays() {
            let config = PulserConfig::new(1e-8)
                .unwrap()
                .cfg_defense_mode(DefenseMode::Manual)
                .cfg_function_delay(FunctionId::Mw, -30e-9);
            let mut p = Pulser::new(config).unwrap();
            p.create_pulse(1, Some(FunctionId::Mw)).unwrap();
            p.set_position(1, 300e-9).unwrap();
            p.set_length(1, 100e-9).unwrap();
            p.create_pulse(3, Some(FunctionId::Defense)).unwrap();
            // the init card makes room for 3 ticks of negative delay
            assert!(matches!(
                p.set_position(3, 40e-9),
                Err(PulserError::PositionFixed { pulse: 3, .. })
            ));
            p.set_position(3, 70e-9).unwrap();
            p.set_length(3, 40e-9).unwrap();
            p.compute().unwrap();
            assert_eq!(p.state().cards[CardId::Init].new_delay, 3);
            assert_eq!(p.state().cards[CardId::Defense].new_delay, 4);
            assert!((p.state().defense_start() - 70e-9).abs() < 1e-12);
        }
    }

    mod runtime {
        use super::*;

        #[test]
        fn change_reports_edits() {
            let mut p = pulser();
            p.create_pulse(1, Some(FunctionId::Mw)).unwrap();
            p.set_position(1, 200e-9).unwrap();
            p.set_length(1, 100e-9).unwrap();
            assert_eq!(p.change_position(1, 200e-9), Ok(false));
            assert_eq!(p.change_position(1, 300e-9), Ok(true));
            assert_eq!(p.change_length(1, 100e-9), Ok(false));
            assert_eq!(p.change_length(1, 50e-9), Ok(true));
            assert_eq!(p.pulse(1).unwrap().len, Some(5));
        }

        #[test]
        fn shift_all_with_deltas() {
            let mut p = pulser();
            for (num, pos) in [(1, 500e-9), (2, 800e-9)] {
                p.create_pulse(num, Some(FunctionId::Mw)).unwrap();
                p.set_position(num, pos).unwrap();
                p.set_length(num, 50e-9).unwrap();
            }
            p.set_position_delta(1, 20e-9).unwrap();
            p.set_length_delta(2, 10e-9).unwrap();
            p.shift(&[]).unwrap();
            p.increment(&[]).unwrap();
            assert!((p.get_position(1).unwrap().unwrap() - 520e-9).abs() < 1e-15);
            assert_eq!(p.get_position(2), Ok(Some(800e-9)));
            assert_eq!(p.pulse(2).unwrap().len, Some(6));
            assert!(matches!(p.shift(&[2]), Err(PulserError::DeltaNotSet { pulse: 2, .. })));

            p.next_phase();
            p.reset(&[]).unwrap();
            assert_eq!(p.get_position(1), Ok(Some(500e-9)));
            assert_eq!(p.pulse(2).unwrap().len, Some(5));
            assert_eq!(p.state().phase_step, 0);
        }

        #[test]
        fn update_is_idempotent() {
            let mut p = pulser();
            p.create_pulse(1, Some(FunctionId::Mw)).unwrap();
            p.set_position(1, 200e-9).unwrap();
            p.set_length(1, 100e-9).unwrap();
            assert!(!p.update().unwrap().is_empty());
            assert!(p.update().unwrap().is_empty());
        }
    }
}
