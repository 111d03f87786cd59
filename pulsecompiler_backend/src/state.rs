//! The complete compile-time state of a pulser.
//!
//! [`PulserState`] bundles the frozen configuration with everything the pulse operations
//! mutate: the pulse registry, one [`Function`] per channel, the card arena, the phase
//! cycles and the RF synthesizer settings. There is exactly one state per pulser and it
//! is passed around explicitly.
//!
//! ## Compute pipeline
//! [`PulserState::compute`] turns the current pulse settings into pending card state:
//!
//! 1. [`function_init`](PulserState::function_init) decides which derived functions are in
//!    use and sorts every function's pulses.
//! 2. The negative-delay offset is loaded into the init card.
//! 3. Each used function's channel setup computes the delays of its cards (`setup` module),
//!    microwave first since the phase and defense channels derive from it.
//! 4. [`check_sequence_length`](PulserState::check_sequence_length) compares the longest
//!    chain with the repetition period.
//!
//! Nothing here touches hardware. The pending card state is turned into hardware calls by
//! [`commit_plan`](crate::commit::commit_plan).

use indexmap::IndexMap;
use log::warn;

use crate::card::{CardArena, CardId, PhaseLabel};
use crate::config::{DefenseMode, PulserConfig, TriggerMode};
use crate::error::*;
use crate::function::{sort_pulses, Function, FunctionId};
use crate::pulse::{Pulse, PulseRegistry};
use crate::ticks::{ticks_ceil, to_seconds, Ticks};

/// Settings of the RF synthesizer in double-pulse mode.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SynthSettings {
    pub width: Option<f64>,
    /// Delay of the second pulse relative to the first.
    pub delay: Option<f64>,
    pub double_mode: bool,
    pub output: bool,
}

/// Achieved start and end of an active microwave pulse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MwTiming {
    pub pulse: PulseNum,
    pub start: f64,
    pub end: f64,
}

#[derive(Clone, Debug)]
pub struct PulserState {
    pub config: PulserConfig,
    pub pulses: PulseRegistry,
    pub functions: IndexMap<FunctionId, Function>,
    pub cards: CardArena,
    pub phase_cycles: Vec<Vec<PhaseLabel>>,
    pub phase_step: usize,
    /// Synthesizer settings as last written to the device.
    pub synth: SynthSettings,
    pub new_synth: SynthSettings,
    /// Delay of the init card, compensating negative function delays.
    pub neg_delay: Ticks,
    pub mw_timing: Vec<MwTiming>,
    /// Pulses the last compute moved to fit the timebase, with the shift in seconds.
    pub shifted_pulses: Vec<(PulseNum, f64)>,
    /// End time of the longest chain, computed by the last sequence length check.
    pub max_seq_len: f64,
    /// Sequence length of the state last written to the cards.
    pub committed_seq_len: f64,
    pub in_test_run: bool,
    /// The internally generated defense pulse (automatic defense mode only).
    pub defense_pulse: Option<PulseNum>,
}

impl PulserState {
    pub fn new(config: PulserConfig) -> Result<Self> {
        let functions = FunctionId::ALL
            .into_iter()
            .map(|id| (id, Function::new(id, config.function_delay(id))))
            .collect();
        let cards = CardArena::new(&config.intrinsic_delays);
        let mut state = Self {
            config,
            pulses: PulseRegistry::new(),
            functions,
            cards,
            phase_cycles: Vec::new(),
            phase_step: 0,
            synth: SynthSettings::default(),
            new_synth: SynthSettings::default(),
            neg_delay: 0,
            mw_timing: Vec::new(),
            shifted_pulses: Vec::new(),
            max_seq_len: 0.,
            committed_seq_len: 0.,
            in_test_run: true,
            defense_pulse: None,
        };
        if state.config.defense_mode == DefenseMode::Automatic {
            let pulse = state.pulses.create_internal()?;
            pulse.function = Some(FunctionId::Defense);
            let num = pulse.num;
            state.function_(FunctionId::Defense).add_pulse(num);
            state.function_(FunctionId::Defense).is_used = false;
            state.defense_pulse = Some(num);
        }
        Ok(state)
    }

    pub fn timebase(&self) -> f64 {
        self.config.timebase
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[&id]
    }

    pub fn function_(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[&id]
    }

    pub fn used_functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values().filter(|f| f.is_used)
    }

    /// Phase a pulse currently gets, following its phase cycle and the phase step.
    pub fn phase_label(&self, pulse: &Pulse) -> Option<PhaseLabel> {
        let cycle = self.phase_cycles.get(pulse.phase_cycle?)?;
        cycle.get(self.phase_step % cycle.len()).copied()
    }

    pub fn add_phase_cycle(&mut self, labels: Vec<PhaseLabel>) -> Result<usize> {
        if labels.is_empty() {
            return Err(PulserError::EmptyPhaseCycle);
        }
        self.phase_cycles.push(labels);
        Ok(self.phase_cycles.len() - 1)
    }

    pub fn next_phase(&mut self) {
        self.phase_step += 1;
    }

    pub fn phase_reset(&mut self) {
        self.phase_step = 0;
    }

    /// End of the init card, the start of every channel chain.
    pub fn init_end(&self) -> f64 {
        self.cards.end_time(CardId::Init, self.timebase())
    }

    /// Fixed start of the defense pulse. Follows from the configured delays and the pulses'
    /// functions alone, so it is the same before and after [`compute`](Self::compute).
    pub fn defense_start(&self) -> f64 {
        let timebase = self.timebase();
        let init_end = self.cards.trigger_time(CardId::Init, timebase)
            + self.cards[CardId::Init].intrinsic_delay
            + to_seconds(self.negative_delay_offset(), timebase);
        init_end
            + self.cards[CardId::Defense].intrinsic_delay
            + self.function(FunctionId::Defense).delay
    }

    /// Whether `id` takes part in the next compute. Phase and automatic defense follow the
    /// microwave pulses.
    fn will_be_used(&self, id: FunctionId) -> bool {
        let mw = self.function(FunctionId::Mw);
        match id {
            FunctionId::Phase => {
                mw.is_used
                    && mw
                        .pulses
                        .iter()
                        .any(|num| self.pulses.get(*num).is_ok_and(|p| p.phase_cycle.is_some()))
            }
            FunctionId::Defense if self.config.defense_mode == DefenseMode::Automatic => {
                mw.is_used
            }
            _ => self.function(id).is_used,
        }
    }

    /// Decides which derived functions are used, then recounts and sorts every used
    /// function's pulses.
    pub fn function_init(&mut self) -> Result<()> {
        if let Some(p) = self.pulses.iter().find(|p| p.is_active() && p.function.is_none()) {
            return Err(PulserError::MissingFunction(p.num));
        }

        for id in [FunctionId::Phase, FunctionId::Defense] {
            let used = self.will_be_used(id);
            self.function_(id).is_used = used;
        }

        for func in self.functions.values_mut().filter(|f| f.is_used) {
            sort_pulses(func, &self.pulses);
        }
        for pulse in self.pulses.iter_mut() {
            pulse.was_active = pulse.is_active();
            pulse.has_been_active |= pulse.was_active;
        }
        Ok(())
    }

    /// Offset compensating the most negative delay of all used functions.
    fn negative_delay_offset(&self) -> Ticks {
        let min_delay = FunctionId::ALL
            .into_iter()
            .filter(|id| self.will_be_used(*id))
            .map(|id| self.function(id).delay)
            .fold(0., f64::min);
        if min_delay < 0. {
            ticks_ceil(-min_delay / self.timebase())
        } else {
            0
        }
    }

    /// Computes the pending state of every card from the current pulse settings.
    pub fn compute(&mut self) -> Result<()> {
        self.function_init()?;

        self.neg_delay = self.negative_delay_offset();
        self.cards[CardId::Init].assign(self.neg_delay);
        self.cards.tb_clock.new_freq = self.config.tb_clock_freq();
        self.cards.ert_clock.new_freq = self.config.ert_clock_freq();
        if self.config.defense_mode == DefenseMode::Manual {
            self.place_manual_defense();
        }

        self.mw_timing.clear();
        self.shifted_pulses.clear();
        for id in [
            FunctionId::Mw,
            FunctionId::Phase,
            FunctionId::Defense,
            FunctionId::Rf,
            FunctionId::Laser,
            FunctionId::Detection,
        ] {
            self.clear_function_cards(id);
            if !self.function(id).is_used {
                continue;
            }
            match id {
                FunctionId::Mw => self.setup_mw()?,
                FunctionId::Phase => self.setup_phase()?,
                FunctionId::Defense => match self.config.defense_mode {
                    DefenseMode::Automatic => self.setup_defense_auto()?,
                    DefenseMode::Manual => self.setup_defense_manual()?,
                },
                FunctionId::Rf => self.setup_rf()?,
                FunctionId::Laser | FunctionId::Detection => self.setup_single(id)?,
            }
        }

        self.check_sequence_length()
    }

    /// Moves manual defense pulses without a position to the fixed defense start.
    fn place_manual_defense(&mut self) {
        let start = self.defense_start();
        let timebase = self.timebase();
        let nums = self.function(FunctionId::Defense).pulses.clone();
        for num in nums {
            if let Ok(pulse) = self.pulses.get_mut(num) {
                if pulse.pos.is_none() && pulse.len.is_some() {
                    pulse.change_position(start, timebase);
                    pulse.was_active = pulse.is_active();
                    pulse.has_been_active |= pulse.was_active;
                }
            }
        }
        let Self {
            functions, pulses, ..
        } = self;
        sort_pulses(&mut functions[&FunctionId::Defense], pulses);
    }

    fn clear_function_cards(&mut self, id: FunctionId) {
        for card in id.cards() {
            self.cards[*card].clear();
        }
        if id == FunctionId::Rf {
            self.new_synth = SynthSettings {
                output: false,
                double_mode: false,
                ..self.synth.clone()
            };
        }
    }

    /// Stores the end of the longest chain; with internal triggering it must fit into the
    /// repetition period.
    pub fn check_sequence_length(&mut self) -> Result<()> {
        let timebase = self.timebase();
        self.max_seq_len = self
            .used_functions()
            .flat_map(|f| f.id.cards())
            .filter(|card| self.cards[**card].is_active)
            .map(|card| self.cards.end_time(*card, timebase))
            .fold(self.init_end(), f64::max);

        let trigger = (self.config.trigger_mode, self.config.rep_time);
        if let (TriggerMode::Internal, Some(rep_time)) = trigger {
            if self.max_seq_len > rep_time {
                return Err(PulserError::SequenceTooLong {
                    length: self.max_seq_len,
                    rep_time,
                });
            }
        }
        Ok(())
    }

    /// Puts the state back to where it was before the test run and warns about user pulses
    /// that never became active.
    pub fn end_test_run(&mut self) {
        for pulse in self.pulses.iter().filter(|p| !p.is_internal() && !p.has_been_active) {
            warn!("Pulse #{} is never active", pulse.num);
        }
        for func in self.functions.values().filter(|f| f.is_declared) {
            let active = func
                .pulses
                .iter()
                .any(|num| self.pulses.get(*num).is_ok_and(|p| p.has_been_active));
            if !active {
                warn!("Function {} is declared but never used", func.name());
            }
        }
        self.pulses.iter_mut().for_each(Pulse::reset);
        self.cards.reset();
        self.phase_step = 0;
        self.synth = SynthSettings::default();
        self.new_synth = SynthSettings::default();
        self.mw_timing.clear();
        self.shifted_pulses.clear();
        self.max_seq_len = 0.;
        self.committed_seq_len = 0.;
        self.in_test_run = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PulserConfig;

    fn state() -> PulserState {
        PulserState::new(PulserConfig::new(1e-8).unwrap()).unwrap()
    }

    fn mw_pulse(state: &mut PulserState, num: PulseNum, pos: f64, len: Ticks) {
        let pulse = state.pulses.create(num).unwrap();
        pulse.set_function(FunctionId::Mw).unwrap();
        pulse.set_position(pos).unwrap();
        pulse.set_length(len).unwrap();
        state.function_(FunctionId::Mw).add_pulse(num);
    }

    #[test]
    fn automatic_defense_pulse_is_created() {
        let state = state();
        assert_eq!(state.defense_pulse, Some(-1));
        assert_eq!(state.pulses.get(-1).unwrap().function, Some(FunctionId::Defense));
        assert!(!state.function(FunctionId::Defense).is_used);
    }

    #[test]
    fn active_pulse_needs_a_function() {
        let mut state = state();
        let pulse = state.pulses.create(0).unwrap();
        pulse.set_position(1e-7).unwrap();
        pulse.set_length(5).unwrap();
        assert_eq!(state.function_init(), Err(PulserError::MissingFunction(0)));
    }

    #[test]
    fn derived_functions_follow_mw() {
        let mut state = state();
        state.function_init().unwrap();
        assert!(!state.function(FunctionId::Defense).is_used);

        mw_pulse(&mut state, 1, 200e-9, 10);
        state.function_init().unwrap();
        assert!(state.function(FunctionId::Defense).is_used);
        assert!(!state.function(FunctionId::Phase).is_used);

        let cycle = state.add_phase_cycle(vec![PhaseLabel::PlusX, PhaseLabel::MinusX]).unwrap();
        state.pulses.get_mut(1).unwrap().set_phase_cycle(cycle).unwrap();
        state.function_init().unwrap();
        assert!(state.function(FunctionId::Phase).is_used);
    }

    #[test]
    fn negative_delays_shift_the_init_card() {
        let config = PulserConfig::new(1e-8)
            .unwrap()
            .cfg_function_delay(FunctionId::Mw, -25e-9);
        let mut state = PulserState::new(config).unwrap();
        mw_pulse(&mut state, 1, 300e-9, 10);
        state.compute().unwrap();
        assert_eq!(state.neg_delay, 3);
        assert_eq!(state.cards[CardId::Init].new_delay, 3);
        assert!((state.init_end() - 50e-9).abs() < 1e-12);
    }

    #[test]
    fn phase_steps_wrap_around_the_cycle() {
        let mut state = state();
        mw_pulse(&mut state, 1, 200e-9, 10);
        let cycle = state
            .add_phase_cycle(vec![PhaseLabel::PlusX, PhaseLabel::MinusY])
            .unwrap();
        state.pulses.get_mut(1).unwrap().set_phase_cycle(cycle).unwrap();
        let label = |s: &PulserState| s.phase_label(s.pulses.get(1).unwrap());
        assert_eq!(label(&state), Some(PhaseLabel::PlusX));
        state.next_phase();
        assert_eq!(label(&state), Some(PhaseLabel::MinusY));
        state.next_phase();
        assert_eq!(label(&state), Some(PhaseLabel::PlusX));
        state.next_phase();
        state.phase_reset();
        assert_eq!(label(&state), Some(PhaseLabel::PlusX));
        assert_eq!(state.add_phase_cycle(vec![]), Err(PulserError::EmptyPhaseCycle));
    }

    #[test]
    fn sequence_too_long_for_internal_trigger() {
        let config = PulserConfig::new(1e-8)
            .unwrap()
            .cfg_internal_trigger(1e-6)
            .unwrap();
        let mut state = PulserState::new(config).unwrap();
        mw_pulse(&mut state, 1, 900e-9, 20);
        assert!(matches!(
            state.compute(),
            Err(PulserError::SequenceTooLong { .. })
        ));
    }

    #[test]
    fn end_test_run_restores_initial_values() {
        let mut state = state();
        mw_pulse(&mut state, 1, 200e-9, 10);
        state.pulses.create(2).unwrap();
        state.compute().unwrap();
        state.pulses.get_mut(1).unwrap().change_position(400e-9, 1e-8);
        state.next_phase();
        state.end_test_run();

        assert_eq!(state.pulses.get(1).unwrap().pos, Some(200e-9));
        assert_eq!(state.phase_step, 0);
        assert!(!state.in_test_run);
        assert!(state.cards.iter().all(|c| !c.is_active && c.new_delay == 0));
        assert!(!state.pulses.get(2).unwrap().has_been_active);
    }
}
