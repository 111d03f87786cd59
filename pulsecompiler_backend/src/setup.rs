//! Channel setup: translating each function's active pulses into card delays.
//!
//! Every routine here runs after the function's cards were cleared by
//! [`PulserState::compute`] and assigns one card (or a gap/length pair) per active pulse.
//! Times are measured from the end pulse of the root card; a card triggered at `t` emits its
//! end pulse at `t + intrinsic + delay * timebase`, and a device sees the card output shifted
//! by its function's propagation delay.
//!
//! Rounding differs per channel:
//! * microwave gaps, RF, laser and detection cards round to the nearest tick and warn when
//!   that moves a pulse,
//! * phase cards round down, so the phase is always set before the microwave pulse starts,
//! * the automatic defense card rounds up to the defense granularity, so it always covers
//!   the last microwave pulse.

use log::warn;

use crate::card::{CardId, PhaseLabel};
use crate::error::*;
use crate::function::FunctionId;
use crate::hardware::*;
use crate::state::{MwTiming, PulserState, SynthSettings};
use crate::ticks::*;

impl PulserState {
    fn check_pulse_count(&self, id: FunctionId, count: usize) -> Result<()> {
        if count > id.max_pulses() {
            return Err(PulserError::TooManyPulses {
                function: id,
                requested: count,
                max: id.max_pulses(),
            });
        }
        Ok(())
    }

    /// Warns about and records a pulse that had to move from `raw` to `ticks`.
    fn note_shift(&mut self, id: FunctionId, num: PulseNum, raw: f64, ticks: Ticks) {
        if !is_shifted(raw) {
            return;
        }
        let shift = (ticks as f64 - raw) * self.timebase();
        warn!("{id} pulse #{num} shifted by {:.2} ns to fit the timebase", shift * 1e9);
        self.shifted_pulses.push((num, shift));
    }

    /// Position and length of a pulse known to be active.
    fn pulse_timing(&self, num: PulseNum) -> Result<(f64, Ticks)> {
        let pulse = self.pulses.get(num)?;
        Ok((pulse.pos.unwrap_or(0.), pulse.len.unwrap_or(0)))
    }

    /// Microwave channel: gap card `i` delays the trigger of length card `i`, whose delay is
    /// the pulse length. Gap cards are chained, so the gap of pulse `i > 0` counts from the
    /// end of the previous gap card.
    pub(crate) fn setup_mw(&mut self) -> Result<()> {
        let id = FunctionId::Mw;
        let timebase = self.timebase();
        let delay = self.function(id).delay;
        let active = self.function(id).active_pulses().to_vec();
        self.check_pulse_count(id, active.len())?;

        let mut prev_end: Option<f64> = None;
        for (i, num) in active.into_iter().enumerate() {
            let (pos, len) = self.pulse_timing(num)?;
            let (gap_card, len_card) = (CardId::MW_GAPS[i], CardId::MW_LENGTHS[i]);

            if let Some(prev_end) = prev_end {
                if pos < prev_end - TICK_TOLERANCE * timebase {
                    return Err(PulserError::TooClose {
                        function: id,
                        pulse: num,
                        detail: format!("starts at {pos} s, previous pulse ends at {prev_end} s"),
                    });
                }
            }

            let cursor = self.cards.trigger_time(gap_card, timebase);
            let latency =
                self.cards[gap_card].intrinsic_delay + self.cards[len_card].intrinsic_delay;
            let raw = (pos - (cursor + latency + delay)) / timebase;
            let gap = ticks_round(raw);
            if gap < 0 {
                let detail = format!("needs a gap of {gap} ticks after the previous card");
                return Err(if i == 0 {
                    PulserError::TooEarly { function: id, pulse: num, detail }
                } else {
                    PulserError::TooClose { function: id, pulse: num, detail }
                });
            }
            for ticks in [gap, len] {
                if ticks > MAX_TICKS {
                    return Err(PulserError::TooLong { function: id, pulse: num, ticks });
                }
            }
            self.note_shift(id, num, raw, gap);

            self.cards[gap_card].assign(gap);
            self.cards[len_card].assign(len);
            let start = self.cards.trigger_time(len_card, timebase)
                + self.cards[len_card].intrinsic_delay
                + delay;
            let end = start + to_seconds(len, timebase);
            self.mw_timing.push(MwTiming { pulse: num, start, end });
            prev_end = Some(end);
        }
        Ok(())
    }

    /// Phase channel: phase card `i` ends `psd` before microwave pulse `i` starts and routes
    /// to the line of the pulse's current phase.
    pub(crate) fn setup_phase(&mut self) -> Result<()> {
        let id = FunctionId::Phase;
        let timebase = self.timebase();
        let psd = self.config.phase_switch_delay;
        let grace = self.config.grace_period;
        let timing = self.mw_timing.clone();
        self.check_pulse_count(id, timing.len())?;

        for (i, mw) in timing.iter().enumerate() {
            let card = CardId::PHASES[i];
            let trigger = self.cards.trigger_time(card, timebase);
            let latency = self.cards[card].intrinsic_delay;
            let raw = (mw.start - psd - (trigger + latency)) / timebase;
            let ticks = ticks_floor(raw);

            let min_length = PHASE_MIN_PULSE_LENGTH - TICK_TOLERANCE * timebase;
            if ticks < 0 || to_seconds(ticks, timebase) < min_length {
                let detail = format!(
                    "phase pulse would last {} s, minimum is {PHASE_MIN_PULSE_LENGTH} s",
                    to_seconds(ticks, timebase)
                );
                return Err(if i == 0 {
                    PulserError::TooEarly { function: id, pulse: mw.pulse, detail }
                } else {
                    PulserError::TooClose { function: id, pulse: mw.pulse, detail }
                });
            }
            if ticks > MAX_TICKS {
                return Err(PulserError::TooLong { function: id, pulse: mw.pulse, ticks });
            }
            let switch = trigger + latency + to_seconds(ticks, timebase);
            if i > 0 && switch < timing[i - 1].end + grace - TICK_TOLERANCE * timebase {
                return Err(PulserError::TooClose {
                    function: id,
                    pulse: mw.pulse,
                    detail: format!(
                        "phase switch at {switch} s is closer than {grace} s to the previous pulse"
                    ),
                });
            }

            let label = self
                .pulses
                .get(mw.pulse)
                .ok()
                .and_then(|p| self.phase_label(p))
                .unwrap_or(PhaseLabel::PlusX);
            let card = &mut self.cards[card];
            card.assign(ticks);
            card.new_phase = Some(label);
        }
        Ok(())
    }

    /// Automatic defense: one pulse from the fixed defense start, or from the first microwave
    /// pulse if a negative microwave delay lets that start earlier, until the defense distance
    /// after the end of the last microwave pulse.
    pub(crate) fn setup_defense_auto(&mut self) -> Result<()> {
        let id = FunctionId::Defense;
        let Some(num) = self.defense_pulse else {
            return Ok(());
        };
        let timebase = self.timebase();
        let (Some(first), Some(last)) =
            (self.mw_timing.first().copied(), self.mw_timing.last().copied())
        else {
            let pulse = self.pulses.get_mut(num)?;
            pulse.pos = None;
            pulse.len = None;
            return Ok(());
        };

        let earliest = self.defense_start().min(first.start);
        let start = to_seconds(ticks_floor(earliest / timebase), timebase);
        let raw = (last.end + self.config.defense_min_distance - start) / timebase;
        let ticks = ceil_to_grid(ticks_ceil(raw), self.config.defense_granularity);
        if ticks > MAX_TICKS {
            return Err(PulserError::TooLong { function: id, pulse: num, ticks });
        }

        self.cards[CardId::Defense].assign(ticks);
        let pulse = self.pulses.get_mut(num)?;
        pulse.pos = Some(start);
        pulse.len = Some(ticks);
        Ok(())
    }

    /// Manual defense: the pulse starts at the fixed defense start, the card delay is its
    /// length.
    pub(crate) fn setup_defense_manual(&mut self) -> Result<()> {
        let id = FunctionId::Defense;
        let timebase = self.timebase();
        let active = self.function(id).active_pulses().to_vec();
        self.check_pulse_count(id, active.len())?;
        let Some(&num) = active.first() else {
            return Ok(());
        };

        let (pos, len) = self.pulse_timing(num)?;
        let start = self.defense_start();
        if !times_equal(pos, start, timebase) {
            return Err(PulserError::PositionFixed {
                pulse: num,
                fixed: start,
                requested: pos,
            });
        }
        if len > MAX_TICKS {
            return Err(PulserError::TooLong { function: id, pulse: num, ticks: len });
        }
        self.cards[CardId::Defense].assign(len);
        Ok(())
    }

    /// Laser and detection: a single card whose end pulse triggers the device.
    pub(crate) fn setup_single(&mut self, id: FunctionId) -> Result<()> {
        let active = self.function(id).active_pulses().to_vec();
        self.check_pulse_count(id, active.len())?;
        let Some(&num) = active.first() else {
            return Ok(());
        };

        if id == FunctionId::Detection {
            let pulse = self.pulses.get_mut(num)?;
            if pulse.len != Some(1) {
                warn!("Length of {id} pulse #{num} set to 1 tick, the trigger has a fixed length");
                pulse.len = Some(1);
            }
        }
        let (pos, _) = self.pulse_timing(num)?;
        let ticks = self.single_card_delay(id, num, pos)?;
        self.cards[id.cards()[0]].assign(ticks);
        Ok(())
    }

    /// Delay of a single-card channel for a pulse at `pos`.
    fn single_card_delay(&mut self, id: FunctionId, num: PulseNum, pos: f64) -> Result<Ticks> {
        let timebase = self.timebase();
        let card = id.cards()[0];
        let earliest = self.init_end() + self.cards[card].intrinsic_delay + self.function(id).delay;
        let raw = (pos - earliest) / timebase;
        let ticks = ticks_round(raw);
        if ticks < 0 {
            return Err(PulserError::TooEarly {
                function: id,
                pulse: num,
                detail: format!("starts at {pos} s, earliest possible start is {earliest} s"),
            });
        }
        if ticks > MAX_TICKS {
            return Err(PulserError::TooLate {
                function: id,
                pulse: num,
                detail: format!("a delay of {ticks} ticks exceeds the card maximum of {MAX_TICKS}"),
            });
        }
        self.note_shift(id, num, raw, ticks);
        Ok(ticks)
    }

    /// RF: the card triggers the synthesizer, which produces one pulse or, in double mode, a
    /// second pulse of the same width after the configured delay.
    pub(crate) fn setup_rf(&mut self) -> Result<()> {
        let id = FunctionId::Rf;
        let timebase = self.timebase();
        let active = self.function(id).active_pulses().to_vec();
        self.check_pulse_count(id, active.len())?;
        let Some(&first) = active.first() else {
            return Ok(());
        };

        let (pos, len) = self.pulse_timing(first)?;
        let mut settings = SynthSettings {
            width: Some(to_seconds(len, timebase)),
            delay: self.synth.delay,
            double_mode: false,
            output: true,
        };

        if let Some(&second) = active.get(1) {
            let pulse = self.pulses.get_mut(second)?;
            if pulse.len != Some(len) {
                warn!("Length of {id} pulse #{second} set to {len} ticks to match #{first}");
                pulse.len = Some(len);
            }
            let (pos2, _) = self.pulse_timing(second)?;
            let separation = pos2 - pos;
            if separation < SYNTH_MIN_PULSE_SEPARATION - TICK_TOLERANCE * timebase {
                return Err(PulserError::TooClose {
                    function: id,
                    pulse: second,
                    detail: format!(
                        "pulse starts are {separation} s apart, the synthesizer needs {} s",
                        SYNTH_MIN_PULSE_SEPARATION
                    ),
                });
            }
            if pos2 < pos + to_seconds(len, timebase) - TICK_TOLERANCE * timebase {
                return Err(PulserError::TooClose {
                    function: id,
                    pulse: second,
                    detail: format!("starts at {pos2} s, before pulse #{first} ends"),
                });
            }
            settings.delay = Some(separation);
            settings.double_mode = true;
        }

        let ticks = self.single_card_delay(id, first, pos)?;
        self.cards[CardId::Rf].assign(ticks);
        self.new_synth = settings;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{DefenseMode, PulserConfig};

    fn add_pulse(state: &mut PulserState, num: PulseNum, id: FunctionId, pos: f64, len: Ticks) {
        let pulse = state.pulses.create(num).unwrap();
        pulse.set_function(id).unwrap();
        pulse.set_position(pos).unwrap();
        pulse.set_length(len).unwrap();
        state.function_(id).add_pulse(num);
    }

    fn state() -> PulserState {
        PulserState::new(PulserConfig::new(1e-8).unwrap()).unwrap()
    }

    #[test]
    fn two_mw_pulses() {
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Mw, 200e-9, 10);
        add_pulse(&mut state, 2, FunctionId::Mw, 500e-9, 10);
        state.compute().unwrap();

        let delays: Vec<Ticks> = [CardId::MwGap0, CardId::MwLen0, CardId::MwGap1, CardId::MwLen1]
            .iter()
            .map(|c| state.cards[*c].new_delay)
            .collect();
        assert_eq!(delays, vec![14, 10, 28, 10]);
        assert!(!state.cards[CardId::MwGap2].is_active);
        assert!((state.mw_timing[1].start - 500e-9).abs() < 1e-12);
        assert!((state.mw_timing[1].end - 600e-9).abs() < 1e-12);
    }

    #[test]
    fn mw_pulse_before_previous_end() {
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Mw, 200e-9, 10);
        add_pulse(&mut state, 2, FunctionId::Mw, 250e-9, 10);
        assert!(matches!(
            state.compute(),
            Err(PulserError::TooClose { pulse: 2, .. })
        ));
    }

    #[test]
    fn mw_pulse_too_early() {
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Mw, 30e-9, 10);
        assert!(matches!(
            state.compute(),
            Err(PulserError::TooEarly { function: FunctionId::Mw, pulse: 1, .. })
        ));
    }

    #[test]
    fn back_to_back_mw_pulses_need_card_latency() {
        // the second length card only fires 40 ns after the first gap card ends
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Mw, 200e-9, 1);
        add_pulse(&mut state, 2, FunctionId::Mw, 210e-9, 10);
        assert!(matches!(
            state.compute(),
            Err(PulserError::TooClose { pulse: 2, .. })
        ));
    }

    #[test]
    fn too_many_mw_pulses() {
        let mut state = state();
        for i in 0..4 {
            add_pulse(&mut state, i, FunctionId::Mw, (200 + 300 * i) as f64 * 1e-9, 10);
        }
        assert!(matches!(
            state.compute(),
            Err(PulserError::TooManyPulses { requested: 4, max: 3, .. })
        ));
    }

    #[test]
    fn phase_cards_follow_mw() {
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Mw, 200e-9, 10);
        add_pulse(&mut state, 2, FunctionId::Mw, 500e-9, 10);
        let cycle = state
            .add_phase_cycle(vec![PhaseLabel::MinusY, PhaseLabel::PlusX])
            .unwrap();
        state.pulses.get_mut(2).unwrap().set_phase_cycle(cycle).unwrap();
        state.compute().unwrap();

        assert_eq!(state.cards[CardId::Phase0].new_delay, 14);
        assert_eq!(state.cards[CardId::Phase1].new_delay, 28);
        assert_eq!(state.cards[CardId::Phase0].new_phase, Some(PhaseLabel::PlusX));
        assert_eq!(state.cards[CardId::Phase1].new_phase, Some(PhaseLabel::MinusY));

        state.next_phase();
        state.compute().unwrap();
        assert_eq!(state.cards[CardId::Phase1].new_phase, Some(PhaseLabel::PlusX));
    }

    #[test]
    fn phase_switch_needs_grace_period() {
        let config = PulserConfig::new(1e-8).unwrap().cfg_grace_period(100e-9);
        let mut state = PulserState::new(config).unwrap();
        add_pulse(&mut state, 1, FunctionId::Mw, 200e-9, 10);
        add_pulse(&mut state, 2, FunctionId::Mw, 400e-9, 10);
        let cycle = state.add_phase_cycle(vec![PhaseLabel::PlusY]).unwrap();
        state.pulses.get_mut(1).unwrap().set_phase_cycle(cycle).unwrap();
        // the second switch happens at 380 ns, only 80 ns after the first pulse ends
        assert!(matches!(
            state.compute(),
            Err(PulserError::TooClose { function: FunctionId::Phase, pulse: 2, .. })
        ));
    }

    #[test]
    fn automatic_defense_covers_mw() {
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Mw, 200e-9, 10);
        state.compute().unwrap();
        // starts at 40 ns, has to last until 350 ns: 31 ticks, rounded up to 40
        assert_eq!(state.cards[CardId::Defense].new_delay, 40);
        let defense = state.pulses.get(-1).unwrap();
        assert_eq!(defense.len, Some(40));
        assert!((defense.pos.unwrap() - 40e-9).abs() < 1e-12);
    }

    #[test]
    fn automatic_defense_starts_with_an_earlier_mw_pulse() {
        let config = PulserConfig::new(1e-8)
            .unwrap()
            .cfg_function_delay(FunctionId::Mw, -50e-9);
        let mut state = PulserState::new(config).unwrap();
        add_pulse(&mut state, 1, FunctionId::Mw, 80e-9, 10);
        assert!((state.defense_start() - 90e-9).abs() < 1e-12);
        state.compute().unwrap();
        // from 80 ns to 230 ns: 15 ticks, rounded up to 20
        let defense = state.pulses.get(-1).unwrap();
        assert!((defense.pos.unwrap() - 80e-9).abs() < 1e-12);
        assert_eq!(defense.len, Some(20));
        assert_eq!(state.cards[CardId::Defense].new_delay, 20);
    }

    #[test]
    fn automatic_defense_too_long() {
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Mw, 200e-9, MAX_TICKS);
        assert!(matches!(
            state.compute(),
            Err(PulserError::TooLong { function: FunctionId::Defense, pulse: -1, .. })
        ));
    }

    #[test]
    fn mw_pulse_too_long() {
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Mw, 200e-9, MAX_TICKS + 1);
        assert_eq!(
            state.compute(),
            Err(PulserError::TooLong { function: FunctionId::Mw, pulse: 1, ticks: MAX_TICKS + 1 })
        );
    }

    #[test]
    fn off_grid_latency_shifts_pulses() {
        let config = PulserConfig::new(1e-8).unwrap().cfg_intrinsic_delays(maplit::hashmap! {
            CardId::MwGap0 => 23e-9,
            CardId::Laser => 23e-9,
        });
        let mut state = PulserState::new(config).unwrap();
        add_pulse(&mut state, 1, FunctionId::Mw, 200e-9, 10);
        add_pulse(&mut state, 2, FunctionId::Laser, 1e-6, 10);
        state.compute().unwrap();

        // 13.7 and 95.7 ticks, both rounded up
        assert_eq!(state.cards[CardId::MwGap0].new_delay, 14);
        assert_eq!(state.cards[CardId::Laser].new_delay, 96);
        let shifts = &state.shifted_pulses;
        assert_eq!(shifts.iter().map(|s| s.0).collect::<Vec<_>>(), vec![1, 2]);
        assert!(shifts.iter().all(|s| (s.1 - 3e-9).abs() < 1e-12));
        assert!((state.mw_timing[0].start - 203e-9).abs() < 1e-12);

        state.pulses.get_mut(1).unwrap().change_position(203e-9, 1e-8);
        state.compute().unwrap();
        assert_eq!(state.shifted_pulses.len(), 1);
    }

    #[test]
    fn manual_defense_position_is_fixed() {
        let config = PulserConfig::new(1e-8).unwrap().cfg_defense_mode(DefenseMode::Manual);
        let mut state = PulserState::new(config).unwrap();
        assert_eq!(state.defense_pulse, None);
        let pulse = state.pulses.create(5).unwrap();
        pulse.set_function(FunctionId::Defense).unwrap();
        pulse.set_length(30).unwrap();
        state.function_(FunctionId::Defense).add_pulse(5);
        state.compute().unwrap();
        assert_eq!(state.cards[CardId::Defense].new_delay, 30);
        assert!((state.pulses.get(5).unwrap().pos.unwrap() - 40e-9).abs() < 1e-12);

        let mut state = PulserState::new(
            PulserConfig::new(1e-8).unwrap().cfg_defense_mode(DefenseMode::Manual),
        )
        .unwrap();
        add_pulse(&mut state, 5, FunctionId::Defense, 100e-9, 30);
        assert!(matches!(
            state.compute(),
            Err(PulserError::PositionFixed { pulse: 5, .. })
        ));
    }

    #[test]
    fn detection_length_is_clamped() {
        let mut state = state();
        add_pulse(&mut state, 3, FunctionId::Detection, 1e-6, 50);
        state.compute().unwrap();
        assert_eq!(state.pulses.get(3).unwrap().len, Some(1));
        assert_eq!(state.cards[CardId::Detection].new_delay, 96);
    }

    #[test]
    fn laser_too_early() {
        let mut state = state();
        add_pulse(&mut state, 3, FunctionId::Laser, 10e-9, 10);
        assert!(matches!(
            state.compute(),
            Err(PulserError::TooEarly { function: FunctionId::Laser, .. })
        ));
    }

    #[test]
    fn laser_too_late() {
        let mut state = state();
        add_pulse(&mut state, 3, FunctionId::Laser, MAX_TICKS as f64 * 1e-8 + 1e-6, 10);
        assert!(matches!(
            state.compute(),
            Err(PulserError::TooLate { function: FunctionId::Laser, pulse: 3, .. })
        ));
    }

    #[test]
    fn single_pulse_channels_take_one_pulse() {
        let mut state = state();
        add_pulse(&mut state, 3, FunctionId::Laser, 1e-6, 10);
        add_pulse(&mut state, 4, FunctionId::Laser, 2e-6, 10);
        assert_eq!(
            state.compute(),
            Err(PulserError::TooManyPulses {
                function: FunctionId::Laser,
                requested: 2,
                max: LASER_MAX_PULSES,
            })
        );

        let config = PulserConfig::new(1e-8).unwrap().cfg_defense_mode(DefenseMode::Manual);
        let mut state = PulserState::new(config).unwrap();
        add_pulse(&mut state, 5, FunctionId::Defense, 40e-9, 30);
        add_pulse(&mut state, 6, FunctionId::Defense, 40e-9, 50);
        assert_eq!(
            state.compute(),
            Err(PulserError::TooManyPulses {
                function: FunctionId::Defense,
                requested: 2,
                max: DEFENSE_MAX_PULSES,
            })
        );
    }

    #[test]
    fn rf_double_pulse() {
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Rf, 100e-9, 5);
        add_pulse(&mut state, 2, FunctionId::Rf, 400e-9, 8);
        state.compute().unwrap();
        assert_eq!(state.pulses.get(2).unwrap().len, Some(5));
        assert_eq!(state.cards[CardId::Rf].new_delay, 6);
        assert!(state.new_synth.double_mode);
        assert!(state.new_synth.output);
        assert!((state.new_synth.width.unwrap() - 50e-9).abs() < 1e-15);
        assert!((state.new_synth.delay.unwrap() - 300e-9).abs() < 1e-15);
    }

    #[test]
    fn rf_pulses_too_close() {
        let mut state = state();
        add_pulse(&mut state, 1, FunctionId::Rf, 100e-9, 5);
        add_pulse(&mut state, 2, FunctionId::Rf, 150e-9, 5);
        assert!(matches!(
            state.compute(),
            Err(PulserError::TooClose { function: FunctionId::Rf, pulse: 2, .. })
        ));
    }
}
