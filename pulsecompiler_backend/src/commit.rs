//! Diff between the committed and the pending hardware state.
//!
//! [`commit_plan`] lists the hardware operations needed to bring the cards, clocks and the RF
//! synthesizer from their committed to their pending state. Unchanged cards produce nothing,
//! so a plan computed right after [`PulserState::mark_committed`] is empty.
//!
//! Order matters on a running chain: cards that go idle are silenced first so they can't
//! trigger anything while the others are reprogrammed, and phase cards get their routing only
//! after their delay is in place.

use std::fmt;

use crate::card::CardId;
use crate::hardware::ClockFreq;
use crate::state::{PulserState, SynthSettings};
use crate::ticks::Ticks;

#[derive(Clone, Debug, PartialEq)]
pub enum SynthAction {
    PulseWidth(f64),
    PulseDelay(f64),
    DoubleMode(bool),
    Output(bool),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommitAction {
    SetClock { clock: &'static str, freq: ClockFreq },
    /// Disable the end pulse output, then zero the delay.
    Deactivate { card: CardId },
    /// Write a new delay to a card that stays active; waits while the card is busy.
    SetDelay { card: CardId, ticks: Ticks },
    /// Write the delay, then enable the end pulse output.
    Activate { card: CardId, ticks: Ticks },
    Route { card: CardId, line: u8 },
    Synth(SynthAction),
}

impl fmt::Display for CommitAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommitAction::SetClock { clock, freq } => write!(f, "{clock}: frequency {freq}"),
            CommitAction::Deactivate { card } => write!(f, "{card}: off"),
            CommitAction::SetDelay { card, ticks } => write!(f, "{card}: delay {ticks}"),
            CommitAction::Activate { card, ticks } => write!(f, "{card}: on, delay {ticks}"),
            CommitAction::Route { card, line } => write!(f, "{card}: output line {line}"),
            CommitAction::Synth(action) => write!(f, "synthesizer: {action:?}"),
        }
    }
}

/// Hardware operations turning the committed state of `state` into its pending state.
pub fn commit_plan(state: &PulserState) -> Vec<CommitAction> {
    let mut plan = Vec::new();

    for clock in [&state.cards.tb_clock, &state.cards.ert_clock] {
        if let Some(freq) = clock.new_freq.filter(|f| clock.freq != Some(*f)) {
            plan.push(CommitAction::SetClock { clock: clock.name, freq });
        }
    }

    let cards = || state.cards.iter().filter(|c| c.id != CardId::Ert);
    for card in cards().filter(|c| c.was_active && !c.is_active) {
        plan.push(CommitAction::Deactivate { card: card.id });
    }
    for card in cards().filter(|c| c.is_active && c.delay != c.new_delay) {
        if card.was_active {
            plan.push(CommitAction::SetDelay { card: card.id, ticks: card.new_delay });
        }
    }
    for card in cards().filter(|c| c.is_active && !c.was_active) {
        plan.push(CommitAction::Activate { card: card.id, ticks: card.new_delay });
    }
    for card in cards().filter(|c| c.is_active) {
        if let Some(label) = card.new_phase.filter(|l| card.phase != Some(*l) || !card.was_active) {
            plan.push(CommitAction::Route { card: card.id, line: label.output_line() });
        }
    }

    let (old, new) = (&state.synth, &state.new_synth);
    if let Some(width) = new.width.filter(|w| old.width != Some(*w)) {
        plan.push(CommitAction::Synth(SynthAction::PulseWidth(width)));
    }
    if let Some(delay) = new.delay.filter(|d| new.double_mode && old.delay != Some(*d)) {
        plan.push(CommitAction::Synth(SynthAction::PulseDelay(delay)));
    }
    if old.double_mode != new.double_mode {
        plan.push(CommitAction::Synth(SynthAction::DoubleMode(new.double_mode)));
    }
    if old.output != new.output {
        plan.push(CommitAction::Synth(SynthAction::Output(new.output)));
    }
    plan
}

impl PulserState {
    /// Records the pending state as programmed into the hardware.
    pub fn mark_committed(&mut self) {
        self.cards.iter_mut().for_each(|c| c.mark_committed());
        for clock in [&mut self.cards.tb_clock, &mut self.cards.ert_clock] {
            if clock.new_freq.is_some() {
                clock.freq = clock.new_freq;
            }
        }
        let delay = if self.new_synth.double_mode {
            self.new_synth.delay
        } else {
            self.synth.delay
        };
        self.synth = SynthSettings {
            delay,
            ..self.new_synth.clone()
        };
        self.committed_seq_len = self.max_seq_len;
    }
}
