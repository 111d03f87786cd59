//! The statically wired card chain of the pulser.
//!
//! ## Topology
//!
//! ```text
//! ERT_DELAY (root: repetition time / external trigger)
//!   └─► INIT_DELAY (negative delay offset, always enabled)
//!         ├─► MW_GAP_0 ─► MW_GAP_1 ─► MW_GAP_2
//!         │     └ MW_LEN_0  └ MW_LEN_1  └ MW_LEN_2
//!         ├─► RF_DELAY
//!         ├─► LASER_DELAY
//!         ├─► DET_DELAY
//!         ├─► DEFENSE_DELAY
//!         └─► PHASE_DELAY_0 ─► PHASE_DELAY_1 ─► PHASE_DELAY_2
//! ```
//!
//! A card is triggered by the end pulse of its `prev` card and emits its own end pulse
//! `intrinsic + delay * timebase` later. The cards live in a [`CardArena`] indexed by
//! [`CardId`]; chain links are `Option<CardId>`, so the wiring is plain data and can't dangle.
//! Only per-card state (delays, activity, phase routing) ever changes after construction.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use crate::error::PulserError;
use crate::hardware::{ClockFreq, DEFAULT_INTRINSIC_DELAY};
use crate::ticks::Ticks;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CardId {
    Ert,
    Init,
    MwGap0,
    MwLen0,
    MwGap1,
    MwLen1,
    MwGap2,
    MwLen2,
    Rf,
    Laser,
    Detection,
    Defense,
    Phase0,
    Phase1,
    Phase2,
}

struct Wiring {
    id: CardId,
    name: &'static str,
    prev: Option<CardId>,
    next: Option<CardId>,
}

const fn wire(
    id: CardId,
    name: &'static str,
    prev: Option<CardId>,
    next: Option<CardId>,
) -> Wiring {
    Wiring { id, name, prev, next }
}

const WIRING: [Wiring; CardId::COUNT] = [
    wire(CardId::Ert, "ERT_DELAY", None, Some(CardId::Init)),
    wire(CardId::Init, "INIT_DELAY", Some(CardId::Ert), None),
    wire(CardId::MwGap0, "MW_GAP_0", Some(CardId::Init), Some(CardId::MwGap1)),
    wire(CardId::MwLen0, "MW_LEN_0", Some(CardId::MwGap0), None),
    wire(CardId::MwGap1, "MW_GAP_1", Some(CardId::MwGap0), Some(CardId::MwGap2)),
    wire(CardId::MwLen1, "MW_LEN_1", Some(CardId::MwGap1), None),
    wire(CardId::MwGap2, "MW_GAP_2", Some(CardId::MwGap1), None),
    wire(CardId::MwLen2, "MW_LEN_2", Some(CardId::MwGap2), None),
    wire(CardId::Rf, "RF_DELAY", Some(CardId::Init), None),
    wire(CardId::Laser, "LASER_DELAY", Some(CardId::Init), None),
    wire(CardId::Detection, "DET_DELAY", Some(CardId::Init), None),
    wire(CardId::Defense, "DEFENSE_DELAY", Some(CardId::Init), None),
    wire(CardId::Phase0, "PHASE_DELAY_0", Some(CardId::Init), Some(CardId::Phase1)),
    wire(CardId::Phase1, "PHASE_DELAY_1", Some(CardId::Phase0), Some(CardId::Phase2)),
    wire(CardId::Phase2, "PHASE_DELAY_2", Some(CardId::Phase1), None),
];

impl CardId {
    pub const COUNT: usize = 15;

    pub const MW_GAPS: [CardId; 3] = [CardId::MwGap0, CardId::MwGap1, CardId::MwGap2];
    pub const MW_LENGTHS: [CardId; 3] = [CardId::MwLen0, CardId::MwLen1, CardId::MwLen2];
    pub const PHASES: [CardId; 3] = [CardId::Phase0, CardId::Phase1, CardId::Phase2];

    pub fn all() -> impl Iterator<Item = CardId> {
        WIRING.iter().map(|w| w.id)
    }

    pub fn name(&self) -> &'static str {
        WIRING[*self as usize].name
    }

    pub fn from_name(name: &str) -> Option<CardId> {
        WIRING.iter().find(|w| w.name == name).map(|w| w.id)
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Phase switch settings; a phase card routes its output to the line of its label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseLabel {
    PlusX,
    MinusX,
    PlusY,
    MinusY,
}

impl PhaseLabel {
    /// Output line of the phase card selecting this phase.
    pub fn output_line(&self) -> u8 {
        match self {
            PhaseLabel::PlusX => 0,
            PhaseLabel::MinusX => 1,
            PhaseLabel::PlusY => 2,
            PhaseLabel::MinusY => 3,
        }
    }
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PhaseLabel::PlusX => "+X",
                PhaseLabel::MinusX => "-X",
                PhaseLabel::PlusY => "+Y",
                PhaseLabel::MinusY => "-Y",
            }
        )
    }
}

impl FromStr for PhaseLabel {
    type Err = PulserError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        match label.trim().to_ascii_uppercase().as_str() {
            "+X" | "X" => Ok(PhaseLabel::PlusX),
            "-X" => Ok(PhaseLabel::MinusX),
            "+Y" | "Y" => Ok(PhaseLabel::PlusY),
            "-Y" => Ok(PhaseLabel::MinusY),
            _ => Err(PulserError::UnknownPhase(label.to_string())),
        }
    }
}

/// A RB8514 delay card: wiring plus committed and pending state.
///
/// `delay`/`was_active`/`phase` describe what the hardware currently holds, `new_delay`/
/// `is_active`/`new_phase` what the last channel setup computed. The commit plan is the
/// difference between the two.
#[derive(Clone, Debug)]
pub struct Card {
    pub id: CardId,
    pub intrinsic_delay: f64,
    pub prev: Option<CardId>,
    pub next: Option<CardId>,
    pub delay: Ticks,
    pub new_delay: Ticks,
    pub was_active: bool,
    pub is_active: bool,
    pub phase: Option<PhaseLabel>,
    pub new_phase: Option<PhaseLabel>,
}

impl Card {
    fn new(wiring: &Wiring, intrinsic_delay: f64) -> Self {
        Self {
            id: wiring.id,
            intrinsic_delay,
            prev: wiring.prev,
            next: wiring.next,
            delay: 0,
            new_delay: 0,
            was_active: false,
            is_active: false,
            phase: None,
            new_phase: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    /// Marks the card as carrying a pulse with the given delay.
    pub fn assign(&mut self, delay: Ticks) {
        self.new_delay = delay;
        self.is_active = true;
    }

    /// Marks the card as unused; its delay must be zero so it can't trigger anything.
    pub fn clear(&mut self) {
        self.new_delay = 0;
        self.is_active = false;
        self.new_phase = None;
    }

    pub fn is_changed(&self) -> bool {
        self.delay != self.new_delay
            || self.was_active != self.is_active
            || self.phase != self.new_phase
    }

    /// Records the pending state as written to hardware.
    pub fn mark_committed(&mut self) {
        self.delay = self.new_delay;
        self.was_active = self.is_active;
        self.phase = self.new_phase;
    }

    /// Forgets everything ever committed or computed.
    pub fn reset(&mut self) {
        self.delay = 0;
        self.was_active = false;
        self.phase = None;
        self.clear();
    }
}

/// A RB8515 clock card.
#[derive(Clone, Debug)]
pub struct ClockCard {
    pub name: &'static str,
    pub freq: Option<ClockFreq>,
    pub new_freq: Option<ClockFreq>,
}

impl ClockCard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            freq: None,
            new_freq: None,
        }
    }
}

pub const TB_CLOCK: &str = "TB_CLOCK";
pub const ERT_CLOCK: &str = "ERT_CLOCK";

/// Default intrinsic latencies, standing in for the per-card values of the device database.
pub fn default_intrinsic_delays() -> HashMap<CardId, f64> {
    CardId::all().map(|id| (id, DEFAULT_INTRINSIC_DELAY)).collect()
}

#[derive(Clone, Debug)]
pub struct CardArena {
    cards: Vec<Card>,
    pub tb_clock: ClockCard,
    pub ert_clock: ClockCard,
}

impl CardArena {
    pub fn new(intrinsic_delays: &HashMap<CardId, f64>) -> Self {
        let cards = WIRING
            .iter()
            .map(|w| {
                let intrinsic = intrinsic_delays
                    .get(&w.id)
                    .copied()
                    .unwrap_or(DEFAULT_INTRINSIC_DELAY);
                Card::new(w, intrinsic)
            })
            .collect();
        Self {
            cards,
            tb_clock: ClockCard::new(TB_CLOCK),
            ert_clock: ClockCard::new(ERT_CLOCK),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Card> {
        self.cards.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Card> {
        self.cards.iter_mut()
    }

    /// Cards downstream of `id` in its chain, following `next` links.
    pub fn chain_from(&self, id: CardId) -> Vec<CardId> {
        let mut chain = vec![id];
        let mut cur = self[id].next;
        while let Some(next) = cur {
            chain.push(next);
            cur = self[next].next;
        }
        chain
    }

    /// Time (relative to the root end pulse) at which `id` gets triggered, using the pending
    /// delays. The init card is the first one in every channel chain and gets triggered at 0.
    pub fn trigger_time(&self, id: CardId, timebase: f64) -> f64 {
        match self[id].prev {
            None | Some(CardId::Ert) => 0.,
            Some(prev) => self.end_time(prev, timebase),
        }
    }

    /// Time of the end pulse of `id` with the pending delays.
    pub fn end_time(&self, id: CardId, timebase: f64) -> f64 {
        let card = &self[id];
        self.trigger_time(id, timebase) + card.intrinsic_delay + card.new_delay as f64 * timebase
    }

    pub fn reset(&mut self) {
        self.cards.iter_mut().for_each(Card::reset);
        self.tb_clock.freq = None;
        self.ert_clock.freq = None;
    }
}

impl Index<CardId> for CardArena {
    type Output = Card;
    fn index(&self, id: CardId) -> &Card {
        &self.cards[id as usize]
    }
}

impl IndexMut<CardId> for CardArena {
    fn index_mut(&mut self, id: CardId) -> &mut Card {
        &mut self.cards[id as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wiring_is_consistent() {
        for (i, id) in CardId::all().enumerate() {
            assert_eq!(id as usize, i);
        }
        let arena = CardArena::new(&default_intrinsic_delays());
        for card in arena.iter() {
            if let Some(next) = card.next {
                assert_eq!(arena[next].prev, Some(card.id));
            }
        }
        assert_eq!(CardId::from_name("MW_LEN_1"), Some(CardId::MwLen1));
        assert_eq!(CardId::from_name("NO_SUCH_CARD"), None);
    }

    #[test]
    fn phase_labels() {
        assert_eq!("-y".parse::<PhaseLabel>(), Ok(PhaseLabel::MinusY));
        assert_eq!("X".parse::<PhaseLabel>(), Ok(PhaseLabel::PlusX));
        assert!("+Z".parse::<PhaseLabel>().is_err());
        assert_eq!(PhaseLabel::MinusX.to_string(), "-X");
    }

    #[test]
    fn chains() {
        let arena = CardArena::new(&default_intrinsic_delays());
        assert_eq!(arena.chain_from(CardId::MwGap0), CardId::MW_GAPS.to_vec());
        assert_eq!(arena.chain_from(CardId::Rf), vec![CardId::Rf]);
    }

    #[test]
    fn timing_along_the_chain() {
        let mut arena = CardArena::new(&default_intrinsic_delays());
        arena[CardId::Init].assign(0);
        arena[CardId::MwGap0].assign(14);
        arena[CardId::MwLen0].assign(10);
        let tb = 1e-8;
        assert!((arena.end_time(CardId::Init, tb) - 20e-9).abs() < 1e-12);
        assert!((arena.end_time(CardId::MwGap0, tb) - 180e-9).abs() < 1e-12);
        assert!((arena.trigger_time(CardId::MwLen0, tb) - 180e-9).abs() < 1e-12);
        assert!((arena.end_time(CardId::MwLen0, tb) - 300e-9).abs() < 1e-12);
    }

    #[test]
    fn commit_bookkeeping() {
        let mut arena = CardArena::new(&default_intrinsic_delays());
        let card = &mut arena[CardId::Rf];
        assert!(!card.is_changed());
        card.assign(5);
        assert!(card.is_changed());
        card.mark_committed();
        assert!(!card.is_changed());
        card.clear();
        assert!(card.is_changed());
        card.reset();
        assert!(!card.is_changed());
    }
}
