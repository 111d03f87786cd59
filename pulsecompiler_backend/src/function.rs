//! Logical pulse channels ("functions") and their pulse views.
//!
//! Each [`Function`] owns a dedicated chain of delay cards and an ordered view (pulse numbers)
//! into the pulse registry. [`sort_pulses`] orders that view the way the channel setup code
//! expects it: active pulses by position, inactive pulses after all active ones.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::card::CardId;
use crate::error::*;
use crate::hardware::*;
use crate::pulse::PulseRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FunctionId {
    Mw,
    Rf,
    Laser,
    Detection,
    Defense,
    Phase,
}

impl FunctionId {
    pub const ALL: [FunctionId; 6] = [
        FunctionId::Mw,
        FunctionId::Rf,
        FunctionId::Laser,
        FunctionId::Detection,
        FunctionId::Defense,
        FunctionId::Phase,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FunctionId::Mw => "MW",
            FunctionId::Rf => "RF",
            FunctionId::Laser => "LASER",
            FunctionId::Detection => "DETECTION",
            FunctionId::Defense => "DEFENSE",
            FunctionId::Phase => "PHASE",
        }
    }

    /// Cards of the function's chain, in chain order.
    pub fn cards(&self) -> &'static [CardId] {
        match self {
            FunctionId::Mw => &[
                CardId::MwGap0,
                CardId::MwLen0,
                CardId::MwGap1,
                CardId::MwLen1,
                CardId::MwGap2,
                CardId::MwLen2,
            ],
            FunctionId::Rf => &[CardId::Rf],
            FunctionId::Laser => &[CardId::Laser],
            FunctionId::Detection => &[CardId::Detection],
            FunctionId::Defense => &[CardId::Defense],
            FunctionId::Phase => &CardId::PHASES,
        }
    }

    pub fn max_pulses(&self) -> usize {
        match self {
            FunctionId::Mw | FunctionId::Phase => MW_MAX_PULSES,
            FunctionId::Rf => RF_MAX_PULSES,
            FunctionId::Laser => LASER_MAX_PULSES,
            FunctionId::Detection => DETECTION_MAX_PULSES,
            FunctionId::Defense => DEFENSE_MAX_PULSES,
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn name_patterns() -> &'static [(Regex, FunctionId)] {
    static PATTERNS: OnceLock<Vec<(Regex, FunctionId)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"^(?i)(mw|micro_?wave)$", FunctionId::Mw),
            (r"^(?i)(rf|radio_?frequency)$", FunctionId::Rf),
            (r"^(?i)laser$", FunctionId::Laser),
            (r"^(?i)det(ection)?$", FunctionId::Detection),
            (r"^(?i)defen[cs]e$", FunctionId::Defense),
            (r"^(?i)phase(_?\d+)?$", FunctionId::Phase),
        ]
        .into_iter()
        .filter_map(|(re, id)| Regex::new(re).ok().map(|re| (re, id)))
        .collect()
    })
}

impl FromStr for FunctionId {
    type Err = PulserError;

    /// Accepts the canonical names plus the usual aliases ("MICROWAVE", "DET", "PHASE_1", ...).
    fn from_str(name: &str) -> Result<Self> {
        name_patterns()
            .iter()
            .find(|(re, _)| re.is_match(name.trim()))
            .map(|(_, id)| *id)
            .ok_or_else(|| PulserError::UnknownFunction(name.to_string()))
    }
}

/// A logical channel with its pulse view and chain.
#[derive(Clone, Debug)]
pub struct Function {
    pub id: FunctionId,
    pub is_used: bool,
    /// Referenced by the user at least once.
    pub is_declared: bool,
    pub pulses: Vec<PulseNum>,
    pub num_active_pulses: usize,
    pub old_num_active_pulses: usize,
    /// Propagation delay between card output and the device, may be negative.
    pub delay: f64,
    pub first_card: Option<CardId>,
}

impl Function {
    pub fn new(id: FunctionId, delay: f64) -> Self {
        Self {
            id,
            is_used: false,
            is_declared: false,
            pulses: Vec::new(),
            num_active_pulses: 0,
            old_num_active_pulses: 0,
            delay,
            first_card: id.cards().first().copied(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    pub fn declare(&mut self) {
        self.is_declared = true;
    }

    pub fn add_pulse(&mut self, num: PulseNum) {
        if !self.pulses.contains(&num) {
            self.pulses.push(num);
        }
        self.is_used = true;
    }

    /// Numbers of the active pulses, in sorted order (valid after [`sort_pulses`]).
    pub fn active_pulses(&self) -> &[PulseNum] {
        &self.pulses[..self.num_active_pulses]
    }
}

/// Recounts the active pulses of `function` and stable-sorts its view by position.
///
/// Inactive pulses sort after every active one and compare equal among themselves, so their
/// relative order is kept.
pub fn sort_pulses(function: &mut Function, pulses: &PulseRegistry) {
    function.old_num_active_pulses = function.num_active_pulses;
    function.num_active_pulses = function
        .pulses
        .iter()
        .filter(|num| pulses.get(**num).is_ok_and(|p| p.is_active()))
        .count();

    if function.pulses.len() < 2 {
        return;
    }
    function.pulses.sort_by(|a, b| {
        let pa = pulses.get(*a).ok().filter(|p| p.is_active());
        let pb = pulses.get(*b).ok().filter(|p| p.is_active());
        match (pa.and_then(|p| p.pos), pb.and_then(|p| p.pos)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    });
}
