//! Pulse records and the registry owning them.
//!
//! ## Lifecycle
//! Pulses are created by number before the experiment starts and receive their properties
//! through the `set_*` methods, each of which may be called once (a second call fails with
//! [`PulserError::AlreadySet`]). The first value set for position, length and the two deltas
//! is kept as the pulse's initial value, which is what [`Pulse::reset`] goes back to between
//! test runs. While an experiment is running the `change_*` methods overwrite properties
//! freely and report whether anything changed.
//!
//! User pulses have non-negative numbers. Negative numbers are reserved for pulses the pulser
//! generates itself (the automatic defense pulse) and are handed out by
//! [`PulseRegistry::create_internal`].

use indexmap::IndexMap;

use crate::error::*;
use crate::function::FunctionId;
use crate::ticks::{times_equal, Ticks};

#[derive(Clone, Debug, PartialEq)]
pub struct Pulse {
    pub num: PulseNum,
    pub function: Option<FunctionId>,
    pub pos: Option<f64>,
    pub len: Option<Ticks>,
    pub dpos: Option<f64>,
    pub dlen: Option<Ticks>,
    pub phase_cycle: Option<usize>,
    pub initial_pos: Option<f64>,
    pub initial_len: Option<Ticks>,
    pub initial_dpos: Option<f64>,
    pub initial_dlen: Option<Ticks>,
    /// Activity at the previous function initialization.
    pub was_active: bool,
    /// Set once the pulse has been active in any sequence.
    pub has_been_active: bool,
}

impl Pulse {
    pub fn new(num: PulseNum) -> Self {
        Self {
            num,
            function: None,
            pos: None,
            len: None,
            dpos: None,
            dlen: None,
            phase_cycle: None,
            initial_pos: None,
            initial_len: None,
            initial_dpos: None,
            initial_dlen: None,
            was_active: false,
            has_been_active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.pos.is_some() && self.len.is_some_and(|len| len > 0)
    }

    pub fn is_internal(&self) -> bool {
        self.num < 0
    }

    pub fn set_function(&mut self, function: FunctionId) -> Result<()> {
        if self.function.is_some() {
            return Err(self.already_set("function"));
        }
        self.function = Some(function);
        Ok(())
    }

    pub fn set_position(&mut self, pos: f64) -> Result<()> {
        if self.pos.is_some() {
            return Err(self.already_set("position"));
        }
        self.pos = Some(pos);
        self.initial_pos.get_or_insert(pos);
        Ok(())
    }

    pub fn set_length(&mut self, len: Ticks) -> Result<()> {
        if self.len.is_some() {
            return Err(self.already_set("length"));
        }
        self.len = Some(len);
        self.initial_len.get_or_insert(len);
        Ok(())
    }

    pub fn set_position_delta(&mut self, dpos: f64) -> Result<()> {
        if self.dpos.is_some() {
            return Err(self.already_set("position delta"));
        }
        self.dpos = Some(dpos);
        self.initial_dpos.get_or_insert(dpos);
        Ok(())
    }

    pub fn set_length_delta(&mut self, dlen: Ticks) -> Result<()> {
        if self.dlen.is_some() {
            return Err(self.already_set("length delta"));
        }
        self.dlen = Some(dlen);
        self.initial_dlen.get_or_insert(dlen);
        Ok(())
    }

    pub fn set_phase_cycle(&mut self, cycle: usize) -> Result<()> {
        if self.phase_cycle.is_some() {
            return Err(self.already_set("phase cycle"));
        }
        self.phase_cycle = Some(cycle);
        Ok(())
    }

    /// Overwrites the position; returns false if it was already equal at `timebase`.
    pub fn change_position(&mut self, pos: f64, timebase: f64) -> bool {
        if self.pos.is_some_and(|old| times_equal(old, pos, timebase)) {
            return false;
        }
        self.pos = Some(pos);
        self.initial_pos.get_or_insert(pos);
        true
    }

    pub fn change_length(&mut self, len: Ticks) -> bool {
        if self.len == Some(len) {
            return false;
        }
        self.len = Some(len);
        self.initial_len.get_or_insert(len);
        true
    }

    pub fn change_position_delta(&mut self, dpos: f64, timebase: f64) -> bool {
        if self.dpos.is_some_and(|old| times_equal(old, dpos, timebase)) {
            return false;
        }
        self.dpos = Some(dpos);
        self.initial_dpos.get_or_insert(dpos);
        true
    }

    pub fn change_length_delta(&mut self, dlen: Ticks) -> bool {
        if self.dlen == Some(dlen) {
            return false;
        }
        self.dlen = Some(dlen);
        self.initial_dlen.get_or_insert(dlen);
        true
    }

    /// Moves the pulse by its position delta.
    pub fn shift(&mut self) -> Result<()> {
        let dpos = self.dpos.ok_or(PulserError::DeltaNotSet {
            pulse: self.num,
            property: "position",
        })?;
        let pos = self.pos.unwrap_or(0.) + dpos;
        if pos < 0. {
            return Err(PulserError::InvalidValue {
                pulse: self.num,
                reason: format!("shifting would move it to negative position {pos} s"),
            });
        }
        self.pos = Some(pos);
        Ok(())
    }

    /// Lengthens the pulse by its length delta.
    pub fn increment(&mut self) -> Result<()> {
        let dlen = self.dlen.ok_or(PulserError::DeltaNotSet {
            pulse: self.num,
            property: "length",
        })?;
        let len = self.len.unwrap_or(0) + dlen;
        if len < 0 {
            return Err(PulserError::InvalidValue {
                pulse: self.num,
                reason: format!("incrementing would make its length negative ({len} ticks)"),
            });
        }
        self.len = Some(len);
        Ok(())
    }

    /// Goes back to the values first set for position, length and deltas.
    pub fn reset(&mut self) {
        self.pos = self.initial_pos;
        self.len = self.initial_len;
        self.dpos = self.initial_dpos;
        self.dlen = self.initial_dlen;
        self.was_active = false;
    }

    fn already_set(&self, property: &'static str) -> PulserError {
        PulserError::AlreadySet {
            pulse: self.num,
            property,
        }
    }
}

/// Insertion-ordered collection of all pulses, keyed by pulse number.
#[derive(Clone, Debug, Default)]
pub struct PulseRegistry {
    pulses: IndexMap<PulseNum, Pulse>,
}

impl PulseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, num: PulseNum) -> Result<&mut Pulse> {
        if num < 0 {
            return Err(PulserError::InvalidPulseNumber(num));
        }
        self.insert(num)
    }

    /// Creates a pulse with the next unused negative number.
    pub fn create_internal(&mut self) -> Result<&mut Pulse> {
        let num = self.pulses.keys().copied().filter(|n| *n < 0).min().unwrap_or(0) - 1;
        self.insert(num)
    }

    fn insert(&mut self, num: PulseNum) -> Result<&mut Pulse> {
        if self.pulses.contains_key(&num) {
            return Err(PulserError::DuplicatePulse(num));
        }
        Ok(self.pulses.entry(num).or_insert(Pulse::new(num)))
    }

    /// Looks up any pulse, internal ones included.
    pub fn get(&self, num: PulseNum) -> Result<&Pulse> {
        self.pulses.get(&num).ok_or(PulserError::UnknownPulse(num))
    }

    pub fn get_mut(&mut self, num: PulseNum) -> Result<&mut Pulse> {
        self.pulses.get_mut(&num).ok_or(PulserError::UnknownPulse(num))
    }

    /// Looks up a user pulse; negative numbers are never handed out to users.
    pub fn user_pulse_(&mut self, num: PulseNum) -> Result<&mut Pulse> {
        if num < 0 {
            return Err(PulserError::UnknownPulse(num));
        }
        self.get_mut(num)
    }

    pub fn contains(&self, num: PulseNum) -> bool {
        self.pulses.contains_key(&num)
    }

    pub fn len(&self) -> usize {
        self.pulses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pulse> {
        self.pulses.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pulse> {
        self.pulses.values_mut()
    }

    pub fn numbers(&self) -> Vec<PulseNum> {
        self.pulses.keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_and_lookup() {
        let mut reg = PulseRegistry::new();
        reg.create(3).unwrap();
        reg.create(1).unwrap();
        assert_eq!(reg.create(3).unwrap_err(), PulserError::DuplicatePulse(3));
        assert_eq!(reg.create(-2).unwrap_err(), PulserError::InvalidPulseNumber(-2));
        assert_eq!(reg.numbers(), vec![3, 1]);
        assert_eq!(reg.get(7).unwrap_err(), PulserError::UnknownPulse(7));

        let internal = reg.create_internal().unwrap().num;
        assert_eq!(internal, -1);
        assert_eq!(reg.create_internal().unwrap().num, -2);
        assert!(matches!(reg.user_pulse_(-1), Err(PulserError::UnknownPulse(-1))));
    }

    #[test]
    fn properties_are_set_once() {
        let mut p = Pulse::new(0);
        assert!(!p.is_active());
        p.set_position(1e-7).unwrap();
        assert!(matches!(
            p.set_position(2e-7),
            Err(PulserError::AlreadySet { property: "position", .. })
        ));
        p.set_length(0).unwrap();
        assert!(!p.is_active());
        assert!(p.change_length(5));
        assert!(p.is_active());
        assert!(p.set_function(FunctionId::Mw).is_ok());
        assert!(p.set_function(FunctionId::Rf).is_err());
    }

    #[test]
    fn change_short_circuits_on_equal_values() {
        let mut p = Pulse::new(0);
        p.set_position(1e-7).unwrap();
        assert!(!p.change_position(1.0000001e-7, 1e-8));
        assert!(p.change_position(2e-7, 1e-8));
        assert_eq!(p.pos, Some(2e-7));
        assert_eq!(p.initial_pos, Some(1e-7));
    }

    #[test]
    fn shift_increment_reset() {
        let mut p = Pulse::new(4);
        assert!(matches!(p.shift(), Err(PulserError::DeltaNotSet { .. })));
        p.set_position(1e-7).unwrap();
        p.set_length(10).unwrap();
        p.set_position_delta(5e-8).unwrap();
        p.set_length_delta(-4).unwrap();
        p.shift().unwrap();
        p.shift().unwrap();
        p.increment().unwrap();
        p.increment().unwrap();
        assert!((p.pos.unwrap() - 2e-7).abs() < 1e-15);
        assert_eq!(p.len, Some(2));
        assert!(p.increment().is_err());
        p.reset();
        assert_eq!(p.pos, Some(1e-7));
        assert_eq!(p.len, Some(10));
    }
}
