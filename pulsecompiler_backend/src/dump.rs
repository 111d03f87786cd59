//! Plain-text and tabular export of the current pulse sequence.
//!
//! The text format is read by external visualization tools:
//!
//! ```text
//! TB: 1e-8
//! ND: 0
//! MW: 1 20 10 +X
//! MW: 2 50 10 -Y
//! DEFENSE: -1 4 40
//! ```
//!
//! After the `TB` (timebase in seconds) and `ND` (negative-delay offset in ticks) header,
//! each active pulse of a used function gets one line with its number, start and length in
//! ticks, and its current phase if it has a phase cycle.

use std::io::{self, Write};

use ndarray::Array2;

use crate::function::FunctionId;
use crate::pulse::Pulse;
use crate::state::PulserState;
use crate::ticks::ticks_round;

fn dumped_pulses(state: &PulserState) -> Vec<(FunctionId, &Pulse)> {
    state
        .used_functions()
        .flat_map(|func| {
            func.pulses
                .iter()
                .filter_map(|num| state.pulses.get(*num).ok())
                .filter(|p| p.is_active())
                .map(move |p| (func.id, p))
        })
        .collect()
}

pub fn dump_pulses<W: Write>(state: &PulserState, out: &mut W) -> io::Result<()> {
    writeln!(out, "TB: {:e}", state.timebase())?;
    writeln!(out, "ND: {}", state.neg_delay)?;
    for (id, pulse) in dumped_pulses(state) {
        write!(
            out,
            "{id}: {} {} {}",
            pulse.num,
            ticks_round(pulse.pos.unwrap_or(0.) / state.timebase()),
            pulse.len.unwrap_or(0)
        )?;
        match state.phase_label(pulse) {
            Some(label) => writeln!(out, " {label}")?,
            None => writeln!(out)?,
        }
    }
    Ok(())
}

/// One row per dumped pulse: function index (in [`FunctionId::ALL`]), pulse number,
/// start tick, length in ticks.
pub fn pulse_table(state: &PulserState) -> Array2<i64> {
    let rows = dumped_pulses(state);
    let mut table = Array2::<i64>::zeros((rows.len(), 4));
    for (mut row, (id, pulse)) in table.rows_mut().into_iter().zip(rows) {
        row[0] = FunctionId::ALL.iter().position(|f| *f == id).unwrap_or_default() as i64;
        row[1] = pulse.num;
        row[2] = ticks_round(pulse.pos.unwrap_or(0.) / state.timebase());
        row[3] = pulse.len.unwrap_or(0);
    }
    table
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::card::PhaseLabel;
    use crate::config::PulserConfig;

    fn state() -> PulserState {
        let mut state = PulserState::new(PulserConfig::new(1e-8).unwrap()).unwrap();
        for (num, pos) in [(2, 500e-9), (1, 200e-9)] {
            let pulse = state.pulses.create(num).unwrap();
            pulse.set_function(FunctionId::Mw).unwrap();
            pulse.set_position(pos).unwrap();
            pulse.set_length(10).unwrap();
            state.function_(FunctionId::Mw).add_pulse(num);
        }
        let cycle = state
            .add_phase_cycle(vec![PhaseLabel::PlusX, PhaseLabel::MinusY])
            .unwrap();
        state.pulses.get_mut(2).unwrap().set_phase_cycle(cycle).unwrap();
        state.compute().unwrap();
        state
    }

    #[test]
    fn text_dump() {
        let mut state = state();
        state.next_phase();
        let mut out = Vec::new();
        dump_pulses(&state, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "TB: 1e-8\nND: 0\nMW: 1 20 10\nMW: 2 50 10 -Y\nDEFENSE: -1 4 70\n"
        );
    }

    #[test]
    fn table() {
        let table = pulse_table(&state());
        assert_eq!(table.shape(), &[3, 4]);
        assert_eq!(table.row(0).to_vec(), vec![0, 1, 20, 10]);
        assert_eq!(table.row(1).to_vec(), vec![0, 2, 50, 10]);
        assert_eq!(table.row(2).to_vec(), vec![4, -1, 4, 70]);
    }
}
