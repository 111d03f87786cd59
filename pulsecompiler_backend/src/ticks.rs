//! Conversion between real time and integer ticks of the timebase clock.
//!
//! Every delay a card can produce is an integer multiple of the timebase. User input arrives
//! in seconds and has to land on that grid: values off the grid by more than 1 % of a tick
//! are rejected by [`to_ticks`], while the channel setup code, which works on sums of card
//! latencies that are not themselves tick multiples, rounds with [`ticks_round`] and friends
//! and reports shifts through [`is_shifted`].

use crate::error::*;
use crate::hardware::MAX_TICKS;

pub type Ticks = i64;

/// Tolerated deviation from the tick grid, as a fraction of one tick.
pub const TICK_TOLERANCE: f64 = 1e-2;

/// Times below this are treated as zero even if they do not round to a full tick.
const ZERO_TIME_LIMIT: f64 = 0.99e-9;

/// Converts a time in seconds to ticks of `timebase`.
///
/// Fails with [`PulserError::RangeError`] if the result would not fit into a delay card and
/// with [`PulserError::PrecisionError`] if `seconds` is not (within 1 % of a tick) an integer
/// multiple of the timebase, or a non-negligible time would round to zero ticks.
///
/// ```
/// use pulsecompiler_backend::ticks::*;
///
/// assert_eq!(to_ticks(200e-9, 1e-8).unwrap(), 20);
/// assert!(to_ticks(205e-9, 1e-8).is_err());
/// ```
pub fn to_ticks(seconds: f64, timebase: f64) -> Result<Ticks> {
    let raw = seconds / timebase;
    let ticks = raw.round();

    if ticks.abs() > MAX_TICKS as f64 {
        return Err(PulserError::RangeError {
            value: seconds,
            max: MAX_TICKS as f64 * timebase,
        });
    }
    if (raw - ticks).abs() > TICK_TOLERANCE || (seconds.abs() >= ZERO_TIME_LIMIT && ticks == 0.) {
        return Err(PulserError::PrecisionError {
            value: seconds,
            timebase,
        });
    }
    Ok(ticks as Ticks)
}

pub fn to_seconds(ticks: Ticks, timebase: f64) -> f64 {
    ticks as f64 * timebase
}

/// Nearest tick count for a raw (fractional) tick ratio.
pub fn ticks_round(raw: f64) -> Ticks {
    raw.round() as Ticks
}

/// Largest tick count not later than `raw`, forgiving float noise below the tolerance.
pub fn ticks_floor(raw: f64) -> Ticks {
    (raw + TICK_TOLERANCE).floor() as Ticks
}

/// Smallest tick count not earlier than `raw`, forgiving float noise below the tolerance.
pub fn ticks_ceil(raw: f64) -> Ticks {
    (raw - TICK_TOLERANCE).ceil() as Ticks
}

/// Rounds `ticks` up to the next multiple of `grid` (a grid of 0 or 1 leaves it unchanged).
pub fn ceil_to_grid(ticks: Ticks, grid: Ticks) -> Ticks {
    if grid <= 1 {
        return ticks;
    }
    ticks + (grid - ticks.rem_euclid(grid)) % grid
}

/// True if rounding `raw` to a tick moves it by more than the tolerance.
pub fn is_shifted(raw: f64) -> bool {
    (raw - raw.round()).abs() > TICK_TOLERANCE
}

/// Two times count as equal if they differ by less than the tolerance at `timebase`.
pub fn times_equal(a: f64, b: f64, timebase: f64) -> bool {
    (a - b).abs() < TICK_TOLERANCE * timebase
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_multiples() {
        assert_eq!(to_ticks(0., 1e-8), Ok(0));
        assert_eq!(to_ticks(200e-9, 1e-8), Ok(20));
        assert_eq!(to_ticks(-30e-9, 1e-8), Ok(-3));
        assert_eq!(to_ticks(1e-3, 1e-7), Ok(10_000));
    }

    #[test]
    fn off_grid_is_rejected() {
        assert!(matches!(
            to_ticks(205e-9, 1e-8),
            Err(PulserError::PrecisionError { .. })
        ));
        // 1 ns rounds to zero ticks at 10 ns and is not negligible
        assert!(matches!(
            to_ticks(1e-9, 1e-8),
            Err(PulserError::PrecisionError { .. })
        ));
        // but float noise around zero is
        assert_eq!(to_ticks(1e-15, 1e-8), Ok(0));
    }

    #[test]
    fn within_tolerance_is_accepted() {
        assert_eq!(to_ticks(200.05e-9, 1e-8), Ok(20));
    }

    #[test]
    fn out_of_range() {
        let too_long = (MAX_TICKS + 1) as f64 * 1e-8;
        assert!(matches!(
            to_ticks(too_long, 1e-8),
            Err(PulserError::RangeError { .. })
        ));
        assert!(matches!(
            to_ticks(-too_long, 1e-8),
            Err(PulserError::RangeError { .. })
        ));
        assert_eq!(to_ticks(MAX_TICKS as f64 * 1e-8, 1e-8), Ok(MAX_TICKS));
    }

    #[test]
    fn floor_and_ceil_forgive_float_noise() {
        assert_eq!(ticks_floor(13.999_999_999), 14);
        assert_eq!(ticks_floor(13.5), 13);
        assert_eq!(ticks_ceil(31.000_000_001), 31);
        assert_eq!(ticks_ceil(31.2), 32);
    }

    #[test]
    fn grid_rounding() {
        assert_eq!(ceil_to_grid(31, 10), 40);
        assert_eq!(ceil_to_grid(40, 10), 40);
        assert_eq!(ceil_to_grid(0, 10), 0);
        assert_eq!(ceil_to_grid(31, 1), 31);
    }

    proptest! {
        #[test]
        fn round_trip(ticks in -1_000_000i64..1_000_000, exp in 0usize..4) {
            let timebase = [1e-8, 1e-7, 1e-6, 1e-5][exp];
            let t = to_seconds(ticks, timebase);
            let back = to_ticks(t, timebase).unwrap();
            prop_assert_eq!(back, ticks);
            prop_assert!(times_equal(to_seconds(back, timebase), t, timebase));
        }

        #[test]
        fn small_jitter_round_trip(ticks in 1i64..100_000, jitter in -0.009f64..0.009) {
            let timebase = 1e-8;
            let t = (ticks as f64 + jitter) * timebase;
            prop_assert_eq!(to_ticks(t, timebase).unwrap(), ticks);
        }
    }
}
