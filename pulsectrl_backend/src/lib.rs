//! Hardware side of the pulser: programs the RB8514 delay cards and RB8515 clock cards with
//! the sequences computed by `pulsecompiler_backend` and runs the trigger chain.

pub mod commit;
pub mod error;
pub mod privilege;
pub mod pulser;
#[cfg(feature = "python")]
pub mod python;
#[cfg(feature = "rulbus")]
pub mod rulbus;
pub mod synthesizer;
pub mod transport;
pub mod utils;

pub use crate::error::*;
pub use crate::pulser::{Pulser, RunState};
pub use crate::synthesizer::*;
pub use crate::transport::*;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn pulsectrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::PyPulser>()?;
    Ok(())
}
