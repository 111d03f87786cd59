//! Python bindings of [`Pulser`].
//!
//! `PyPulser` exposes the pulse operations with function and phase names as strings. Errors are
//! raised as `ValueError` for sequence problems and `RuntimeError` for hardware failures.

use numpy::{IntoPyArray, PyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use pulsecompiler_backend::*;

use crate::error::CtrlError;
use crate::pulser::Pulser;
use crate::transport::CardTransport;

impl From<CtrlError> for PyErr {
    fn from(err: CtrlError) -> PyErr {
        match err {
            CtrlError::Pulser(_) => PyValueError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

fn py_err(err: PulserError) -> PyErr {
    CtrlError::from(err).into()
}

#[cfg(feature = "rulbus")]
fn default_transport() -> PyResult<Box<dyn CardTransport>> {
    let transport = crate::rulbus::RulbusTransport::new()
        .map_err(|err| PyRuntimeError::new_err(err.to_string()))?;
    Ok(Box::new(transport))
}

#[cfg(not(feature = "rulbus"))]
fn default_transport() -> PyResult<Box<dyn CardTransport>> {
    Ok(Box::new(crate::transport::RecordingTransport::new()))
}

#[pyclass(name = "Pulser", unsendable)]
pub struct PyPulser {
    inner: Pulser,
}

#[pymethods]
impl PyPulser {
    /// Pulser with the given timebase. `rep_time` selects internal triggering, otherwise the
    /// pulser waits for an external trigger on the `trigger_slope` edge ("POSITIVE" or
    /// "NEGATIVE").
    #[new]
    #[pyo3(signature = (
        timebase,
        rep_time = None,
        trigger_slope = "POSITIVE",
        manual_defense = false
    ))]
    pub fn new(
        timebase: f64,
        rep_time: Option<f64>,
        trigger_slope: &str,
        manual_defense: bool,
    ) -> PyResult<Self> {
        let mut config = PulserConfig::new(timebase).map_err(py_err)?;
        config = match rep_time {
            Some(rep_time) => config.cfg_internal_trigger(rep_time).map_err(py_err)?,
            None => config.cfg_external_trigger(parse_slope(trigger_slope)?),
        };
        if manual_defense {
            config = config.cfg_defense_mode(DefenseMode::Manual);
        }
        Ok(Self {
            inner: Pulser::new(config, default_transport()?)?,
        })
    }

    pub fn set_function_delay(&mut self, function: &str, delay: f64) -> PyResult<()> {
        let function: FunctionId = function.parse().map_err(py_err)?;
        let state = self.inner.state_();
        state.config.function_delays.insert(function, delay);
        let func = state.function_(function);
        func.delay = delay;
        func.declare();
        Ok(())
    }

    #[pyo3(signature = (num, function=None))]
    pub fn create_pulse(&mut self, num: PulseNum, function: Option<&str>) -> PyResult<()> {
        let function = function.map(str::parse::<FunctionId>).transpose().map_err(py_err)?;
        self.inner.create_pulse(num, function).map_err(py_err)
    }

    pub fn set_function(&mut self, num: PulseNum, function: &str) -> PyResult<()> {
        let function = function.parse().map_err(py_err)?;
        self.inner.set_function(num, function).map_err(py_err)
    }

    pub fn set_position(&mut self, num: PulseNum, pos: f64) -> PyResult<()> {
        self.inner.set_position(num, pos).map_err(py_err)
    }

    pub fn set_length(&mut self, num: PulseNum, len: f64) -> PyResult<()> {
        self.inner.set_length(num, len).map_err(py_err)
    }

    pub fn set_position_delta(&mut self, num: PulseNum, dpos: f64) -> PyResult<()> {
        self.inner.set_position_delta(num, dpos).map_err(py_err)
    }

    pub fn set_length_delta(&mut self, num: PulseNum, dlen: f64) -> PyResult<()> {
        self.inner.set_length_delta(num, dlen).map_err(py_err)
    }

    pub fn set_phase_cycle(&mut self, num: PulseNum, cycle: usize) -> PyResult<()> {
        self.inner.set_phase_cycle(num, cycle).map_err(py_err)
    }

    pub fn get_function(&self, num: PulseNum) -> PyResult<Option<&'static str>> {
        let function = self.inner.get_function(num).map_err(py_err)?;
        Ok(function.map(|f| f.name()))
    }

    pub fn get_position(&self, num: PulseNum) -> PyResult<Option<f64>> {
        self.inner.get_position(num).map_err(py_err)
    }

    pub fn get_length(&self, num: PulseNum) -> PyResult<Option<f64>> {
        self.inner.get_length(num).map_err(py_err)
    }

    pub fn change_position(&mut self, num: PulseNum, pos: f64) -> PyResult<bool> {
        self.inner.change_position(num, pos).map_err(py_err)
    }

    pub fn change_length(&mut self, num: PulseNum, len: f64) -> PyResult<bool> {
        self.inner.change_length(num, len).map_err(py_err)
    }

    #[pyo3(signature = (nums=Vec::new()))]
    pub fn shift(&mut self, nums: Vec<PulseNum>) -> PyResult<()> {
        self.inner.shift(&nums).map_err(py_err)
    }

    #[pyo3(signature = (nums=Vec::new()))]
    pub fn increment(&mut self, nums: Vec<PulseNum>) -> PyResult<()> {
        self.inner.increment(&nums).map_err(py_err)
    }

    #[pyo3(signature = (nums=Vec::new()))]
    pub fn reset(&mut self, nums: Vec<PulseNum>) -> PyResult<()> {
        self.inner.reset(&nums).map_err(py_err)
    }

    /// Adds a phase cycle like `["+X", "-X"]` and returns its index.
    pub fn add_phase_cycle(&mut self, labels: Vec<String>) -> PyResult<usize> {
        let labels = labels
            .iter()
            .map(|l| l.parse::<PhaseLabel>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(py_err)?;
        self.inner.add_phase_cycle(labels).map_err(py_err)
    }

    pub fn next_phase(&mut self) {
        self.inner.next_phase();
    }

    pub fn phase_reset(&mut self) {
        self.inner.phase_reset();
    }

    /// Computes the sequence and programs the changed cards; returns the issued operations.
    pub fn update(&mut self) -> PyResult<Vec<String>> {
        let plan = self.inner.update()?;
        Ok(plan.iter().map(|action| action.to_string()).collect())
    }

    pub fn run(&mut self, on: bool) -> PyResult<()> {
        Ok(self.inner.run(on)?)
    }

    /// One of "Stopped", "ArmedInternal", "ArmedExternal", "Running".
    pub fn run_state(&self) -> String {
        format!("{:?}", self.inner.run_state())
    }

    pub fn start_experiment(&mut self) -> PyResult<()> {
        Ok(self.inner.start_experiment()?)
    }

    pub fn end_experiment(&mut self) -> PyResult<()> {
        Ok(self.inner.end_experiment()?)
    }

    pub fn dump_pulses(&self) -> PyResult<String> {
        let mut out = Vec::new();
        self.inner
            .dump_pulses(&mut out)
            .map_err(|err| PyRuntimeError::new_err(err.to_string()))?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Active pulses as rows of (function index, pulse number, start tick, length in ticks).
    pub fn pulse_table<'py>(&self, py: Python<'py>) -> &'py PyArray2<i64> {
        self.inner.pulse_table().into_pyarray(py)
    }
}

fn parse_slope(slope: &str) -> PyResult<Slope> {
    match slope.to_ascii_uppercase().as_str() {
        "POSITIVE" | "RISING" => Ok(Slope::Positive),
        "NEGATIVE" | "FALLING" => Ok(Slope::Negative),
        _ => Err(PyValueError::new_err(format!("invalid trigger slope '{slope}'"))),
    }
}
