//! # Running a pulse sequence on the card chain
//!
//! [`Pulser`] extends the compiler's pulse model with hardware access: it owns a
//! [`CardTransport`] for the delay and clock cards, an optional [`RfSynthesizer`] and the run
//! state of the trigger chain. All pulse operations come from [`BasePulser`]; this module adds
//! the experiment lifecycle around them.
//!
//! ## Lifecycle
//!
//! 1. **Test run.** A new pulser starts in a test run. [`Pulser::update`] computes and checks
//!    every sequence but only logs the hardware writes it would issue, and [`Pulser::run`] only
//!    tracks the run state.
//! 2. **Experiment.** [`Pulser::start_experiment`] closes the test run (restoring every pulse
//!    to its initial settings), opens all cards and silences them. From now on `update` writes
//!    the changed cards and `run` drives the trigger chain.
//! 3. **End.** [`Pulser::end_experiment`] stops the chain, switches all outputs off and closes
//!    the cards.
//!
//! ## Run states
//!
//! ```text
//! Stopped ──arm()──► ArmedInternal / ArmedExternal ──start()──► Running
//!    ▲                                                              │
//!    └──────────────────────────stop()──────────────────────────────┘
//! ```
//!
//! `update` on a running chain stops it, writes the changed cards and starts it again, so no
//! sequence is ever emitted from half-programmed cards.
//!
//! ## Failures
//!
//! Every hardware call runs with raised privileges through [`Pulser::hw_call`]. A failing call
//! is logged once, the chain is stopped on a best-effort basis and the failure is returned as
//! [`CtrlError::HardwareFailure`]. Failures during that stop are returned to it without
//! triggering another stop.

use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, error, info, warn};

use pulsecompiler_backend::*;

use crate::error::{CtrlError, Result, TransportError};
use crate::privilege::Privileges;
use crate::synthesizer::RfSynthesizer;
use crate::transport::{CardHandle, CardTransport, TransportResult};
use crate::utils::{poll_until_idle, BUSY_POLL_ATTEMPTS, BUSY_POLL_INTERVAL};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    ArmedInternal,
    ArmedExternal,
    Running,
}

pub struct Pulser {
    pub(crate) state: PulserState,
    transport: Box<dyn CardTransport>,
    pub(crate) synthesizer: Option<Box<dyn RfSynthesizer>>,
    privileges: Privileges,
    /// Open card handles by card name, clock cards included.
    handles: IndexMap<&'static str, CardHandle>,
    run_state: RunState,
    in_failure: bool,
}

impl_pulser_boilerplate!(Pulser);

impl Pulser {
    pub fn new(config: PulserConfig, transport: Box<dyn CardTransport>) -> Result<Self> {
        Ok(Self {
            state: PulserState::new(config)?,
            transport,
            synthesizer: None,
            privileges: Privileges::acquire()?,
            handles: IndexMap::new(),
            run_state: RunState::Stopped,
            in_failure: false,
        })
    }

    /// Binds the synthesizer generating the RF pulses.
    pub fn with_synthesizer(mut self, synthesizer: Box<dyn RfSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn in_test_run(&self) -> bool {
        self.state.in_test_run
    }

    /// Computes the sequence and writes every card whose state changed, returning the
    /// operations issued (or, in the test run, the ones that would have been).
    pub fn update(&mut self) -> Result<Vec<CommitAction>> {
        self.state.compute()?;
        let plan = commit_plan(&self.state);
        if plan.is_empty() {
            return Ok(plan);
        }

        self.check_plan(&plan)?;
        let was_running = self.run_state == RunState::Running;
        if was_running {
            self.stop()?;
        }
        self.commit(&plan)?;
        if was_running {
            self.start()?;
        }
        Ok(plan)
    }

    pub fn run(&mut self, on: bool) -> Result<()> {
        if on {
            self.start()
        } else {
            self.stop()
        }
    }

    /// Prepares the root card for the configured trigger mode.
    pub fn arm(&mut self) -> Result<()> {
        if self.run_state != RunState::Stopped {
            return Ok(());
        }
        let armed = match self.state.config.trigger_mode {
            TriggerMode::External(slope) => {
                if !self.state.in_test_run {
                    self.hw_call(CardId::Ert.name(), "set_trigger_slope", |t, h| {
                        t.set_trigger_slope(h, slope)
                    })?;
                }
                RunState::ArmedExternal
            }
            TriggerMode::Internal => {
                let freq = self.state.config.ert_clock_freq();
                let clock = &self.state.cards.ert_clock;
                if let Some(freq) = freq.filter(|f| clock.freq != Some(*f)) {
                    if !self.state.in_test_run {
                        self.hw_call(ERT_CLOCK, "set_clock_frequency", |t, h| {
                            t.set_clock_frequency(h, freq)
                        })?;
                    }
                    self.state.cards.ert_clock.freq = Some(freq);
                }
                RunState::ArmedInternal
            }
        };
        self.set_run_state(armed);
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.run_state == RunState::Running {
            return Ok(());
        }
        if self.run_state == RunState::Stopped {
            self.arm()?;
        }
        if !self.state.in_test_run {
            let ert = CardId::Ert.name();
            if self.run_state == RunState::ArmedInternal {
                let ticks = self.state.config.rep_ticks().unwrap_or(0);
                self.hw_call(ert, "set_raw_delay", |t, h| t.set_raw_delay(h, ticks, false))?;
                self.hw_call(ert, "set_output_pulse", |t, h| {
                    t.set_output_pulse(h, OutputPulse::End, Polarity::Positive)
                })?;
                self.hw_call(ert, "software_start", |t, h| t.software_start(h))?;
            } else {
                self.hw_call(ert, "set_output_pulse", |t, h| {
                    t.set_output_pulse(h, OutputPulse::End, Polarity::Positive)
                })?;
            }
        }
        self.set_run_state(RunState::Running);
        Ok(())
    }

    /// Disables the root card, then waits for the sequence in flight to finish.
    pub fn stop(&mut self) -> Result<()> {
        if self.run_state == RunState::Stopped {
            return Ok(());
        }
        if !self.state.in_test_run {
            self.hw_call(CardId::Ert.name(), "set_output_pulse", |t, h| {
                t.set_output_pulse(h, OutputPulse::End, Polarity::Off)
            })?;
            thread::sleep(self.quiescence_time());
            self.wait_until_idle()?;
        }
        self.set_run_state(RunState::Stopped);
        Ok(())
    }

    /// Time the sequence last written to the cards needs to run out.
    pub(crate) fn quiescence_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.state.committed_seq_len).unwrap_or_default()
    }

    fn wait_until_idle(&mut self) -> Result<()> {
        let active: Vec<&'static str> = self
            .state
            .cards
            .iter()
            .filter(|c| c.was_active && c.id != CardId::Ert)
            .map(|c| c.name())
            .collect();
        for card in active {
            let idle = poll_until_idle(BUSY_POLL_ATTEMPTS, BUSY_POLL_INTERVAL, || {
                self.hw_call(card, "is_busy", |t, h| t.is_busy(h))
            })?;
            if !idle {
                warn!("{card} still busy after stopping the pulser");
            }
        }
        Ok(())
    }

    fn set_run_state(&mut self, run_state: RunState) {
        if self.run_state != run_state {
            info!("Pulser {:?} -> {:?}", self.run_state, run_state);
            self.run_state = run_state;
        }
    }

    /// Closes the test run, then opens every card and switches all of them off.
    pub fn start_experiment(&mut self) -> Result<()> {
        if self.state.in_test_run {
            self.state.end_test_run();
        }
        self.set_run_state(RunState::Stopped);

        for card in CardId::all() {
            self.open_card(card.name())?;
        }
        self.open_card(TB_CLOCK)?;
        self.open_card(ERT_CLOCK)?;

        for card in CardId::all().map(|c| c.name()) {
            self.hw_call(card, "set_output_pulse", |t, h| {
                t.set_output_pulse(h, OutputPulse::End, Polarity::Off)
            })?;
            self.hw_call(card, "set_raw_delay", |t, h| t.set_raw_delay(h, 0, false))?;
        }

        if self.synthesizer.is_some() {
            let slope = self.state.config.synth_trigger_slope;
            self.synth_call("set_trigger_slope", |s| s.set_trigger_slope(slope))?;
        }
        info!("Pulser hardware initialized, {} cards open", self.handles.len());
        Ok(())
    }

    /// Stops the chain, switches every card and the synthesizer output off and closes the cards.
    pub fn end_experiment(&mut self) -> Result<()> {
        if self.state.in_test_run {
            return Ok(());
        }
        self.stop()?;

        let active: Vec<CardId> = self
            .state
            .cards
            .iter()
            .filter(|c| c.was_active)
            .map(|c| c.id)
            .collect();
        for card in active {
            self.execute(&CommitAction::Deactivate { card })?;
            self.state.cards[card].clear();
            self.state.cards[card].mark_committed();
        }
        if self.state.synth.output {
            self.execute(&CommitAction::Synth(SynthAction::Output(false)))?;
            self.state.synth.output = false;
        }

        let handles: Vec<&'static str> = self.handles.keys().copied().collect();
        for card in handles {
            self.hw_call(card, "close", |t, h| t.close(h))?;
        }
        self.handles.clear();
        info!("Pulser hardware released");
        Ok(())
    }

    fn open_card(&mut self, name: &'static str) -> Result<()> {
        if self.handles.contains_key(name) {
            return Ok(());
        }
        let opened = {
            let _guard = self.privileges.raise()?;
            self.transport.open(name)
        };
        let handle = opened.map_err(|err| self.fail(name, "open", err))?;
        debug!("Opened {name} as handle {handle}");
        self.handles.insert(name, handle);
        Ok(())
    }

    /// Runs a transport call on card `card` with raised privileges.
    pub(crate) fn hw_call<F, R>(&mut self, card: &'static str, op: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn CardTransport, CardHandle) -> TransportResult<R>,
    {
        let handle = match self.handles.get(card) {
            Some(handle) => *handle,
            None => {
                let err = TransportError::new(-1, "card is not open");
                return Err(self.fail(card, op, err));
            }
        };
        let result = {
            let _guard = self.privileges.raise()?;
            f(self.transport.as_mut(), handle)
        };
        result.map_err(|err| self.fail(card, op, err))
    }

    pub(crate) fn synth_call<F>(&mut self, op: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn RfSynthesizer) -> TransportResult<()>,
    {
        let synthesizer = self.synthesizer.as_deref_mut().ok_or(CtrlError::MissingSynthesizer)?;
        let result = f(synthesizer);
        result.map_err(|err| self.fail("synthesizer", op, err))
    }

    /// Failure path of every hardware call: logs the failure, stops the chain unless this
    /// failure happened while already handling one, and returns the error to report.
    fn fail(&mut self, card: &str, op: &'static str, err: TransportError) -> CtrlError {
        let failure = CtrlError::HardwareFailure {
            card: card.to_string(),
            op,
            msg: err.to_string(),
        };
        if self.in_failure {
            return failure;
        }

        self.in_failure = true;
        error!("Pulser hardware failure: {failure}");
        if let Err(stop_err) = self.stop() {
            debug!("Stopping after the failure failed as well: {stop_err}");
        }
        self.set_run_state(RunState::Stopped);
        self.in_failure = false;
        failure
    }

    #[cfg(test)]
    pub(crate) fn in_failure(&self) -> bool {
        self.in_failure
    }
}
