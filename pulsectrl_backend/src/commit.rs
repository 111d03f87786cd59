//! Executes a commit plan on the cards and the synthesizer.

use log::debug;

use pulsecompiler_backend::{CommitAction, OutputPulse, Polarity, SynthAction};

use crate::error::{CtrlError, Result};
use crate::pulser::Pulser;
use crate::utils::{poll_until_idle, BUSY_POLL_ATTEMPTS, BUSY_POLL_INTERVAL};

impl Pulser {
    /// Issues `plan` and records the new state as committed. During the test run the plan is
    /// only logged.
    pub(crate) fn commit(&mut self, plan: &[CommitAction]) -> Result<()> {
        self.check_plan(plan)?;
        if self.state.in_test_run {
            for action in plan {
                debug!("test run: {action}");
            }
        } else {
            for action in plan {
                debug!("{action}");
                self.execute(action)?;
            }
        }
        self.state.mark_committed();
        Ok(())
    }

    /// Fails if `plan` needs a device the pulser has no access to.
    pub(crate) fn check_plan(&self, plan: &[CommitAction]) -> Result<()> {
        let uses_synth = plan.iter().any(|a| matches!(a, CommitAction::Synth(_)));
        if uses_synth && self.synthesizer.is_none() {
            return Err(CtrlError::MissingSynthesizer);
        }
        Ok(())
    }

    pub(crate) fn execute(&mut self, action: &CommitAction) -> Result<()> {
        match *action {
            CommitAction::SetClock { clock, freq } => {
                self.hw_call(clock, "set_clock_frequency", |t, h| t.set_clock_frequency(h, freq))
            }
            CommitAction::Deactivate { card } => {
                let card = card.name();
                self.hw_call(card, "set_output_pulse", |t, h| {
                    t.set_output_pulse(h, OutputPulse::End, Polarity::Off)
                })?;
                self.hw_call(card, "set_raw_delay", |t, h| t.set_raw_delay(h, 0, false))
            }
            CommitAction::SetDelay { card, ticks } => {
                let card = card.name();
                // a delay must not be rewritten while it is running
                let idle = poll_until_idle(BUSY_POLL_ATTEMPTS, BUSY_POLL_INTERVAL, || {
                    self.hw_call(card, "is_busy", |t, h| t.is_busy(h))
                })?;
                if !idle {
                    debug!("{card} still busy, leaving the wait to the driver");
                }
                self.hw_call(card, "set_raw_delay", |t, h| t.set_raw_delay(h, ticks, true))
            }
            CommitAction::Activate { card, ticks } => {
                let card = card.name();
                self.hw_call(card, "set_raw_delay", |t, h| t.set_raw_delay(h, ticks, false))?;
                self.hw_call(card, "set_output_pulse", |t, h| {
                    t.set_output_pulse(h, OutputPulse::End, Polarity::Positive)
                })
            }
            CommitAction::Route { card, line } => {
                self.hw_call(card.name(), "route_output", |t, h| t.route_output(h, line))
            }
            CommitAction::Synth(ref synth) => match *synth {
                SynthAction::PulseWidth(width) => {
                    self.synth_call("set_pulse_width", |s| s.set_pulse_width(width))
                }
                SynthAction::PulseDelay(delay) => {
                    self.synth_call("set_pulse_delay", |s| s.set_pulse_delay(delay))
                }
                SynthAction::DoubleMode(on) => {
                    self.synth_call("set_double_mode", |s| s.set_double_mode(on))
                }
                SynthAction::Output(on) => self.synth_call("set_output", |s| s.set_output(on)),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use pulsecompiler_backend::*;

    use crate::error::CtrlError;
    use crate::pulser::{Pulser, RunState};
    use crate::synthesizer::{RecordingSynthesizer, SynthCall};
    use crate::transport::{RecordingTransport, TransportCall};

    fn rf_pulser() -> Pulser {
        let transport = Box::new(RecordingTransport::new());
        let mut p = Pulser::new(PulserConfig::new(1e-8).unwrap(), transport).unwrap();
        for (num, pos) in [(1, 100e-9), (2, 400e-9)] {
            p.create_pulse(num, Some(FunctionId::Rf)).unwrap();
            p.set_position(num, pos).unwrap();
            p.set_length(num, 50e-9).unwrap();
        }
        p
    }

    #[test]
    fn rf_pulses_need_a_synthesizer() {
        let mut p = rf_pulser();
        assert_eq!(p.update().unwrap_err(), CtrlError::MissingSynthesizer);
    }

    #[test]
    fn synthesizer_gets_the_double_pulse() {
        let synth = RecordingSynthesizer::new();
        let mut p = rf_pulser().with_synthesizer(Box::new(synth.clone()));
        p.update().unwrap();
        p.start_experiment().unwrap();
        p.update().unwrap();
        let calls = synth.calls();
        assert!(calls.contains(&SynthCall::PulseWidth(5e-8)));
        assert!(calls.contains(&SynthCall::DoubleMode(true)));
        assert_eq!(calls.last(), Some(&SynthCall::Output(true)));
    }

    #[test]
    fn busy_card_is_polled_before_rewriting() {
        let transport = RecordingTransport::new();
        let probe = transport.probe();
        let mut p = Pulser::new(PulserConfig::new(1e-8).unwrap(), Box::new(transport)).unwrap();
        p.create_pulse(1, Some(FunctionId::Laser)).unwrap();
        p.set_position(1, 1e-6).unwrap();
        p.set_length(1, 10e-9).unwrap();
        p.start_experiment().unwrap();
        p.update().unwrap();

        probe.clear();
        probe.set_busy_polls(3);
        p.change_position(1, 2e-6).unwrap();
        p.update().unwrap();
        let calls = probe.calls();
        assert_eq!(
            calls.iter().filter(|c| matches!(c, TransportCall::IsBusy(_))).count(),
            4
        );
        assert_eq!(
            calls.last(),
            Some(&TransportCall::SetDelay {
                card: "LASER_DELAY".to_string(),
                ticks: 196,
                wait_ready: true,
            })
        );
    }

    #[test]
    fn missing_synthesizer_leaves_a_running_chain_alone() {
        let transport = RecordingTransport::new();
        let probe = transport.probe();
        let mut p = Pulser::new(PulserConfig::new(1e-8).unwrap(), Box::new(transport)).unwrap();
        p.create_pulse(1, Some(FunctionId::Mw)).unwrap();
        p.set_position(1, 200e-9).unwrap();
        p.set_length(1, 100e-9).unwrap();
        p.create_pulse(2, Some(FunctionId::Rf)).unwrap();
        p.set_position(2, 1e-6).unwrap();
        p.set_length(2, 0.).unwrap();
        p.start_experiment().unwrap();
        p.update().unwrap();
        p.run(true).unwrap();
        probe.clear();

        p.change_length(2, 50e-9).unwrap();
        assert_eq!(p.update().unwrap_err(), CtrlError::MissingSynthesizer);
        assert!(probe.writes().is_empty());
        assert_eq!(p.run_state(), RunState::Running);
    }
}
