use std::error::Error;
use std::io;

use maplit::hashmap;

use pulsecompiler_backend::*;
use pulsectrl_backend::{Pulser, RecordingSynthesizer, RecordingTransport};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = PulserConfig::new(1e-8)?
        .cfg_internal_trigger(1e-3)?
        .cfg_function_delay(FunctionId::Laser, -50e-9)
        .cfg_intrinsic_delays(hashmap! {
            CardId::MwGap0 => 30e-9,
            CardId::MwLen0 => 30e-9,
        });
    let transport = RecordingTransport::new();
    let probe = transport.probe();
    let synthesizer = RecordingSynthesizer::new();
    let mut pulser =
        Pulser::new(config, Box::new(transport))?.with_synthesizer(Box::new(synthesizer.clone()));

    let cycle = pulser.add_phase_cycle(vec![PhaseLabel::PlusX, PhaseLabel::MinusX])?;
    pulser.create_pulse(1, Some(FunctionId::Mw))?;
    pulser.set_position(1, 300e-9)?;
    pulser.set_length(1, 100e-9)?;
    pulser.set_phase_cycle(1, cycle)?;
    pulser.create_pulse(2, Some(FunctionId::Mw))?;
    pulser.set_position(2, 700e-9)?;
    pulser.set_length(2, 200e-9)?;
    pulser.set_position_delta(2, 100e-9)?;
    pulser.create_pulse(3, Some(FunctionId::Rf))?;
    pulser.set_position(3, 2e-6)?;
    pulser.set_length(3, 500e-9)?;
    pulser.create_pulse(4, Some(FunctionId::Detection))?;
    pulser.set_position(4, 5e-6)?;
    pulser.set_length(4, 10e-9)?;

    pulser.start_experiment()?;
    pulser.update()?;
    pulser.run(true)?;
    for _ in 0..4 {
        pulser.next_phase();
        pulser.shift(&[2])?;
        pulser.update()?;
    }
    pulser.dump_pulses(&mut io::stdout())?;
    println!("{}", pulser.pulse_table());
    pulser.end_experiment()?;

    println!(
        "{} card writes, {} synthesizer calls",
        probe.writes().len(),
        synthesizer.calls().len()
    );
    Ok(())
}
