use std::error::Error;

use pulsecompiler_backend::*;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let config = PulserConfig::new(1e-8)?.cfg_internal_trigger(1e-3)?;
    let mut pulser = Pulser::new(config)?;
    let cycle = pulser.add_phase_cycle(vec![PhaseLabel::PlusX, PhaseLabel::MinusX])?;

    pulser.create_pulse(1, Some(FunctionId::Mw))?;
    pulser.set_position(1, 200e-9)?;
    pulser.set_length(1, 100e-9)?;
    pulser.set_phase_cycle(1, cycle)?;

    pulser.create_pulse(2, Some(FunctionId::Mw))?;
    pulser.set_position(2, 500e-9)?;
    pulser.set_length(2, 100e-9)?;
    pulser.set_position_delta(2, 100e-9)?;

    pulser.create_pulse(3, Some(FunctionId::Detection))?;
    pulser.set_position(3, 1e-6)?;
    pulser.set_length(3, 10e-9)?;

    pulser.update()?;
    for _ in 0..3 {
        pulser.shift(&[])?;
        pulser.next_phase();
        pulser.update()?;
    }
    pulser.dump_pulses(&mut std::io::stdout())?;
    println!("{:?}", pulser.pulse_table());
    pulser.end_test_run();
    Ok(())
}
