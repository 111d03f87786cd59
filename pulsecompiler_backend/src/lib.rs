//! Pulse-sequence compiler for pulsers built from cascaded RB8514 delay cards and RB8515
//! clock cards.
//!
//! Pulses are described by function (microwave, RF, laser, detection, defense), position,
//! length and optional deltas and phase cycles. [`PulserState::compute`] turns them into the
//! integer delay of every card in the fixed card chain, and [`commit_plan`] lists the
//! hardware writes needed to get there from what is currently programmed. This crate never
//! talks to hardware; the controller crate executes the plan.

pub mod card;
pub mod commit;
pub mod config;
pub mod dump;
pub mod error;
pub mod function;
pub mod hardware;
pub mod pulse;
pub mod pulser;
mod setup;
pub mod state;
pub mod ticks;

pub use card::*;
pub use commit::*;
pub use config::*;
pub use dump::*;
pub use error::*;
pub use function::*;
pub use hardware::*;
pub use pulse::*;
pub use pulser::*;
pub use state::*;
pub use ticks::*;
