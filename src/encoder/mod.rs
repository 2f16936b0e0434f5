//! Encoder Supervisor
//!
//! Runs the external encoder process that turns the mixed PCM stream into the
//! session's compressed audio file.

mod command;
mod supervisor;

pub use command::{build_args, locate_program};
pub use supervisor::{verify_output, EncoderEvent, EncoderInput, EncoderSupervisor, InputStats};
