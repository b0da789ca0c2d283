pub mod commands;
pub mod handlers;

pub use commands::{CliArgs, Commands, GenerateArgs, LorasCommand, ServeArgs};
pub use handlers::{exit_code, EXIT_FAILURE, EXIT_USAGE};
