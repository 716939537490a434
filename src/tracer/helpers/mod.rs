pub mod command;
pub mod run_command_with_log_pipe;
pub mod run_with_sudo;
