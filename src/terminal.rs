//! Arguments for the `runInTerminal` reverse request that starts the backend.

use crate::config::LaunchArguments;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunInTerminalArguments {
    pub kind: &'static str,
    pub title: String,
    pub args: Vec<String>,
}

impl RunInTerminalArguments {
    pub fn new(launch: &LaunchArguments, title: &str) -> Self {
        Self {
            kind: launch.console.terminal_kind(),
            title: title.to_string(),
            args: backend_command_line(launch),
        }
    }
}

/// `<command words...> <backend args...> <program> [-a <program args...>]`
pub fn backend_command_line(launch: &LaunchArguments) -> Vec<String> {
    let mut argv: Vec<String> = launch
        .dashmips_command
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect();
    argv.extend(launch.dashmips_args.iter().cloned());
    argv.push(launch.program.to_string_lossy().into_owned());
    if !launch.args.is_empty() {
        argv.push("-a".to_string());
        argv.extend(launch.args.iter().cloned());
    }
    argv
}

/// What the front end reported about the terminal launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Terminal started; the backend process id, if the front end knows it.
    Started { process_id: Option<i32> },
    /// Terminal failed to start or the front end did not answer in time.
    Failed,
}
