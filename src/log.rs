//! Adapter logging setup.
//!
//! Logs never go to stdout, stdout may carry DAP traffic (`--stdio`).

use anyhow::Context;
use env_logger::{Builder, Env, Target};
use std::backtrace::Backtrace;
use std::fs::OpenOptions;
use std::path::Path;

/// Install the global logger and the panic hook.
///
/// Filter comes from `RUST_LOG` (default: `info`). Records go to `log_file`
/// when given, to stderr otherwise.
pub fn init(log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            builder.target(Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(Target::Stderr);
        }
    }
    builder.try_init().context("install logger")?;

    install_panic_hook();
    Ok(())
}

/// Log panics (with a backtrace) before the default hook runs, so a dying
/// adapter leaves a trace even when stderr is not visible.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log::error!(target: "dap", "adapter panic: {info}");
        log::error!(target: "dap", "{}", Backtrace::force_capture());
        log::logger().flush();
        default_hook(info);
    }));
}
