//! dashmips DAP adapter.
//!
//! Serves the Debug Adapter Protocol over TCP (or stdin/stdout) and forwards
//! debugging to a dashmips backend reached over a WebSocket.

use anyhow::Context;
use clap::Parser;
use dashmips_dap::config::AdapterConfig;
use dashmips_dap::dap::{DapConnection, DapOutput, DapReader, FileTracer};
use dashmips_dap::session::DebugSession;
use log::{info, warn};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on (default: 127.0.0.1:4711)
    #[clap(long, default_value = "127.0.0.1:4711")]
    listen: String,

    /// Serve a single session over stdin/stdout instead of TCP.
    #[clap(long)]
    stdio: bool,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    oneshot: bool,

    /// Adapter config file (default: ~/.config/dashmips-dap/config.toml).
    #[clap(long, env = "DASHMIPS_DAP_CONFIG")]
    config: Option<PathBuf>,

    /// Backend address used by `launch` as host:port, overrides the config file.
    #[clap(long)]
    backend: Option<String>,

    /// Optional log file for adapter diagnostics (no output to stdout).
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long)]
    trace_dap: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dashmips_dap::log::init(args.log_file.as_deref())?;

    let mut config = AdapterConfig::load(args.config.as_deref())?;
    if let Some(backend) = &args.backend {
        config.set_backend(backend)?;
    }

    let tracer = match (&args.log_file, args.trace_dap) {
        (Some(path), true) => Some(FileTracer::new(path)?),
        (None, true) => {
            warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
            None
        }
        _ => None,
    };

    if args.stdio {
        info!(target: "dap", "serving DAP over stdio");
        return serve(DapConnection::stdio(), &config, tracer);
    }

    let addr: SocketAddr = args.listen.parse().context("Invalid listen address")?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    info!(target: "dap", "dashmips-dap listening on {addr}");

    // Server mode: accept clients sequentially. One client == one debug session.
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "dap", "DAP client connected: {peer}");
        if let Some(t) = &tracer {
            t.line(&format!("client connected: {peer}"));
        }

        let conn = match DapConnection::tcp(stream) {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "failed to init DAP I/O: {err:#}");
                continue;
            }
        };

        if let Err(err) = serve(conn, &config, tracer.clone()) {
            warn!(target: "dap", "session ended with error: {err:#}");
            if let Some(t) = &tracer {
                t.line(&format!("session error: {err:#}"));
            }
        } else if let Some(t) = &tracer {
            t.line("session finished OK");
        }

        if args.oneshot {
            break;
        }
    }
    Ok(())
}

fn serve(
    conn: DapConnection,
    config: &AdapterConfig,
    tracer: Option<FileTracer>,
) -> anyhow::Result<()> {
    let output = DapOutput::new(conn.writer, tracer.clone());
    let session = DebugSession::new(output, config.clone());
    session.run(DapReader::new(conn.reader, tracer))
}
