//! Debug session: translates DAP requests from the front end into backend
//! calls and backend lifecycle into DAP responses and events.
//!
//! A session serves exactly one front-end connection. Requests that may
//! block (`launch`, `attach`, `setBreakpoints`) are answered on their own
//! worker thread, so the reader loop keeps routing `runInTerminal` answers
//! and later requests while they wait. Everything else is answered inline.

use crate::breakpoint::{self, Breakpoint, SourceBreakpoint};
use crate::config::{AdapterConfig, AttachArguments, LaunchArguments};
use crate::dap::{ClientResponse, DapOutput, DapReader, DapRequest, Incoming};
use crate::error::RpcError;
use crate::gate::Gate;
use crate::register::{RegisterFormat, format_register};
use crate::rpc::{ConnectOptions, Method, RpcClient};
use crate::terminal::{LaunchOutcome, RunInTerminalArguments};
use crate::weak_error;
use anyhow::{Context, anyhow, bail};
use log::{debug, error, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use strum_macros::Display;

/// The backend runs single-threaded programs, this is their only thread.
pub const THREAD_ID: i64 = 0;
pub const THREAD_NAME: &str = "main";

/// Category of the variable handle minted by `scopes`.
pub const REGISTER_CATEGORY: &str = "register";

#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Launching,
    Attaching,
    Connected,
    Terminated,
}

/// Opaque variable references handed to the front end.
#[derive(Debug)]
pub struct VariableHandles {
    next: i64,
    store: HashMap<i64, &'static str>,
}

impl Default for VariableHandles {
    fn default() -> Self {
        Self {
            next: Self::START,
            store: HashMap::new(),
        }
    }
}

impl VariableHandles {
    const START: i64 = 1000;

    pub fn create(&mut self, category: &'static str) -> i64 {
        let handle = self.next;
        self.next += 1;
        self.store.insert(handle, category);
        handle
    }

    pub fn get(&self, handle: i64) -> Option<&'static str> {
        self.store.get(&handle).copied()
    }
}

/// Process id reported by `runInTerminal`. Only positive ids name a single
/// process, anything else would make `kill` signal a whole group.
fn backend_process_id(body: &Value) -> Option<i32> {
    let raw = body.get("processId")?;
    match raw.as_i64().and_then(|pid| i32::try_from(pid).ok()) {
        Some(pid) if pid > 0 => Some(pid),
        _ => {
            warn!(target: "dap", "unknown backend process id: {raw}");
            None
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DebugSession {
    config: AdapterConfig,
    output: DapOutput,
    rpc: RpcClient,
    state: Mutex<SessionState>,
    register_format: Mutex<RegisterFormat>,
    /// Backend process started through `runInTerminal`, unknown for `attach`.
    backend_process: Mutex<Option<Pid>>,
    variables: Mutex<VariableHandles>,
    /// Opened by `configurationDone`.
    configured: Gate,
    /// Opened once the backend answered `start`.
    connected: Gate,
}

impl DebugSession {
    pub fn new(output: DapOutput, config: AdapterConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            output,
            rpc: RpcClient::new(),
            state: Mutex::new(SessionState::Uninitialized),
            register_format: Mutex::new(RegisterFormat::default()),
            backend_process: Mutex::new(None),
            variables: Mutex::new(VariableHandles::default()),
            configured: Gate::new(),
            connected: Gate::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_configured(&self) -> bool {
        self.configured.is_signaled()
    }

    /// Render a register value in the format chosen at launch.
    pub fn format_register(&self, value: i32) -> String {
        format_register(value, *lock(&self.register_format))
    }

    fn transition(&self, to: SessionState) {
        let mut state = lock(&self.state);
        if *state == SessionState::Terminated {
            return;
        }
        debug!(target: "dap", "session state {} -> {to}", *state);
        *state = to;
    }

    /// Serve requests until `disconnect` or until the front end goes away.
    pub fn run<R: BufRead>(self: &Arc<Self>, mut reader: DapReader<R>) -> anyhow::Result<()> {
        loop {
            let msg = match reader.read_message() {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!(target: "dap", "front end closed the connection");
                    self.teardown(false);
                    return Ok(());
                }
                Err(e) => {
                    self.teardown(false);
                    return Err(e);
                }
            };

            let req = match Incoming::classify(msg) {
                Ok(Incoming::Request(req)) => req,
                Ok(Incoming::Response(rsp)) => {
                    self.output.complete_request(rsp);
                    continue;
                }
                Ok(Incoming::Other(msg)) => {
                    debug!(target: "dap", "ignore message: {msg}");
                    continue;
                }
                Err(e) => {
                    warn!(target: "dap", "malformed DAP message: {e}");
                    continue;
                }
            };
            debug!(target: "dap", "{}: {} {}", req.seq, req.command, req.arguments);

            if matches!(
                req.command.as_str(),
                "launch" | "attach" | "setBreakpoints"
            ) {
                self.answer_in_background(req);
                continue;
            }
            if !self.answer(&req) {
                return Ok(());
            }
        }
    }

    fn answer_in_background(self: &Arc<Self>, req: DapRequest) {
        let session = self.clone();
        let req_for_worker = req.clone();
        let spawned = thread::Builder::new()
            .name(format!("dap-{}", req.command))
            .spawn(move || {
                session.answer(&req_for_worker);
            });
        if weak_error!(spawned, "spawn request worker:").is_none() {
            self.answer(&req);
        }
    }

    /// Answer one request, return `false` once the session must stop reading.
    ///
    /// A handler error becomes the error response of its request, handlers
    /// therefore respond only as their last step.
    fn answer(self: &Arc<Self>, req: &DapRequest) -> bool {
        match self.dispatch(req) {
            Ok(cont) => cont,
            Err(e) => {
                warn!(target: "dap", "{} failed: {e:#}", req.command);
                weak_error!(self.output.send_err(req, format!("{e:#}")), "send error response:");
                true
            }
        }
    }

    fn dispatch(self: &Arc<Self>, req: &DapRequest) -> anyhow::Result<bool> {
        match req.command.as_str() {
            "initialize" => self.handle_initialize(req)?,
            "configurationDone" => self.handle_configuration_done(req)?,
            "launch" => self.handle_launch(req)?,
            "attach" => self.handle_attach(req)?,
            "setBreakpoints" => self.handle_set_breakpoints(req)?,
            "threads" => self.handle_threads(req)?,
            "scopes" => self.handle_scopes(req)?,
            "variables" => self.handle_variables(req)?,
            // stack frames and execution control are not wired to the backend yet
            "stackTrace" | "continue" | "next" | "evaluate" => self.output.send_success(req)?,
            "disconnect" => {
                self.handle_disconnect(req)?;
                return Ok(false);
            }
            unknown => {
                warn!(target: "dap", "unsupported request: {unknown}");
                self.output
                    .send_err(req, format!("unsupported request: {unknown}"))?;
            }
        }
        Ok(true)
    }

    fn handle_initialize(&self, req: &DapRequest) -> anyhow::Result<()> {
        self.transition(SessionState::Initializing);
        let body = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsEvaluateForHovers": true,
            "supportsStepBack": false,
            "supportsValueFormattingOptions": true,
        });
        self.output.send_success_body(req, body)?;
        self.output.send_event("initialized")
    }

    fn handle_configuration_done(&self, req: &DapRequest) -> anyhow::Result<()> {
        self.configured.signal();
        self.output.send_success(req)
    }

    fn handle_launch(self: &Arc<Self>, req: &DapRequest) -> anyhow::Result<()> {
        let args: LaunchArguments = serde_json::from_value(req.arguments.clone())
            .context("launch: invalid arguments")?;
        self.transition(SessionState::Launching);
        *lock(&self.register_format) = args.register_format.unwrap_or_default();

        // a failed terminal launch is already reported, the backend may still be up
        if let LaunchOutcome::Started {
            process_id: Some(pid),
        } = self.request_terminal_launch(&args)
        {
            *lock(&self.backend_process) = Some(Pid::from_raw(pid));
        }

        let (host, port) = (self.config.backend_host.clone(), self.config.backend_port);
        match self.connect_backend(&host, port) {
            Ok(()) => self.output.send_success(req),
            Err(e) => self.fail_connection(req, e),
        }
    }

    fn handle_attach(self: &Arc<Self>, req: &DapRequest) -> anyhow::Result<()> {
        let args: AttachArguments = serde_json::from_value(req.arguments.clone())
            .context("attach: invalid arguments")?;
        self.transition(SessionState::Attaching);

        match self.connect_backend(&args.host, args.port) {
            Ok(()) => self.output.send_success(req),
            Err(e) => self.fail_connection(req, e),
        }
    }

    /// Ask the front end to start the backend in a terminal.
    ///
    /// Never fails: a refused or unanswered request is logged, reported with
    /// a `terminated` event and returned as [`LaunchOutcome::Failed`].
    fn request_terminal_launch(&self, args: &LaunchArguments) -> LaunchOutcome {
        let arguments = RunInTerminalArguments::new(args, &self.config.terminal_title);
        let rsp = match serde_json::to_value(arguments)
            .map_err(anyhow::Error::from)
            .and_then(|arguments| self.output.send_request("runInTerminal", arguments))
        {
            Ok((seq, rx)) => match rx.recv_timeout(self.config.launch_timeout()) {
                Ok(rsp) => rsp,
                Err(_) => {
                    self.output.abandon_request(seq);
                    ClientResponse::timeout(seq, "runInTerminal")
                }
            },
            Err(e) => {
                error!(target: "dap", "cannot request terminal launch: {e:#}");
                ClientResponse::timeout(0, "runInTerminal")
            }
        };

        if !rsp.success {
            error!(
                target: "dap",
                "front end failed to launch the backend: {}",
                rsp.message.as_deref().unwrap_or("no reason given")
            );
            weak_error!(self.output.send_event("terminated"), "send terminated event:");
            return LaunchOutcome::Failed;
        }

        let process_id = backend_process_id(&rsp.body);
        info!(target: "dap", "backend terminal started, process id: {process_id:?}");
        LaunchOutcome::Started { process_id }
    }

    /// Connect the backend, teardown the session if it later goes away.
    ///
    /// A terminated session never connects. A teardown that races the
    /// connect drops the fresh connection.
    fn connect_backend(self: &Arc<Self>, host: &str, port: u16) -> Result<(), RpcError> {
        if self.state() == SessionState::Terminated {
            return Err(RpcError::Closed);
        }
        let opts = ConnectOptions {
            timeout: self.config.connect_timeout(),
            retry_delay: self.config.connect_retry(),
        };
        let start = self.rpc.connect(host, port, opts)?;
        if self.state() == SessionState::Terminated {
            self.rpc.close();
            return Err(RpcError::Closed);
        }
        debug!(target: "dap", "backend started: {start}");

        let session: Weak<Self> = Arc::downgrade(self);
        self.rpc.on_disconnect(Box::new(move || {
            if let Some(session) = session.upgrade() {
                session.teardown(true);
            }
        }));

        self.transition(SessionState::Connected);
        self.connected.signal();
        Ok(())
    }

    fn fail_connection(&self, req: &DapRequest, e: RpcError) -> anyhow::Result<()> {
        error!(target: "dap", "{}: cannot connect to backend: {e:#}", req.command);
        let terminated = self.state() == SessionState::Terminated;
        self.output.send_err(req, format!("cannot connect to backend: {e}"))?;
        if !terminated {
            self.output.send_event("terminated")?;
            self.teardown(false);
        }
        Ok(())
    }

    fn handle_set_breakpoints(&self, req: &DapRequest) -> anyhow::Result<()> {
        self.connected.wait(None);
        if self.state() == SessionState::Terminated {
            bail!("setBreakpoints: session terminated");
        }

        let specs: Vec<SourceBreakpoint> = match req.arguments.get("breakpoints") {
            None | Some(Value::Null) => vec![],
            Some(bps) => serde_json::from_value(bps.clone())
                .context("setBreakpoints: invalid arguments.breakpoints")?,
        };
        if specs.is_empty() {
            return self.output.send_success(req);
        }

        let source_path = req
            .arguments
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("setBreakpoints: missing arguments.source.path"))?;

        let breakpoints = breakpoint::translate(source_path, &specs);
        self.sync_breakpoints(&breakpoints)?;
        self.output
            .send_success_body(req, json!({"breakpoints": breakpoints}))
    }

    /// Hand the breakpoint list to the backend.
    ///
    /// The backend receives breakpoints only as the parameters of `continue`,
    /// so this also resumes execution.
    fn sync_breakpoints(&self, breakpoints: &[Breakpoint]) -> anyhow::Result<()> {
        const BREAKPOINTS_METHOD: Method = Method::Continue;

        let params = breakpoints
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let reply = self
            .rpc
            .call(BREAKPOINTS_METHOD, params)
            .context("setBreakpoints: backend call failed")?;
        debug!(target: "dap", "backend accepted breakpoints: {reply}");
        Ok(())
    }

    fn handle_threads(&self, req: &DapRequest) -> anyhow::Result<()> {
        self.output.send_success_body(
            req,
            json!({"threads": [{"id": THREAD_ID, "name": THREAD_NAME}]}),
        )
    }

    fn handle_scopes(&self, req: &DapRequest) -> anyhow::Result<()> {
        let handle = lock(&self.variables).create(REGISTER_CATEGORY);
        self.output.send_success_body(
            req,
            json!({
                "scopes": [{
                    "name": "Registers",
                    "variablesReference": handle,
                    "expensive": false,
                }],
            }),
        )
    }

    fn handle_variables(&self, req: &DapRequest) -> anyhow::Result<()> {
        let handle = req
            .arguments
            .get("variablesReference")
            .and_then(Value::as_i64);
        let category = handle.and_then(|h| lock(&self.variables).get(h));
        debug!(target: "dap", "variables of {category:?} scope are not provided by the backend");
        self.output.send_success(req)
    }

    fn handle_disconnect(&self, req: &DapRequest) -> anyhow::Result<()> {
        let process = *lock(&self.backend_process);
        match process {
            Some(pid) => {
                info!(target: "dap", "interrupt backend process {pid}");
                weak_error!(kill(pid, Signal::SIGINT), "interrupt backend:");
            }
            None => warn!(target: "dap", "disconnect: no backend process to interrupt"),
        }
        self.teardown(false);
        self.output.send_success(req)
    }

    /// Terminate the session: drop the backend connection and release every
    /// handler blocked on a gate. `notify` emits a `terminated` event.
    ///
    /// Only the first call has an effect.
    fn teardown(&self, notify: bool) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Terminated {
                return;
            }
            *state = SessionState::Terminated;
        }

        self.rpc.close();
        self.configured.signal();
        self.connected.signal();
        if notify {
            weak_error!(self.output.send_event("terminated"), "send terminated event:");
        }
        info!(target: "dap", "session terminated");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn session() -> (Arc<DebugSession>, SharedBuf) {
        let buf = SharedBuf::default();
        let output = DapOutput::new(Box::new(buf.clone()), None);
        (DebugSession::new(output, AdapterConfig::default()), buf)
    }

    fn messages(buf: &SharedBuf) -> Vec<Value> {
        let data = buf.0.lock().unwrap().clone();
        let mut reader = DapReader::new(std::io::Cursor::new(data), None);
        let mut out = vec![];
        while let Some(msg) = reader.read_message().unwrap() {
            out.push(msg);
        }
        out
    }

    fn request(seq: i64, command: &str, arguments: Value) -> DapRequest {
        DapRequest {
            seq,
            command: command.to_string(),
            arguments,
        }
    }

    #[test]
    fn test_variable_handles() {
        let mut handles = VariableHandles::default();
        let a = handles.create(REGISTER_CATEGORY);
        let b = handles.create(REGISTER_CATEGORY);
        assert_eq!(a, 1000);
        assert_eq!(b, 1001);
        assert_eq!(handles.get(a), Some(REGISTER_CATEGORY));
        assert_eq!(handles.get(5), None);
    }

    #[test]
    fn test_initialize_capabilities() {
        let (session, buf) = session();
        assert!(session.answer(&request(1, "initialize", json!({"adapterID": "dashmips"}))));
        assert_eq!(session.state(), SessionState::Initializing);

        let msgs = messages(&buf);
        assert_eq!(msgs.len(), 2);
        let body = &msgs[0]["body"];
        assert_eq!(body["supportsConfigurationDoneRequest"], true);
        assert_eq!(body["supportsEvaluateForHovers"], true);
        assert_eq!(body["supportsStepBack"], false);
        assert_eq!(body["supportsValueFormattingOptions"], true);
        assert_eq!(msgs[1]["event"], "initialized");
    }

    #[test]
    fn test_configuration_done_is_idempotent() {
        let (session, buf) = session();
        session.answer(&request(1, "configurationDone", json!({})));
        session.answer(&request(2, "configurationDone", json!({})));
        assert!(session.is_configured());

        let msgs = messages(&buf);
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m["success"] == true));
    }

    #[test]
    fn test_scopes_allocate_fresh_handles() {
        let (session, buf) = session();
        session.answer(&request(1, "scopes", json!({"frameId": 0})));
        session.answer(&request(2, "scopes", json!({"frameId": 0})));

        let msgs = messages(&buf);
        let first = &msgs[0]["body"]["scopes"];
        let second = &msgs[1]["body"]["scopes"];
        assert_eq!(first.as_array().unwrap().len(), 1);
        assert_eq!(first[0]["name"], "Registers");
        assert_eq!(first[0]["expensive"], false);
        assert_ne!(first[0]["variablesReference"], second[0]["variablesReference"]);
    }

    #[test]
    fn test_stubbed_requests_answer_without_body() {
        let (session, buf) = session();
        let commands = ["stackTrace", "continue", "next", "evaluate", "variables"];
        for (seq, command) in commands.iter().enumerate() {
            session.answer(&request(seq as i64 + 1, command, json!({})));
        }

        let msgs = messages(&buf);
        assert_eq!(msgs.len(), commands.len());
        for (msg, command) in msgs.iter().zip(commands) {
            assert_eq!(msg["command"], command);
            assert_eq!(msg["success"], true);
            assert!(msg.get("body").is_none());
        }
    }

    #[test]
    fn test_unknown_and_malformed_requests_get_error_response() {
        let (session, buf) = session();
        session.answer(&request(1, "stepBack", json!({})));
        session.answer(&request(2, "launch", json!({"console": "integratedTerminal"})));
        session.answer(&request(3, "attach", json!({"host": "localhost"})));

        let msgs = messages(&buf);
        assert_eq!(msgs.len(), 3);
        for (i, msg) in msgs.iter().enumerate() {
            assert_eq!(msg["request_seq"], i as i64 + 1);
            assert_eq!(msg["success"], false);
        }
        assert!(msgs[0]["message"].as_str().unwrap().contains("unsupported"));
        assert!(msgs[1]["message"].as_str().unwrap().contains("launch"));
    }

    #[test]
    fn test_disconnect_without_process_stops_session() {
        let (session, buf) = session();
        assert!(!session.answer(&request(1, "disconnect", json!({}))));
        assert_eq!(session.state(), SessionState::Terminated);

        let msgs = messages(&buf);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["command"], "disconnect");
        assert_eq!(msgs[0]["success"], true);
    }

    #[test]
    fn test_set_breakpoints_after_teardown() {
        let (session, buf) = session();
        session.teardown(false);
        session.answer(&request(1, "setBreakpoints", json!({"breakpoints": []})));

        let msgs = messages(&buf);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["success"], false);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (session, buf) = session();
        session.teardown(true);
        session.teardown(true);
        assert_eq!(session.state(), SessionState::Terminated);

        let msgs = messages(&buf);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["event"], "terminated");
    }

    #[test]
    fn test_backend_process_id() {
        struct TestCase {
            body: Value,
            expected: Option<i32>,
        }
        let cases = [
            TestCase {
                body: json!({"processId": 4242}),
                expected: Some(4242),
            },
            TestCase {
                body: json!({"processId": 0}),
                expected: None,
            },
            TestCase {
                body: json!({"processId": -1}),
                expected: None,
            },
            TestCase {
                body: json!({"processId": 1u64 << 40}),
                expected: None,
            },
            TestCase {
                body: json!({"processId": "12"}),
                expected: None,
            },
            TestCase {
                body: json!({"shellProcessId": 12}),
                expected: None,
            },
        ];

        for tc in cases {
            assert_eq!(backend_process_id(&tc.body), tc.expected, "{}", tc.body);
        }
    }

    #[test]
    fn test_attach_after_teardown_does_not_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        let (session, buf) = session();
        session.teardown(false);
        session.answer(&request(
            1,
            "attach",
            json!({"host": "127.0.0.1", "port": port}),
        ));

        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.rpc.is_connected());
        assert!(matches!(
            listener.accept(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
        ));

        let msgs = messages(&buf);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["command"], "attach");
        assert_eq!(msgs[0]["success"], false);
    }

    #[test]
    fn test_register_format_defaults_to_decimal() {
        let (session, _) = session();
        assert_eq!(session.format_register(42), "0000000042");
        *lock(&session.register_format) = RegisterFormat::Hex;
        assert_eq!(session.format_register(255), "0x000000ff");
    }
}
