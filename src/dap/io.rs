use crate::dap::protocol::{
    ClientResponse, DapEvent, DapRequest, DapResponse, DapReverseRequest,
};
use crate::dap::tracer::FileTracer;
use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::{Mutex, PoisonError, mpsc};

/// Raw byte streams of one front-end connection.
pub struct DapConnection {
    pub reader: Box<dyn BufRead + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl DapConnection {
    pub fn tcp(stream: TcpStream) -> anyhow::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(stream),
        })
    }

    pub fn stdio() -> Self {
        Self {
            reader: Box::new(BufReader::new(std::io::stdin())),
            writer: Box::new(std::io::stdout()),
        }
    }
}

/// Inbound half: `Content-Length` framed JSON messages.
pub struct DapReader<R> {
    reader: R,
    tracer: Option<FileTracer>,
}

impl<R: BufRead> DapReader<R> {
    pub fn new(reader: R, tracer: Option<FileTracer>) -> Self {
        Self { reader, tracer }
    }

    /// Read next message, `None` when the front end closed the stream
    /// between two messages.
    pub fn read_message(&mut self) -> anyhow::Result<Option<Value>> {
        let mut content_length: Option<usize> = None;
        let mut header_seen = false;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line)?;
            if read_n == 0 {
                if header_seen {
                    return Err(anyhow!("DAP connection closed inside a message header"));
                }
                return Ok(None);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if content_length.is_some() {
                    break;
                }
                continue;
            }
            header_seen = true;
            if let Some(v) = line.strip_prefix("Content-Length:") {
                content_length = Some(v.trim().parse()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        let msg: Value = serde_json::from_slice(&buf)?;
        if let Some(tracer) = &self.tracer {
            tracer.inbound(&msg);
        }
        Ok(Some(msg))
    }
}

struct Sink {
    out: Box<dyn Write + Send>,
    seq: i64,
}

/// Outbound half, shared by every handler of a session.
///
/// Owns the outbound `seq` counter, so sequence numbers follow write order,
/// and the table of reverse requests waiting for a front-end answer.
pub struct DapOutput {
    sink: Mutex<Sink>,
    tracer: Option<FileTracer>,
    pending: Mutex<HashMap<i64, mpsc::Sender<ClientResponse>>>,
}

impl DapOutput {
    pub fn new(out: Box<dyn Write + Send>, tracer: Option<FileTracer>) -> Self {
        Self {
            sink: Mutex::new(Sink { out, seq: 1 }),
            tracer,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Write a message built from the next outbound `seq`, return that `seq`.
    fn emit<T: Serialize>(&self, build: impl FnOnce(i64) -> T) -> anyhow::Result<i64> {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = sink.seq;
        sink.seq += 1;

        let msg = build(seq);
        let payload = serde_json::to_vec(&msg)?;
        if let Some(tracer) = &self.tracer {
            tracer.outbound(&msg);
        }
        write!(sink.out, "Content-Length: {}\r\n\r\n", payload.len())?;
        sink.out.write_all(&payload)?;
        sink.out.flush()?;
        Ok(seq)
    }

    pub fn send_success(&self, req: &DapRequest) -> anyhow::Result<()> {
        self.send_response_raw(req, true, None, None)
    }

    pub fn send_success_body<T: Serialize>(&self, req: &DapRequest, body: T) -> anyhow::Result<()> {
        let body = serde_json::to_value(body)?;
        self.send_response_raw(req, true, None, Some(body))
    }

    pub fn send_err(&self, req: &DapRequest, message: impl ToString) -> anyhow::Result<()> {
        self.send_response_raw(req, false, Some(message.to_string()), None)
    }

    fn send_response_raw(
        &self,
        req: &DapRequest,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) -> anyhow::Result<()> {
        self.emit(|seq| DapResponse {
            seq,
            r#type: "response",
            request_seq: req.seq,
            success,
            command: &req.command,
            message,
            body,
        })?;
        Ok(())
    }

    pub fn send_event(&self, name: &'static str) -> anyhow::Result<()> {
        self.emit(|seq| DapEvent {
            seq,
            r#type: "event",
            event: name,
            body: None,
        })?;
        Ok(())
    }

    /// Send a reverse request, the answer arrives through the returned channel
    /// once the reader loop hands it to [`DapOutput::complete_request`].
    pub fn send_request(
        &self,
        command: &'static str,
        arguments: Value,
    ) -> anyhow::Result<(i64, mpsc::Receiver<ClientResponse>)> {
        let (tx, rx) = mpsc::channel();
        // register before writing, the answer may race the return of `emit`
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = self.emit(|seq| DapReverseRequest {
            seq,
            r#type: "request",
            command,
            arguments,
        })?;
        pending.insert(seq, tx);
        Ok((seq, rx))
    }

    /// Route a front-end response to the reverse request it answers.
    pub fn complete_request(&self, rsp: ClientResponse) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&rsp.request_seq);
        match waiter {
            Some(tx) => {
                // the requester may have already given up on a timeout
                let _ = tx.send(rsp);
            }
            None => {
                log::warn!(target: "dap", "response to unknown request {}", rsp.request_seq);
            }
        }
    }

    /// Forget a reverse request whose answer is no longer awaited.
    pub fn abandon_request(&self, seq: i64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&seq);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::Arc;

    fn frame(msg: &Value) -> Vec<u8> {
        let payload = serde_json::to_vec(msg).unwrap();
        let mut out = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
        out.extend(payload);
        out
    }

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

    fn written(buf: &SharedBuf) -> Vec<Value> {
        let data = buf.0.lock().unwrap().clone();
        let mut reader = DapReader::new(Cursor::new(data), None);
        let mut out = vec![];
        while let Some(msg) = reader.read_message().unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_read_messages() {
        let first = json!({"seq": 1, "type": "request", "command": "initialize"});
        let second = json!({"seq": 2, "type": "request", "command": "threads"});
        let mut data = frame(&first);
        data.extend(frame(&second));

        let mut reader = DapReader::new(Cursor::new(data), None);
        assert_eq!(reader.read_message().unwrap(), Some(first));
        assert_eq!(reader.read_message().unwrap(), Some(second));
        assert_eq!(reader.read_message().unwrap(), None);
    }

    #[test]
    fn test_read_truncated_message() {
        let mut reader = DapReader::new(Cursor::new(b"Content-Length: 10\r\n".to_vec()), None);
        assert!(reader.read_message().is_err());

        let mut reader = DapReader::new(Cursor::new(b"Content-Length: 10\r\n\r\n{}".to_vec()), None);
        assert!(reader.read_message().is_err());
    }

    #[test]
    fn test_output_sequence_numbers() {
        let buf = SharedBuf::default();
        let output = DapOutput::new(Box::new(buf.clone()), None);
        let req = DapRequest {
            seq: 7,
            command: "threads".to_string(),
            arguments: Value::Null,
        };

        output.send_success(&req).unwrap();
        output.send_event("initialized").unwrap();
        output.send_err(&req, "boom").unwrap();

        let msgs = written(&buf);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0]["seq"], 1);
        assert_eq!(msgs[0]["request_seq"], 7);
        assert_eq!(msgs[0]["success"], true);
        assert_eq!(msgs[1]["seq"], 2);
        assert_eq!(msgs[1]["event"], "initialized");
        assert_eq!(msgs[2]["seq"], 3);
        assert_eq!(msgs[2]["success"], false);
        assert_eq!(msgs[2]["message"], "boom");
    }

    #[test]
    fn test_reverse_request_routing() {
        let buf = SharedBuf::default();
        let output = DapOutput::new(Box::new(buf.clone()), None);

        let (seq, rx) = output
            .send_request("runInTerminal", json!({"args": ["x"]}))
            .unwrap();
        output.complete_request(ClientResponse {
            request_seq: seq + 100,
            success: true,
            command: "runInTerminal".to_string(),
            message: None,
            body: Value::Null,
        });
        assert!(rx.try_recv().is_err());

        output.complete_request(ClientResponse {
            request_seq: seq,
            success: true,
            command: "runInTerminal".to_string(),
            message: None,
            body: json!({"processId": 11}),
        });
        assert_eq!(rx.try_recv().unwrap().body["processId"], 11);

        let msgs = written(&buf);
        assert_eq!(msgs[0]["type"], "request");
        assert_eq!(msgs[0]["command"], "runInTerminal");
        assert_eq!(msgs[0]["seq"], seq);
    }
}
