//! Deterministic event log: recorder, replayer, and the instruction tracer.
//!
//! The recorder emits newline-delimited JSON: a header, one event per
//! dispatched intrinsic, and a final exit or panic event. The replayer
//! consumes the same NDJSON and checks each live intrinsic against the next
//! recorded event; any divergence is a dedicated panic.

use crate::error::{PanicKind, VmError, err};
use crate::heap::{ObjectPayload, StrRepr};
use crate::interp::Vm;
use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::rc::Rc;
use tracing::warn;
use volt_core::LocalId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub overflow: String,
    pub bounds: String,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            overflow: "panic".to_string(),
            bounds: "panic".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Header {
        v: u32,
        policy: Policy,
    },
    Intrinsic {
        name: String,
        args: Vec<Json>,
        ret: Json,
    },
    Exit {
        code: i64,
    },
    Panic {
        code: String,
        msg: String,
        at: String,
        bt: Vec<String>,
    },
}

/// Writes the NDJSON event log. The header goes out on construction.
pub struct Recorder {
    out: Box<dyn Write>,
}

impl Recorder {
    pub fn new(mut out: Box<dyn Write>) -> Self {
        let header = Event::Header {
            v: 1,
            policy: Policy::default(),
        };
        write_event(&mut out, &header);
        Recorder { out }
    }

    pub fn record_intrinsic(&mut self, name: &str, args: &[Json], ret: &Json) {
        write_event(
            &mut self.out,
            &Event::Intrinsic {
                name: name.to_string(),
                args: args.to_vec(),
                ret: ret.clone(),
            },
        );
    }

    pub fn record_exit(&mut self, code: i32) {
        write_event(
            &mut self.out,
            &Event::Exit {
                code: i64::from(code),
            },
        );
    }

    pub fn record_panic(&mut self, code: &str, msg: &str, at: &str, bt: &[String]) {
        write_event(
            &mut self.out,
            &Event::Panic {
                code: code.to_string(),
                msg: msg.to_string(),
                at: at.to_string(),
                bt: bt.to_vec(),
            },
        );
    }
}

fn write_event(out: &mut Box<dyn Write>, event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => {
            if writeln!(out, "{line}").is_err() {
                warn!("event log write failed");
            }
        }
        Err(e) => warn!("event log serialization failed: {e}"),
    }
}

/// Validates live execution against a recorded log.
#[derive(Debug)]
pub struct Replayer {
    events: VecDeque<Event>,
}

impl Replayer {
    /// Parse an NDJSON log, validating the header.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, VmError> {
        let mut events = VecDeque::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                err(
                    PanicKind::InvalidReplayLogFormat,
                    format!("log line {}: {e}", i + 1),
                )
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line).map_err(|e| {
                err(
                    PanicKind::InvalidReplayLogFormat,
                    format!("log line {}: {e}", i + 1),
                )
            })?;
            events.push_back(event);
        }
        match events.pop_front() {
            Some(Event::Header { v: 1, .. }) => Ok(Replayer { events }),
            Some(Event::Header { v, .. }) => Err(err(
                PanicKind::InvalidReplayLogFormat,
                format!("unsupported log version {v}"),
            )),
            _ => Err(err(
                PanicKind::InvalidReplayLogFormat,
                "log does not begin with a header",
            )),
        }
    }

    pub fn expect_intrinsic(
        &mut self,
        name: &str,
        args: &[Json],
        ret: &Json,
    ) -> Result<(), VmError> {
        match self.events.pop_front() {
            Some(Event::Intrinsic {
                name: rec_name,
                args: rec_args,
                ret: rec_ret,
            }) => {
                if rec_name != name || rec_args != args || rec_ret != *ret {
                    return Err(err(
                        PanicKind::ReplayMismatch,
                        format!("recorded `{rec_name}`, executed `{name}`"),
                    ));
                }
                Ok(())
            }
            Some(other) => Err(err(
                PanicKind::ReplayMismatch,
                format!("recorded {other:?}, executed intrinsic `{name}`"),
            )),
            None => Err(err(
                PanicKind::ReplayLogExhausted,
                format!("log exhausted before intrinsic `{name}`"),
            )),
        }
    }

    pub fn expect_exit(&mut self, code: i32) -> Result<(), VmError> {
        match self.events.pop_front() {
            Some(Event::Exit { code: recorded }) if recorded == i64::from(code) => Ok(()),
            Some(other) => Err(err(
                PanicKind::ReplayMismatch,
                format!("recorded {other:?}, executed exit {code}"),
            )),
            None => Err(err(
                PanicKind::ReplayLogExhausted,
                "log exhausted before exit",
            )),
        }
    }
}

/// Observer of per-instruction local writes.
pub trait Tracer {
    fn instruction(&mut self, func: &str, block: u32, ip: usize, writes: &[(LocalId, String)]);
}

/// Collects trace lines in memory; useful in tests and the REPL.
#[derive(Debug, Clone, Default)]
pub struct CollectTracer {
    lines: Rc<RefCell<Vec<String>>>,
}

impl CollectTracer {
    pub fn new() -> Self {
        CollectTracer::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl Tracer for CollectTracer {
    fn instruction(&mut self, func: &str, block: u32, ip: usize, writes: &[(LocalId, String)]) {
        let rendered = writes
            .iter()
            .map(|(local, v)| format!("_{} = {}", local.0, v))
            .collect::<Vec<_>>()
            .join(", ");
        self.lines
            .borrow_mut()
            .push(format!("{func} bb{block}[{ip}]: {rendered}"));
    }
}

/// Shared in-memory sink for the recorder, cloneable before the VM takes
/// ownership of the writer.
#[derive(Debug, Clone, Default)]
pub struct SharedLog(Rc<RefCell<Vec<u8>>>);

impl SharedLog {
    pub fn new() -> Self {
        SharedLog::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Vm {
    /// JSON projection of a value for the event log: scalars directly,
    /// strings as text, arrays recursively, everything else by kind and
    /// handle.
    pub(crate) fn value_to_json(&self, v: &Value) -> Json {
        match v.kind {
            ValueKind::Invalid => Json::Null,
            ValueKind::Int(n) => Json::from(n),
            ValueKind::Bool(b) => Json::from(b),
            ValueKind::Unit => Json::Null,
            ValueKind::Func(f) => Json::from(format!("fn{}", f.0)),
            ValueKind::Ref(_) | ValueKind::RefMut(_) | ValueKind::Ptr(_) => {
                Json::from("&_".to_string())
            }
            ValueKind::Str(h) => match self.heap.lookup(h).map(|o| &o.payload) {
                Some(ObjectPayload::Str(s)) => match &s.repr {
                    StrRepr::Flat(bytes) => {
                        Json::from(String::from_utf8_lossy(bytes).into_owned())
                    }
                    _ => Json::from(format!("str#{}", h.0)),
                },
                _ => Json::from(format!("str#{}", h.0)),
            },
            ValueKind::Array(h) => match self.heap.lookup(h).map(|o| &o.payload) {
                Some(ObjectPayload::Array(elems)) => {
                    Json::Array(elems.iter().map(|e| self.value_to_json(e)).collect())
                }
                _ => Json::from(format!("array#{}", h.0)),
            },
            ValueKind::Map(h) => Json::from(format!("map#{}", h.0)),
            ValueKind::Struct(h) => Json::from(format!("struct#{}", h.0)),
            ValueKind::Tag(h) => match self.heap.lookup(h).map(|o| &o.payload) {
                Some(ObjectPayload::Tag(tag)) => Json::Array(
                    std::iter::once(Json::from(
                        self.types.symbol_name(tag.variant).to_string(),
                    ))
                    .chain(tag.payload.iter().map(|p| self.value_to_json(p)))
                    .collect(),
                ),
                _ => Json::from(format!("tag#{}", h.0)),
            },
            ValueKind::Range(h) => Json::from(format!("range#{}", h.0)),
            ValueKind::BigInt(h) | ValueKind::BigUint(h) | ValueKind::BigFloat(h) => {
                match self.heap.lookup(h).map(|o| &o.payload) {
                    Some(ObjectPayload::BigInt(v)) => Json::from(v.to_string()),
                    Some(ObjectPayload::BigUint(v)) => Json::from(v.to_string()),
                    Some(ObjectPayload::BigFloat(v)) => Json::from(v.format()),
                    _ => Json::from(format!("big#{}", h.0)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_emits_header_first() {
        let log = SharedLog::new();
        let mut rec = Recorder::new(Box::new(log.clone()));
        rec.record_exit(0);
        let lines: Vec<String> = log.contents().lines().map(String::from).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"kind\":\"header\""));
        assert!(lines[0].contains("\"v\":1"));
        assert!(lines[0].contains("\"overflow\":\"panic\""));
        assert!(lines[1].contains("\"kind\":\"exit\""));
    }

    #[test]
    fn test_replayer_round_trip() {
        let log = SharedLog::new();
        let mut rec = Recorder::new(Box::new(log.clone()));
        rec.record_intrinsic("monotonic_now", &[], &Json::from(7));
        rec.record_exit(0);

        let mut rep =
            Replayer::from_reader(std::io::Cursor::new(log.contents().into_bytes())).unwrap();
        rep.expect_intrinsic("monotonic_now", &[], &Json::from(7))
            .unwrap();
        rep.expect_exit(0).unwrap();
    }

    #[test]
    fn test_replayer_detects_mismatch() {
        let log = SharedLog::new();
        let mut rec = Recorder::new(Box::new(log.clone()));
        rec.record_intrinsic("monotonic_now", &[], &Json::from(7));

        let mut rep =
            Replayer::from_reader(std::io::Cursor::new(log.contents().into_bytes())).unwrap();
        let e = rep
            .expect_intrinsic("rt_argv", &[], &Json::from(7))
            .unwrap_err();
        assert_eq!(e.kind, PanicKind::ReplayMismatch);
    }

    #[test]
    fn test_replayer_exhaustion() {
        let log = SharedLog::new();
        let _rec = Recorder::new(Box::new(log.clone()));
        let mut rep =
            Replayer::from_reader(std::io::Cursor::new(log.contents().into_bytes())).unwrap();
        let e = rep
            .expect_intrinsic("monotonic_now", &[], &Json::Null)
            .unwrap_err();
        assert_eq!(e.kind, PanicKind::ReplayLogExhausted);
    }

    #[test]
    fn test_replayer_rejects_garbage() {
        let e = Replayer::from_reader(std::io::Cursor::new(b"not json\n".to_vec())).unwrap_err();
        assert_eq!(e.kind, PanicKind::InvalidReplayLogFormat);
        let e = Replayer::from_reader(std::io::Cursor::new(
            b"{\"kind\":\"exit\",\"code\":0}\n".to_vec(),
        ))
        .unwrap_err();
        assert_eq!(e.kind, PanicKind::InvalidReplayLogFormat);
    }
}
