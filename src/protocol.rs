//! Messages exchanged between the pool and its workers.

use crate::{errors::Exception, value::Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Ready = 0,
    Request = 1,
    Response = 2,
    CallbackCall = 3,
    CallbackResult = 4,
    GeneratorStart = 5,
    GeneratorYield = 6,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Opcode::Ready => "READY",
            Opcode::Request => "REQUEST",
            Opcode::Response => "RESPONSE",
            Opcode::CallbackCall => "CALLBACK_CALL",
            Opcode::CallbackResult => "CALLBACK_RESULT",
            Opcode::GeneratorStart => "GENERATOR_START",
            Opcode::GeneratorYield => "GENERATOR_YIELD",
        })
    }
}

/// Payloads are already marshalled for the receiving side. Failure flags
/// are carried by the `Result`s.
#[derive(Debug)]
pub enum Message {
    /// worker → pool: module loaded.
    Ready,
    /// pool → worker. `callbacks` lists the argument positions that held callables.
    Request {
        method: String,
        args: Vec<Value>,
        callbacks: Vec<usize>,
    },
    /// worker → pool: the task settled.
    Response { result: Result<Value, Exception> },
    /// worker → pool: invoke the callable at argument `index`.
    CallbackCall { call_id: u64, index: usize, args: Vec<Value> },
    /// pool → worker, answering the `CallbackCall` with the same `call_id`.
    CallbackResult {
        call_id: u64,
        result: Result<Value, Exception>,
    },
    GeneratorStart,
    GeneratorYield { value: Value },
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Ready => Opcode::Ready,
            Message::Request { .. } => Opcode::Request,
            Message::Response { .. } => Opcode::Response,
            Message::CallbackCall { .. } => Opcode::CallbackCall,
            Message::CallbackResult { .. } => Opcode::CallbackResult,
            Message::GeneratorStart => Opcode::GeneratorStart,
            Message::GeneratorYield { .. } => Opcode::GeneratorYield,
        }
    }
}

/// What a worker thread can send to the pool. `Error` and `Exit` stand in
/// for the worker's error and exit events.
#[derive(Debug)]
pub(crate) enum Envelope {
    Message(Message),
    Error(String),
    Exit,
}
