//! Effect opcodes.
//!
//! Opcodes name the effects of a run for logging and for the write-ahead
//! log; dispatch itself goes through the typed services in
//! [`crate::services`].

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Channel updates of a finished run handed back to the caller.
    StateTransitionCommit,
    WriteCommitment,
    OpSign,
    OpSignAsIntermediary,
    IoSend,
    IoWait,
    IoSendAndWait,
}

impl Opcode {
    /// Whether the effect is recorded in the write-ahead log.
    pub fn is_logged(&self) -> bool {
        !matches!(self, Opcode::StateTransitionCommit | Opcode::WriteCommitment)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
