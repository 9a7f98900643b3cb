//! Register bytecode VM for data-parallel per-element expressions

mod bytecode;
mod chunk;
mod disasm;
mod opcode;
mod vm;

pub use bytecode::{ByteCode, ByteCodeBuilder, ExternalFunctionDecl, StreamDecl};
pub use chunk::{ChunkReader, ChunkWriter};
pub use opcode::{DataType, OpCode};
pub use vm::{ExternalFunction, Value, ValueColumn, ValueColumnMut, Vm};

use common::*;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("Unknown opcode {0:#x}")]
    UnknownOpCode(u32),

    #[error("Bytecode ends in the middle of an instruction")]
    TruncatedInstruction,

    #[error("Register r{0} out of range ({1} allocated)")]
    RegisterOutOfRange(u32, u32),

    #[error("{0} index {1} out of range")]
    StreamOutOfRange(&'static str, u32),

    #[error("Chunk {name:?} has version {found}, expected at least {expected}")]
    UnsupportedVersion {
        name: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("Malformed stream: {0}")]
    MalformedStream(&'static str),

    #[error("Input column {0} has the wrong type")]
    InputTypeMismatch(u32),

    #[error("Function {0:?} returned a value of the wrong type")]
    FunctionReturnTypeMismatch(String),

    #[error("Missing external function binding for {0:?}")]
    MissingFunction(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExprResult<T> = Result<T, ExprError>;
