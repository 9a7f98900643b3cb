use std::io::{Read, Write};

use common::*;

use crate::chunk::{ChunkReader, ChunkWriter};
use crate::opcode::{DataType, OpCode};
use crate::{ExprError, ExprResult};

const METADATA_CHUNK: &str = "MetaData";
const METADATA_VERSION: u32 = 4;
const CODE_CHUNK: &str = "Code";
const CODE_VERSION: u32 = 3;

/// An input or output column declaration
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamDecl {
    pub name: String,
    pub data_type: DataType,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExternalFunctionDecl {
    pub name: String,
    pub return_type: DataType,
    pub arg_types: Vec<DataType>,
}

/// A compiled expression: storage words plus the stream and function tables
/// the words index into
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ByteCode {
    pub(crate) code: Vec<u32>,
    pub(crate) inputs: Vec<StreamDecl>,
    pub(crate) outputs: Vec<StreamDecl>,
    pub(crate) functions: Vec<ExternalFunctionDecl>,
    pub(crate) num_instructions: u32,
    pub(crate) num_temp_registers: u32,
}

/// Decoded form of one instruction
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Instr {
    Nop,
    Unary {
        op: OpCode,
        dst: u32,
        src: u32,
    },
    Binary {
        op: OpCode,
        dst: u32,
        a: u32,
        b: u32,
    },
    BinaryConst {
        op: OpCode,
        dst: u32,
        a: u32,
        constant: u32,
    },
    Ternary {
        op: OpCode,
        dst: u32,
        cond: u32,
        a: u32,
        b: u32,
    },
    MovR {
        dst: u32,
        src: u32,
    },
    MovC {
        dst: u32,
        constant: u32,
    },
    Load {
        op: OpCode,
        dst: u32,
        input: u32,
    },
    Store {
        op: OpCode,
        output: u32,
        src: u32,
    },
    Call {
        function: u32,
        dst: u32,
        args: SmallVec<[u32; 4]>,
    },
}

impl ByteCode {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn inputs(&self) -> &[StreamDecl] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[StreamDecl] {
        &self.outputs
    }

    pub fn functions(&self) -> &[ExternalFunctionDecl] {
        &self.functions
    }

    pub fn instruction_count(&self) -> u32 {
        self.num_instructions
    }

    pub fn temp_register_count(&self) -> u32 {
        self.num_temp_registers
    }

    pub(crate) fn decode(&self) -> Decoder {
        Decoder {
            code: &self.code,
            pos: 0,
        }
    }

    pub fn save<W: Write>(&self, out: W) -> ExprResult<()> {
        let mut chunk = ChunkWriter::begin_stream(out)?;

        chunk.begin_chunk(METADATA_CHUNK, METADATA_VERSION);
        chunk.write_u32(self.num_instructions);
        chunk.write_u32(self.num_temp_registers);

        chunk.write_u32(self.inputs.len() as u32);
        for input in &self.inputs {
            chunk.write_str(&input.name);
            chunk.write_u8(input.data_type as u8);
        }

        chunk.write_u32(self.outputs.len() as u32);
        for output in &self.outputs {
            chunk.write_str(&output.name);
            chunk.write_u8(output.data_type as u8);
        }

        chunk.write_u32(self.functions.len() as u32);
        for function in &self.functions {
            chunk.write_str(&function.name);
            chunk.write_u8(function.return_type as u8);
            chunk.write_u32(function.arg_types.len() as u32);
            for arg in &function.arg_types {
                chunk.write_u8(*arg as u8);
            }
        }
        chunk.end_chunk()?;

        chunk.begin_chunk(CODE_CHUNK, CODE_VERSION);
        chunk.write_u32(self.code.len() as u32);
        for word in &self.code {
            chunk.write_u32(*word);
        }
        chunk.end_chunk()?;

        chunk.end_stream()?;
        Ok(())
    }

    pub fn load<R: Read>(input: R) -> ExprResult<ByteCode> {
        let mut chunk = ChunkReader::begin_stream(input)?;
        let mut loaded = ByteCode::default();

        loop {
            let (name, version) = match chunk.current_chunk() {
                Some(info) => (info.name.clone(), info.version),
                None => break,
            };

            match name.as_str() {
                METADATA_CHUNK => {
                    if version < METADATA_VERSION {
                        let found = version;
                        error!(
                            "invalid bytecode metadata chunk";
                            "version" => found, "expected" => METADATA_VERSION
                        );
                        return Err(ExprError::UnsupportedVersion {
                            name: METADATA_CHUNK,
                            found,
                            expected: METADATA_VERSION,
                        });
                    }

                    loaded.num_instructions = chunk.read_u32()?;
                    loaded.num_temp_registers = chunk.read_u32()?;
                    loaded.inputs = read_stream_decls(&mut chunk)?;
                    loaded.outputs = read_stream_decls(&mut chunk)?;

                    let fn_count = chunk.read_u32()?;
                    loaded.functions = (0..fn_count)
                        .map(|_| read_function_decl(&mut chunk))
                        .collect::<ExprResult<_>>()?;
                }
                CODE_CHUNK => {
                    if version < CODE_VERSION {
                        let found = version;
                        error!(
                            "invalid bytecode code chunk";
                            "version" => found, "expected" => CODE_VERSION
                        );
                        return Err(ExprError::UnsupportedVersion {
                            name: CODE_CHUNK,
                            found,
                            expected: CODE_VERSION,
                        });
                    }

                    let word_count = chunk.read_u32()?;
                    loaded.code = (0..word_count)
                        .map(|_| chunk.read_u32())
                        .collect::<ExprResult<_>>()?;
                }
                _ => {} // unknown chunks are skipped
            }

            chunk.next_chunk()?;
        }

        Ok(loaded)
    }
}

fn read_stream_decls<R: Read>(chunk: &mut ChunkReader<R>) -> ExprResult<Vec<StreamDecl>> {
    let count = chunk.read_u32()?;
    (0..count)
        .map(|_| {
            let name = chunk.read_str()?;
            let ty = chunk.read_u8()?;
            Ok(StreamDecl {
                name,
                data_type: DataType::from_u8(ty)
                    .ok_or(ExprError::MalformedStream("bad stream data type"))?,
            })
        })
        .collect()
}

fn read_function_decl<R: Read>(chunk: &mut ChunkReader<R>) -> ExprResult<ExternalFunctionDecl> {
    let name = chunk.read_str()?;
    let ret = chunk.read_u8()?;
    let arg_count = chunk.read_u32()?;
    let arg_types = (0..arg_count)
        .map(|_| {
            let ty = chunk.read_u8()?;
            DataType::from_u8(ty).ok_or(ExprError::MalformedStream("bad function arg type"))
        })
        .collect::<ExprResult<_>>()?;

    Ok(ExternalFunctionDecl {
        name,
        return_type: DataType::from_u8(ret)
            .ok_or(ExprError::MalformedStream("bad function return type"))?,
        arg_types,
    })
}

pub(crate) struct Decoder<'a> {
    code: &'a [u32],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn next_word(&mut self) -> ExprResult<u32> {
        let word = self
            .code
            .get(self.pos)
            .copied()
            .ok_or(ExprError::TruncatedInstruction)?;
        self.pos += 1;
        Ok(word)
    }
}

impl<'a> Iterator for Decoder<'a> {
    type Item = ExprResult<Instr>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.code.len() {
            return None;
        }

        Some(self.decode_one())
    }
}

impl<'a> Decoder<'a> {
    fn decode_one(&mut self) -> ExprResult<Instr> {
        let word = self.next_word()?;
        let op = OpCode::from_u32(word).ok_or(ExprError::UnknownOpCode(word))?;

        let instr = if op.is_unary() {
            Instr::Unary {
                op,
                dst: self.next_word()?,
                src: self.next_word()?,
            }
        } else if op.is_binary() {
            Instr::Binary {
                op,
                dst: self.next_word()?,
                a: self.next_word()?,
                b: self.next_word()?,
            }
        } else if op.is_binary_with_constant() {
            Instr::BinaryConst {
                op,
                dst: self.next_word()?,
                a: self.next_word()?,
                constant: self.next_word()?,
            }
        } else if op.is_ternary() {
            Instr::Ternary {
                op,
                dst: self.next_word()?,
                cond: self.next_word()?,
                a: self.next_word()?,
                b: self.next_word()?,
            }
        } else {
            match op {
                OpCode::Nop => Instr::Nop,
                OpCode::MovX_R => Instr::MovR {
                    dst: self.next_word()?,
                    src: self.next_word()?,
                },
                OpCode::MovX_C => Instr::MovC {
                    dst: self.next_word()?,
                    constant: self.next_word()?,
                },
                OpCode::LoadF | OpCode::LoadI => Instr::Load {
                    op,
                    dst: self.next_word()?,
                    input: self.next_word()?,
                },
                OpCode::StoreF | OpCode::StoreI => Instr::Store {
                    op,
                    output: self.next_word()?,
                    src: self.next_word()?,
                },
                OpCode::Call => {
                    let function = self.next_word()?;
                    let dst = self.next_word()?;
                    let arg_count = self.next_word()?;
                    let args = (0..arg_count)
                        .map(|_| self.next_word())
                        .collect::<ExprResult<_>>()?;
                    Instr::Call {
                        function,
                        dst,
                        args,
                    }
                }
                _ => unreachable!(),
            }
        };

        Ok(instr)
    }
}

/// Assembles [ByteCode] instruction by instruction
#[derive(Default)]
pub struct ByteCodeBuilder {
    code: Vec<u32>,
    inputs: Vec<StreamDecl>,
    outputs: Vec<StreamDecl>,
    functions: Vec<ExternalFunctionDecl>,
    num_instructions: u32,
    max_register: u32,
}

impl ByteCodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: impl Into<String>, data_type: DataType) -> u32 {
        self.inputs.push(StreamDecl {
            name: name.into(),
            data_type,
        });
        self.inputs.len() as u32 - 1
    }

    pub fn add_output(&mut self, name: impl Into<String>, data_type: DataType) -> u32 {
        self.outputs.push(StreamDecl {
            name: name.into(),
            data_type,
        });
        self.outputs.len() as u32 - 1
    }

    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        return_type: DataType,
        arg_types: impl Into<Vec<DataType>>,
    ) -> u32 {
        self.functions.push(ExternalFunctionDecl {
            name: name.into(),
            return_type,
            arg_types: arg_types.into(),
        });
        self.functions.len() as u32 - 1
    }

    fn touch(&mut self, reg: u32) -> u32 {
        self.max_register = self.max_register.max(reg + 1);
        reg
    }

    fn emit(&mut self, op: OpCode, operands: &[u32]) {
        self.code.push(op as u32);
        self.code.extend_from_slice(operands);
        self.num_instructions += 1;
    }

    pub fn unary(&mut self, op: OpCode, dst: u32, src: u32) -> &mut Self {
        debug_assert!(op.is_unary());
        self.touch(dst);
        self.touch(src);
        self.emit(op, &[dst, src]);
        self
    }

    pub fn binary(&mut self, op: OpCode, dst: u32, a: u32, b: u32) -> &mut Self {
        debug_assert!(op.is_binary());
        self.touch(dst);
        self.touch(a);
        self.touch(b);
        self.emit(op, &[dst, a, b]);
        self
    }

    pub fn binary_const(&mut self, op: OpCode, dst: u32, a: u32, constant: u32) -> &mut Self {
        debug_assert!(op.is_binary_with_constant());
        self.touch(dst);
        self.touch(a);
        self.emit(op, &[dst, a, constant]);
        self
    }

    pub fn select(&mut self, op: OpCode, dst: u32, cond: u32, a: u32, b: u32) -> &mut Self {
        debug_assert!(op.is_ternary());
        self.touch(dst);
        self.touch(cond);
        self.touch(a);
        self.touch(b);
        self.emit(op, &[dst, cond, a, b]);
        self
    }

    pub fn mov(&mut self, dst: u32, src: u32) -> &mut Self {
        self.touch(dst);
        self.touch(src);
        self.emit(OpCode::MovX_R, &[dst, src]);
        self
    }

    pub fn mov_const(&mut self, dst: u32, constant: u32) -> &mut Self {
        self.touch(dst);
        self.emit(OpCode::MovX_C, &[dst, constant]);
        self
    }

    pub fn mov_const_f(&mut self, dst: u32, constant: f32) -> &mut Self {
        self.mov_const(dst, constant.to_bits())
    }

    pub fn load_f(&mut self, dst: u32, input: u32) -> &mut Self {
        self.touch(dst);
        self.emit(OpCode::LoadF, &[dst, input]);
        self
    }

    pub fn load_i(&mut self, dst: u32, input: u32) -> &mut Self {
        self.touch(dst);
        self.emit(OpCode::LoadI, &[dst, input]);
        self
    }

    pub fn store_f(&mut self, output: u32, src: u32) -> &mut Self {
        self.touch(src);
        self.emit(OpCode::StoreF, &[output, src]);
        self
    }

    pub fn store_i(&mut self, output: u32, src: u32) -> &mut Self {
        self.touch(src);
        self.emit(OpCode::StoreI, &[output, src]);
        self
    }

    pub fn call(&mut self, function: u32, dst: u32, args: &[u32]) -> &mut Self {
        self.touch(dst);
        self.code.push(OpCode::Call as u32);
        self.code.push(function);
        self.code.push(dst);
        self.code.push(args.len() as u32);
        for arg in args {
            self.touch(*arg);
            self.code.push(*arg);
        }
        self.num_instructions += 1;
        self
    }

    pub fn finish(self) -> ByteCode {
        ByteCode {
            code: self.code,
            inputs: self.inputs,
            outputs: self.outputs,
            functions: self.functions,
            num_instructions: self.num_instructions,
            num_temp_registers: self.max_register,
        }
    }
}
