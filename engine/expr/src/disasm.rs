//! Deterministic textual listing of compiled bytecode

use std::fmt::Write;

use crate::bytecode::{ByteCode, Instr};
use crate::opcode::OpCode;
use crate::ExprResult;

impl ByteCode {
    pub fn disassemble(&self) -> ExprResult<String> {
        let mut out = String::new();

        out.push_str("// Inputs:\n");
        for (i, input) in self.inputs.iter().enumerate() {
            let _ = writeln!(out, "//  {}: {}({})", i, input.name, input.data_type.name());
        }

        out.push_str("\n// Outputs:\n");
        for (i, output) in self.outputs.iter().enumerate() {
            let _ = writeln!(
                out,
                "//  {}: {}({})",
                i,
                output.name,
                output.data_type.name()
            );
        }

        out.push_str("\n// Functions:\n");
        for (i, function) in self.functions.iter().enumerate() {
            let _ = write!(
                out,
                "//  {}: {} {}(",
                i,
                function.return_type.name(),
                function.name
            );
            for (j, arg) in function.arg_types.iter().enumerate() {
                out.push_str(arg.name());
                if j + 1 < function.arg_types.len() {
                    out.push_str(", ");
                }
            }
            out.push_str(")\n");
        }

        let _ = writeln!(out, "\n// Temp Registers: {}", self.num_temp_registers);
        let _ = writeln!(out, "// Instructions: {}\n", self.num_instructions);

        let pad = OpCode::max_name_len() + 1;
        let mnemonic = |out: &mut String, op: OpCode| {
            let name = op.name();
            out.push_str(name);
            for _ in name.len()..pad {
                out.push(' ');
            }
        };

        for instr in self.decode() {
            match instr? {
                Instr::Nop => {
                    mnemonic(&mut out, OpCode::Nop);
                    out.push('\n');
                }
                Instr::Unary { op, dst, src } => {
                    mnemonic(&mut out, op);
                    let _ = writeln!(out, "r{} r{}", dst, src);
                }
                Instr::Binary { op, dst, a, b } => {
                    mnemonic(&mut out, op);
                    let _ = writeln!(out, "r{} r{} r{}", dst, a, b);
                }
                Instr::BinaryConst {
                    op,
                    dst,
                    a,
                    constant,
                } => {
                    mnemonic(&mut out, op);
                    let _ = write!(out, "r{} r{} ", dst, a);
                    append_constant(&mut out, constant);
                    out.push('\n');
                }
                Instr::Ternary {
                    op,
                    dst,
                    cond,
                    a,
                    b,
                } => {
                    mnemonic(&mut out, op);
                    let _ = writeln!(out, "r{} r{} r{} r{}", dst, cond, a, b);
                }
                Instr::MovR { dst, src } => {
                    mnemonic(&mut out, OpCode::MovX_R);
                    let _ = writeln!(out, "r{} r{}", dst, src);
                }
                Instr::MovC { dst, constant } => {
                    mnemonic(&mut out, OpCode::MovX_C);
                    let _ = write!(out, "r{} ", dst);
                    append_constant(&mut out, constant);
                    out.push('\n');
                }
                Instr::Load { op, dst, input } => {
                    mnemonic(&mut out, op);
                    let name = self
                        .inputs
                        .get(input as usize)
                        .map(|i| i.name.as_str())
                        .unwrap_or("?");
                    let _ = writeln!(out, "r{} i{}({})", dst, input, name);
                }
                Instr::Store { op, output, src } => {
                    mnemonic(&mut out, op);
                    let name = self
                        .outputs
                        .get(output as usize)
                        .map(|o| o.name.as_str())
                        .unwrap_or("?");
                    let _ = writeln!(out, "o{}({}) r{}", output, name, src);
                }
                Instr::Call {
                    function,
                    dst,
                    args,
                } => {
                    mnemonic(&mut out, OpCode::Call);
                    let name = match self.functions.get(function as usize) {
                        Some(f) if !f.name.is_empty() => f.name.clone(),
                        _ => format!("Unknown_{}", function),
                    };
                    let _ = write!(out, "{} r{}", name, dst);
                    for arg in &args {
                        let _ = write!(out, " r{}", arg);
                    }
                    out.push('\n');
                }
            }
        }

        Ok(out)
    }
}

fn append_constant(out: &mut String, bits: u32) {
    let _ = write!(out, "0x{:08x}({:.6})", bits, f32::from_bits(bits));
}

#[cfg(test)]
mod tests {
    use crate::bytecode::ByteCodeBuilder;
    use crate::opcode::{DataType, OpCode};
    use crate::ByteCode;

    fn sample() -> ByteCode {
        let mut builder = ByteCodeBuilder::new();
        let input = builder.add_input("x", DataType::Float);
        let output = builder.add_output("scaled", DataType::Float);
        builder
            .load_f(0, input)
            .mov_const_f(1, 2.5)
            .binary(OpCode::MulF_RR, 2, 0, 1)
            .store_f(output, 2);
        builder.finish()
    }

    #[test]
    fn listing_contains_tables_and_instructions() {
        let listing = sample().disassemble().unwrap();

        assert!(listing.contains("// Inputs:\n//  0: x(Float)"));
        assert!(listing.contains("// Outputs:\n//  0: scaled(Float)"));
        assert!(listing.contains("// Temp Registers: 3"));
        assert!(listing.contains("// Instructions: 4"));
        assert!(listing.contains("LoadF"));
        assert!(listing.contains("r0 i0(x)"));
        assert!(listing.contains("0x40200000(2.500000)"));
        assert!(listing.contains("o0(scaled) r2"));
    }

    #[test]
    fn listing_is_deterministic() {
        let bytecode = sample();
        assert_eq!(
            bytecode.disassemble().unwrap(),
            bytecode.disassemble().unwrap()
        );
    }

    #[test]
    fn round_trip_preserves_listing() {
        let bytecode = sample();
        let mut bytes = Vec::new();
        bytecode.save(&mut bytes).unwrap();
        let loaded = ByteCode::load(&bytes[..]).unwrap();

        assert_eq!(loaded, bytecode);
        assert_eq!(
            loaded.disassemble().unwrap(),
            bytecode.disassemble().unwrap()
        );
    }

    #[test]
    fn old_chunk_versions_refuse_to_load() {
        use crate::chunk::ChunkWriter;

        common::logging::for_tests();

        // hand-write a stream with an outdated MetaData chunk
        let mut writer = ChunkWriter::begin_stream(Vec::new()).unwrap();
        writer.begin_chunk("MetaData", 3);
        writer.write_u32(0);
        writer.write_u32(0);
        writer.write_u32(0);
        writer.write_u32(0);
        writer.write_u32(0);
        writer.end_chunk().unwrap();
        let bytes = writer.end_stream().unwrap();

        assert!(matches!(
            ByteCode::load(&bytes[..]),
            Err(crate::ExprError::UnsupportedVersion { .. })
        ));
    }
}
