use crate::bytecode::{ByteCode, Instr};
use crate::opcode::{DataType, OpCode};
use crate::{ExprError, ExprResult};

/// A single scalar crossing the VM boundary (external function calls)
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Float(f32),
    Int(i32),
    Bool(bool),
}

/// Read-only input column, one element per row
#[derive(Copy, Clone)]
pub enum ValueColumn<'a> {
    Float(&'a [f32]),
    Int(&'a [i32]),
}

/// Output column written by Store opcodes
pub enum ValueColumnMut<'a> {
    Float(&'a mut [f32]),
    Int(&'a mut [i32]),
}

/// External function callable from bytecode. Receives the row index so
/// stateful implementations (per-row random draws etc) can key off it
pub trait ExternalFunction {
    fn call(&mut self, row: usize, args: &[Value]) -> Value;
}

impl<F> ExternalFunction for F
where
    F: FnMut(usize, &[Value]) -> Value,
{
    fn call(&mut self, row: usize, args: &[Value]) -> Value {
        self(row, args)
    }
}

#[derive(Copy, Clone)]
enum Operand {
    Reg(u32),
    Const(u32),
}

/// Executes [ByteCode] over batches of rows. Registers are bit-wise u32
/// lanes, one per row; opcodes decide the interpretation
#[derive(Default)]
pub struct Vm {
    registers: Vec<Vec<u32>>,
}

impl Vm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute(
        &mut self,
        bytecode: &ByteCode,
        inputs: &[ValueColumn],
        outputs: &mut [ValueColumnMut],
        functions: &mut [&mut dyn ExternalFunction],
        num_rows: usize,
    ) -> ExprResult<()> {
        let num_registers = bytecode.temp_register_count();
        self.registers.resize(num_registers as usize, Vec::new());
        for reg in &mut self.registers {
            reg.clear();
            reg.resize(num_rows, 0);
        }

        let check = |reg: u32| {
            if reg < num_registers {
                Ok(())
            } else {
                Err(ExprError::RegisterOutOfRange(reg, num_registers))
            }
        };

        for instr in bytecode.decode() {
            match instr? {
                Instr::Nop => {}
                Instr::Unary { op, dst, src } => {
                    check(dst)?;
                    check(src)?;
                    self.exec_unary(op, dst, src, num_rows);
                }
                Instr::Binary { op, dst, a, b } => {
                    check(dst)?;
                    check(a)?;
                    check(b)?;
                    self.exec_binary(op, dst, a, Operand::Reg(b), num_rows);
                }
                Instr::BinaryConst {
                    op,
                    dst,
                    a,
                    constant,
                } => {
                    check(dst)?;
                    check(a)?;
                    self.exec_binary(op.without_constant(), dst, a, Operand::Const(constant), num_rows);
                }
                // SelF/SelI/SelB are all a bit-wise pick on the condition lane
                Instr::Ternary {
                    op: _,
                    dst,
                    cond,
                    a,
                    b,
                } => {
                    check(dst)?;
                    check(cond)?;
                    check(a)?;
                    check(b)?;
                    for row in 0..num_rows {
                        let c = self.registers[cond as usize][row];
                        let v = if c != 0 {
                            self.registers[a as usize][row]
                        } else {
                            self.registers[b as usize][row]
                        };
                        self.registers[dst as usize][row] = v;
                    }
                }
                Instr::MovR { dst, src } => {
                    check(dst)?;
                    check(src)?;
                    for row in 0..num_rows {
                        self.registers[dst as usize][row] = self.registers[src as usize][row];
                    }
                }
                Instr::MovC { dst, constant } => {
                    check(dst)?;
                    self.registers[dst as usize][0..num_rows].fill(constant);
                }
                Instr::Load { op, dst, input } => {
                    check(dst)?;
                    let column = inputs
                        .get(input as usize)
                        .copied()
                        .ok_or(ExprError::StreamOutOfRange("input", input))?;

                    let dst_reg = &mut self.registers[dst as usize];
                    match (op, column) {
                        (OpCode::LoadF, ValueColumn::Float(values)) if values.len() >= num_rows => {
                            for row in 0..num_rows {
                                dst_reg[row] = values[row].to_bits();
                            }
                        }
                        (OpCode::LoadI, ValueColumn::Int(values)) if values.len() >= num_rows => {
                            for row in 0..num_rows {
                                dst_reg[row] = values[row] as u32;
                            }
                        }
                        _ => return Err(ExprError::InputTypeMismatch(input)),
                    }
                }
                Instr::Store { op, output, src } => {
                    check(src)?;
                    let src_reg = &self.registers[src as usize];
                    let column = outputs
                        .get_mut(output as usize)
                        .ok_or(ExprError::StreamOutOfRange("output", output))?;

                    match (op, column) {
                        (OpCode::StoreF, ValueColumnMut::Float(values))
                            if values.len() >= num_rows =>
                        {
                            for row in 0..num_rows {
                                values[row] = f32::from_bits(src_reg[row]);
                            }
                        }
                        (OpCode::StoreI, ValueColumnMut::Int(values))
                            if values.len() >= num_rows =>
                        {
                            for row in 0..num_rows {
                                values[row] = src_reg[row] as i32;
                            }
                        }
                        _ => return Err(ExprError::InputTypeMismatch(output)),
                    }
                }
                Instr::Call {
                    function,
                    dst,
                    args,
                } => {
                    check(dst)?;
                    for arg in &args {
                        check(*arg)?;
                    }

                    let decl = bytecode
                        .functions()
                        .get(function as usize)
                        .ok_or(ExprError::StreamOutOfRange("function", function))?;
                    let callee = functions
                        .get_mut(function as usize)
                        .ok_or_else(|| ExprError::MissingFunction(decl.name.clone()))?;

                    let mut arg_values = Vec::with_capacity(args.len());
                    for row in 0..num_rows {
                        arg_values.clear();
                        for (i, arg) in args.iter().enumerate() {
                            let bits = self.registers[*arg as usize][row];
                            let ty = decl
                                .arg_types
                                .get(i)
                                .copied()
                                .unwrap_or(DataType::Float);
                            arg_values.push(value_from_bits(bits, ty));
                        }

                        let result = callee.call(row, &arg_values);
                        let bits = match (result, decl.return_type) {
                            (Value::Float(f), DataType::Float) => f.to_bits(),
                            (Value::Int(i), DataType::Int) => i as u32,
                            (Value::Bool(b), DataType::Bool) => b as u32,
                            _ => {
                                return Err(ExprError::FunctionReturnTypeMismatch(
                                    decl.name.clone(),
                                ))
                            }
                        };
                        self.registers[dst as usize][row] = bits;
                    }
                }
            }
        }

        Ok(())
    }

    fn exec_unary(&mut self, op: OpCode, dst: u32, src: u32, num_rows: usize) {
        let (dst, src) = (dst as usize, src as usize);

        macro_rules! un_f {
            ($f:expr) => {
                for row in 0..num_rows {
                    let x = f32::from_bits(self.registers[src][row]);
                    self.registers[dst][row] = ($f)(x).to_bits();
                }
            };
        }
        macro_rules! un_i {
            ($f:expr) => {
                for row in 0..num_rows {
                    let x = self.registers[src][row] as i32;
                    self.registers[dst][row] = ($f)(x) as u32;
                }
            };
        }

        match op {
            OpCode::AbsF_R => un_f!(f32::abs),
            OpCode::AbsI_R => un_i!(i32::wrapping_abs),
            OpCode::SqrtF_R => un_f!(f32::sqrt),
            OpCode::ExpF_R => un_f!(f32::exp),
            OpCode::LnF_R => un_f!(f32::ln),
            OpCode::Log2F_R => un_f!(f32::log2),
            OpCode::Log2I_R => un_i!(|x: i32| if x > 0 { 31 - x.leading_zeros() as i32 } else { 0 }),
            OpCode::Log10F_R => un_f!(f32::log10),
            OpCode::Pow2F_R => un_f!(f32::exp2),
            OpCode::SinF_R => un_f!(f32::sin),
            OpCode::CosF_R => un_f!(f32::cos),
            OpCode::TanF_R => un_f!(f32::tan),
            OpCode::ASinF_R => un_f!(f32::asin),
            OpCode::ACosF_R => un_f!(f32::acos),
            OpCode::ATanF_R => un_f!(f32::atan),
            OpCode::RoundF_R => un_f!(f32::round),
            OpCode::FloorF_R => un_f!(f32::floor),
            OpCode::CeilF_R => un_f!(f32::ceil),
            OpCode::TruncF_R => un_f!(f32::trunc),
            OpCode::NotB_R => {
                for row in 0..num_rows {
                    let x = self.registers[src][row];
                    self.registers[dst][row] = (x == 0) as u32;
                }
            }
            OpCode::NotI_R => un_i!(|x: i32| !x),
            OpCode::IToF_R => {
                for row in 0..num_rows {
                    let x = self.registers[src][row] as i32;
                    self.registers[dst][row] = (x as f32).to_bits();
                }
            }
            OpCode::FToI_R => {
                for row in 0..num_rows {
                    let x = f32::from_bits(self.registers[src][row]);
                    self.registers[dst][row] = (x as i32) as u32;
                }
            }
            _ => unreachable!("not a unary opcode: {:?}", op),
        }
    }

    fn exec_binary(&mut self, op: OpCode, dst: u32, a: u32, b: Operand, num_rows: usize) {
        let (dst, a) = (dst as usize, a as usize);

        macro_rules! operand {
            ($row:expr) => {
                match b {
                    Operand::Reg(r) => self.registers[r as usize][$row],
                    Operand::Const(c) => c,
                }
            };
        }

        macro_rules! bin_f {
            ($f:expr) => {
                for row in 0..num_rows {
                    let x = f32::from_bits(self.registers[a][row]);
                    let y = f32::from_bits(operand!(row));
                    self.registers[dst][row] = ($f)(x, y).to_bits();
                }
            };
        }
        macro_rules! bin_i {
            ($f:expr) => {
                for row in 0..num_rows {
                    let x = self.registers[a][row] as i32;
                    let y = operand!(row) as i32;
                    self.registers[dst][row] = ($f)(x, y) as u32;
                }
            };
        }
        macro_rules! cmp_f {
            ($f:expr) => {
                for row in 0..num_rows {
                    let x = f32::from_bits(self.registers[a][row]);
                    let y = f32::from_bits(operand!(row));
                    self.registers[dst][row] = ($f)(x, y) as u32;
                }
            };
        }
        macro_rules! cmp_i {
            ($f:expr) => {
                for row in 0..num_rows {
                    let x = self.registers[a][row] as i32;
                    let y = operand!(row) as i32;
                    self.registers[dst][row] = ($f)(x, y) as u32;
                }
            };
        }
        macro_rules! bin_b {
            ($f:expr) => {
                for row in 0..num_rows {
                    let x = self.registers[a][row] != 0;
                    let y = operand!(row) != 0;
                    self.registers[dst][row] = ($f)(x, y) as u32;
                }
            };
        }

        match op {
            OpCode::AddF_RR => bin_f!(|x, y| x + y),
            OpCode::AddI_RR => bin_i!(i32::wrapping_add),
            OpCode::SubF_RR => bin_f!(|x, y| x - y),
            OpCode::SubI_RR => bin_i!(i32::wrapping_sub),
            OpCode::MulF_RR => bin_f!(|x, y| x * y),
            OpCode::MulI_RR => bin_i!(i32::wrapping_mul),
            OpCode::DivF_RR => bin_f!(|x, y| x / y),
            // division by zero yields a sentinel instead of trapping
            OpCode::DivI_RR => bin_i!(|x: i32, y: i32| if y == 0 { 0 } else { x.wrapping_div(y) }),
            OpCode::MinF_RR => bin_f!(f32::min),
            OpCode::MinI_RR => bin_i!(i32::min),
            OpCode::MaxF_RR => bin_f!(f32::max),
            OpCode::MaxI_RR => bin_i!(i32::max),
            OpCode::ShlI_RR => bin_i!(|x: i32, y: i32| x.wrapping_shl(y as u32)),
            OpCode::ShrI_RR => bin_i!(|x: i32, y: i32| x.wrapping_shr(y as u32)),
            OpCode::AndI_RR => bin_i!(|x, y| x & y),
            OpCode::XorI_RR => bin_i!(|x, y| x ^ y),
            OpCode::OrI_RR => bin_i!(|x, y| x | y),
            OpCode::EqF_RR => cmp_f!(|x, y| x == y),
            OpCode::EqI_RR => cmp_i!(|x, y| x == y),
            OpCode::EqB_RR => bin_b!(|x, y| x == y),
            OpCode::NEqF_RR => cmp_f!(|x, y| x != y),
            OpCode::NEqI_RR => cmp_i!(|x, y| x != y),
            OpCode::NEqB_RR => bin_b!(|x, y| x != y),
            OpCode::LtF_RR => cmp_f!(|x, y| x < y),
            OpCode::LtI_RR => cmp_i!(|x, y| x < y),
            OpCode::LEqF_RR => cmp_f!(|x, y| x <= y),
            OpCode::LEqI_RR => cmp_i!(|x, y| x <= y),
            OpCode::GtF_RR => cmp_f!(|x, y| x > y),
            OpCode::GtI_RR => cmp_i!(|x, y| x > y),
            OpCode::GEqF_RR => cmp_f!(|x, y| x >= y),
            OpCode::GEqI_RR => cmp_i!(|x, y| x >= y),
            OpCode::AndB_RR => bin_b!(|x, y| x && y),
            OpCode::OrB_RR => bin_b!(|x, y| x || y),
            _ => unreachable!("not a binary opcode: {:?}", op),
        }
    }
}

fn value_from_bits(bits: u32, ty: DataType) -> Value {
    match ty {
        DataType::Float => Value::Float(f32::from_bits(bits)),
        DataType::Int => Value::Int(bits as i32),
        DataType::Bool => Value::Bool(bits != 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ByteCodeBuilder;

    #[test]
    fn multiply_by_constant() {
        // out0 = in0 * 2.5
        let mut builder = ByteCodeBuilder::new();
        let input = builder.add_input("x", DataType::Float);
        let output = builder.add_output("scaled", DataType::Float);
        builder
            .load_f(0, input)
            .mov_const_f(1, 2.5)
            .binary(OpCode::MulF_RR, 2, 0, 1)
            .store_f(output, 2);
        let bytecode = builder.finish();

        assert_eq!(bytecode.instruction_count(), 4);

        let inputs = [ValueColumn::Float(&[1.0, -2.0, 0.0])];
        let mut out = [0.0f32; 3];
        let mut outputs = [ValueColumnMut::Float(&mut out)];

        let mut vm = Vm::new();
        vm.execute(&bytecode, &inputs, &mut outputs, &mut [], 3)
            .unwrap();

        assert_eq!(out, [2.5, -5.0, 0.0]);
    }

    #[test]
    fn int_division_by_zero_is_sentinel() {
        let mut builder = ByteCodeBuilder::new();
        let a = builder.add_input("a", DataType::Int);
        let b = builder.add_input("b", DataType::Int);
        let output = builder.add_output("q", DataType::Int);
        builder
            .load_i(0, a)
            .load_i(1, b)
            .binary(OpCode::DivI_RR, 2, 0, 1)
            .store_i(output, 2);
        let bytecode = builder.finish();

        let inputs = [
            ValueColumn::Int(&[10, 7, -9]),
            ValueColumn::Int(&[2, 0, 3]),
        ];
        let mut out = [0i32; 3];
        let mut outputs = [ValueColumnMut::Int(&mut out)];

        let mut vm = Vm::new();
        vm.execute(&bytecode, &inputs, &mut outputs, &mut [], 3)
            .unwrap();

        assert_eq!(out, [5, 0, -3]);
    }

    #[test]
    fn select_picks_per_row() {
        // out = (in > 0) ? in : -in  == abs
        let mut builder = ByteCodeBuilder::new();
        let input = builder.add_input("x", DataType::Float);
        let output = builder.add_output("y", DataType::Float);
        builder
            .load_f(0, input)
            .mov_const_f(1, 0.0)
            .binary(OpCode::GtF_RR, 2, 0, 1)
            .binary(OpCode::SubF_RR, 3, 1, 0)
            .select(OpCode::SelF_RRR, 4, 2, 0, 3)
            .store_f(output, 4);
        let bytecode = builder.finish();

        let inputs = [ValueColumn::Float(&[1.5, -3.0, 0.0])];
        let mut out = [0.0f32; 3];
        let mut outputs = [ValueColumnMut::Float(&mut out)];

        Vm::new()
            .execute(&bytecode, &inputs, &mut outputs, &mut [], 3)
            .unwrap();

        assert_eq!(out, [1.5, 3.0, 0.0]);
    }

    #[test]
    fn binary_with_constant_matches_register_form() {
        let mut builder = ByteCodeBuilder::new();
        let input = builder.add_input("x", DataType::Float);
        let output = builder.add_output("y", DataType::Float);
        builder
            .load_f(0, input)
            .binary_const(OpCode::AddF_RC, 1, 0, 10.0f32.to_bits())
            .store_f(output, 1);
        let bytecode = builder.finish();

        let inputs = [ValueColumn::Float(&[1.0, 2.0])];
        let mut out = [0.0f32; 2];
        let mut outputs = [ValueColumnMut::Float(&mut out)];

        Vm::new()
            .execute(&bytecode, &inputs, &mut outputs, &mut [], 2)
            .unwrap();

        assert_eq!(out, [11.0, 12.0]);
    }

    #[test]
    fn external_function_sees_rows_and_args() {
        let mut builder = ByteCodeBuilder::new();
        let input = builder.add_input("x", DataType::Float);
        let output = builder.add_output("y", DataType::Float);
        let func = builder.add_function("rowScale", DataType::Float, vec![DataType::Float]);
        builder
            .load_f(0, input)
            .call(func, 1, &[0])
            .store_f(output, 1);
        let bytecode = builder.finish();

        let mut scale = |row: usize, args: &[Value]| {
            let x = match args[0] {
                Value::Float(f) => f,
                _ => panic!("wrong arg type"),
            };
            Value::Float(x * row as f32)
        };
        let mut functions: [&mut dyn ExternalFunction; 1] = [&mut scale];

        let inputs = [ValueColumn::Float(&[3.0, 3.0, 3.0])];
        let mut out = [0.0f32; 3];
        let mut outputs = [ValueColumnMut::Float(&mut out)];

        Vm::new()
            .execute(&bytecode, &inputs, &mut outputs, &mut functions, 3)
            .unwrap();

        assert_eq!(out, [0.0, 3.0, 6.0]);
    }

    #[test]
    fn mismatched_function_return_type_is_rejected() {
        let mut builder = ByteCodeBuilder::new();
        let output = builder.add_output("y", DataType::Float);
        let func = builder.add_function("bad", DataType::Float, Vec::new());
        builder.call(func, 0, &[]).store_f(output, 0);
        let bytecode = builder.finish();

        let mut bad = |_row: usize, _args: &[Value]| Value::Int(1);
        let mut functions: [&mut dyn ExternalFunction; 1] = [&mut bad];

        let mut out = [0.0f32; 1];
        let mut outputs = [ValueColumnMut::Float(&mut out)];

        let result = Vm::new().execute(&bytecode, &[], &mut outputs, &mut functions, 1);
        assert!(matches!(
            result,
            Err(ExprError::FunctionReturnTypeMismatch(_))
        ));
    }
}
