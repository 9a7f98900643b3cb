/// Primitive type of a register lane or stream element
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum DataType {
    Float = 0,
    Int = 1,
    Bool = 2,
}

impl DataType {
    pub fn from_u8(v: u8) -> Option<DataType> {
        match v {
            0 => Some(DataType::Float),
            1 => Some(DataType::Int),
            2 => Some(DataType::Bool),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Float => "Float",
            DataType::Int => "Int",
            DataType::Bool => "Bool",
        }
    }
}

macro_rules! opcodes {
    ($($name:ident = $val:literal,)+) => {
        /// Storage-word opcodes. Numbering leaves gaps where the encoding
        /// reserves group boundary values, so the on-disk format stays stable
        /// when a group grows
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u32)]
        #[allow(non_camel_case_types)] // mnemonic suffixes mirror the on-disk name table
        pub enum OpCode {
            $($name = $val,)+
        }

        impl OpCode {
            pub fn from_u32(v: u32) -> Option<OpCode> {
                match v {
                    $($val => Some(OpCode::$name),)+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(OpCode::$name => stringify!($name),)+
                }
            }

            pub(crate) fn max_name_len() -> usize {
                let mut max = 0;
                $(
                    let len = stringify!($name).len();
                    if len > max {
                        max = len;
                    }
                )+
                max
            }
        }
    };
}

opcodes! {
    Nop = 0,

    AbsF_R = 2,
    AbsI_R = 3,
    SqrtF_R = 4,

    ExpF_R = 5,
    LnF_R = 6,
    Log2F_R = 7,
    Log2I_R = 8,
    Log10F_R = 9,
    Pow2F_R = 10,

    SinF_R = 11,
    CosF_R = 12,
    TanF_R = 13,

    ASinF_R = 14,
    ACosF_R = 15,
    ATanF_R = 16,

    RoundF_R = 17,
    FloorF_R = 18,
    CeilF_R = 19,
    TruncF_R = 20,

    NotB_R = 21,
    NotI_R = 22,

    IToF_R = 23,
    FToI_R = 24,

    AddF_RR = 27,
    AddI_RR = 28,

    SubF_RR = 29,
    SubI_RR = 30,

    MulF_RR = 31,
    MulI_RR = 32,

    DivF_RR = 33,
    DivI_RR = 34,

    MinF_RR = 35,
    MinI_RR = 36,

    MaxF_RR = 37,
    MaxI_RR = 38,

    ShlI_RR = 39,
    ShrI_RR = 40,
    AndI_RR = 41,
    XorI_RR = 42,
    OrI_RR = 43,

    EqF_RR = 44,
    EqI_RR = 45,
    EqB_RR = 46,

    NEqF_RR = 47,
    NEqI_RR = 48,
    NEqB_RR = 49,

    LtF_RR = 50,
    LtI_RR = 51,

    LEqF_RR = 52,
    LEqI_RR = 53,

    GtF_RR = 54,
    GtI_RR = 55,

    GEqF_RR = 56,
    GEqI_RR = 57,

    AndB_RR = 58,
    OrB_RR = 59,

    AddF_RC = 62,
    AddI_RC = 63,

    SubF_RC = 64,
    SubI_RC = 65,

    MulF_RC = 66,
    MulI_RC = 67,

    DivF_RC = 68,
    DivI_RC = 69,

    MinF_RC = 70,
    MinI_RC = 71,

    MaxF_RC = 72,
    MaxI_RC = 73,

    ShlI_RC = 74,
    ShrI_RC = 75,
    AndI_RC = 76,
    XorI_RC = 77,
    OrI_RC = 78,

    EqF_RC = 79,
    EqI_RC = 80,
    EqB_RC = 81,

    NEqF_RC = 82,
    NEqI_RC = 83,
    NEqB_RC = 84,

    LtF_RC = 85,
    LtI_RC = 86,

    LEqF_RC = 87,
    LEqI_RC = 88,

    GtF_RC = 89,
    GtI_RC = 90,

    GEqF_RC = 91,
    GEqI_RC = 92,

    AndB_RC = 93,
    OrB_RC = 94,

    SelF_RRR = 97,
    SelI_RRR = 98,
    SelB_RRR = 99,

    MovX_R = 102,
    MovX_C = 103,
    LoadF = 104,
    LoadI = 105,
    StoreF = 106,
    StoreI = 107,

    Call = 108,
}

const FIRST_UNARY: u32 = 1;
const LAST_UNARY: u32 = 25;
const FIRST_BINARY: u32 = 26;
const LAST_BINARY: u32 = 60;
const FIRST_BINARY_WITH_CONSTANT: u32 = 61;
const LAST_BINARY_WITH_CONSTANT: u32 = 95;
const FIRST_TERNARY: u32 = 96;
const LAST_TERNARY: u32 = 100;

impl OpCode {
    pub fn is_unary(self) -> bool {
        let v = self as u32;
        v > FIRST_UNARY && v < LAST_UNARY
    }

    pub fn is_binary(self) -> bool {
        let v = self as u32;
        v > FIRST_BINARY && v < LAST_BINARY
    }

    pub fn is_binary_with_constant(self) -> bool {
        let v = self as u32;
        v > FIRST_BINARY_WITH_CONSTANT && v < LAST_BINARY_WITH_CONSTANT
    }

    pub fn is_ternary(self) -> bool {
        let v = self as u32;
        v > FIRST_TERNARY && v < LAST_TERNARY
    }

    /// The register-register twin of a binary-with-constant opcode. The two
    /// groups are laid out with identical offsets
    pub fn without_constant(self) -> OpCode {
        debug_assert!(self.is_binary_with_constant());
        let v = self as u32 - (FIRST_BINARY_WITH_CONSTANT - FIRST_BINARY);
        OpCode::from_u32(v).expect("mismatched binary opcode groups")
    }

    /// Number of operand storage words following the opcode, None for
    /// variable length (Call)
    pub fn operand_count(self) -> Option<u32> {
        if self.is_unary() {
            Some(2)
        } else if self.is_binary() || self.is_binary_with_constant() {
            Some(3)
        } else if self.is_ternary() {
            Some(4)
        } else {
            match self {
                OpCode::MovX_R
                | OpCode::MovX_C
                | OpCode::LoadF
                | OpCode::LoadI
                | OpCode::StoreF
                | OpCode::StoreI => Some(2),
                OpCode::Nop => Some(0),
                OpCode::Call => None,
                // every remaining opcode belongs to one of the groups above
                _ => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_groups_line_up() {
        assert_eq!(OpCode::AddF_RC.without_constant(), OpCode::AddF_RR);
        assert_eq!(OpCode::OrB_RC.without_constant(), OpCode::OrB_RR);
        assert_eq!(OpCode::GEqI_RC.without_constant(), OpCode::GEqI_RR);
    }

    #[test]
    fn round_trips_through_u32() {
        for v in 0..120u32 {
            if let Some(op) = OpCode::from_u32(v) {
                assert_eq!(op as u32, v);
                assert!(!op.name().is_empty());
            }
        }
    }
}
