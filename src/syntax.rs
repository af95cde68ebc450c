use std::collections::BTreeMap;
use std::fmt;

pub type Word = i32;

/// A position in the source text, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Loc {
    pub line: usize,
    pub column: usize,
}

impl Loc {
    pub fn new(line: usize, column: usize) -> Loc {
        Loc { line, column }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

pub const NUM_REGISTERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Z,
    A,
    B,
    C,
    D,
}

impl Reg {
    pub const ALL: [Reg; NUM_REGISTERS] = [Reg::Z, Reg::A, Reg::B, Reg::C, Reg::D];

    pub fn from_name(name: &str) -> Option<Reg> {
        match name {
            "z" => Some(Reg::Z),
            "a" => Some(Reg::A),
            "b" => Some(Reg::B),
            "c" => Some(Reg::C),
            "d" => Some(Reg::D),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Z => "z",
            Reg::A => "a",
            Reg::B => "b",
            Reg::C => "c",
            Reg::D => "d",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Val {
    Reg(Reg),
    Imm(Word),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op2 {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

/// One assembled instruction. Jump targets are already resolved to
/// instruction indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Set(Reg, Word),
    Mov(Reg, Val),
    Op2(Reg, Op2, Val),
    Neg(Reg),
    Cmp(Cmp, Val, Val),
    Then,
    Unless,
    Jmp(usize),
    Call(usize),
    Ret,
    Push(Val),
    Pop(Reg),
    Dbg(Val, Word),
    Exit,
    Nop,
}

const KIND_NONE: u8 = 0;
const KIND_REG: u8 = 1;
const KIND_IMM: u8 = 2;
const KIND_ADDR: u8 = 3;

/// Size in bytes of one record produced by `Instr::encode_into`.
pub const RECORD_LEN: usize = 12;

#[derive(Clone, Copy)]
enum Field {
    None,
    Reg(Reg),
    Imm(Word),
    Addr(usize),
}

impl From<Val> for Field {
    fn from(v: Val) -> Field {
        match v {
            Val::Reg(r) => Field::Reg(r),
            Val::Imm(n) => Field::Imm(n),
        }
    }
}

impl Field {
    fn kind_and_bits(self) -> (u8, u32) {
        match self {
            Field::None => (KIND_NONE, 0),
            Field::Reg(r) => (KIND_REG, r.index() as u32),
            Field::Imm(n) => (KIND_IMM, n as u32),
            Field::Addr(a) => (KIND_ADDR, a as u32),
        }
    }
}

impl Instr {
    fn fields(&self) -> (u8, u8, Field, Field) {
        match *self {
            Instr::Set(r, n) => (0, 0, Field::Reg(r), Field::Imm(n)),
            Instr::Mov(r, v) => (1, 0, Field::Reg(r), v.into()),
            Instr::Op2(r, op, v) => (2, op as u8, Field::Reg(r), v.into()),
            Instr::Neg(r) => (3, 0, Field::Reg(r), Field::None),
            Instr::Cmp(c, x, y) => (4, c as u8, x.into(), y.into()),
            Instr::Then => (5, 0, Field::None, Field::None),
            Instr::Unless => (6, 0, Field::None, Field::None),
            Instr::Jmp(t) => (7, 0, Field::Addr(t), Field::None),
            Instr::Call(t) => (8, 0, Field::Addr(t), Field::None),
            Instr::Ret => (9, 0, Field::None, Field::None),
            Instr::Push(v) => (10, 0, v.into(), Field::None),
            Instr::Pop(r) => (11, 0, Field::Reg(r), Field::None),
            Instr::Dbg(v, w) => (12, 0, v.into(), Field::Imm(w)),
            Instr::Exit => (13, 0, Field::None, Field::None),
            Instr::Nop => (14, 0, Field::None, Field::None),
        }
    }

    /// Appends the fixed-shape record for this instruction:
    /// opcode, sub-op, two operand kinds, then two little-endian operands.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let (opcode, sub, x, y) = self.fields();
        let (kx, bx) = x.kind_and_bits();
        let (ky, by) = y.kind_and_bits();
        out.extend_from_slice(&[opcode, sub, kx, ky]);
        out.extend_from_slice(&bx.to_le_bytes());
        out.extend_from_slice(&by.to_le_bytes());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub instrs: Vec<Instr>,
    /// Source location of each instruction, parallel to `instrs`.
    pub locs: Vec<Loc>,
    pub labels: BTreeMap<String, usize>,
    pub entry: usize,
}

impl Program {
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.instrs.len() * RECORD_LEN);
        out.extend_from_slice(&(self.entry as u32).to_le_bytes());
        for instr in &self.instrs {
            instr.encode_into(&mut out);
        }
        out
    }
}
