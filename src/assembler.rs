use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::error::CompileError;
use crate::lexer::{Tok, Token};
use crate::syntax::{Cmp, Instr, Loc, Op2, Program, Reg, Val, Word};

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Name(String),
    Int(Word),
}

#[derive(Debug)]
struct Stmt {
    mnemonic: String,
    operands: Vec<(Operand, Loc)>,
    loc: Loc,
}

#[derive(Debug)]
struct Line {
    labels: Vec<(String, Loc)>,
    stmt: Option<Stmt>,
}

fn unexpected(t: &Token, mnemonic: &str, expected: &str) -> CompileError {
    CompileError::Operand {
        loc: t.loc,
        mnemonic: mnemonic.to_string(),
        msg: format!("expected {}, found `{}`", expected, t.tok),
    }
}

/// Splits the canonical token stream into lines of `label:`* followed by at
/// most one statement.
fn parse_lines(tokens: &[Token]) -> Result<Vec<Line>, CompileError> {
    let mut lines = Vec::new();
    for chunk in tokens.split(|t| t.tok == Tok::Newline) {
        let mut iter = chunk.iter().peekable();
        let mut labels = Vec::new();
        while let Some(Token { tok: Tok::Label(name), loc }) = iter.peek() {
            labels.push((name.clone(), *loc));
            iter.next();
        }
        let stmt = match iter.next() {
            None => None,
            Some(Token { tok: Tok::Ident(mnemonic), loc }) => {
                let mut operands = Vec::new();
                while let Some(t) = iter.next() {
                    let operand = match &t.tok {
                        Tok::Ident(s) => Operand::Name(s.clone()),
                        Tok::Int(n) => Operand::Int(*n),
                        _ => return Err(unexpected(t, mnemonic, "an operand")),
                    };
                    operands.push((operand, t.loc));
                    match iter.next() {
                        None => break,
                        Some(Token { tok: Tok::Comma, .. }) => continue,
                        Some(t) => return Err(unexpected(t, mnemonic, "`,` or end of line")),
                    }
                }
                Some(Stmt {
                    mnemonic: mnemonic.clone(),
                    operands,
                    loc: *loc,
                })
            }
            Some(t) => return Err(unexpected(t, &t.tok.to_string(), "an instruction")),
        };
        if !labels.is_empty() || stmt.is_some() {
            lines.push(Line { labels, stmt });
        }
    }
    Ok(lines)
}

/// Pass 1: binds every label to the index of the instruction that follows it.
fn bind_labels(lines: &[Line]) -> Result<HashMap<String, (usize, Loc)>, CompileError> {
    let mut table: HashMap<String, (usize, Loc)> = HashMap::new();
    let mut index = 0;
    for line in lines {
        for (name, loc) in &line.labels {
            if let Some((_, first)) = table.get(name) {
                return Err(CompileError::DuplicateLabel {
                    loc: *loc,
                    name: name.clone(),
                    first: *first,
                });
            }
            table.insert(name.clone(), (index, *loc));
        }
        if line.stmt.is_some() {
            index += 1;
        }
    }
    Ok(table)
}

struct Encoder<'a> {
    stmt: &'a Stmt,
    labels: &'a HashMap<String, (usize, Loc)>,
}

impl<'a> Encoder<'a> {
    fn error(&self, loc: Loc, msg: String) -> CompileError {
        CompileError::Operand {
            loc,
            mnemonic: self.stmt.mnemonic.clone(),
            msg,
        }
    }

    fn arity(&self, n: usize) -> Result<(), CompileError> {
        let got = self.stmt.operands.len();
        if got == n {
            Ok(())
        } else {
            Err(self.error(
                self.stmt.loc,
                format!("expects {} operand(s), got {}", n, got),
            ))
        }
    }

    fn reg(&self, i: usize) -> Result<Reg, CompileError> {
        let (operand, loc) = &self.stmt.operands[i];
        match operand {
            Operand::Name(s) => Reg::from_name(s)
                .ok_or_else(|| self.error(*loc, format!("`{}` is not a register", s))),
            Operand::Int(n) => Err(self.error(
                *loc,
                format!("operand {} must be a register, found immediate {}", i + 1, n),
            )),
        }
    }

    fn val(&self, i: usize) -> Result<Val, CompileError> {
        match &self.stmt.operands[i].0 {
            Operand::Int(n) => Ok(Val::Imm(*n)),
            Operand::Name(_) => self.reg(i).map(Val::Reg),
        }
    }

    fn imm(&self, i: usize) -> Result<Word, CompileError> {
        match &self.stmt.operands[i] {
            (Operand::Int(n), _) => Ok(*n),
            (Operand::Name(s), loc) => Err(self.error(
                *loc,
                format!("operand {} must be an immediate, found `{}`", i + 1, s),
            )),
        }
    }

    fn label(&self, i: usize) -> Result<usize, CompileError> {
        match &self.stmt.operands[i] {
            (Operand::Name(s), loc) => match self.labels.get(s) {
                Some((index, _)) => Ok(*index),
                None => Err(CompileError::UnresolvedLabel {
                    loc: *loc,
                    name: s.clone(),
                }),
            },
            (Operand::Int(n), loc) => Err(self.error(
                *loc,
                format!("jump targets must be labels, found immediate {}", n),
            )),
        }
    }

    fn nullary(&self, instr: Instr) -> Result<Instr, CompileError> {
        self.arity(0)?;
        Ok(instr)
    }

    fn op2(&self, op: Op2) -> Result<Instr, CompileError> {
        self.arity(2)?;
        Ok(Instr::Op2(self.reg(0)?, op, self.val(1)?))
    }

    fn cmp(&self, cmp: Cmp) -> Result<Instr, CompileError> {
        self.arity(2)?;
        Ok(Instr::Cmp(cmp, self.val(0)?, self.val(1)?))
    }

    /// Pass 2: one statement to one instruction.
    fn encode(&self) -> Result<Instr, CompileError> {
        match self.stmt.mnemonic.as_str() {
            "set" => {
                self.arity(2)?;
                Ok(Instr::Set(self.reg(0)?, self.imm(1)?))
            }
            "mov" => {
                self.arity(2)?;
                Ok(Instr::Mov(self.reg(0)?, self.val(1)?))
            }
            "add" => self.op2(Op2::Add),
            "sub" => self.op2(Op2::Sub),
            "mul" => self.op2(Op2::Mul),
            "div" => self.op2(Op2::Div),
            "mod" => self.op2(Op2::Mod),
            "neg" => {
                self.arity(1)?;
                Ok(Instr::Neg(self.reg(0)?))
            }
            "lt" => self.cmp(Cmp::Lt),
            "gt" => self.cmp(Cmp::Gt),
            "le" => self.cmp(Cmp::Le),
            "ge" => self.cmp(Cmp::Ge),
            "eq" => self.cmp(Cmp::Eq),
            "ne" => self.cmp(Cmp::Ne),
            "then" => self.nullary(Instr::Then),
            "unless" => self.nullary(Instr::Unless),
            "jmp" => {
                self.arity(1)?;
                Ok(Instr::Jmp(self.label(0)?))
            }
            "call" => {
                self.arity(1)?;
                Ok(Instr::Call(self.label(0)?))
            }
            "ret" => self.nullary(Instr::Ret),
            "push" => {
                self.arity(1)?;
                Ok(Instr::Push(self.val(0)?))
            }
            "pop" => {
                self.arity(1)?;
                Ok(Instr::Pop(self.reg(0)?))
            }
            "dbg" => {
                self.arity(2)?;
                Ok(Instr::Dbg(self.val(0)?, self.imm(1)?))
            }
            "exit" => self.nullary(Instr::Exit),
            "nop" => self.nullary(Instr::Nop),
            _ => Err(CompileError::UnknownInstruction {
                loc: self.stmt.loc,
                mnemonic: self.stmt.mnemonic.clone(),
            }),
        }
    }
}

/// Assembles a canonical (fully macro-expanded) token stream.
pub fn assemble(tokens: &[Token]) -> Result<Program, CompileError> {
    let lines = parse_lines(tokens)?;
    let table = bind_labels(&lines)?;
    debug!("pass 1 bound {} label(s)", table.len());

    let mut instrs = Vec::new();
    let mut locs = Vec::new();
    for stmt in lines.iter().filter_map(|line| line.stmt.as_ref()) {
        let encoder = Encoder {
            stmt,
            labels: &table,
        };
        instrs.push(encoder.encode()?);
        locs.push(stmt.loc);
    }

    let entry = match table.get("main") {
        Some((index, _)) => *index,
        None => return Err(CompileError::MissingEntryPoint),
    };
    debug!("assembled {} instruction(s), entry at {}", instrs.len(), entry);

    let labels: BTreeMap<String, usize> = table
        .into_iter()
        .map(|(name, (index, _))| (name, index))
        .collect();
    Ok(Program {
        instrs,
        locs,
        labels,
        entry,
    })
}
