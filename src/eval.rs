use std::fmt;

use log::{debug, trace};

use crate::error::{Fault, RuntimeError};
use crate::sink::DebugSink;
use crate::syntax::{Cmp, Instr, Op2, Program, Reg, Val, Word, NUM_REGISTERS};

/// Resource bounds for one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub call_stack: usize,
    pub data_stack: usize,
    pub max_steps: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            call_stack: 1024,
            data_stack: 1024,
            max_steps: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// An `exit` instruction ran.
    Exit,
    /// The program counter ran past the last instruction.
    EndOfProgram,
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Halt::Exit => f.write_str("exit"),
            Halt::EndOfProgram => f.write_str("end of program"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Halted(Halt),
}

/// Externally visible machine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub pc: usize,
    pub registers: [Word; NUM_REGISTERS],
    pub flag: bool,
    pub guard: Option<bool>,
    pub call_depth: usize,
    pub data_depth: usize,
    pub steps: u64,
}

impl Snapshot {
    pub fn register(&self, r: Reg) -> Word {
        self.registers[r.index()]
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pc = {}", self.pc)?;
        for r in Reg::ALL.iter() {
            write!(f, ", {} = {}", r, self.register(*r))?;
        }
        write!(
            f,
            ", flag = {}, call depth = {}, data depth = {}, steps = {}",
            self.flag, self.call_depth, self.data_depth, self.steps
        )
    }
}

fn eval_op2(op: Op2, m: Word, n: Word) -> Result<Word, RuntimeError> {
    match op {
        Op2::Add => Ok(m.wrapping_add(n)),
        Op2::Sub => Ok(m.wrapping_sub(n)),
        Op2::Mul => Ok(m.wrapping_mul(n)),
        Op2::Div if n == 0 => Err(RuntimeError::DivisionByZero),
        Op2::Div => Ok(m.wrapping_div(n)),
        Op2::Mod if n == 0 => Err(RuntimeError::DivisionByZero),
        Op2::Mod => Ok(m.wrapping_rem(n)),
    }
}

fn eval_cmp(cmp: Cmp, m: Word, n: Word) -> bool {
    match cmp {
        Cmp::Lt => m < n,
        Cmp::Gt => m > n,
        Cmp::Le => m <= n,
        Cmp::Ge => m >= n,
        Cmp::Eq => m == n,
        Cmp::Ne => m != n,
    }
}

/// A register machine executing one borrowed program.
///
/// `then` does not look ahead: it arms `guard`, and the next fetch consumes
/// it, skipping the fetched instruction when the guard is false. A host can
/// stop between any two calls to `step` and resume later.
pub struct Machine<'p, S> {
    program: &'p Program,
    limits: Limits,
    pc: usize,
    registers: [Word; NUM_REGISTERS],
    flag: bool,
    guard: Option<bool>,
    call_stack: Vec<usize>,
    data_stack: Vec<Word>,
    halted: Option<Halt>,
    steps: u64,
    sink: S,
}

impl<'p, S: DebugSink> Machine<'p, S> {
    pub fn new(program: &'p Program, limits: Limits, sink: S) -> Machine<'p, S> {
        Machine {
            program,
            limits,
            pc: program.entry,
            registers: [0; NUM_REGISTERS],
            flag: false,
            guard: None,
            call_stack: Vec::new(),
            data_stack: Vec::new(),
            halted: None,
            steps: 0,
            sink,
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn register(&self, r: Reg) -> Word {
        self.registers[r.index()]
    }

    pub fn flag(&self) -> bool {
        self.flag
    }

    pub fn halted(&self) -> Option<Halt> {
        self.halted
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            pc: self.pc,
            registers: self.registers,
            flag: self.flag,
            guard: self.guard,
            call_depth: self.call_stack.len(),
            data_depth: self.data_stack.len(),
            steps: self.steps,
        }
    }

    fn fault(&self, error: RuntimeError) -> Fault {
        let state = self.snapshot();
        debug!("fault at pc {}: {}", state.pc, error);
        Fault { error, state }
    }

    fn val(&self, v: Val) -> Word {
        match v {
            Val::Reg(r) => self.registers[r.index()],
            Val::Imm(n) => n,
        }
    }

    fn set(&mut self, r: Reg, n: Word) {
        self.registers[r.index()] = n;
    }

    /// Executes one instruction, or skips it if a false guard is pending.
    pub fn step(&mut self) -> Result<Status, Fault> {
        if let Some(halt) = self.halted {
            return Ok(Status::Halted(halt));
        }
        let instr = match self.program.instrs.get(self.pc) {
            Some(instr) => *instr,
            None => {
                trace!("pc {} is past the end of the program", self.pc);
                self.halted = Some(Halt::EndOfProgram);
                return Ok(Status::Halted(Halt::EndOfProgram));
            }
        };
        if let Some(limit) = self.limits.max_steps {
            if self.steps >= limit {
                return Err(self.fault(RuntimeError::StepLimitExceeded { limit }));
            }
        }

        let guard = self.guard.take();
        if guard == Some(false) {
            trace!("{:>4}: skip {:?}", self.pc, instr);
            self.pc += 1;
            self.steps += 1;
            return Ok(Status::Running);
        }
        trace!("{:>4}: {:?}", self.pc, instr);
        match self.exec(instr) {
            Ok(status) => {
                self.steps += 1;
                Ok(status)
            }
            Err(error) => {
                self.guard = guard;
                Err(self.fault(error))
            }
        }
    }

    fn exec(&mut self, instr: Instr) -> Result<Status, RuntimeError> {
        let next = self.pc + 1;
        match instr {
            Instr::Set(r, n) => self.set(r, n),
            Instr::Mov(r, v) => {
                let n = self.val(v);
                self.set(r, n);
            }
            Instr::Op2(r, op, v) => {
                let n = eval_op2(op, self.registers[r.index()], self.val(v))?;
                self.set(r, n);
            }
            Instr::Neg(r) => {
                let n = self.registers[r.index()].wrapping_neg();
                self.set(r, n);
            }
            Instr::Cmp(cmp, x, y) => self.flag = eval_cmp(cmp, self.val(x), self.val(y)),
            Instr::Then => {
                self.guard = Some(self.flag);
                self.flag = false;
            }
            Instr::Unless => {
                self.guard = Some(!self.flag);
                self.flag = false;
            }
            Instr::Jmp(target) => {
                self.pc = target;
                return Ok(Status::Running);
            }
            Instr::Call(target) => {
                if self.call_stack.len() >= self.limits.call_stack {
                    return Err(RuntimeError::CallStackOverflow {
                        limit: self.limits.call_stack,
                    });
                }
                self.call_stack.push(next);
                self.pc = target;
                return Ok(Status::Running);
            }
            Instr::Ret => match self.call_stack.pop() {
                Some(addr) => {
                    self.pc = addr;
                    return Ok(Status::Running);
                }
                None => return Err(RuntimeError::CallStackUnderflow),
            },
            Instr::Push(v) => {
                if self.data_stack.len() >= self.limits.data_stack {
                    return Err(RuntimeError::DataStackOverflow {
                        limit: self.limits.data_stack,
                    });
                }
                let n = self.val(v);
                self.data_stack.push(n);
            }
            Instr::Pop(r) => match self.data_stack.pop() {
                Some(n) => self.set(r, n),
                None => return Err(RuntimeError::DataStackUnderflow),
            },
            Instr::Dbg(v, width) => {
                let n = self.val(v);
                self.sink.write(n, width);
            }
            Instr::Exit => {
                self.halted = Some(Halt::Exit);
                return Ok(Status::Halted(Halt::Exit));
            }
            Instr::Nop => {}
        }
        self.pc = next;
        Ok(Status::Running)
    }

    /// Steps until the machine halts or faults.
    pub fn run(&mut self) -> Result<Halt, Fault> {
        loop {
            if let Status::Halted(halt) = self.step()? {
                debug!("halted ({:?}) after {} step(s)", halt, self.steps);
                return Ok(halt);
            }
        }
    }
}

/// Runs `program` to completion and returns how it halted with the final
/// state.
pub fn eval<S: DebugSink>(
    program: &Program,
    limits: Limits,
    sink: S,
) -> Result<(Halt, Snapshot), Fault> {
    let mut machine = Machine::new(program, limits, sink);
    let halt = machine.run()?;
    Ok((halt, machine.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::lexer::lex;

    fn program(source: &str) -> Program {
        assemble(&lex(source).unwrap()).unwrap()
    }

    fn run_with(source: &str, limits: Limits) -> (Result<(Halt, Snapshot), Fault>, Vec<(Word, Word)>) {
        let p = program(source);
        let mut out = Vec::new();
        let r = eval(&p, limits, &mut out);
        (r, out)
    }

    fn run(source: &str) -> (Halt, Snapshot, Vec<(Word, Word)>) {
        let (r, out) = run_with(source, Limits::default());
        let (halt, state) = r.unwrap();
        (halt, state, out)
    }

    fn fault(source: &str) -> Fault {
        run_with(source, Limits::default()).0.unwrap_err()
    }

    #[test]
    fn initial_state() {
        let p = program("nop\nmain:\n exit\n");
        let m = Machine::new(&p, Limits::default(), Vec::new());
        let s = m.snapshot();
        assert_eq!(s.pc, 1);
        assert_eq!(s.registers, [0; NUM_REGISTERS]);
        assert!(!s.flag);
        assert_eq!(s.guard, None);
        assert_eq!((s.call_depth, s.data_depth), (0, 0));
    }

    #[test]
    fn arithmetic_wraps() {
        let (_, s, _) = run(
            "main:\n\
             set a, 0x7FFFFFFF\n\
             add a, 1\n\
             set b, 7\n\
             mul b, -3\n\
             set c, -7\n\
             mod c, 2\n\
             set d, -20\n\
             div d, 6\n\
             neg z\n\
             sub z, 5\n",
        );
        assert_eq!(s.register(Reg::A), Word::MIN);
        assert_eq!(s.register(Reg::B), -21);
        assert_eq!(s.register(Reg::C), -1);
        assert_eq!(s.register(Reg::D), -3);
        assert_eq!(s.register(Reg::Z), -5);
    }

    #[test]
    fn division_by_zero_faults() {
        let f = fault("main:\n set a, 4\n div a, z\n");
        assert_eq!(f.error, RuntimeError::DivisionByZero);
        assert_eq!(f.state.pc, 1);
        assert_eq!(f.state.register(Reg::A), 4);
    }

    #[test]
    fn then_skips_when_the_flag_is_false() {
        let (_, s, _) = run("main:\n lt b, a\n then\n set c, 1\n set d, 1\n");
        assert_eq!(s.register(Reg::C), 0);
        assert_eq!(s.register(Reg::D), 1);
    }

    #[test]
    fn then_runs_when_the_flag_is_true() {
        let (_, s, _) = run("main:\n set b, 5\n lt a, b\n then\n set c, 1\n set d, 1\n");
        assert_eq!(s.register(Reg::C), 1);
        assert_eq!(s.register(Reg::D), 1);
    }

    #[test]
    fn then_consumes_the_flag_exactly_once() {
        // The second `then` sees a cleared flag even though `lt` was true.
        let (_, s, _) = run(
            "main:\n\
             set b, 1\n\
             lt a, b\n\
             then\n\
             set c, 1\n\
             then\n\
             set d, 1\n",
        );
        assert_eq!(s.register(Reg::C), 1);
        assert_eq!(s.register(Reg::D), 0);
        assert!(!s.flag);
    }

    #[test]
    fn unless_inverts_the_guard() {
        let (_, s, _) = run("main:\n lt a, a\n unless\n set c, 1\n set b, 1\n lt a, b\n unless\n set d, 1\n");
        assert_eq!(s.register(Reg::C), 1);
        assert_eq!(s.register(Reg::D), 0);
    }

    #[test]
    fn skipped_jump_falls_through() {
        let (_, s, _) = run("main:\n gt a, 1\n then\n jmp away\n set a, 9\n exit\naway:\n set b, 9\n");
        assert_eq!(s.register(Reg::A), 9);
        assert_eq!(s.register(Reg::B), 0);
    }

    #[test]
    fn guard_survives_a_pause_between_steps() {
        let p = program("main:\n set b, 1\n lt a, b\n then\n set c, 7\n dbg c, 2\n exit\n");
        let mut m = Machine::new(&p, Limits::default(), Vec::new());
        for _ in 0..2 {
            assert_eq!(m.step().unwrap(), Status::Running);
        }
        assert!(m.flag());
        assert_eq!(m.step().unwrap(), Status::Running);
        let paused = m.snapshot();
        assert_eq!(paused.guard, Some(true));
        assert!(!paused.flag);
        assert!(!m.flag());
        assert_eq!(m.step().unwrap(), Status::Running);
        assert_eq!(m.register(Reg::C), 7);
        assert_eq!(m.step().unwrap(), Status::Running);
        assert_eq!(m.sink(), &vec![(7, 2)]);
        assert_eq!(m.halted(), None);
        assert_eq!(m.step().unwrap(), Status::Halted(Halt::Exit));
        assert_eq!(m.halted(), Some(Halt::Exit));
        assert_eq!(m.step().unwrap(), Status::Halted(Halt::Exit));
        assert_eq!(m.into_sink(), vec![(7, 2)]);
    }

    #[test]
    fn call_returns_one_past_the_call_site() {
        let p = program("main:\n call f\n set a, 1\n exit\nf:\n ret\n");
        let mut m = Machine::new(&p, Limits::default(), Vec::new());
        m.step().unwrap();
        assert_eq!(m.pc(), 3);
        assert_eq!(m.snapshot().call_depth, 1);
        m.step().unwrap();
        assert_eq!(m.pc(), 1);
        assert_eq!(m.snapshot().call_depth, 0);
    }

    #[test]
    fn stacks_are_independent() {
        let (_, s, _) = run(
            "main:\n\
             set a, 11\n\
             push a\n\
             push 22\n\
             call f\n\
             pop b\n\
             pop c\n\
             exit\n\
             f:\n\
             ret\n",
        );
        assert_eq!(s.register(Reg::B), 22);
        assert_eq!(s.register(Reg::C), 11);
        assert_eq!(s.data_depth, 0);
    }

    #[test]
    fn ret_without_call_underflows() {
        let f = fault("main:\n ret\n");
        assert_eq!(f.error, RuntimeError::CallStackUnderflow);
        assert_eq!(f.state.pc, 0);
    }

    #[test]
    fn pop_on_empty_stack_underflows() {
        let f = fault("main:\n set a, 3\n pop a\n");
        assert_eq!(f.error, RuntimeError::DataStackUnderflow);
        assert_eq!(f.state.register(Reg::A), 3);
        assert_eq!(f.state.pc, 1);
    }

    #[test]
    fn unbounded_recursion_overflows_the_call_stack() {
        let limits = Limits {
            call_stack: 16,
            ..Limits::default()
        };
        let f = run_with("main:\n call main\n", limits).0.unwrap_err();
        assert_eq!(f.error, RuntimeError::CallStackOverflow { limit: 16 });
        assert_eq!(f.state.call_depth, 16);
    }

    #[test]
    fn unbounded_pushes_overflow_the_data_stack() {
        let limits = Limits {
            data_stack: 4,
            ..Limits::default()
        };
        let f = run_with("main:\n push a\n jmp main\n", limits).0.unwrap_err();
        assert_eq!(f.error, RuntimeError::DataStackOverflow { limit: 4 });
        assert_eq!(f.state.data_depth, 4);
    }

    #[test]
    fn step_limit_stops_infinite_loops() {
        let limits = Limits {
            max_steps: Some(10),
            ..Limits::default()
        };
        let f = run_with("main:\n jmp main\n", limits).0.unwrap_err();
        assert_eq!(f.error, RuntimeError::StepLimitExceeded { limit: 10 });
        assert_eq!(f.state.steps, 10);
    }

    #[test]
    fn running_off_the_end_halts() {
        let (halt, s, _) = run("main:\n set a, 1\n");
        assert_eq!(halt, Halt::EndOfProgram);
        assert_eq!(s.pc, 1);
    }

    #[test]
    fn dbg_passes_value_and_width_through() {
        let (halt, _, out) = run("main:\n set a, -4\n dbg a, 3\n dbg 12, 0\n exit\n dbg a, 1\n");
        assert_eq!(halt, Halt::Exit);
        assert_eq!(out, vec![(-4, 3), (12, 0)]);
    }

    #[test]
    fn fault_reports_the_guard_of_the_failing_instruction() {
        let f = fault("main:\n set b, 1\n lt a, b\n then\n ret\n");
        assert_eq!(f.error, RuntimeError::CallStackUnderflow);
        assert_eq!(f.state.guard, Some(true));
        assert_eq!(f.state.pc, 3);
    }
}
