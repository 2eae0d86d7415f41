use crate::bytecode::{FunDecl, Module, Opcode, RegId};
use crate::types::{integer, numeric, Type, TypeKind, TypeSet};
use enumflags2::BitFlags;
use thiserror::Error;
use tracing::debug;


// Static per-function checks, run before a module is executed or
// serialized. The interpreter relies on these holding: it does not
// re-check types or jump targets at runtime.


pub type Result<T> = core::result::Result<T, VerifyError>;


// The first violation found, located by function index and instruction
// offset.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("function {fun} @{pos}: {rule}")]
pub struct VerifyError {
    pub fun: usize,
    pub pos: usize,
    pub rule: Rule,
}


#[derive(Clone, Debug, Error, PartialEq)]
pub enum Rule {
    #[error("expected {expect:?}, got {got:?}")]
    Expected { expect: TypeSet, got: TypeKind },
    #[error("register types differ: {a} vs {b}")]
    Mismatch { a: Type, b: Type },
    #[error("register r{0} out of bounds")]
    BadReg(RegId),
    #[error("global @{0} out of bounds")]
    BadGlobal(usize),
    #[error("float constant @{0} out of bounds")]
    BadFloat(usize),
    #[error("global @{0} is not a function")]
    NotAFunction(usize),
    #[error("arity mismatch: expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("immediate {0} does not fit in ui8")]
    BadImmediate(i32),
    #[error("jump lands outside the function (delta {0})")]
    BadJump(i32),
    #[error("{declared} registers cannot hold {args} arguments")]
    MissingArgRegs { declared: usize, args: usize },
    #[error("argument register r{0} has the wrong type")]
    ArgReg(usize),
}


// Check every function of a module.
pub fn verify(module: &Module) -> Result<()> {
    for f in &module.functions {
        verify_fun(module, f)?;
    }
    debug!("verified {} functions", module.functions.len());
    Ok(())
}


pub fn verify_fun(module: &Module, f: &FunDecl) -> Result<()> {
    Verifier { module, f }.run()
}


struct Verifier<'a> {
    module: &'a Module,
    f: &'a FunDecl,
}

impl<'a> Verifier<'a> {
    fn run(&self) -> Result<()> {
        let (args, ret) = self.signature()?;

        if self.f.regs.len() < args.len() {
            return Err(self.err(0, Rule::MissingArgRegs {
                declared: self.f.regs.len(),
                args: args.len(),
            }));
        }
        for (i, arg) in args.iter().enumerate() {
            if self.f.regs[i] != **arg {
                return Err(self.err(0, Rule::ArgReg(i)));
            }
        }

        for (pos, op) in self.f.code.iter().enumerate() {
            self.op(pos, op, &ret)?;
        }
        Ok(())
    }

    // The function's own global slot must carry its signature.
    fn signature(&self) -> Result<(Vec<crate::ast::Node<Type>>, Type)> {
        let slot = self
            .module
            .globals
            .get(self.f.index)
            .ok_or_else(|| self.err(0, Rule::BadGlobal(self.f.index)))?;
        match slot.as_fun() {
            Some((args, ret)) => Ok((args.to_vec(), ret.clone())),
            None => Err(self.err(0, Rule::NotAFunction(self.f.index))),
        }
    }

    fn err(&self, pos: usize, rule: Rule) -> VerifyError {
        VerifyError {
            fun: self.f.index,
            pos,
            rule,
        }
    }

    fn reg(&self, pos: usize, r: RegId) -> Result<&Type> {
        self.f
            .regs
            .get(r)
            .ok_or_else(|| self.err(pos, Rule::BadReg(r)))
    }

    // The register must hold one of the expected kinds; its exact type
    // is returned for further agreement checks.
    fn expect(&self, pos: usize, r: RegId, expect: TypeSet) -> Result<&Type> {
        let ty = self.reg(pos, r)?;
        if expect.contains(ty.kind()) {
            Ok(ty)
        } else {
            Err(self.err(pos, Rule::Expected {
                expect,
                got: ty.kind(),
            }))
        }
    }

    fn same(&self, pos: usize, a: RegId, b: RegId) -> Result<()> {
        let ta = self.reg(pos, a)?;
        let tb = self.reg(pos, b)?;
        if ta == tb {
            Ok(())
        } else {
            Err(self.err(pos, Rule::Mismatch {
                a: ta.clone(),
                b: tb.clone(),
            }))
        }
    }

    // The called global must hold a function whose signature agrees
    // with the argument registers and the destination.
    fn call(&self, pos: usize, dst: RegId, g: usize, args: &[RegId]) -> Result<()> {
        let slot = self
            .module
            .globals
            .get(g)
            .ok_or_else(|| self.err(pos, Rule::BadGlobal(g)))?;
        self.callee(pos, dst, slot, args, g)
    }

    fn callee(&self, pos: usize, dst: RegId, ty: &Type, args: &[RegId], at: usize) -> Result<()> {
        let (want, ret) = match ty.as_fun() {
            Some(sig) => sig,
            None => return Err(self.err(pos, Rule::NotAFunction(at))),
        };
        if want.len() != args.len() {
            return Err(self.err(pos, Rule::Arity {
                expected: want.len(),
                got: args.len(),
            }));
        }
        for (r, want) in args.iter().zip(want.iter()) {
            let ta = self.reg(pos, *r)?;
            if ta != &**want {
                return Err(self.err(pos, Rule::Mismatch {
                    a: ta.clone(),
                    b: (**want).clone(),
                }));
            }
        }
        let td = self.reg(pos, dst)?;
        if td != ret {
            return Err(self.err(pos, Rule::Mismatch {
                a: td.clone(),
                b: ret.clone(),
            }));
        }
        Ok(())
    }

    fn global(&self, pos: usize, r: RegId, g: usize) -> Result<()> {
        let slot = self
            .module
            .globals
            .get(g)
            .ok_or_else(|| self.err(pos, Rule::BadGlobal(g)))?;
        let ty = self.reg(pos, r)?;
        if ty == slot {
            Ok(())
        } else {
            Err(self.err(pos, Rule::Mismatch {
                a: ty.clone(),
                b: slot.clone(),
            }))
        }
    }

    // Every delta must land on an instruction of this function:
    // 0 <= pos + 1 + d < len.
    fn jump(&self, pos: usize, d: i32) -> Result<()> {
        let target = pos as i64 + 1 + d as i64;
        if target < 0 || target >= self.f.code.len() as i64 {
            Err(self.err(pos, Rule::BadJump(d)))
        } else {
            Ok(())
        }
    }

    fn op(&self, pos: usize, op: &Opcode, ret: &Type) -> Result<()> {
        use Opcode::*;
        match op {
            Mov(a, b) => self.same(pos, *a, *b),
            Int(r, i) => {
                let ty = self.expect(pos, *r, integer())?;
                if *ty == Type::UI8 && !(0..=0xFF).contains(i) {
                    return Err(self.err(pos, Rule::BadImmediate(*i)));
                }
                Ok(())
            }
            Float(r, idx) => {
                self.expect(pos, *r, TypeKind::F32 | TypeKind::F64)?;
                if *idx >= self.module.floats.len() {
                    return Err(self.err(pos, Rule::BadFloat(*idx)));
                }
                Ok(())
            }
            Bool(r, _) => {
                self.expect(pos, *r, BitFlags::from_flag(TypeKind::Bool))?;
                Ok(())
            }
            Add(r, a, b) | Sub(r, a, b) => {
                self.expect(pos, *r, numeric())?;
                self.same(pos, *r, *a)?;
                self.same(pos, *r, *b)
            }
            Incr(r) | Decr(r) => {
                self.expect(pos, *r, integer())?;
                Ok(())
            }
            Call0(r, g) => self.call(pos, *r, *g, &[]),
            Call1(r, g, a) => self.call(pos, *r, *g, &[*a]),
            Call2(r, g, a, b) => self.call(pos, *r, *g, &[*a, *b]),
            Call3(r, g, a, b, c) => self.call(pos, *r, *g, &[*a, *b, *c]),
            CallN(r, f, args) => {
                let ty = self.reg(pos, *f)?.clone();
                self.callee(pos, *r, &ty, args, *f)
            }
            GetGlobal(r, g) => self.global(pos, *r, *g),
            SetGlobal(g, r) => self.global(pos, *r, *g),
            Eq(r, a, b) | NotEq(r, a, b) | Lt(r, a, b) | Gte(r, a, b) => {
                self.expect(pos, *r, BitFlags::from_flag(TypeKind::Bool))?;
                self.same(pos, *a, *b)
            }
            Ret(r) => {
                let ty = self.reg(pos, *r)?;
                if ty == ret {
                    Ok(())
                } else {
                    Err(self.err(pos, Rule::Mismatch {
                        a: ty.clone(),
                        b: ret.clone(),
                    }))
                }
            }
            JTrue(r, d) | JFalse(r, d) => {
                self.expect(pos, *r, BitFlags::from_flag(TypeKind::Bool))?;
                self.jump(pos, *d)
            }
            JNull(r, d) | JNotNull(r, d) => {
                self.reg(pos, *r)?;
                self.jump(pos, *d)
            }
            JAlways(d) => self.jump(pos, *d),
            ToAny(r, a) => {
                self.expect(pos, *r, BitFlags::from_flag(TypeKind::Any))?;
                self.reg(pos, *a)?;
                Ok(())
            }
        }
    }
}
