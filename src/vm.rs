// (C) 2020 Brandon Lewis
//
// A virtual machine for compact register-based modules.
//
// *Execution Model*
//
// A module consists of typed global slots, a float constant pool, a
// set of compiled functions and a set of natives to be bound by name
// when the module is loaded. Every function runs over its own register
// file; there is no operand stack.
//
// *Validity*
//
// Every function is verified before the first instruction executes
// (see the verifier module). The interpreter therefore indexes
// registers and globals without rechecking, and treats any value shape
// it still cannot handle as a broken internal invariant, not a user
// error: those panic with an internal-error message.
//
// *Values*
//
// Registers and globals hold tagged values: null, i32, f64, bool,
// function references, bound natives, and boxed "any" values that
// remember the static type they were built from.
//
// *Natives*
//
// Natives are resolved through a loader the host injects; nothing is
// looked up from a process-wide table. Handlers are called
// synchronously and must not retain the argument slice across calls.
//
// *Control flow*
//
// Jump deltas are relative to the instruction after the jump. A frame
// ends at Ret, yielding the value of its register to the caller. Guest
// calls recurse on the host stack, one level per call.

use crate::bytecode::{FunDecl, Module, Opcode};
use crate::types::Type;
use crate::verifier::{self, VerifyError};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use tracing::trace;


// The result of loading or running a module.
pub type Result<T> = core::result::Result<T, Error>;


#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("unresolved native: {0}")]
    UnresolvedNative(String),
    #[error("native {0} is bound to a missing global @{1}")]
    BadNativeSlot(String, usize),
    #[error("entrypoint @{0} is not a callable function taking no arguments")]
    BadEntrypoint(usize),
}


// A bound native handler.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Value>;


// All runtime values.
#[derive(Clone)]
pub enum Value {
    Null,
    Int(i32),
    Float(f64),
    Bool(bool),
    Fun(Rc<FunDecl>),
    Any(Box<Value>, Type),
    Native(NativeFn),
}


impl Value {
    // What an untouched register of the given type holds.
    pub fn default_for(ty: &Type) -> Value {
        match ty {
            Type::Void | Type::Any | Type::Fun(_, _) => Value::Null,
            Type::UI8 | Type::I32 => Value::Int(0),
            Type::F32 | Type::F64 => Value::Float(0.0),
            Type::Bool => Value::Bool(false),
        }
    }
}


impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Fun(fun) => write!(f, "Fun(@{})", fun.index),
            Value::Any(v, ty) => write!(f, "Any({:?}, {})", v, ty),
            Value::Native(_) => write!(f, "Native(..)"),
        }
    }
}


// Structural equality; functions compare by identity (their global
// slot), natives by handler identity.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Fun(a), Value::Fun(b)) => a.index == b.index,
            (Value::Any(va, ta), Value::Any(vb, tb)) => ta == tb && va == vb,
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (_, _) => false,
        }
    }
}


// Resolves host natives by name at module load.
pub trait NativeLoader {
    fn resolve(&self, name: &str) -> Option<NativeFn>;
}

// The empty loader, for modules without natives.
impl NativeLoader for () {
    fn resolve(&self, _name: &str) -> Option<NativeFn> {
        None
    }
}

impl NativeLoader for HashMap<String, NativeFn> {
    fn resolve(&self, name: &str) -> Option<NativeFn> {
        self.get(name).cloned()
    }
}


// What one instruction does to the program counter.
enum ControlFlow {
    Advance,
    Jump(i32),
    Return(Value),
}


// The entire VM state: the module being executed and its global array.
pub struct VM<'m> {
    module: &'m Module,
    globals: Vec<Value>,
}


// Verify, bind and run a module; the result is the value returned by
// its entrypoint.
pub fn interp(module: &Module, loader: &dyn NativeLoader) -> Result<Value> {
    let mut vm = VM::boot(module, loader)?;
    vm.run()
}


impl<'m> VM<'m> {
    // Verify every function, install defaults, functions and natives
    // into the global array.
    pub fn boot(module: &'m Module, loader: &dyn NativeLoader) -> Result<VM<'m>> {
        verifier::verify(module)?;
        let mut globals: Vec<Value> = module.globals.iter().map(Value::default_for).collect();
        for f in &module.functions {
            globals[f.index] = Value::Fun(Rc::new(f.clone()));
        }
        for (name, g) in &module.natives {
            let slot = globals
                .get_mut(*g)
                .ok_or_else(|| Error::BadNativeSlot(name.clone(), *g))?;
            match loader.resolve(name) {
                Some(handler) => *slot = Value::Native(handler),
                None => return Err(Error::UnresolvedNative(name.clone())),
            }
        }
        Ok(VM { module, globals })
    }

    // Call the entrypoint with no arguments.
    pub fn run(&mut self) -> Result<Value> {
        let entry = self.module.entrypoint;
        match self.module.globals.get(entry).and_then(Type::as_fun) {
            Some((args, _)) if args.is_empty() => {}
            _ => return Err(Error::BadEntrypoint(entry)),
        }
        match self.globals.get(entry).cloned() {
            Some(Value::Fun(f)) => Ok(self.call(&f, &[])),
            _ => Err(Error::BadEntrypoint(entry)),
        }
    }

    // Execute one frame to completion. The register file starts out
    // holding each type's default, then the arguments.
    fn call(&mut self, f: &Rc<FunDecl>, args: &[Value]) -> Value {
        trace!("call @{} with {} arguments", f.index, args.len());
        let mut regs: Vec<Value> = f.regs.iter().map(Value::default_for).collect();
        regs[..args.len()].clone_from_slice(args);

        let mut pc = 0;
        loop {
            let op = f.code.get(pc).unwrap_or_else(|| {
                panic!("internal error: function @{} ran off the end of its code", f.index)
            });
            pc += 1;
            match self.dispatch(f, &mut regs, op) {
                ControlFlow::Advance => {}
                ControlFlow::Jump(d) => pc = (pc as i64 + d as i64) as usize,
                ControlFlow::Return(v) => return v,
            }
        }
    }

    fn dispatch(&mut self, f: &FunDecl, regs: &mut [Value], op: &Opcode) -> ControlFlow {
        use Opcode::*;
        match op {
            Mov(a, b) => {
                regs[*a] = regs[*b].clone();
                ControlFlow::Advance
            }
            Int(r, i) => {
                regs[*r] = Value::Int(*i);
                ControlFlow::Advance
            }
            Float(r, idx) => {
                regs[*r] = Value::Float(self.module.floats[*idx]);
                ControlFlow::Advance
            }
            Bool(r, b) => {
                regs[*r] = Value::Bool(*b);
                ControlFlow::Advance
            }
            Add(r, a, b) => {
                regs[*r] = arith(&f.regs[*r], &regs[*a], &regs[*b], i32::wrapping_add, |x, y| {
                    x + y
                });
                ControlFlow::Advance
            }
            Sub(r, a, b) => {
                regs[*r] = arith(&f.regs[*r], &regs[*a], &regs[*b], i32::wrapping_sub, |x, y| {
                    x - y
                });
                ControlFlow::Advance
            }
            Incr(r) => {
                regs[*r] = step(&f.regs[*r], &regs[*r], 1);
                ControlFlow::Advance
            }
            Decr(r) => {
                regs[*r] = step(&f.regs[*r], &regs[*r], -1);
                ControlFlow::Advance
            }
            Call0(r, g) => self.call_global(regs, *r, *g, vec![]),
            Call1(r, g, a) => {
                let argv = vec![regs[*a].clone()];
                self.call_global(regs, *r, *g, argv)
            }
            Call2(r, g, a, b) => {
                let argv = vec![regs[*a].clone(), regs[*b].clone()];
                self.call_global(regs, *r, *g, argv)
            }
            Call3(r, g, a, b, c) => {
                let argv = vec![regs[*a].clone(), regs[*b].clone(), regs[*c].clone()];
                self.call_global(regs, *r, *g, argv)
            }
            CallN(r, fr, args) => {
                let callee = regs[*fr].clone();
                let argv: Vec<Value> = args.iter().map(|a| regs[*a].clone()).collect();
                regs[*r] = self.invoke(callee, &argv);
                ControlFlow::Advance
            }
            GetGlobal(r, g) => {
                regs[*r] = self.globals[*g].clone();
                ControlFlow::Advance
            }
            SetGlobal(g, r) => {
                self.globals[*g] = regs[*r].clone();
                ControlFlow::Advance
            }
            Eq(r, a, b) => {
                regs[*r] = Value::Bool(regs[*a] == regs[*b]);
                ControlFlow::Advance
            }
            NotEq(r, a, b) => {
                regs[*r] = Value::Bool(regs[*a] != regs[*b]);
                ControlFlow::Advance
            }
            Lt(r, a, b) => {
                regs[*r] = Value::Bool(lt(&regs[*a], &regs[*b]));
                ControlFlow::Advance
            }
            Gte(r, a, b) => {
                regs[*r] = Value::Bool(gte(&regs[*a], &regs[*b]));
                ControlFlow::Advance
            }
            Ret(r) => ControlFlow::Return(regs[*r].clone()),
            JTrue(r, d) => branch(&regs[*r], true, *d),
            JFalse(r, d) => branch(&regs[*r], false, *d),
            JNull(r, d) => {
                if let Value::Null = regs[*r] {
                    ControlFlow::Jump(*d)
                } else {
                    ControlFlow::Advance
                }
            }
            JNotNull(r, d) => {
                if let Value::Null = regs[*r] {
                    ControlFlow::Advance
                } else {
                    ControlFlow::Jump(*d)
                }
            }
            JAlways(d) => ControlFlow::Jump(*d),
            ToAny(r, a) => {
                regs[*r] = Value::Any(Box::new(regs[*a].clone()), f.regs[*a].clone());
                ControlFlow::Advance
            }
        }
    }

    fn call_global(&mut self, regs: &mut [Value], r: usize, g: usize, argv: Vec<Value>) -> ControlFlow {
        let callee = self.globals[g].clone();
        regs[r] = self.invoke(callee, &argv);
        ControlFlow::Advance
    }

    fn invoke(&mut self, callee: Value, args: &[Value]) -> Value {
        match callee {
            Value::Fun(f) => self.call(&f, args),
            Value::Native(handler) => handler(args),
            other => panic!("internal error: call of a non-function value {:?}", other),
        }
    }
}


// Integer arithmetic wraps: modulo 256 in a ui8 register, two's
// complement in an i32 register. Floats are IEEE-754 doubles.
fn arith(
    ty: &Type,
    a: &Value,
    b: &Value,
    int_op: fn(i32, i32) -> i32,
    float_op: fn(f64, f64) -> f64,
) -> Value {
    match (ty, a, b) {
        (Type::UI8, Value::Int(x), Value::Int(y)) => Value::Int(int_op(*x, *y) & 0xFF),
        (Type::I32, Value::Int(x), Value::Int(y)) => Value::Int(int_op(*x, *y)),
        (Type::F32, Value::Float(x), Value::Float(y))
        | (Type::F64, Value::Float(x), Value::Float(y)) => Value::Float(float_op(*x, *y)),
        (ty, a, b) => panic!(
            "internal error: arithmetic on {:?} and {:?} in a {} register",
            a, b, ty
        ),
    }
}


fn step(ty: &Type, v: &Value, by: i32) -> Value {
    match (ty, v) {
        (Type::UI8, Value::Int(x)) => Value::Int(x.wrapping_add(by) & 0xFF),
        (Type::I32, Value::Int(x)) => Value::Int(x.wrapping_add(by)),
        (ty, v) => panic!("internal error: incr/decr of {:?} in a {} register", v, ty),
    }
}


fn lt(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x < y,
        (Value::Float(x), Value::Float(y)) => x < y,
        (Value::Bool(x), Value::Bool(y)) => x < y,
        (a, b) => panic!("internal error: ordering of {:?} and {:?}", a, b),
    }
}


fn gte(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x >= y,
        (Value::Float(x), Value::Float(y)) => x >= y,
        (Value::Bool(x), Value::Bool(y)) => x >= y,
        (a, b) => panic!("internal error: ordering of {:?} and {:?}", a, b),
    }
}


fn branch(v: &Value, when: bool, d: i32) -> ControlFlow {
    match v {
        Value::Bool(b) if *b == when => ControlFlow::Jump(d),
        Value::Bool(_) => ControlFlow::Advance,
        other => panic!("internal error: branch on a non-bool value {:?}", other),
    }
}


// These tests are, where possible, written against the *behavior* of
// the VM: hand-assembled modules a conforming implementation has to
// agree on.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{FunDecl, Module};
    use crate::types::Type;
    use std::cell::RefCell;
    use Opcode::*;

    // A module with a single zero-argument function installed at
    // global 0, which is also the entrypoint.
    fn single(ret: Type, regs: Vec<Type>, code: Vec<Opcode>) -> Module {
        Module {
            version: 1,
            entrypoint: 0,
            globals: vec![Type::fun(vec![], ret)],
            floats: vec![],
            natives: vec![],
            functions: vec![FunDecl {
                index: 0,
                regs,
                code,
            }],
        }
    }

    fn eval(m: &Module) -> Value {
        interp(m, &()).unwrap()
    }

    #[test]
    fn test_return_constant() {
        let m = single(
            Type::I32,
            vec![Type::I32],
            vec![Int(0, 42), Ret(0)],
        );
        assert_eq!(eval(&m), Value::Int(42));
    }

    #[test]
    fn test_addition() {
        let m = single(
            Type::I32,
            vec![Type::I32, Type::I32, Type::I32],
            vec![
                Int(0, 2),       // 0
                Int(1, 3),       // 1
                Add(2, 0, 1),    // 2
                Ret(2),          // 3
            ],
        );
        assert_eq!(eval(&m), Value::Int(5));
    }

    #[test]
    fn test_if_expression() {
        // return if (true) 1 else 2
        let m = single(
            Type::I32,
            vec![Type::Bool, Type::I32, Type::I32, Type::I32],
            vec![
                Bool(0, true),   // 0
                JFalse(0, 3),    // 1
                Int(1, 1),       // 2
                Mov(2, 1),       // 3
                JAlways(2),      // 4
                Int(3, 2),       // 5
                Mov(2, 3),       // 6
                Ret(2),          // 7
            ],
        );
        assert_eq!(eval(&m), Value::Int(1));
    }

    #[test]
    fn test_ui8_addition_wraps() {
        let m = single(
            Type::UI8,
            vec![Type::UI8, Type::UI8, Type::UI8],
            vec![
                Int(0, 200),
                Int(1, 200),
                Add(2, 0, 1),
                Ret(2),
            ],
        );
        assert_eq!(eval(&m), Value::Int(144));
    }

    #[test]
    fn test_ui8_subtraction_wraps() {
        let m = single(
            Type::UI8,
            vec![Type::UI8, Type::UI8, Type::UI8],
            vec![Int(0, 3), Int(1, 5), Sub(2, 0, 1), Ret(2)],
        );
        assert_eq!(eval(&m), Value::Int(254));
    }

    #[test]
    fn test_i32_addition_wraps() {
        let m = single(
            Type::I32,
            vec![Type::I32, Type::I32, Type::I32],
            vec![
                Int(0, i32::MAX),
                Int(1, 1),
                Add(2, 0, 1),
                Ret(2),
            ],
        );
        assert_eq!(eval(&m), Value::Int(i32::MIN));
    }

    #[test]
    fn test_float_arithmetic() {
        let m = Module {
            floats: vec![1.5, 2.25],
            ..single(
                Type::F64,
                vec![Type::F64, Type::F64, Type::F64],
                vec![
                    Float(0, 0),
                    Float(1, 1),
                    Add(2, 0, 1),
                    Ret(2),
                ],
            )
        };
        assert_eq!(eval(&m), Value::Float(3.75));
    }

    #[test]
    fn test_incr_and_decr() {
        let m = single(
            Type::I32,
            vec![Type::I32],
            vec![Int(0, 41), Incr(0), Ret(0)],
        );
        assert_eq!(eval(&m), Value::Int(42));

        let m = single(
            Type::UI8,
            vec![Type::UI8],
            vec![Int(0, 0), Decr(0), Ret(0)],
        );
        assert_eq!(eval(&m), Value::Int(255));
    }

    #[test]
    fn test_comparisons() {
        let cases: Vec<(Opcode, bool)> = vec![
            (Eq(2, 0, 1), false),
            (NotEq(2, 0, 1), true),
            (Lt(2, 0, 1), true),
            (Gte(2, 0, 1), false),
        ];
        for (op, expected) in cases {
            let m = single(
                Type::Bool,
                vec![Type::I32, Type::I32, Type::Bool],
                vec![Int(0, 2), Int(1, 3), op.clone(), Ret(2)],
            );
            assert_eq!(eval(&m), Value::Bool(expected), "{:?}", op);
        }
    }

    #[test]
    fn test_boxing_preserves_the_source_type() {
        let m = single(
            Type::Any,
            vec![Type::I32, Type::Any],
            vec![Int(0, 7), ToAny(1, 0), Ret(1)],
        );
        assert_eq!(
            eval(&m),
            Value::Any(Box::new(Value::Int(7)), Type::I32)
        );
    }

    #[test]
    fn test_defaults_by_register_type() {
        // Untouched registers carry their type's default.
        let m = single(
            Type::Bool,
            vec![Type::Bool],
            vec![Ret(0)],
        );
        assert_eq!(eval(&m), Value::Bool(false));

        let m = single(Type::I32, vec![Type::I32], vec![Ret(0)]);
        assert_eq!(eval(&m), Value::Int(0));

        let m = single(Type::Any, vec![Type::Any], vec![Ret(0)]);
        assert_eq!(eval(&m), Value::Null);
    }

    #[test]
    fn test_null_jump_skips_a_default_load() {
        // The callee loads 5 into its argument register when the
        // caller passed null.
        let callee = FunDecl {
            index: 1,
            regs: vec![Type::Any],
            code: vec![
                JNotNull(0, 1),  // 0
                ToAny(0, 0),     // 1  stands in for the default load
                Ret(0),          // 2
            ],
        };
        // ToAny(0, 0) as the "default load" keeps the register types
        // trivial: the observable effect is whether instruction 1 ran.
        let m = Module {
            version: 1,
            entrypoint: 0,
            globals: vec![
                Type::fun(vec![], Type::Any),
                Type::fun(vec![Type::Any], Type::Any),
            ],
            floats: vec![],
            natives: vec![],
            functions: vec![
                FunDecl {
                    index: 0,
                    regs: vec![Type::Any, Type::I32, Type::Any],
                    code: vec![
                        Int(1, 9),
                        ToAny(0, 1),      // a non-null argument
                        Call1(2, 1, 0),
                        Ret(2),
                    ],
                },
                callee,
            ],
        };
        // Non-null argument: JNotNull skips the re-box, the argument
        // comes back unchanged.
        assert_eq!(
            eval(&m),
            Value::Any(Box::new(Value::Int(9)), Type::I32)
        );
    }

    #[test]
    fn test_call_through_register() {
        // main calls f(10, 2) through a register; f subtracts.
        let f_ty = Type::fun(vec![Type::I32, Type::I32], Type::I32);
        let m = Module {
            version: 1,
            entrypoint: 0,
            globals: vec![Type::fun(vec![], Type::I32), f_ty.clone()],
            floats: vec![],
            natives: vec![],
            functions: vec![
                FunDecl {
                    index: 0,
                    regs: vec![f_ty, Type::I32, Type::I32, Type::I32],
                    code: vec![
                        GetGlobal(0, 1),          // 0
                        Int(1, 10),               // 1
                        Int(2, 2),                // 2
                        CallN(3, 0, vec![1, 2]),  // 3
                        Ret(3),                   // 4
                    ],
                },
                FunDecl {
                    index: 1,
                    regs: vec![Type::I32, Type::I32, Type::I32],
                    code: vec![Sub(2, 0, 1), Ret(2)],
                },
            ],
        };
        assert_eq!(eval(&m), Value::Int(8));
    }

    #[test]
    fn test_recursion() {
        // fact(n) = if n <= 1 { 1 } else { n * ... } needs Mul; use
        // the classic countdown sum instead:
        // sum(n) = if n < 1 { 0 } else { n + sum(n - 1) }
        let sum_ty = Type::fun(vec![Type::I32], Type::I32);
        let m = Module {
            version: 1,
            entrypoint: 0,
            globals: vec![Type::fun(vec![], Type::I32), sum_ty],
            floats: vec![],
            natives: vec![],
            functions: vec![
                FunDecl {
                    index: 0,
                    regs: vec![Type::I32, Type::I32],
                    code: vec![Int(0, 10), Call1(1, 1, 0), Ret(1)],
                },
                FunDecl {
                    index: 1,
                    regs: vec![
                        Type::I32,  // n
                        Type::I32,  // 1
                        Type::Bool, // n < 1
                        Type::I32,  // 0
                        Type::I32,  // n - 1
                        Type::I32,  // sum(n - 1)
                        Type::I32,  // n + sum(n - 1)
                    ],
                    code: vec![
                        Int(1, 1),       // 0
                        Lt(2, 0, 1),     // 1
                        JFalse(2, 2),    // 2
                        Int(3, 0),       // 3
                        Ret(3),          // 4
                        Sub(4, 0, 1),    // 5
                        Call1(5, 1, 4),  // 6
                        Add(6, 0, 5),    // 7
                        Ret(6),          // 8
                    ],
                },
            ],
        };
        assert_eq!(eval(&m), Value::Int(55));
    }

    #[test]
    fn test_backward_jump_loops() {
        // i = 0; do { i++ } while (i < 3); return i
        let m = single(
            Type::I32,
            vec![Type::I32, Type::I32, Type::Bool],
            vec![
                Int(0, 0),      // 0
                Int(1, 3),      // 1
                Incr(0),        // 2
                Lt(2, 0, 1),    // 3
                JTrue(2, -3),   // 4
                Ret(0),         // 5
            ],
        );
        assert_eq!(eval(&m), Value::Int(3));
    }

    #[test]
    fn test_set_global() {
        let m = Module {
            version: 1,
            entrypoint: 0,
            globals: vec![Type::fun(vec![], Type::I32), Type::I32],
            floats: vec![],
            natives: vec![],
            functions: vec![FunDecl {
                index: 0,
                regs: vec![Type::I32, Type::I32],
                code: vec![
                    Int(0, 21),
                    SetGlobal(1, 0),
                    GetGlobal(1, 1),
                    Add(0, 0, 1),
                    Ret(0),
                ],
            }],
        };
        assert_eq!(eval(&m), Value::Int(42));
    }

    #[test]
    fn test_native_receives_boxed_arguments() {
        let log_ty = Type::fun(vec![Type::Any], Type::Void);
        let m = Module {
            version: 1,
            entrypoint: 1,
            globals: vec![log_ty, Type::fun(vec![], Type::Void)],
            floats: vec![],
            natives: vec![("std@log".to_string(), 0)],
            functions: vec![FunDecl {
                index: 1,
                regs: vec![Type::I32, Type::Any, Type::Void],
                code: vec![
                    Int(0, 7),
                    ToAny(1, 0),
                    Call1(2, 0, 1),
                    Ret(2),
                ],
            }],
        };

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut loader: HashMap<String, NativeFn> = HashMap::new();
        loader.insert(
            "std@log".to_string(),
            Rc::new(move |args: &[Value]| {
                sink.borrow_mut().extend(args.iter().cloned());
                Value::Null
            }),
        );

        assert_eq!(interp(&m, &loader).unwrap(), Value::Null);
        assert_eq!(
            *seen.borrow(),
            vec![Value::Any(Box::new(Value::Int(7)), Type::I32)]
        );
    }

    #[test]
    fn test_unresolved_native_is_fatal() {
        let m = Module {
            version: 1,
            entrypoint: 1,
            globals: vec![
                Type::fun(vec![], Type::Void),
                Type::fun(vec![], Type::Void),
            ],
            floats: vec![],
            natives: vec![("std@missing".to_string(), 0)],
            functions: vec![FunDecl {
                index: 1,
                regs: vec![Type::Void],
                code: vec![Ret(0)],
            }],
        };
        assert_eq!(
            interp(&m, &()).unwrap_err(),
            Error::UnresolvedNative("std@missing".to_string())
        );
    }

    #[test]
    fn test_entrypoint_must_be_a_compiled_function() {
        // The entrypoint slot has a function type but holds a native.
        let m = Module {
            version: 1,
            entrypoint: 0,
            globals: vec![Type::fun(vec![], Type::Void)],
            floats: vec![],
            natives: vec![("std@boot".to_string(), 0)],
            functions: vec![],
        };
        let mut loader: HashMap<String, NativeFn> = HashMap::new();
        loader.insert("std@boot".to_string(), Rc::new(|_| Value::Null));
        assert_eq!(
            interp(&m, &loader).unwrap_err(),
            Error::BadEntrypoint(0)
        );
    }

    #[test]
    fn test_entrypoint_must_take_no_arguments() {
        let m = Module {
            version: 1,
            entrypoint: 0,
            globals: vec![Type::fun(vec![Type::I32], Type::Void)],
            floats: vec![],
            natives: vec![],
            functions: vec![FunDecl {
                index: 0,
                regs: vec![Type::I32, Type::Void],
                code: vec![Ret(1)],
            }],
        };
        assert_eq!(interp(&m, &()).unwrap_err(), Error::BadEntrypoint(0));
    }

    #[test]
    fn test_verification_runs_first() {
        let m = single(
            Type::I32,
            vec![Type::Bool],
            vec![Bool(0, true), Ret(0)],
        );
        match interp(&m, &()) {
            Err(Error::Verify(e)) => assert_eq!(e.pos, 1),
            other => panic!("expected a verifier error, got {:?}", other),
        }
    }

    #[test]
    fn test_interpretation_is_deterministic() {
        let m = single(
            Type::I32,
            vec![Type::I32, Type::I32, Type::I32],
            vec![Int(0, 2), Int(1, 3), Add(2, 0, 1), Ret(2)],
        );
        assert_eq!(eval(&m), eval(&m));
    }
}
