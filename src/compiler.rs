use crate::ast::{
    Arg, BinOp, ClassDecl, Const, ExprKind, FieldAccess, Method, Program, TExpr, TypeDecl, UnOp,
    Var,
};
use crate::bytecode::{FunDecl, GlobalId, Module, Opcode, RegId, VERSION};
use crate::lookup::Lookup;
use crate::types::{Type, MAX_ARITY};
use thiserror::Error;
use tracing::debug;


// Lowers type-checked expression trees to register code, one function
// per static method. Name resolution and inference already happened in
// the front-end; the only type work left here is coercion at call and
// initialization sites.


pub type Result<T> = core::result::Result<T, CompileError>;


#[derive(Clone, Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("unsupported construct: {0}")]
    Unsupported(String),
    #[error("cannot coerce {from} to {to}")]
    InvalidCoercion { from: Type, to: Type },
    #[error("call arity mismatch: expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("call target is not a function: {0}")]
    NotCallable(Type),
    #[error("too many arguments: {0} (at most {})", MAX_ARITY)]
    TooManyArgs(usize),
    #[error("entrypoint {0} is not defined")]
    NoEntrypoint(String),
    #[error("entrypoint {0} must be a function taking no arguments")]
    BadEntrypoint(String),
}


// Remembers a forward jump whose target is not yet known. `FunCtx::patch`
// writes `target - (site + 1)` into the opcode's delta once the target
// exists; deltas count from the instruction after the jump.
struct Patch {
    site: usize,
}


// Per-function state: the register table and the code being emitted.
//
// Named variables intern their register by the variable's unique id;
// intermediate results get anonymous slots via `tmp`. Both index the
// same table, and registers are never freed within a function.
struct FunCtx {
    regs: Lookup<u32, Type>,
    code: Vec<Opcode>,
}

impl FunCtx {
    fn new() -> FunCtx {
        FunCtx {
            regs: Lookup::new(),
            code: Vec::new(),
        }
    }

    // The stable register of a named variable.
    fn reg(&mut self, v: &Var) -> RegId {
        self.regs.intern(&v.id, || v.ty.clone())
    }

    // A fresh anonymous register.
    fn tmp(&mut self, ty: Type) -> RegId {
        self.regs.add(ty)
    }

    fn ty(&self, r: RegId) -> Type {
        self.regs.items()[r].clone()
    }

    fn emit(&mut self, op: Opcode) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    // Emit a jump with a placeholder delta, to be patched later.
    fn jump(&mut self, op: Opcode) -> Patch {
        let site = self.emit(op);
        Patch { site }
    }

    // Point a pending jump at the current position.
    fn patch(&mut self, p: Patch) {
        let delta = self.code.len() as i32 - (p.site as i32 + 1);
        self.code[p.site].set_delta(delta);
    }

    // Emit an unconditional jump back to an already-emitted position.
    fn jump_back(&mut self, target: usize) {
        let site = self.code.len();
        self.emit(Opcode::JAlways(target as i32 - (site as i32 + 1)));
    }
}


pub struct Compiler {
    globals: Lookup<String, Type>,
    floats: Lookup<u64, f64>,
    natives: Lookup<String, (String, GlobalId)>,
    functions: Vec<FunDecl>,
}


// Lower a whole front-end program into a module rooted at the named
// entrypoint global (e.g. "Main:main").
pub fn compile(program: &Program, entry: &str) -> Result<Module> {
    let mut compiler = Compiler::new();
    for decl in &program.types {
        compiler.declare(decl)?;
    }
    compiler.finish(entry)
}


impl Compiler {
    pub fn new() -> Compiler {
        Compiler {
            globals: Lookup::new(),
            floats: Lookup::new(),
            natives: Lookup::new(),
            functions: Vec::new(),
        }
    }

    pub fn declare(&mut self, decl: &TypeDecl) -> Result<()> {
        match decl {
            TypeDecl::Class(c) => self.class(c),
            // Aliases and abstracts carry no code of their own.
            TypeDecl::Alias(_) | TypeDecl::Abstract(_) => Ok(()),
            TypeDecl::Enum(name) => Err(CompileError::Unsupported(format!("enum {}", name))),
            TypeDecl::Interface(name) => {
                Err(CompileError::Unsupported(format!("interface {}", name)))
            }
        }
    }

    pub fn finish(self, entry: &str) -> Result<Module> {
        let g = self
            .globals
            .get(&entry.to_string())
            .ok_or_else(|| CompileError::NoEntrypoint(entry.to_string()))?;
        match self.globals.items()[g].as_fun() {
            Some((args, _)) if args.is_empty() => {}
            _ => return Err(CompileError::BadEntrypoint(entry.to_string())),
        }
        Ok(Module {
            version: VERSION,
            entrypoint: g,
            globals: self.globals.into_items(),
            floats: self.floats.into_items(),
            natives: self.natives.into_items(),
            functions: self.functions,
        })
    }

    fn class(&mut self, c: &ClassDecl) -> Result<()> {
        if c.is_extern {
            for m in &c.methods {
                if let Some((lib, name)) = &m.native {
                    let g = self.global(&format!("{}:{}", c.path, m.name), &method_type(m));
                    let native = format!("{}@{}", lib, name);
                    self.natives.intern(&native.clone(), || (native.clone(), g));
                }
            }
            Ok(())
        } else {
            for m in &c.methods {
                self.method(&c.path, m)?;
            }
            Ok(())
        }
    }

    fn global(&mut self, name: &str, ty: &Type) -> GlobalId {
        self.globals.intern(&name.to_string(), || ty.clone())
    }

    fn method(&mut self, class_path: &str, m: &Method) -> Result<()> {
        let body = match &m.body {
            Some(body) => body,
            None => {
                return Err(CompileError::Unsupported(format!(
                    "method {}:{} has no body",
                    class_path, m.name
                )))
            }
        };
        if m.args.len() > MAX_ARITY {
            return Err(CompileError::TooManyArgs(m.args.len()));
        }
        let g = self.global(&format!("{}:{}", class_path, m.name), &method_type(m));

        let mut ctx = FunCtx::new();
        // Arguments claim the leading registers, in order.
        for arg in &m.args {
            ctx.reg(&arg.var);
        }
        for (i, arg) in m.args.iter().enumerate() {
            self.default(&mut ctx, i, arg)?;
        }
        self.expr(&mut ctx, body)?;
        if m.ret == Type::Void {
            let v = ctx.tmp(Type::Void);
            ctx.emit(Opcode::Ret(v));
        }
        debug!(
            "compiled {}:{} ({} registers, {} ops)",
            class_path,
            m.name,
            ctx.regs.len(),
            ctx.code.len()
        );
        self.functions.push(FunDecl {
            index: g,
            regs: ctx.regs.into_items(),
            code: ctx.code,
        });
        Ok(())
    }

    // A caller passing null gets the default literal: skip the load
    // when the argument register holds a real value.
    fn default(&mut self, ctx: &mut FunCtx, reg: RegId, arg: &Arg) -> Result<()> {
        match &arg.default {
            None | Some(Const::Null) => Ok(()),
            Some(c) => {
                ctx.emit(Opcode::JNotNull(reg, 1));
                self.load_const(ctx, reg, c)
            }
        }
    }

    fn load_const(&mut self, ctx: &mut FunCtx, reg: RegId, c: &Const) -> Result<()> {
        match c {
            Const::Int(i) => {
                ctx.emit(Opcode::Int(reg, *i));
            }
            Const::Float(f) => {
                let idx = self.floats.intern(&f.to_bits(), || *f);
                ctx.emit(Opcode::Float(reg, idx));
            }
            Const::Bool(b) => {
                ctx.emit(Opcode::Bool(reg, *b));
            }
            Const::Str(_) => return Err(CompileError::Unsupported("string literal".into())),
            Const::Null => {}
        }
        Ok(())
    }

    // Lower one expression; the result is the register holding its
    // value.
    fn expr(&mut self, ctx: &mut FunCtx, e: &TExpr) -> Result<RegId> {
        match &e.expr {
            ExprKind::Const(c) => self.constant(ctx, c),
            ExprKind::Local(v) => Ok(ctx.reg(v)),
            ExprKind::Var(v, init) => self.var_decl(ctx, v, init.as_deref()),
            ExprKind::Paren(inner) => self.expr(ctx, inner),
            ExprKind::Block(children) => self.block(ctx, children),
            ExprKind::Return(value) => self.ret(ctx, value.as_deref()),
            ExprKind::Field(access) => self.field(ctx, access, &e.ty),
            ExprKind::Call(callee, args) => self.call(ctx, callee, args),
            ExprKind::If(cond, then, els) => self.branch(ctx, cond, then, els.as_deref(), &e.ty),
            ExprKind::While(cond, body) => self.repeat(ctx, cond, body),
            ExprKind::Binop(op, a, b) => self.binop(ctx, *op, a, b, &e.ty),
            ExprKind::Unop(op, a) => self.unop(ctx, *op, a),
            ExprKind::ObjectDecl(_) => {
                Err(CompileError::Unsupported("object literal".into()))
            }
        }
    }

    fn constant(&mut self, ctx: &mut FunCtx, c: &Const) -> Result<RegId> {
        match c {
            Const::Int(i) => {
                let r = ctx.tmp(Type::I32);
                ctx.emit(Opcode::Int(r, *i));
                Ok(r)
            }
            Const::Float(f) => {
                let idx = self.floats.intern(&f.to_bits(), || *f);
                let r = ctx.tmp(Type::F64);
                ctx.emit(Opcode::Float(r, idx));
                Ok(r)
            }
            Const::Bool(b) => {
                let r = ctx.tmp(Type::Bool);
                ctx.emit(Opcode::Bool(r, *b));
                Ok(r)
            }
            Const::Str(_) => Err(CompileError::Unsupported("string literal".into())),
            Const::Null => Err(CompileError::Unsupported("null literal".into())),
        }
    }

    // A declaration adopts the register its initializer produced when
    // that register is an anonymous temporary of the right type;
    // initializing from another variable copies instead, so registers
    // never alias.
    fn var_decl(&mut self, ctx: &mut FunCtx, v: &Var, init: Option<&TExpr>) -> Result<RegId> {
        match init {
            None => Ok(ctx.reg(v)),
            Some(e) => {
                let r = self.expr(ctx, e)?;
                let r = self.coerce(ctx, r, &v.ty)?;
                if ctx.regs.is_named(r) {
                    let dst = ctx.reg(v);
                    ctx.emit(Opcode::Mov(dst, r));
                    Ok(dst)
                } else {
                    ctx.regs.bind(&v.id, r);
                    Ok(r)
                }
            }
        }
    }

    fn block(&mut self, ctx: &mut FunCtx, children: &[crate::ast::Node<TExpr>]) -> Result<RegId> {
        let mut last = None;
        for child in children {
            last = Some(self.expr(ctx, child)?);
        }
        match last {
            Some(r) => Ok(r),
            None => Ok(ctx.tmp(Type::Void)),
        }
    }

    fn ret(&mut self, ctx: &mut FunCtx, value: Option<&TExpr>) -> Result<RegId> {
        match value {
            None => {
                let v = ctx.tmp(Type::Void);
                ctx.emit(Opcode::Ret(v));
                Ok(v)
            }
            Some(e) => {
                let r = self.expr(ctx, e)?;
                ctx.emit(Opcode::Ret(r));
                Ok(ctx.tmp(Type::Void))
            }
        }
    }

    fn field(&mut self, ctx: &mut FunCtx, access: &FieldAccess, ty: &Type) -> Result<RegId> {
        let FieldAccess::Static { class, field } = access;
        let g = self.global(&format!("{}:{}", class, field), ty);
        let dst = ctx.tmp(ty.clone());
        ctx.emit(Opcode::GetGlobal(dst, g));
        Ok(dst)
    }

    fn call(
        &mut self,
        ctx: &mut FunCtx,
        callee: &TExpr,
        args: &[crate::ast::Node<TExpr>],
    ) -> Result<RegId> {
        let (want, ret) = match callee.ty.as_fun() {
            Some((want, ret)) => (want.to_vec(), ret.clone()),
            None => return Err(CompileError::NotCallable(callee.ty.clone())),
        };
        if args.len() != want.len() {
            return Err(CompileError::Arity {
                expected: want.len(),
                got: args.len(),
            });
        }
        if args.len() > MAX_ARITY {
            return Err(CompileError::TooManyArgs(args.len()));
        }
        let f = self.expr(ctx, callee)?;
        let mut regs = Vec::with_capacity(args.len());
        for (arg, want) in args.iter().zip(want.iter()) {
            let r = self.expr(ctx, arg)?;
            regs.push(self.coerce(ctx, r, want)?);
        }
        let dst = ctx.tmp(ret);
        ctx.emit(Opcode::CallN(dst, f, regs));
        Ok(dst)
    }

    fn branch(
        &mut self,
        ctx: &mut FunCtx,
        cond: &TExpr,
        then: &TExpr,
        els: Option<&TExpr>,
        ty: &Type,
    ) -> Result<RegId> {
        let c = self.expr(ctx, cond)?;
        let skip = ctx.jump(Opcode::JFalse(c, 0));
        let rt = self.expr(ctx, then)?;
        let dst = ctx.tmp(ty.clone());
        self.branch_into(ctx, dst, rt, ty)?;
        match els {
            Some(els) => {
                let exit = ctx.jump(Opcode::JAlways(0));
                ctx.patch(skip);
                let re = self.expr(ctx, els)?;
                self.branch_into(ctx, dst, re, ty)?;
                ctx.patch(exit);
            }
            None => ctx.patch(skip),
        }
        Ok(dst)
    }

    // Copy a branch result into the if-expression's register. In
    // statement position (the if is Void but the branch is not) the
    // branch value is discarded.
    fn branch_into(&mut self, ctx: &mut FunCtx, dst: RegId, src: RegId, ty: &Type) -> Result<()> {
        if ctx.ty(src) == *ty {
            ctx.emit(Opcode::Mov(dst, src));
        } else if *ty != Type::Void {
            let r = self.coerce(ctx, src, ty)?;
            ctx.emit(Opcode::Mov(dst, r));
        }
        Ok(())
    }

    fn repeat(&mut self, ctx: &mut FunCtx, cond: &TExpr, body: &TExpr) -> Result<RegId> {
        let head = ctx.code.len();
        let c = self.expr(ctx, cond)?;
        let exit = ctx.jump(Opcode::JFalse(c, 0));
        self.expr(ctx, body)?;
        ctx.jump_back(head);
        ctx.patch(exit);
        Ok(ctx.tmp(Type::Void))
    }

    fn binop(
        &mut self,
        ctx: &mut FunCtx,
        op: BinOp,
        a: &TExpr,
        b: &TExpr,
        ty: &Type,
    ) -> Result<RegId> {
        let ra = self.expr(ctx, a)?;
        let rb = self.expr(ctx, b)?;
        match op {
            BinOp::Add => {
                let dst = ctx.tmp(ty.clone());
                ctx.emit(Opcode::Add(dst, ra, rb));
                Ok(dst)
            }
            BinOp::Sub => {
                let dst = ctx.tmp(ty.clone());
                ctx.emit(Opcode::Sub(dst, ra, rb));
                Ok(dst)
            }
            BinOp::Eq => Ok(self.compare(ctx, Opcode::Eq, ra, rb)),
            BinOp::NotEq => Ok(self.compare(ctx, Opcode::NotEq, ra, rb)),
            BinOp::Lt => Ok(self.compare(ctx, Opcode::Lt, ra, rb)),
            BinOp::Gte => Ok(self.compare(ctx, Opcode::Gte, ra, rb)),
            // No Lte/Gt opcodes: swap the operands instead.
            BinOp::Lte => Ok(self.compare(ctx, Opcode::Gte, rb, ra)),
            BinOp::Gt => Ok(self.compare(ctx, Opcode::Lt, rb, ra)),
            BinOp::Mul | BinOp::Div | BinOp::Mod => {
                Err(CompileError::Unsupported(format!("operator {:?}", op)))
            }
        }
    }

    fn compare(
        &mut self,
        ctx: &mut FunCtx,
        make: fn(RegId, RegId, RegId) -> Opcode,
        a: RegId,
        b: RegId,
    ) -> RegId {
        let dst = ctx.tmp(Type::Bool);
        ctx.emit(make(dst, a, b));
        dst
    }

    fn unop(&mut self, ctx: &mut FunCtx, op: UnOp, a: &TExpr) -> Result<RegId> {
        match (op, &a.expr) {
            (UnOp::Incr, ExprKind::Local(v)) | (UnOp::Decr, ExprKind::Local(v)) => {
                if !v.ty.is_integer() {
                    return Err(CompileError::Unsupported(format!(
                        "{:?} on a {} variable",
                        op, v.ty
                    )));
                }
                let r = ctx.reg(v);
                ctx.emit(match op {
                    UnOp::Incr => Opcode::Incr(r),
                    _ => Opcode::Decr(r),
                });
                Ok(r)
            }
            (UnOp::Incr, _) | (UnOp::Decr, _) => Err(CompileError::Unsupported(
                "increment of a non-variable".into(),
            )),
            (op, _) => Err(CompileError::Unsupported(format!("operator {:?}", op))),
        }
    }

    // Adapt a value to the demanded type. Equal types are a no-op; Any
    // boxes; nothing else converts implicitly.
    fn coerce(&mut self, ctx: &mut FunCtx, src: RegId, want: &Type) -> Result<RegId> {
        let have = ctx.ty(src);
        if have == *want {
            return Ok(src);
        }
        if *want == Type::Any {
            let dst = ctx.tmp(Type::Any);
            ctx.emit(Opcode::ToAny(dst, src));
            return Ok(dst);
        }
        Err(CompileError::InvalidCoercion {
            from: have,
            to: want.clone(),
        })
    }
}


fn method_type(m: &Method) -> Type {
    Type::fun(
        m.args.iter().map(|a| a.var.ty.clone()).collect(),
        m.ret.clone(),
    )
}
