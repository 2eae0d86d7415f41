use crate::bytecode::{Module, Opcode, RegId};
use crate::lookup::Lookup;
use crate::types::{Type, MAX_ARITY};
use thiserror::Error;


// The binary module format.
//
// Layout, after the magic and version byte: the section counts, the
// entrypoint, then the type table, global type-refs, float pool,
// native records and function records. Every index is a vint; every
// type occurrence is a reference into the type table, whose first
// seven entries are always the primitives in tag order.


pub const MAGIC: &[u8; 3] = b"HLB";

// Largest magnitude the variable-length integer encoding can carry.
pub const VINT_LIMIT: i64 = 0x2000_0000;


pub type Result<T> = core::result::Result<T, WriteError>;


#[derive(Clone, Debug, Error, PartialEq)]
pub enum WriteError {
    #[error("value {0} is too big to be serialized (|v| < {})", VINT_LIMIT)]
    Overflow(i64),
    #[error("native name {0:?} is longer than 255 bytes")]
    NameTooLong(String),
    #[error("native {0:?} is not bound to a function global")]
    NativeNotFun(String),
    #[error("function arity {0} exceeds {}", MAX_ARITY)]
    ArityTooLarge(usize),
}


// Signed variable-length integers: one, two or four bytes, keyed off
// the top bits of the first byte. One-byte values are bare; 0x80/0xA0
// open the two-byte positive/negative forms, 0xC0/0xE0 the four-byte
// ones.
pub fn write_vint(out: &mut Vec<u8>, i: i64) -> Result<()> {
    if i >= 0 {
        if i < 0x80 {
            out.push(i as u8);
        } else if i < 0x2000 {
            out.push(((i >> 8) as u8) | 0x80);
            out.push(i as u8);
        } else if i < VINT_LIMIT {
            out.push(((i >> 24) as u8) | 0xC0);
            out.push((i >> 16) as u8);
            out.push((i >> 8) as u8);
            out.push(i as u8);
        } else {
            return Err(WriteError::Overflow(i));
        }
    } else {
        let m = -i;
        if m < 0x2000 {
            out.push(((m >> 8) as u8) | 0xA0);
            out.push(m as u8);
        } else if m < VINT_LIMIT {
            out.push(((m >> 24) as u8) | 0xE0);
            out.push((m >> 16) as u8);
            out.push((m >> 8) as u8);
            out.push(m as u8);
        } else {
            return Err(WriteError::Overflow(i));
        }
    }
    Ok(())
}


// Serialize a module.
pub fn write(module: &Module) -> Result<Vec<u8>> {
    let mut w = Writer::new();

    // Collect the type table up front: the counts precede it in the
    // header.
    for ty in &module.globals {
        w.collect(ty)?;
    }
    for f in &module.functions {
        for ty in &f.regs {
            w.collect(ty)?;
        }
    }

    w.out.extend_from_slice(MAGIC);
    w.out.push(module.version);
    let n_types = w.types.len();
    w.index(n_types)?;
    w.index(module.globals.len())?;
    w.index(module.floats.len())?;
    w.index(module.natives.len())?;
    w.index(module.functions.len())?;
    w.index(module.entrypoint)?;

    let table: Vec<Type> = w.types.items().to_vec();
    for ty in &table {
        w.type_record(ty)?;
    }

    for ty in &module.globals {
        w.type_ref(ty)?;
    }

    for f in &module.floats {
        w.out.extend_from_slice(&f.to_le_bytes());
    }

    for (name, g) in &module.natives {
        if name.len() > 255 {
            return Err(WriteError::NameTooLong(name.clone()));
        }
        let arity = module
            .globals
            .get(*g)
            .and_then(Type::as_fun)
            .map(|(args, _)| args.len())
            .ok_or_else(|| WriteError::NativeNotFun(name.clone()))?;
        w.out.push(name.len() as u8);
        w.out.extend_from_slice(name.as_bytes());
        w.out.push(arity as u8);
        w.index(*g)?;
    }

    for f in &module.functions {
        w.index(f.index)?;
        w.index(f.regs.len())?;
        w.index(f.code.len())?;
        for ty in &f.regs {
            w.type_ref(ty)?;
        }
        for op in &f.code {
            w.opcode(op)?;
        }
    }

    Ok(w.out)
}


struct Writer {
    out: Vec<u8>,
    types: Lookup<Type, Type>,
}

impl Writer {
    fn new() -> Writer {
        let mut types = Lookup::new();
        // The primitives claim the first seven slots, in tag order, so
        // their indices never drift.
        let primitives = [
            Type::Void,
            Type::UI8,
            Type::I32,
            Type::F32,
            Type::F64,
            Type::Bool,
            Type::Any,
        ];
        for ty in primitives.iter() {
            types.intern(ty, || ty.clone());
        }
        Writer {
            out: Vec::new(),
            types,
        }
    }

    fn vint(&mut self, i: i64) -> Result<()> {
        write_vint(&mut self.out, i)
    }

    fn index(&mut self, i: usize) -> Result<()> {
        self.vint(i as i64)
    }

    // Intern a type and its components, components first, so every
    // reference inside the table points backwards.
    fn collect(&mut self, ty: &Type) -> Result<usize> {
        if let Type::Fun(args, ret) = ty {
            if args.len() > MAX_ARITY {
                return Err(WriteError::ArityTooLarge(args.len()));
            }
            for arg in args {
                self.collect(arg)?;
            }
            self.collect(ret)?;
        }
        Ok(self.types.intern(ty, || ty.clone()))
    }

    fn type_ref(&mut self, ty: &Type) -> Result<()> {
        let id = self.types.intern(ty, || ty.clone());
        self.index(id)
    }

    // A type record is its tag byte; function types append arity and
    // the component type-refs.
    fn type_record(&mut self, ty: &Type) -> Result<()> {
        self.out.push(ty.tag());
        if let Type::Fun(args, ret) = ty {
            self.out.push(args.len() as u8);
            for arg in args {
                self.type_ref(arg)?;
            }
            self.type_ref(ret)?;
        }
        Ok(())
    }

    fn opcode(&mut self, op: &Opcode) -> Result<()> {
        use Opcode::*;
        let tag = op.tag();
        match op {
            Mov(a, b) | ToAny(a, b) => {
                self.out.push(tag);
                self.index(*a)?;
                self.index(*b)
            }
            Int(r, i) => {
                self.out.push(tag);
                self.index(*r)?;
                if tag == 1 {
                    self.out.push(*i as u8);
                } else {
                    self.out.extend_from_slice(&i.to_le_bytes());
                }
                Ok(())
            }
            Float(r, idx) => {
                self.out.push(tag);
                self.index(*r)?;
                self.index(*idx)
            }
            Bool(r, _) => {
                self.out.push(tag);
                self.index(*r)
            }
            Add(r, a, b) | Sub(r, a, b) | Eq(r, a, b) | NotEq(r, a, b) | Lt(r, a, b)
            | Gte(r, a, b) => self.binop(tag, *r, *a, *b),
            Incr(r) | Decr(r) | Ret(r) => {
                self.out.push(tag);
                self.index(*r)
            }
            Call0(r, g) => {
                self.out.push(tag);
                self.index(*r)?;
                self.index(*g)
            }
            Call1(r, g, a) => {
                self.out.push(tag);
                self.index(*r)?;
                self.index(*g)?;
                self.index(*a)
            }
            Call2(r, g, a, b) => {
                self.out.push(tag);
                self.index(*r)?;
                self.index(*g)?;
                self.index(*a)?;
                self.index(*b)
            }
            Call3(r, g, a, b, c) => {
                self.out.push(tag);
                self.index(*r)?;
                self.index(*g)?;
                self.index(*a)?;
                self.index(*b)?;
                self.index(*c)
            }
            CallN(r, f, args) => {
                if args.len() > MAX_ARITY {
                    return Err(WriteError::ArityTooLarge(args.len()));
                }
                self.out.push(tag);
                self.index(*r)?;
                self.index(*f)?;
                self.out.push(args.len() as u8);
                for a in args {
                    self.index(*a)?;
                }
                Ok(())
            }
            GetGlobal(r, g) => {
                self.out.push(tag);
                self.index(*r)?;
                self.index(*g)
            }
            SetGlobal(g, r) => {
                self.out.push(tag);
                self.index(*g)?;
                self.index(*r)
            }
            JTrue(r, d) | JFalse(r, d) | JNull(r, d) | JNotNull(r, d) => {
                self.out.push(tag);
                self.index(*r)?;
                self.vint(*d as i64)
            }
            JAlways(d) => {
                self.out.push(tag);
                self.vint(*d as i64)
            }
        }
    }

    // Binary operations get a compact two-byte form when the tag and
    // all three registers fit: the destination's three bits are split
    // one into the tag byte, two into the operand byte.
    fn binop(&mut self, tag: u8, r: RegId, a: RegId, b: RegId) -> Result<()> {
        if tag < 64 && r < 8 && a < 8 && b < 8 {
            self.out.push(((tag << 1) | 0x80) | if r > 3 { 1 } else { 0 });
            self.out
                .push((((r & 3) as u8) << 6) | ((a as u8) << 3) | (b as u8));
            Ok(())
        } else {
            self.out.push(tag);
            self.index(r)?;
            self.index(a)?;
            self.index(b)
        }
    }
}
