use crate::ast::Node;
use crate::bytecode::{FunDecl, Module, Opcode, VERSION};
use crate::types::Type;
use crate::write::MAGIC;
use thiserror::Error;


// Decodes the binary module format back into a Module. The reader is
// strict: unknown tags, forward type references and truncated input
// are all malformed, and a module that decodes re-encodes to the same
// bytes.


pub type Result<T> = core::result::Result<T, ReadError>;


#[derive(Clone, Debug, Error, PartialEq)]
pub enum ReadError {
    #[error("not an hlb module (bad magic)")]
    BadMagic,
    #[error("unsupported module version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed module: {0}")]
    Malformed(String),
}


// Decode one vint at the head of `buf`; the second half of the result
// is how many bytes it occupied.
pub fn read_vint(buf: &[u8]) -> Result<(i64, usize)> {
    let mut r = Reader { buf, pos: 0 };
    let v = r.vint()?;
    Ok((v, r.pos))
}


pub fn read(buf: &[u8]) -> Result<Module> {
    let mut r = Reader { buf, pos: 0 };

    if r.bytes(3)? != MAGIC {
        return Err(ReadError::BadMagic);
    }
    let version = r.byte()?;
    if version != VERSION {
        return Err(ReadError::UnsupportedVersion(version));
    }

    let n_types = r.index()?;
    let n_globals = r.index()?;
    let n_floats = r.index()?;
    let n_natives = r.index()?;
    let n_functions = r.index()?;
    let entrypoint = r.index()?;
    if entrypoint >= n_globals {
        return Err(malformed(format!("entrypoint @{} out of bounds", entrypoint)));
    }

    // The type table. Function records may only refer backwards, so
    // the table can be built in one pass.
    let mut types: Vec<Type> = Vec::with_capacity(n_types);
    for i in 0..n_types {
        let ty = r.type_record(&types, i)?;
        types.push(ty);
    }

    let mut globals = Vec::with_capacity(n_globals);
    for _ in 0..n_globals {
        globals.push(r.type_at(&types)?);
    }

    let mut floats = Vec::with_capacity(n_floats);
    for _ in 0..n_floats {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(r.bytes(8)?);
        floats.push(f64::from_le_bytes(raw));
    }

    let mut natives = Vec::with_capacity(n_natives);
    for _ in 0..n_natives {
        let len = r.byte()? as usize;
        let name = String::from_utf8(r.bytes(len)?.to_vec())
            .map_err(|_| malformed("native name is not utf-8".to_string()))?;
        let arity = r.byte()? as usize;
        let g = r.index()?;
        if g >= n_globals {
            return Err(malformed(format!("native {:?} global out of bounds", name)));
        }
        if let Some((args, _)) = globals[g].as_fun() {
            if args.len() != arity {
                return Err(malformed(format!(
                    "native {:?} arity {} disagrees with its type",
                    name, arity
                )));
            }
        }
        natives.push((name, g));
    }

    let mut functions = Vec::with_capacity(n_functions);
    for _ in 0..n_functions {
        let index = r.index()?;
        if index >= n_globals {
            return Err(malformed(format!("function index @{} out of bounds", index)));
        }
        let n_regs = r.index()?;
        let n_code = r.index()?;
        let mut regs = Vec::with_capacity(n_regs);
        for _ in 0..n_regs {
            regs.push(r.type_at(&types)?);
        }
        let mut code = Vec::with_capacity(n_code);
        for _ in 0..n_code {
            code.push(r.opcode()?);
        }
        functions.push(FunDecl { index, regs, code });
    }

    if r.pos != buf.len() {
        return Err(malformed(format!("{} trailing bytes", buf.len() - r.pos)));
    }

    Ok(Module {
        version,
        entrypoint,
        globals,
        floats,
        natives,
        functions,
    })
}


fn malformed(what: String) -> ReadError {
    ReadError::Malformed(what)
}


struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected end of input".to_string()))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(malformed("unexpected end of input".to_string()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn vint(&mut self) -> Result<i64> {
        let b = self.byte()? as i64;
        if b & 0x80 == 0 {
            return Ok(b);
        }
        let negative = b & 0x20 != 0;
        let v = if b & 0x40 == 0 {
            ((b & 0x1F) << 8) | self.byte()? as i64
        } else {
            ((b & 0x1F) << 24)
                | (self.byte()? as i64) << 16
                | (self.byte()? as i64) << 8
                | self.byte()? as i64
        };
        Ok(if negative { -v } else { v })
    }

    fn index(&mut self) -> Result<usize> {
        let v = self.vint()?;
        if v < 0 {
            return Err(malformed(format!("negative index {}", v)));
        }
        Ok(v as usize)
    }

    fn delta(&mut self) -> Result<i32> {
        Ok(self.vint()? as i32)
    }

    fn type_at(&mut self, types: &[Type]) -> Result<Type> {
        let i = self.index()?;
        types
            .get(i)
            .cloned()
            .ok_or_else(|| malformed(format!("type reference #{} out of bounds", i)))
    }

    // `before` is how many table entries already exist: references
    // must point backwards (types are a DAG).
    fn type_record(&mut self, types: &[Type], before: usize) -> Result<Type> {
        let tag = self.byte()?;
        match tag {
            0 => Ok(Type::Void),
            1 => Ok(Type::UI8),
            2 => Ok(Type::I32),
            3 => Ok(Type::F32),
            4 => Ok(Type::F64),
            5 => Ok(Type::Bool),
            6 => Ok(Type::Any),
            7 => {
                let arity = self.byte()? as usize;
                let mut args = Vec::with_capacity(arity);
                for _ in 0..arity {
                    args.push(Node::new(self.backward_ref(types, before)?));
                }
                let ret = Node::new(self.backward_ref(types, before)?);
                Ok(Type::Fun(args, ret))
            }
            t => Err(malformed(format!("unknown type tag {}", t))),
        }
    }

    fn backward_ref(&mut self, types: &[Type], before: usize) -> Result<Type> {
        let i = self.index()?;
        if i >= before {
            return Err(malformed(format!("type reference #{} is not backwards", i)));
        }
        Ok(types[i].clone())
    }

    fn opcode(&mut self) -> Result<Opcode> {
        use Opcode::*;
        let b = self.byte()?;
        if b & 0x80 != 0 {
            // The compact binop form: tag in bits 6..1, the
            // destination's high bit in bit 0.
            let tag = (b >> 1) & 0x3F;
            let packed = self.byte()?;
            let r = (((b & 1) as usize) << 2) | (packed >> 6) as usize;
            let a = ((packed >> 3) & 7) as usize;
            let b2 = (packed & 7) as usize;
            return match tag {
                6 => Ok(Add(r, a, b2)),
                7 => Ok(Sub(r, a, b2)),
                16 => Ok(Eq(r, a, b2)),
                17 => Ok(NotEq(r, a, b2)),
                18 => Ok(Lt(r, a, b2)),
                20 => Ok(Gte(r, a, b2)),
                t => Err(malformed(format!("unknown compact opcode tag {}", t))),
            };
        }
        match b {
            0 => Ok(Mov(self.index()?, self.index()?)),
            1 => {
                let r = self.index()?;
                Ok(Int(r, self.byte()? as i32))
            }
            2 => {
                let r = self.index()?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(self.bytes(4)?);
                Ok(Int(r, i32::from_le_bytes(raw)))
            }
            3 => Ok(Float(self.index()?, self.index()?)),
            4 => Ok(Bool(self.index()?, true)),
            5 => Ok(Bool(self.index()?, false)),
            6 => Ok(Add(self.index()?, self.index()?, self.index()?)),
            7 => Ok(Sub(self.index()?, self.index()?, self.index()?)),
            8 => Ok(Incr(self.index()?)),
            9 => Ok(Decr(self.index()?)),
            10 => Ok(Call0(self.index()?, self.index()?)),
            11 => Ok(Call1(self.index()?, self.index()?, self.index()?)),
            12 => Ok(Call2(
                self.index()?,
                self.index()?,
                self.index()?,
                self.index()?,
            )),
            13 => {
                let r = self.index()?;
                let f = self.index()?;
                let n = self.byte()? as usize;
                let mut args = Vec::with_capacity(n);
                for _ in 0..n {
                    args.push(self.index()?);
                }
                Ok(CallN(r, f, args))
            }
            14 => Ok(GetGlobal(self.index()?, self.index()?)),
            15 => Ok(SetGlobal(self.index()?, self.index()?)),
            16 => Ok(Eq(self.index()?, self.index()?, self.index()?)),
            17 => Ok(NotEq(self.index()?, self.index()?, self.index()?)),
            18 => Ok(Lt(self.index()?, self.index()?, self.index()?)),
            20 => Ok(Gte(self.index()?, self.index()?, self.index()?)),
            21 => Ok(Ret(self.index()?)),
            22 => Ok(JTrue(self.index()?, self.delta()?)),
            23 => Ok(JFalse(self.index()?, self.delta()?)),
            24 => Ok(JNull(self.index()?, self.delta()?)),
            25 => Ok(JNotNull(self.index()?, self.delta()?)),
            26 => Ok(JAlways(self.delta()?)),
            27 => Ok(ToAny(self.index()?, self.index()?)),
            28 => Ok(Call3(
                self.index()?,
                self.index()?,
                self.index()?,
                self.index()?,
                self.index()?,
            )),
            t => Err(malformed(format!("unknown opcode tag {}", t))),
        }
    }
}
