use crate::bytecode::{Module, Opcode};
use std::fmt::Write;


// Renders a module as the line-oriented listing used for diagnostics
// and tests: header, entrypoint, then the globals, floats, natives and
// functions sections, one line per item, registers and opcodes
// indented below their function.
pub fn dump(m: &Module) -> String {
    let mut s = String::new();
    render(m, &mut s).expect("writing to a string cannot fail");
    s
}


fn render(m: &Module, s: &mut String) -> std::fmt::Result {
    writeln!(s, "hl v{}", m.version)?;
    writeln!(s, "entry @{}", m.entrypoint)?;

    writeln!(s, "{} globals", m.globals.len())?;
    for (i, ty) in m.globals.iter().enumerate() {
        writeln!(s, "\t@{} : {}", i, ty)?;
    }

    writeln!(s, "{} floats", m.floats.len())?;
    for (i, f) in m.floats.iter().enumerate() {
        writeln!(s, "\t@{} {}", i, f)?;
    }

    writeln!(s, "{} natives", m.natives.len())?;
    for (name, g) in &m.natives {
        writeln!(s, "\tnative {} @{} : {}", name, g, global_type(m, *g))?;
    }

    writeln!(s, "{} functions", m.functions.len())?;
    for f in &m.functions {
        writeln!(s, "\tfun {} : {}", f.index, global_type(m, f.index))?;
        for (i, ty) in f.regs.iter().enumerate() {
            writeln!(s, "\t\tr{} {}", i, ty)?;
        }
        for (i, op) in f.code.iter().enumerate() {
            writeln!(s, "\t\t@{} {} {}", i, op.mnemonic(), operands(op))?;
        }
    }
    Ok(())
}


fn global_type(m: &Module, g: usize) -> String {
    match m.globals.get(g) {
        Some(ty) => ty.to_string(),
        None => "?".to_string(),
    }
}


fn operands(op: &Opcode) -> String {
    use Opcode::*;
    match op {
        Mov(a, b) | ToAny(a, b) => format!("{},{}", a, b),
        Int(r, i) => format!("{},{}", r, i),
        Float(r, idx) => format!("{},@{}", r, idx),
        Bool(r, _) => format!("{}", r),
        Add(r, a, b) | Sub(r, a, b) | Eq(r, a, b) | NotEq(r, a, b) | Lt(r, a, b)
        | Gte(r, a, b) => format!("{},{},{}", r, a, b),
        Incr(r) | Decr(r) | Ret(r) => format!("{}", r),
        Call0(r, g) => format!("{},@{}()", r, g),
        Call1(r, g, a) => format!("{},@{}({})", r, g, a),
        Call2(r, g, a, b) => format!("{},@{}({},{})", r, g, a, b),
        Call3(r, g, a, b, c) => format!("{},@{}({},{},{})", r, g, a, b, c),
        CallN(r, f, args) => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            format!("{},r{}({})", r, f, args.join(","))
        }
        GetGlobal(r, g) => format!("{},@{}", r, g),
        SetGlobal(g, r) => format!("@{},{}", g, r),
        JTrue(r, d) | JFalse(r, d) | JNull(r, d) | JNotNull(r, d) => format!("{},{}", r, d),
        JAlways(d) => format!("{}", d),
    }
}
