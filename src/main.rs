// hlb: bytecode back-end for a small statically typed language.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::env::args;
use std::error::Error;
use std::fs;
use std::process::exit;
use std::rc::Rc;

use hlb::ast;
use hlb::compiler;
use hlb::dump;
use hlb::vm::{self, NativeFn, Value};
use hlb::write;


const USAGE: &str = "usage: hlb <program.ron> <Class:main> [<out.hlb> | --run]";


// Compile a front-end dump. With an output path the module is written
// to disk; with --run it is interpreted against the builtin natives;
// with neither it is disassembled to stdout. Any failure is one
// diagnostic line and a non-zero exit.
fn main() {
    if let Err(e) = drive() {
        eprintln!("hlb: {}", e);
        exit(1);
    }
}


fn drive() -> Result<(), Box<dyn Error>> {
    let path = args().nth(1).ok_or(USAGE)?;
    let entry = args().nth(2).ok_or(USAGE)?;

    let program = ast::load(path)?;
    let module = compiler::compile(&program, &entry)?;

    match args().nth(3).as_deref() {
        Some("--run") => {
            let result = vm::interp(&module, &builtins())?;
            println!("{:?}", result);
        }
        Some(out) => {
            hlb::verifier::verify(&module)?;
            fs::write(out, write::write(&module)?)?;
        }
        None => {
            hlb::verifier::verify(&module)?;
            print!("{}", dump::dump(&module));
        }
    }
    Ok(())
}


// The native set a bare driver provides.
fn builtins() -> HashMap<String, NativeFn> {
    let mut natives: HashMap<String, NativeFn> = HashMap::new();
    natives.insert(
        "std@log".to_string(),
        Rc::new(|args: &[Value]| {
            match args.first() {
                Some(Value::Any(v, _)) => println!("{:?}", v),
                Some(v) => println!("{:?}", v),
                None => println!(),
            }
            Value::Null
        }),
    );
    natives
}
