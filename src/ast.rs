use crate::types::Type;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;


// Abstract over various memory management strategies.
pub type Node<T> = Rc<T>;
pub type Seq<T> = Vec<Node<T>>;


// Arithmetic and relational operators as the front-end spells them.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}


#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
pub enum UnOp {
    Incr,
    Decr,
    Not,
    Neg,
}


// Literal constants. An integer literal is an i32 by construction;
// anything wider cannot enter the pipeline.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub enum Const {
    Int(i32),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
}


// A resolved local variable. The id is unique within a method and is
// what the compiler keys register slots on.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Var {
    pub id: u32,
    pub name: String,
    pub ty: Type,
}


// How a field is reached. Only static access survives type checking in
// the supported subset.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub enum FieldAccess {
    Static { class: String, field: String },
}


// A typed expression: every node carries the type the front-end
// resolved for it.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TExpr {
    pub expr: ExprKind,
    pub ty: Type,
}


#[derive(Clone, Debug, PartialEq, Deserialize)]
pub enum ExprKind {
    Const(Const),
    Local(Node<Var>),
    Var(Node<Var>, Option<Node<TExpr>>),
    Return(Option<Node<TExpr>>),
    Paren(Node<TExpr>),
    Block(Seq<TExpr>),
    Call(Node<TExpr>, Seq<TExpr>),
    Field(FieldAccess),
    ObjectDecl(Vec<(String, Node<TExpr>)>),
    If(Node<TExpr>, Node<TExpr>, Option<Node<TExpr>>),
    While(Node<TExpr>, Node<TExpr>),
    Binop(BinOp, Node<TExpr>, Node<TExpr>),
    Unop(UnOp, Node<TExpr>),
}


// One formal argument; the default, when present, is a literal.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Arg {
    pub var: Node<Var>,
    pub default: Option<Const>,
}


// A static method. Extern methods carry a native marker (library and
// function name) instead of a body.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Method {
    pub name: String,
    pub args: Vec<Arg>,
    pub ret: Type,
    pub body: Option<Node<TExpr>>,
    pub native: Option<(String, String)>,
}


#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ClassDecl {
    pub path: String,
    pub is_extern: bool,
    pub methods: Vec<Method>,
}


#[derive(Clone, Debug, PartialEq, Deserialize)]
pub enum TypeDecl {
    Class(ClassDecl),
    Alias(String),
    Abstract(String),
    Enum(String),
    Interface(String),
}


// ADT for whole programs, as handed over by the front-end.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Program {
    pub types: Vec<TypeDecl>,
}


#[derive(Debug, Error)]
pub enum LoadError {
    #[error("couldn't read program: {0}")]
    Io(#[from] std::io::Error),
    #[error("couldn't parse program: {0}")]
    Parse(String),
}


// Read a front-end dump from disk. The interchange format is RON,
// which round-trips the enum shapes above without any glue.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Program, LoadError> {
    let reader = File::open(path)?;
    ron::de::from_reader(reader).map_err(|e| LoadError::Parse(e.to_string()))
}
