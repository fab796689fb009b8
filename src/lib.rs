//! Back end for a dynamically typed language: resolved IR is lowered to
//! register bytecode with statically placed reference counting, then run on
//! a register VM with tail calls, error values and suspension.

pub mod bytecode;
pub mod closure;
pub mod config;
pub mod emit;
pub mod ir;
pub mod lifetime;
pub mod value;
pub mod vm;

pub use bytecode::Program;
pub use config::{CompileOptions, RunOptions};
pub use emit::{CompileError, compile};
pub use ir::Module;
pub use value::Value;
pub use vm::{Outcome, Suspension, Vm, VmError, VmStats};
