//! Lowering from the AST to VM bytecode.

pub mod codegen;
pub mod instructions;

pub use codegen::{compile, compile_expression, CompiledTemplate};
pub use instructions::{Instruction, Instructions};
