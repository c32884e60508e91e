//! CIL instruction streams and module metadata, the substrate the transformer works on.
//!
//! This module provides the in-memory model of a compiled .NET module:
//!
//! - [`OpCode`] - the instruction set subset relevant to call-site analysis, with
//!   ECMA-335 stack behavior ([`PopBehavior`]/[`PushBehavior`]) and control-flow
//!   classification ([`FlowType`])
//! - [`Instruction`] / [`InstrId`] - instructions with identities that are stable
//!   across stream edits, so branch targets and exception-handler boundaries never
//!   need fixing up when instructions are inserted, removed or replaced
//! - [`MethodBody`] - an editable instruction stream with locals and handler regions
//! - [`Module`] - the arena of type/field/method definitions and import tables
//!
//! # Example
//!
//! ```rust
//! use regexweave::cil::{MethodBody, OpCode, Operand};
//!
//! let mut body = MethodBody::new();
//! let load = body.emit(OpCode::Ldstr, Operand::Str("abc".to_string()));
//! body.emit(OpCode::Ret, Operand::None);
//! assert_eq!(body.position_of(load), Some(0));
//! ```

mod body;
mod instruction;
mod module;
mod opcode;

pub use body::{ExceptionHandler, HandlerKind, LocalVar, MethodBody};
pub use instruction::{InstrId, Instruction, Operand};
pub use module::{
    AssemblyName, AttrValue, CustomAttribute, FieldAttributes, FieldDef, FieldImport, FieldIndex,
    FieldRef, FieldRefIndex, MethodAttributes, MethodDef, MethodImport, MethodIndex, MethodRef,
    MethodRefIndex, Module, ParamSig, TypeAttributes, TypeDef, TypeImport, TypeIndex, TypeName,
    TypeRef, TypeRefIndex, Version,
};
pub use opcode::{FlowType, OpCode, PopBehavior, PushBehavior};
