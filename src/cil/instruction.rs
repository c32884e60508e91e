//! Instruction representation for mutable CIL method bodies.
//!
//! Unlike an offset-based disassembly view, instructions here carry a stable [`InstrId`]
//! assigned by their owning [`crate::cil::MethodBody`]. Branch operands, switch tables and
//! exception-handler boundaries reference ids rather than stream positions, so removing or
//! inserting instructions never invalidates a reference: an id either still resolves within
//! the body or validation fails loudly.

use crate::cil::{
    module::{FieldRef, MethodRef, TypeRef},
    OpCode,
};

/// Stable identity of an instruction within one method body.
///
/// Ids are unique per body and never reused; they carry no ordering meaning. Use
/// [`crate::cil::MethodBody::position_of`] to recover the current stream position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub(crate) u32);

impl InstrId {
    /// Raw id value, for diagnostics.
    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for InstrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IL_{:04}", self.0)
    }
}

/// An instruction operand.
///
/// Covers every operand kind the transformer reads, rewrites or relocates: inline constants,
/// branch targets (by [`InstrId`]), member references and parameter/local slots.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Inline 8/32-bit integer constant (sign-extended for the short form)
    Int32(i32),
    /// Inline 64-bit integer constant
    Int64(i64),
    /// Inline floating point constant
    Float64(f64),
    /// Inline string literal
    Str(String),
    /// Branch target within the same body
    Target(InstrId),
    /// Jump table for `switch`
    Switch(Vec<InstrId>),
    /// Method reference (definition in this module or imported)
    Method(MethodRef),
    /// Field reference (definition in this module or imported)
    Field(FieldRef),
    /// Type reference (definition in this module or imported)
    Type(TypeRef),
    /// Local variable slot (long-form index)
    Local(u16),
    /// Parameter slot (long-form index)
    Param(u16),
}

/// One decoded, mutable CIL instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Stable identity within the owning body
    pub id: InstrId,
    /// The opcode
    pub opcode: OpCode,
    /// The operand, if any
    pub operand: Operand,
}

impl Instruction {
    /// The method operand for call-shaped instructions, if present.
    #[must_use]
    pub fn method_operand(&self) -> Option<&MethodRef> {
        match &self.operand {
            Operand::Method(m) => Some(m),
            _ => None,
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.operand {
            Operand::None => write!(f, "{}: {}", self.id, self.opcode.mnemonic()),
            Operand::Str(s) => write!(f, "{}: {} {:?}", self.id, self.opcode.mnemonic(), s),
            Operand::Target(t) => write!(f, "{}: {} {}", self.id, self.opcode.mnemonic(), t),
            other => write!(f, "{}: {} {:?}", self.id, self.opcode.mnemonic(), other),
        }
    }
}
