//! Decoding of compile-time constants from single load instructions.
//!
//! The whole transformation only fires for call sites whose pattern, options and timeout
//! arguments are literal loads. These helpers map one instruction to its constant value,
//! covering every integer load encoding the compiler may pick for a given value (the
//! short forms `ldc.i4.0` through `ldc.i4.8`, `ldc.i4.m1`, the sign-extended `ldc.i4.s`
//! and the full-width `ldc.i4`). Any other instruction yields `None`, which the caller
//! treats as "not a constant argument" and skips the site.

use crate::cil::{Instruction, OpCode, Operand};

/// Decode a 32-bit integer constant from a single instruction, if it is one.
#[must_use]
pub fn int_literal(instruction: &Instruction) -> Option<i32> {
    match instruction.opcode {
        OpCode::LdcI4M1 => Some(-1),
        OpCode::LdcI4_0 => Some(0),
        OpCode::LdcI4_1 => Some(1),
        OpCode::LdcI4_2 => Some(2),
        OpCode::LdcI4_3 => Some(3),
        OpCode::LdcI4_4 => Some(4),
        OpCode::LdcI4_5 => Some(5),
        OpCode::LdcI4_6 => Some(6),
        OpCode::LdcI4_7 => Some(7),
        OpCode::LdcI4_8 => Some(8),
        OpCode::LdcI4S | OpCode::LdcI4 => match instruction.operand {
            Operand::Int32(value) => Some(value),
            _ => None,
        },
        _ => None,
    }
}

/// Decode a 64-bit integer constant from a single instruction, if it is one.
///
/// Covers `ldc.i8` directly and every 32-bit encoding widened, which is how the
/// compiler emits small `long` constants such as `TimeSpan` tick counts.
#[must_use]
pub fn long_literal(instruction: &Instruction) -> Option<i64> {
    match instruction.opcode {
        OpCode::LdcI8 => match instruction.operand {
            Operand::Int64(value) => Some(value),
            _ => None,
        },
        _ => int_literal(instruction).map(i64::from),
    }
}

/// Decode a string constant from a single instruction, if it is an `ldstr`.
#[must_use]
pub fn str_literal(instruction: &Instruction) -> Option<&str> {
    match (&instruction.opcode, &instruction.operand) {
        (OpCode::Ldstr, Operand::Str(value)) => Some(value.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::MethodBody;

    fn single(opcode: OpCode, operand: Operand) -> Instruction {
        let mut body = MethodBody::new();
        let id = body.emit(opcode, operand);
        body.get(id).unwrap().clone()
    }

    #[test]
    fn short_form_integer_encodings() {
        assert_eq!(int_literal(&single(OpCode::LdcI4M1, Operand::None)), Some(-1));
        assert_eq!(int_literal(&single(OpCode::LdcI4_0, Operand::None)), Some(0));
        assert_eq!(int_literal(&single(OpCode::LdcI4_8, Operand::None)), Some(8));
    }

    #[test]
    fn wide_integer_encodings_read_the_operand() {
        assert_eq!(
            int_literal(&single(OpCode::LdcI4S, Operand::Int32(-113))),
            Some(-113)
        );
        assert_eq!(
            int_literal(&single(OpCode::LdcI4, Operand::Int32(1 << 20))),
            Some(1 << 20)
        );
    }

    #[test]
    fn non_constant_loads_are_rejected() {
        assert_eq!(int_literal(&single(OpCode::Ldarg0, Operand::None)), None);
        assert_eq!(
            str_literal(&single(OpCode::Ldnull, Operand::None)),
            None
        );
    }

    #[test]
    fn string_and_long_literals() {
        let instr = single(OpCode::Ldstr, Operand::Str("^x+$".to_string()));
        assert_eq!(str_literal(&instr), Some("^x+$"));

        assert_eq!(
            long_literal(&single(OpCode::LdcI8, Operand::Int64(10_000_000))),
            Some(10_000_000)
        );
        assert_eq!(long_literal(&single(OpCode::LdcI4_3, Operand::None)), Some(3));
    }
}
