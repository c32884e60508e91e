//! CIL opcode definitions with flow-control and stack-effect metadata.
//!
//! Every opcode the transformer models carries three pieces of static metadata: its mnemonic,
//! how it affects control flow ([`FlowType`]) and how it affects the evaluation stack
//! ([`PopBehavior`]/[`PushBehavior`]). The backward argument locator consumes the stack
//! metadata; the rewriter and generator consume the mnemonics only for diagnostics.
//!
//! Call-shaped opcodes (`call`, `callvirt`, `newobj`) have variable stack effects that depend
//! on the signature of the method operand; those are resolved at the point of use against the
//! owning [`crate::cil::Module`], which is why the behavior enums carry a `Var` arm instead of
//! a count.
//!
//! # References
//! - ECMA-335 6th Edition, Partition III - CIL Instruction Set

use strum::IntoStaticStr;

/// How an instruction affects control flow.
///
/// Anything other than `Sequential` and `Call` delimits the straight-line region the
/// argument locator is allowed to reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Execution continues with the next instruction
    Sequential,
    /// Transfers control to a method and returns
    Call,
    /// Branches to the target only when the popped condition holds
    ConditionalBranch,
    /// Always branches to the target
    UnconditionalBranch,
    /// Multi-way branch over a jump table
    Switch,
    /// Leaves the method (or a protected region, for `endfinally`)
    Return,
    /// Raises an exception
    Throw,
    /// Debugger breakpoint
    Break,
}

/// Number of values an instruction removes from the evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopBehavior {
    /// Pops exactly this many values
    Fixed(u8),
    /// Pops one value per declared parameter, plus the receiver for instance calls;
    /// resolved against the method operand's signature
    VarPop,
    /// No stack model exists for this opcode (e.g. `ret`)
    Unmodeled,
}

/// Number of values an instruction places onto the evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushBehavior {
    /// Pushes exactly this many values
    Fixed(u8),
    /// Pushes one value unless the called method returns void;
    /// resolved against the method operand's signature
    VarPush,
}

/// The CIL opcodes modeled by this crate.
///
/// This is the subset of ECMA-335 Partition III that can appear in the code regions the
/// transformer reads or writes: constant loads in every encoding, argument/local/field
/// access, calls, branches, comparisons, and the handful of object-model instructions the
/// generated accessors and compiled regex bodies use. Mnemonics follow the standard exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
#[allow(missing_docs)] // the mnemonic is the documentation
pub enum OpCode {
    #[strum(serialize = "nop")]
    Nop,
    #[strum(serialize = "break")]
    Break,
    #[strum(serialize = "dup")]
    Dup,
    #[strum(serialize = "pop")]
    Pop,
    #[strum(serialize = "ret")]
    Ret,
    #[strum(serialize = "throw")]
    Throw,
    #[strum(serialize = "rethrow")]
    Rethrow,

    // Constant loads, every encoding from the short forms to the generic i4 form
    #[strum(serialize = "ldc.i4.m1")]
    LdcI4M1,
    #[strum(serialize = "ldc.i4.0")]
    LdcI4_0,
    #[strum(serialize = "ldc.i4.1")]
    LdcI4_1,
    #[strum(serialize = "ldc.i4.2")]
    LdcI4_2,
    #[strum(serialize = "ldc.i4.3")]
    LdcI4_3,
    #[strum(serialize = "ldc.i4.4")]
    LdcI4_4,
    #[strum(serialize = "ldc.i4.5")]
    LdcI4_5,
    #[strum(serialize = "ldc.i4.6")]
    LdcI4_6,
    #[strum(serialize = "ldc.i4.7")]
    LdcI4_7,
    #[strum(serialize = "ldc.i4.8")]
    LdcI4_8,
    #[strum(serialize = "ldc.i4.s")]
    LdcI4S,
    #[strum(serialize = "ldc.i4")]
    LdcI4,
    #[strum(serialize = "ldc.i8")]
    LdcI8,
    #[strum(serialize = "ldc.r8")]
    LdcR8,
    #[strum(serialize = "ldstr")]
    Ldstr,
    #[strum(serialize = "ldnull")]
    Ldnull,
    #[strum(serialize = "ldtoken")]
    Ldtoken,

    // Arguments
    #[strum(serialize = "ldarg.0")]
    Ldarg0,
    #[strum(serialize = "ldarg.1")]
    Ldarg1,
    #[strum(serialize = "ldarg.2")]
    Ldarg2,
    #[strum(serialize = "ldarg.3")]
    Ldarg3,
    #[strum(serialize = "ldarg.s")]
    LdargS,
    #[strum(serialize = "ldarg")]
    Ldarg,

    // Locals
    #[strum(serialize = "ldloc.0")]
    Ldloc0,
    #[strum(serialize = "ldloc.1")]
    Ldloc1,
    #[strum(serialize = "ldloc.2")]
    Ldloc2,
    #[strum(serialize = "ldloc.3")]
    Ldloc3,
    #[strum(serialize = "ldloc.s")]
    LdlocS,
    #[strum(serialize = "ldloc")]
    Ldloc,
    #[strum(serialize = "stloc.0")]
    Stloc0,
    #[strum(serialize = "stloc.1")]
    Stloc1,
    #[strum(serialize = "stloc.2")]
    Stloc2,
    #[strum(serialize = "stloc.3")]
    Stloc3,
    #[strum(serialize = "stloc.s")]
    StlocS,
    #[strum(serialize = "stloc")]
    Stloc,

    // Fields
    #[strum(serialize = "ldfld")]
    Ldfld,
    #[strum(serialize = "stfld")]
    Stfld,
    #[strum(serialize = "ldsfld")]
    Ldsfld,
    #[strum(serialize = "stsfld")]
    Stsfld,

    // Calls
    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "callvirt")]
    Callvirt,
    #[strum(serialize = "newobj")]
    Newobj,

    // Branches
    #[strum(serialize = "br")]
    Br,
    #[strum(serialize = "br.s")]
    BrS,
    #[strum(serialize = "brtrue")]
    Brtrue,
    #[strum(serialize = "brtrue.s")]
    BrtrueS,
    #[strum(serialize = "brfalse")]
    Brfalse,
    #[strum(serialize = "brfalse.s")]
    BrfalseS,
    #[strum(serialize = "beq")]
    Beq,
    #[strum(serialize = "beq.s")]
    BeqS,
    #[strum(serialize = "bne.un")]
    BneUn,
    #[strum(serialize = "bne.un.s")]
    BneUnS,
    #[strum(serialize = "switch")]
    Switch,
    #[strum(serialize = "leave")]
    Leave,
    #[strum(serialize = "leave.s")]
    LeaveS,
    #[strum(serialize = "endfinally")]
    Endfinally,

    // Arithmetic and comparison
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "sub")]
    Sub,
    #[strum(serialize = "mul")]
    Mul,
    #[strum(serialize = "div")]
    Div,
    #[strum(serialize = "rem")]
    Rem,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
    #[strum(serialize = "xor")]
    Xor,
    #[strum(serialize = "neg")]
    Neg,
    #[strum(serialize = "not")]
    Not,
    #[strum(serialize = "ceq")]
    Ceq,
    #[strum(serialize = "cgt")]
    Cgt,
    #[strum(serialize = "clt")]
    Clt,
    #[strum(serialize = "conv.i4")]
    ConvI4,
    #[strum(serialize = "conv.i8")]
    ConvI8,

    // Object model
    #[strum(serialize = "box")]
    Box,
    #[strum(serialize = "castclass")]
    Castclass,
    #[strum(serialize = "newarr")]
    Newarr,
    #[strum(serialize = "ldlen")]
    Ldlen,
}

impl OpCode {
    /// The standard mnemonic for this opcode, e.g. `"ldc.i4.s"`.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    /// How this opcode affects control flow.
    #[must_use]
    pub fn flow_type(self) -> FlowType {
        match self {
            OpCode::Br | OpCode::BrS | OpCode::Leave | OpCode::LeaveS => {
                FlowType::UnconditionalBranch
            }
            OpCode::Brtrue
            | OpCode::BrtrueS
            | OpCode::Brfalse
            | OpCode::BrfalseS
            | OpCode::Beq
            | OpCode::BeqS
            | OpCode::BneUn
            | OpCode::BneUnS => FlowType::ConditionalBranch,
            OpCode::Switch => FlowType::Switch,
            OpCode::Ret | OpCode::Endfinally => FlowType::Return,
            OpCode::Throw | OpCode::Rethrow => FlowType::Throw,
            OpCode::Break => FlowType::Break,
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj => FlowType::Call,
            _ => FlowType::Sequential,
        }
    }

    /// Whether this opcode ends the straight-line region the argument locator may walk.
    ///
    /// Matches the original block-delimiter set: branches (conditional, unconditional and
    /// switch), returns and breakpoints. `throw` is deliberately not a delimiter.
    #[must_use]
    pub fn is_block_delimiter(self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Return
                | FlowType::Break
        )
    }

    /// Values this opcode removes from the evaluation stack.
    #[must_use]
    pub fn pop_behavior(self) -> PopBehavior {
        match self {
            OpCode::Nop
            | OpCode::Break
            | OpCode::LdcI4M1
            | OpCode::LdcI4_0
            | OpCode::LdcI4_1
            | OpCode::LdcI4_2
            | OpCode::LdcI4_3
            | OpCode::LdcI4_4
            | OpCode::LdcI4_5
            | OpCode::LdcI4_6
            | OpCode::LdcI4_7
            | OpCode::LdcI4_8
            | OpCode::LdcI4S
            | OpCode::LdcI4
            | OpCode::LdcI8
            | OpCode::LdcR8
            | OpCode::Ldstr
            | OpCode::Ldnull
            | OpCode::Ldtoken
            | OpCode::Ldarg0
            | OpCode::Ldarg1
            | OpCode::Ldarg2
            | OpCode::Ldarg3
            | OpCode::LdargS
            | OpCode::Ldarg
            | OpCode::Ldloc0
            | OpCode::Ldloc1
            | OpCode::Ldloc2
            | OpCode::Ldloc3
            | OpCode::LdlocS
            | OpCode::Ldloc
            | OpCode::Ldsfld
            | OpCode::Br
            | OpCode::BrS
            | OpCode::Leave
            | OpCode::LeaveS
            | OpCode::Endfinally
            | OpCode::Rethrow => PopBehavior::Fixed(0),
            OpCode::Dup
            | OpCode::Pop
            | OpCode::Throw
            | OpCode::Stloc0
            | OpCode::Stloc1
            | OpCode::Stloc2
            | OpCode::Stloc3
            | OpCode::StlocS
            | OpCode::Stloc
            | OpCode::Ldfld
            | OpCode::Stsfld
            | OpCode::Brtrue
            | OpCode::BrtrueS
            | OpCode::Brfalse
            | OpCode::BrfalseS
            | OpCode::Switch
            | OpCode::Neg
            | OpCode::Not
            | OpCode::ConvI4
            | OpCode::ConvI8
            | OpCode::Box
            | OpCode::Castclass
            | OpCode::Newarr
            | OpCode::Ldlen => PopBehavior::Fixed(1),
            OpCode::Stfld
            | OpCode::Beq
            | OpCode::BeqS
            | OpCode::BneUn
            | OpCode::BneUnS
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Rem
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Ceq
            | OpCode::Cgt
            | OpCode::Clt => PopBehavior::Fixed(2),
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj => PopBehavior::VarPop,
            OpCode::Ret => PopBehavior::Unmodeled,
        }
    }

    /// Values this opcode places onto the evaluation stack.
    #[must_use]
    pub fn push_behavior(self) -> PushBehavior {
        match self {
            OpCode::Dup => PushBehavior::Fixed(2),
            OpCode::LdcI4M1
            | OpCode::LdcI4_0
            | OpCode::LdcI4_1
            | OpCode::LdcI4_2
            | OpCode::LdcI4_3
            | OpCode::LdcI4_4
            | OpCode::LdcI4_5
            | OpCode::LdcI4_6
            | OpCode::LdcI4_7
            | OpCode::LdcI4_8
            | OpCode::LdcI4S
            | OpCode::LdcI4
            | OpCode::LdcI8
            | OpCode::LdcR8
            | OpCode::Ldstr
            | OpCode::Ldnull
            | OpCode::Ldtoken
            | OpCode::Ldarg0
            | OpCode::Ldarg1
            | OpCode::Ldarg2
            | OpCode::Ldarg3
            | OpCode::LdargS
            | OpCode::Ldarg
            | OpCode::Ldloc0
            | OpCode::Ldloc1
            | OpCode::Ldloc2
            | OpCode::Ldloc3
            | OpCode::LdlocS
            | OpCode::Ldloc
            | OpCode::Ldsfld
            | OpCode::Ldfld
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Rem
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Neg
            | OpCode::Not
            | OpCode::Ceq
            | OpCode::Cgt
            | OpCode::Clt
            | OpCode::ConvI4
            | OpCode::ConvI8
            | OpCode::Box
            | OpCode::Castclass
            | OpCode::Newarr
            | OpCode::Ldlen
            | OpCode::Newobj => PushBehavior::Fixed(1),
            OpCode::Call | OpCode::Callvirt => PushBehavior::VarPush,
            _ => PushBehavior::Fixed(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics_follow_the_standard() {
        assert_eq!(OpCode::LdcI4S.mnemonic(), "ldc.i4.s");
        assert_eq!(OpCode::Newobj.mnemonic(), "newobj");
        assert_eq!(OpCode::BneUnS.mnemonic(), "bne.un.s");
        assert_eq!(OpCode::Endfinally.mnemonic(), "endfinally");
    }

    #[test]
    fn block_delimiters_match_the_locator_contract() {
        assert!(OpCode::BrS.is_block_delimiter());
        assert!(OpCode::BrfalseS.is_block_delimiter());
        assert!(OpCode::Switch.is_block_delimiter());
        assert!(OpCode::Ret.is_block_delimiter());
        assert!(OpCode::Break.is_block_delimiter());

        assert!(!OpCode::Call.is_block_delimiter());
        assert!(!OpCode::Throw.is_block_delimiter());
        assert!(!OpCode::Nop.is_block_delimiter());
    }

    #[test]
    fn stack_metadata_for_common_opcodes() {
        assert_eq!(OpCode::Ldstr.pop_behavior(), PopBehavior::Fixed(0));
        assert_eq!(OpCode::Ldstr.push_behavior(), PushBehavior::Fixed(1));
        assert_eq!(OpCode::Stfld.pop_behavior(), PopBehavior::Fixed(2));
        assert_eq!(OpCode::Dup.push_behavior(), PushBehavior::Fixed(2));
        assert_eq!(OpCode::Call.pop_behavior(), PopBehavior::VarPop);
        assert_eq!(OpCode::Newobj.push_behavior(), PushBehavior::Fixed(1));
        assert_eq!(OpCode::Ret.pop_behavior(), PopBehavior::Unmodeled);
    }
}
