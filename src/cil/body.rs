//! Mutable CIL method bodies: instruction streams, locals and exception-handler regions.
//!
//! A [`MethodBody`] owns an ordered instruction stream plus local-variable declarations and
//! exception-handler regions whose boundaries reference instructions in the same body. The
//! editing API works in terms of [`InstrId`]s so that call-site rewriting never has to fix up
//! branch targets: `replace` keeps the replaced instruction's id, and `remove` refuses to
//! drop an instruction that is still a branch target or a handler boundary.
//!
//! Invariant (checked by [`MethodBody::validate`]): after any edit, every `Target`/`Switch`
//! operand and every handler boundary references an instruction that exists in this body.

use crate::{
    cil::{
        module::{TypeName, TypeRef},
        InstrId, Instruction, OpCode, Operand,
    },
    Result,
};

/// One local variable slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVar {
    /// Debug name, if any
    pub name: Option<String>,
    /// The variable's type
    pub ty: TypeName,
}

/// The kind of one exception-handler region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Typed catch clause
    Catch,
    /// Filter clause (`filter` / `endfilter`)
    Filter,
    /// `finally` clause
    Finally,
    /// `fault` clause
    Fault,
}

/// One exception-handler region within a method body.
///
/// All boundaries are instruction ids within the same body. `try_end` and `handler_end`
/// follow the Cecil convention of referencing the first instruction *after* the region.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub kind: HandlerKind,
    /// First instruction of the protected region
    pub try_start: InstrId,
    /// First instruction after the protected region
    pub try_end: InstrId,
    /// First instruction of the handler
    pub handler_start: InstrId,
    /// First instruction after the handler
    pub handler_end: InstrId,
    /// First instruction of the filter, for [`HandlerKind::Filter`]
    pub filter_start: Option<InstrId>,
    /// The caught exception type, for [`HandlerKind::Catch`]
    pub catch_type: Option<TypeRef>,
}

impl ExceptionHandler {
    /// All instruction ids that delimit this handler's regions.
    pub fn boundaries(&self) -> impl Iterator<Item = InstrId> + '_ {
        [
            self.try_start,
            self.try_end,
            self.handler_start,
            self.handler_end,
        ]
        .into_iter()
        .chain(self.filter_start)
    }
}

/// A mutable CIL method body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodBody {
    /// Ordered instruction stream; order is significant and mutable
    pub instructions: Vec<Instruction>,
    /// Local variable declarations
    pub locals: Vec<LocalVar>,
    /// Exception-handler regions referencing instructions in this body
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Whether locals must be zero-initialized
    pub init_locals: bool,
    /// Declared operand stack depth
    pub max_stack: u16,
    next_id: u32,
}

impl MethodBody {
    /// Create an empty body.
    #[must_use]
    pub fn new() -> Self {
        MethodBody::default()
    }

    /// Reserve a fresh instruction id without appending an instruction.
    ///
    /// Used when an instruction must be referenced (as a branch target) before it is
    /// actually emitted, mirroring the forward-label pattern of IL emitters.
    pub fn fresh_id(&mut self) -> InstrId {
        let id = InstrId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append an instruction, returning its id.
    pub fn emit(&mut self, opcode: OpCode, operand: Operand) -> InstrId {
        let id = self.fresh_id();
        self.instructions.push(Instruction {
            id,
            opcode,
            operand,
        });
        id
    }

    /// Append an instruction under a previously reserved id.
    pub fn emit_with_id(&mut self, id: InstrId, opcode: OpCode, operand: Operand) {
        self.instructions.push(Instruction {
            id,
            opcode,
            operand,
        });
    }

    /// Declare a new local variable, returning its slot index.
    pub fn alloc_local(&mut self, ty: TypeName) -> u16 {
        self.locals.push(LocalVar { name: None, ty });
        // Local slots are u16 in long-form encodings; bodies this crate touches stay far below
        #[allow(clippy::cast_possible_truncation)]
        let slot = (self.locals.len() - 1) as u16;
        slot
    }

    /// Current stream position of an instruction, if it exists in this body.
    #[must_use]
    pub fn position_of(&self, id: InstrId) -> Option<usize> {
        self.instructions.iter().position(|i| i.id == id)
    }

    /// Look up an instruction by id.
    #[must_use]
    pub fn get(&self, id: InstrId) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.id == id)
    }

    /// Remove the instruction with the given id.
    ///
    /// # Errors
    /// Fails if the id does not exist in this body, or if removing it would dangle a branch
    /// target or an exception-handler boundary.
    pub fn remove(&mut self, id: InstrId) -> Result<Instruction> {
        let Some(position) = self.position_of(id) else {
            return Err(weave_error!("Cannot remove {}: not in this body", id));
        };

        if self.is_referenced(id) {
            return Err(weave_error!(
                "Cannot remove {}: still referenced by a branch or handler",
                id
            ));
        }

        Ok(self.instructions.remove(position))
    }

    /// Replace the opcode and operand of an instruction in place, keeping its id.
    ///
    /// Incoming branches to the replaced instruction remain valid, which is what makes the
    /// call-site redirect a one-instruction edit.
    ///
    /// # Errors
    /// Fails if the id does not exist in this body.
    pub fn replace(&mut self, id: InstrId, opcode: OpCode, operand: Operand) -> Result<()> {
        let Some(position) = self.position_of(id) else {
            return Err(weave_error!("Cannot replace {}: not in this body", id));
        };

        self.instructions[position].opcode = opcode;
        self.instructions[position].operand = operand;
        Ok(())
    }

    /// Insert a new instruction immediately before the instruction with the given id.
    ///
    /// # Errors
    /// Fails if the id does not exist in this body.
    pub fn insert_before(&mut self, id: InstrId, opcode: OpCode, operand: Operand) -> Result<InstrId> {
        let Some(position) = self.position_of(id) else {
            return Err(weave_error!("Cannot insert before {}: not in this body", id));
        };

        let new_id = self.fresh_id();
        self.instructions.insert(
            position,
            Instruction {
                id: new_id,
                opcode,
                operand,
            },
        );
        Ok(new_id)
    }

    /// Whether any branch operand or handler boundary references the given id.
    #[must_use]
    pub fn is_referenced(&self, id: InstrId) -> bool {
        let in_operands = self.instructions.iter().any(|i| match &i.operand {
            Operand::Target(t) => *t == id,
            Operand::Switch(targets) => targets.contains(&id),
            _ => false,
        });

        in_operands
            || self
                .exception_handlers
                .iter()
                .any(|h| h.boundaries().any(|b| b == id))
    }

    /// Check the branch-target invariant: every referenced id resolves in this body.
    ///
    /// # Errors
    /// Returns a malformed-body error naming the first dangling reference.
    pub fn validate(&self) -> Result<()> {
        for instruction in &self.instructions {
            match &instruction.operand {
                Operand::Target(t) => {
                    if self.position_of(*t).is_none() {
                        return Err(weave_error!(
                            "Branch {} targets {} which is not in this body",
                            instruction.id,
                            t
                        ));
                    }
                }
                Operand::Switch(targets) => {
                    for t in targets {
                        if self.position_of(*t).is_none() {
                            return Err(weave_error!(
                                "Switch {} targets {} which is not in this body",
                                instruction.id,
                                t
                            ));
                        }
                    }
                }
                Operand::Local(slot) => {
                    if usize::from(*slot) >= self.locals.len() {
                        return Err(weave_error!(
                            "Instruction {} references undeclared local slot {}",
                            instruction.id,
                            slot
                        ));
                    }
                }
                _ => {}
            }
        }

        for (index, handler) in self.exception_handlers.iter().enumerate() {
            for boundary in handler.boundaries() {
                if self.position_of(boundary).is_none() {
                    return Err(weave_error!(
                        "Exception handler {} references {} which is not in this body",
                        index,
                        boundary
                    ));
                }
            }
        }

        Ok(())
    }
}
