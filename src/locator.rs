//! Backward stack simulation to locate the instructions producing a call's arguments.
//!
//! Call-site rewriting needs to know, for a given `call`/`newobj`, exactly which
//! instruction pushed each argument. The locator walks the instruction stream backward
//! from the call, accumulating net stack effect, and records a producer every time the
//! running delta accounts for exactly one more argument slot. The walk only succeeds
//! inside a single basic block: any control-flow instruction encountered on the way, or
//! any branch elsewhere in the method that jumps into the consumed range, makes the
//! argument provenance ambiguous and the site is skipped.
//!
//! Failure here is not an error in the weave sense; it means "this call site is not
//! simple enough to transform" and the caller logs the reason and moves on. That is why
//! [`LocateError`] is its own type rather than a [`crate::Error`] variant.

use thiserror::Error;

use crate::cil::{InstrId, MethodBody, MethodRef, Module, OpCode, Operand, PopBehavior, PushBehavior};

/// Why a call site's arguments could not be located.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    /// The walk reached the start of the method with argument slots unaccounted for.
    #[error("ran out of instructions before all arguments were located")]
    OutOfInstructions,

    /// A control-flow instruction sits between the call and its argument producers.
    #[error("argument producers are separated from the call by {mnemonic}")]
    BlockDelimiter {
        /// Mnemonic of the delimiting instruction
        mnemonic: &'static str,
    },

    /// The walk met an instruction whose stack effect this crate does not model.
    #[error("stack effect of {mnemonic} is not modeled")]
    UnmodeledOpcode {
        /// Mnemonic of the unmodeled instruction
        mnemonic: &'static str,
    },

    /// A branch elsewhere in the method jumps into the consumed instruction range.
    #[error("a branch targets the instruction range consumed by the call")]
    IncomingJump,
}

/// Producers of a call's arguments, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedArguments {
    /// `producers[i]` pushed argument `i`
    pub producers: Vec<InstrId>,
}

impl LocatedArguments {
    /// Producer of the given argument index.
    #[must_use]
    pub fn producer(&self, argument: usize) -> Option<InstrId> {
        self.producers.get(argument).copied()
    }
}

/// Locates argument producers by backward stack simulation over a single method body.
pub struct ArgumentLocator<'a> {
    module: &'a Module,
    body: &'a MethodBody,
}

impl<'a> ArgumentLocator<'a> {
    /// Create a locator over one method body.
    #[must_use]
    pub fn new(module: &'a Module, body: &'a MethodBody) -> Self {
        ArgumentLocator { module, body }
    }

    /// Locate the producers of all `arg_count` arguments of the call at `call_id`.
    ///
    /// The count must be the *stack* argument count: declared parameters plus one
    /// for the receiver of an instance `call`/`callvirt` (`newobj` allocates its
    /// receiver itself and takes only the declared parameters).
    ///
    /// # Errors
    /// Returns a [`LocateError`] describing why the site has to be skipped.
    pub fn locate(
        &self,
        call_id: InstrId,
        arg_count: usize,
    ) -> Result<LocatedArguments, LocateError> {
        let call_position = self
            .body
            .position_of(call_id)
            .ok_or(LocateError::OutOfInstructions)?;

        // Filled back to front: the last argument is nearest the call.
        let mut producers = vec![None; arg_count];
        let mut remaining = arg_count;
        let mut delta: isize = 0;
        let mut position = call_position;

        while remaining > 0 {
            if position == 0 {
                return Err(LocateError::OutOfInstructions);
            }
            position -= 1;
            let instruction = &self.body.instructions[position];

            if instruction.opcode.is_block_delimiter() {
                return Err(LocateError::BlockDelimiter {
                    mnemonic: instruction.opcode.mnemonic(),
                });
            }

            delta += self.push_count(instruction)? as isize;
            delta -= self.pop_count(instruction)? as isize;

            if delta == 1 {
                remaining -= 1;
                producers[remaining] = Some(instruction.id);
                delta = 0;
            }
        }

        self.reject_incoming_jumps(position, call_position)?;

        Ok(LocatedArguments {
            producers: producers.into_iter().flatten().collect(),
        })
    }

    /// Stack argument count of the call at `call_id`, receiver included.
    ///
    /// # Errors
    /// Returns [`LocateError::UnmodeledOpcode`] when the instruction is not a call
    /// form, or when its target cannot be resolved.
    pub fn call_argument_count(&self, call_id: InstrId) -> Result<usize, LocateError> {
        let instruction = self
            .body
            .get(call_id)
            .ok_or(LocateError::OutOfInstructions)?;
        let method = match instruction.operand {
            Operand::Method(method) => method,
            _ => {
                return Err(LocateError::UnmodeledOpcode {
                    mnemonic: instruction.opcode.mnemonic(),
                })
            }
        };
        self.resolved_pop(instruction.opcode, method)
    }

    /// Values a single instruction removes from the stack.
    fn pop_count(&self, instruction: &crate::cil::Instruction) -> Result<usize, LocateError> {
        match instruction.opcode.pop_behavior() {
            PopBehavior::Fixed(n) => Ok(n as usize),
            PopBehavior::VarPop => match instruction.operand {
                Operand::Method(method) => self.resolved_pop(instruction.opcode, method),
                _ => Err(LocateError::UnmodeledOpcode {
                    mnemonic: instruction.opcode.mnemonic(),
                }),
            },
            PopBehavior::Unmodeled => Err(LocateError::UnmodeledOpcode {
                mnemonic: instruction.opcode.mnemonic(),
            }),
        }
    }

    /// Values a single instruction leaves on the stack.
    fn push_count(&self, instruction: &crate::cil::Instruction) -> Result<usize, LocateError> {
        match instruction.opcode.push_behavior() {
            PushBehavior::Fixed(n) => Ok(n as usize),
            PushBehavior::VarPush => match instruction.operand {
                Operand::Method(method) => {
                    let (_, _, returns_void, _) = self
                        .module
                        .method_signature(method)
                        .map_err(|_| LocateError::UnmodeledOpcode {
                            mnemonic: instruction.opcode.mnemonic(),
                        })?;
                    Ok(usize::from(!returns_void))
                }
                _ => Err(LocateError::UnmodeledOpcode {
                    mnemonic: instruction.opcode.mnemonic(),
                }),
            },
        }
    }

    fn resolved_pop(&self, opcode: OpCode, method: MethodRef) -> Result<usize, LocateError> {
        let (param_count, has_this, _, _) =
            self.module
                .method_signature(method)
                .map_err(|_| LocateError::UnmodeledOpcode {
                    mnemonic: opcode.mnemonic(),
                })?;
        // newobj allocates the receiver; only call/callvirt pop an existing one.
        let receiver = has_this && opcode != OpCode::Newobj;
        Ok(param_count + usize::from(receiver))
    }

    /// Reject the range when any branch or handler boundary lands inside it.
    ///
    /// `start` is the position of the earliest producer. A target anywhere from the
    /// first producer through the call would let control enter with an unknown
    /// stack, so the producers seen by the backward walk would not be the values
    /// actually consumed; the first producer itself is included because deleting a
    /// branch target would leave the branch dangling.
    fn reject_incoming_jumps(&self, start: usize, call: usize) -> Result<(), LocateError> {
        let lands_inside = |id: InstrId| {
            self.body
                .position_of(id)
                .is_some_and(|p| p >= start && p <= call)
        };

        for instruction in &self.body.instructions {
            match &instruction.operand {
                Operand::Target(target) if lands_inside(*target) => {
                    return Err(LocateError::IncomingJump)
                }
                Operand::Switch(targets) if targets.iter().any(|t| lands_inside(*t)) => {
                    return Err(LocateError::IncomingJump)
                }
                _ => {}
            }
        }
        for handler in &self.body.exception_handlers {
            if handler.boundaries().any(lands_inside) {
                return Err(LocateError::IncomingJump);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::{
        MethodImport, ParamSig, TypeImport, TypeName, Version,
    };

    struct Fixture {
        module: Module,
        body: MethodBody,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                module: Module::new("Test", Version::default()),
                body: MethodBody::new(),
            }
        }

        fn import_static(&mut self, name: &str, param_count: usize, returns_void: bool) -> MethodRef {
            let declaring = self.module.import_type(TypeImport {
                name: TypeName::regex(),
                assembly: "System.Text.RegularExpressions".to_string(),
            });
            let params = (0..param_count)
                .map(|_| ParamSig::of(TypeName::string()))
                .collect();
            MethodRef::External(self.module.import_method(MethodImport {
                declaring,
                name: name.to_string(),
                params,
                return_type: if returns_void {
                    TypeName::void()
                } else {
                    TypeName::boolean()
                },
                has_this: false,
            }))
        }
    }

    #[test]
    fn straight_line_arguments_are_located() {
        let mut fx = Fixture::new();
        let target = fx.import_static("IsMatch", 2, false);

        let input = fx.body.emit(OpCode::Ldarg0, Operand::None);
        let pattern = fx.body.emit(OpCode::Ldstr, Operand::Str("a+".to_string()));
        let call = fx.body.emit(OpCode::Call, Operand::Method(target));
        fx.body.emit(OpCode::Ret, Operand::None);

        let locator = ArgumentLocator::new(&fx.module, &fx.body);
        let located = locator.locate(call, 2).unwrap();
        assert_eq!(located.producer(0), Some(input));
        assert_eq!(located.producer(1), Some(pattern));
    }

    #[test]
    fn nested_call_argument_is_attributed_to_its_range_start() {
        let mut fx = Fixture::new();
        let inner = fx.import_static("Unescape", 1, false);
        let outer = fx.import_static("IsMatch", 2, false);

        // IsMatch(Unescape(arg0), "a+") - the first argument's producing range
        // begins at the ldarg feeding the inner call.
        let load = fx.body.emit(OpCode::Ldarg0, Operand::None);
        fx.body.emit(OpCode::Call, Operand::Method(inner));
        let pattern = fx.body.emit(OpCode::Ldstr, Operand::Str("a+".to_string()));
        let call = fx.body.emit(OpCode::Call, Operand::Method(outer));

        let locator = ArgumentLocator::new(&fx.module, &fx.body);
        let located = locator.locate(call, 2).unwrap();
        assert_eq!(located.producer(0), Some(load));
        assert_eq!(located.producer(1), Some(pattern));
    }

    #[test]
    fn branch_between_producers_is_rejected() {
        let mut fx = Fixture::new();
        let target = fx.import_static("IsMatch", 2, false);

        fx.body.emit(OpCode::Ldarg0, Operand::None);
        let after = fx.body.fresh_id();
        fx.body.emit(OpCode::Br, Operand::Target(after));
        fx.body.emit_with_id(after, OpCode::Ldstr, Operand::Str("a+".to_string()));
        let call = fx.body.emit(OpCode::Call, Operand::Method(target));

        let locator = ArgumentLocator::new(&fx.module, &fx.body);
        assert_eq!(
            locator.locate(call, 2),
            Err(LocateError::BlockDelimiter { mnemonic: "br" })
        );
    }

    #[test]
    fn incoming_jump_into_range_is_rejected() {
        let mut fx = Fixture::new();
        let target = fx.import_static("IsMatch", 2, false);

        fx.body.emit(OpCode::Ldarg0, Operand::None);
        let pattern = fx.body.emit(OpCode::Ldstr, Operand::Str("a+".to_string()));
        let call = fx.body.emit(OpCode::Call, Operand::Method(target));
        fx.body.emit(OpCode::Ret, Operand::None);
        // Later code jumps straight at the pattern load.
        fx.body.emit(OpCode::Br, Operand::Target(pattern));

        let locator = ArgumentLocator::new(&fx.module, &fx.body);
        assert_eq!(locator.locate(call, 2), Err(LocateError::IncomingJump));
    }

    #[test]
    fn running_out_of_instructions_is_reported() {
        let mut fx = Fixture::new();
        let target = fx.import_static("IsMatch", 2, false);

        fx.body.emit(OpCode::Ldstr, Operand::Str("a+".to_string()));
        let call = fx.body.emit(OpCode::Call, Operand::Method(target));

        let locator = ArgumentLocator::new(&fx.module, &fx.body);
        assert_eq!(locator.locate(call, 2), Err(LocateError::OutOfInstructions));
    }

    #[test]
    fn receiver_counts_toward_instance_call_arguments() {
        let mut fx = Fixture::new();
        let declaring = fx.module.import_type(TypeImport {
            name: TypeName::regex(),
            assembly: "System.Text.RegularExpressions".to_string(),
        });
        let instance = MethodRef::External(fx.module.import_method(MethodImport {
            declaring,
            name: "IsMatch".to_string(),
            params: vec![ParamSig::of(TypeName::string())],
            return_type: TypeName::boolean(),
            has_this: true,
        }));

        fx.body.emit(OpCode::Ldarg0, Operand::None);
        fx.body.emit(OpCode::Ldarg1, Operand::None);
        let call = fx.body.emit(OpCode::Callvirt, Operand::Method(instance));

        let locator = ArgumentLocator::new(&fx.module, &fx.body);
        assert_eq!(locator.call_argument_count(call), Ok(2));
        assert!(locator.locate(call, 2).is_ok());
    }
}
