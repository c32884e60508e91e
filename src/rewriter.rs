//! Redirection of extracted call sites to their generated accessors.
//!
//! Constructor sites are easy: once the pattern and options loads are deleted, the
//! stack at the `newobj` holds at most a timeout, which is exactly the accessor's
//! signature, so the `newobj` is replaced in place by a `call` to the accessor.
//!
//! Static-helper sites (`Regex.Replace(input, pattern, replacement, options, timeout)`)
//! need reordering: after deleting the pattern and options loads the stack holds the
//! residual arguments with the regex receiver missing from the *bottom*. The remaining
//! values are spilled to fresh locals in reverse, the accessor is called (consuming the
//! timeout local when the shape has one), the residuals are reloaded in order and the
//! original call becomes a `callvirt` to the instance-method equivalent. The net stack
//! effect of the site is unchanged.
//!
//! Instruction identities are stable under all of these edits, so branches to the call
//! instruction keep working and sites within one body can be rewritten in any order.

use std::collections::BTreeMap;

use crate::catalog::{RegexCallShape, ShapeKind, ShapeParam};
use crate::cil::{
    MethodImport, MethodIndex, MethodRef, Module, OpCode, Operand, ParamSig, TypeImport, TypeName,
};
use crate::extractor::{RegexDefinition, RegexReference};
use crate::generator::AccessorMethods;
use crate::Result;

/// Rewrite every extracted reference in one method.
///
/// # Errors
/// Fails when a reference's definition has no accessor, or on structural damage
/// while editing the body.
pub fn rewrite_method(
    module: &mut Module,
    method: MethodIndex,
    references: &[RegexReference],
    accessors: &BTreeMap<RegexDefinition, AccessorMethods>,
) -> Result<()> {
    // Instance equivalents touch the import tables, so resolve them before the
    // body is taken out of the module.
    let mut equivalents = Vec::with_capacity(references.len());
    for reference in references {
        equivalents.push(match reference.shape.kind {
            ShapeKind::Static => Some(import_instance_equivalent(module, reference.shape)),
            ShapeKind::Constructor => None,
        });
    }

    let mut body = module
        .methods
        .get_mut(method.index())
        .and_then(|m| m.body.take())
        .ok_or_else(|| weave_error!("Method {} has no body to rewrite", method.value()))?;

    let result = (|| {
        for (reference, equivalent) in references.iter().zip(&equivalents) {
            let accessor = accessors.get(&reference.definition).ok_or_else(|| {
                weave_error!("No accessor was generated for {}", reference.definition)
            })?;
            rewrite_reference(&mut body, reference, accessor, *equivalent)?;
        }
        body.validate()
    })();

    module.methods[method.index()].body = Some(body);
    result
}

fn rewrite_reference(
    body: &mut crate::cil::MethodBody,
    reference: &RegexReference,
    accessor: &AccessorMethods,
    equivalent: Option<MethodRef>,
) -> Result<()> {
    for doomed in reference.doomed_producers().collect::<Vec<_>>() {
        body.remove(doomed)?;
    }

    let accessor_ref = if reference.shape.has_timeout() {
        accessor.with_timeout
    } else {
        accessor.plain
    };

    match reference.shape.kind {
        ShapeKind::Constructor => {
            // The remaining stack (nothing, or just the timeout) matches the
            // accessor's signature exactly.
            body.replace(
                reference.call,
                OpCode::Call,
                Operand::Method(accessor_ref),
            )?;
        }
        ShapeKind::Static => {
            let equivalent = equivalent
                .ok_or_else(|| weave_error!("Static shape {} lost its instance equivalent", reference.shape.name))?;

            let residuals: Vec<ShapeParam> = reference.shape.residual_params().collect();
            if !residuals.is_empty() {
                body.init_locals = true;
            }
            let locals: Vec<u16> = residuals
                .iter()
                .map(|param| body.alloc_local(param.type_name()))
                .collect();

            // Spill in reverse; the last residual is on top of the stack.
            for &local in locals.iter().rev() {
                body.insert_before(reference.call, OpCode::Stloc, Operand::Local(local))?;
            }

            // The accessor consumes the timeout, if the shape carries one.
            if let Some(position) = residuals.iter().position(|p| *p == ShapeParam::Timeout) {
                body.insert_before(
                    reference.call,
                    OpCode::Ldloc,
                    Operand::Local(locals[position]),
                )?;
            }
            body.insert_before(reference.call, OpCode::Call, Operand::Method(accessor_ref))?;

            // Reload everything but the timeout, in declaration order.
            for (param, &local) in residuals.iter().zip(&locals) {
                if *param != ShapeParam::Timeout {
                    body.insert_before(reference.call, OpCode::Ldloc, Operand::Local(local))?;
                }
            }

            body.replace(reference.call, OpCode::Callvirt, Operand::Method(equivalent))?;
        }
    }
    Ok(())
}

/// Import the instance method a static shape is rewritten to.
fn import_instance_equivalent(module: &mut Module, shape: &RegexCallShape) -> MethodRef {
    let declaring = module.import_type(TypeImport {
        name: TypeName::regex(),
        assembly: "System.Text.RegularExpressions".to_string(),
    });
    let params = shape
        .instance_params()
        .map(|param| ParamSig::of(param.type_name()))
        .collect();
    MethodRef::External(module.import_method(MethodImport {
        declaring,
        name: shape.name.to_string(),
        params,
        return_type: shape.returns.type_name(),
        has_this: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::{
        MethodAttributes, MethodBody, MethodDef, TypeAttributes, TypeDef, Version,
    };
    use crate::extractor::{self, ExtractOutcome};
    use crate::locator::ArgumentLocator;

    /// Target module with a Regex import surface and one host method.
    struct Fixture {
        module: Module,
        host: MethodIndex,
    }

    impl Fixture {
        fn new(body: impl FnOnce(&mut Module, &mut MethodBody)) -> Self {
            let mut module = Module::new("MyApp", Version(1, 0, 0, 0));
            let host_type = module.add_type(TypeDef::new(
                TypeName::new("MyApp", "Program"),
                TypeAttributes::PUBLIC,
                None,
            ));
            let mut method = MethodDef::new(
                "Run",
                MethodAttributes::PUBLIC | MethodAttributes::STATIC,
                TypeName::void(),
                vec![ParamSig::named("input", TypeName::string())],
            );
            let mut method_body = MethodBody::new();
            body(&mut module, &mut method_body);
            method.body = Some(method_body);
            let host = module.add_method(host_type, method);
            Fixture { module, host }
        }

        fn fake_accessors(
            &mut self,
            definition: &RegexDefinition,
        ) -> BTreeMap<RegexDefinition, AccessorMethods> {
            let container = self.module.add_type(TypeDef::new(
                TypeName::new("PrecompiledRegex", "RegularExpressions"),
                TypeAttributes::SEALED,
                None,
            ));
            let plain = self.module.add_method(
                container,
                MethodDef::new(
                    "PrecompiledRegex0",
                    MethodAttributes::PUBLIC | MethodAttributes::STATIC,
                    TypeName::regex(),
                    Vec::new(),
                ),
            );
            let with_timeout = self.module.add_method(
                container,
                MethodDef::new(
                    "PrecompiledRegex0",
                    MethodAttributes::PUBLIC | MethodAttributes::STATIC,
                    TypeName::regex(),
                    vec![ParamSig::named("matchTimeout", TypeName::timespan())],
                ),
            );
            let mut accessors = BTreeMap::new();
            accessors.insert(
                definition.clone(),
                AccessorMethods {
                    plain: MethodRef::Def(plain),
                    with_timeout: MethodRef::Def(with_timeout),
                },
            );
            accessors
        }

        fn extract_all(&self) -> Vec<RegexReference> {
            let body = self.module.methods[self.host.index()].body.as_ref().unwrap();
            extractor::scan(&self.module, body)
                .unwrap()
                .into_iter()
                .filter_map(|(_, outcome)| match outcome {
                    ExtractOutcome::Reference(reference) => Some(reference),
                    _ => None,
                })
                .collect()
        }

        fn host_mnemonics(&self) -> Vec<&'static str> {
            self.module.methods[self.host.index()]
                .body
                .as_ref()
                .unwrap()
                .instructions
                .iter()
                .map(|i| i.opcode.mnemonic())
                .collect()
        }
    }

    fn import_regex_method(
        module: &mut Module,
        name: &str,
        params: Vec<ParamSig>,
        has_this: bool,
        return_type: TypeName,
    ) -> MethodRef {
        let declaring = module.import_type(TypeImport {
            name: TypeName::regex(),
            assembly: "System.Text.RegularExpressions".to_string(),
        });
        MethodRef::External(module.import_method(MethodImport {
            declaring,
            name: name.to_string(),
            params,
            return_type,
            has_this,
        }))
    }

    #[test]
    fn constructor_site_becomes_an_accessor_call() {
        let mut fx = Fixture::new(|module, body| {
            let ctor = import_regex_method(
                module,
                ".ctor",
                vec![ParamSig::of(TypeName::string())],
                true,
                TypeName::void(),
            );
            body.emit(OpCode::Ldstr, Operand::Str("a+".to_string()));
            body.emit(OpCode::Newobj, Operand::Method(ctor));
            body.emit(OpCode::Pop, Operand::None);
            body.emit(OpCode::Ret, Operand::None);
        });

        let references = fx.extract_all();
        assert_eq!(references.len(), 1);
        let accessors = fx.fake_accessors(&references[0].definition);

        rewrite_method(&mut fx.module, fx.host, &references, &accessors).unwrap();
        assert_eq!(fx.host_mnemonics(), ["call", "pop", "ret"]);
    }

    #[test]
    fn branch_to_the_call_survives_the_rewrite() {
        let mut fx = Fixture::new(|module, body| {
            let ctor = import_regex_method(
                module,
                ".ctor",
                vec![ParamSig::of(TypeName::string())],
                true,
                TypeName::void(),
            );
            body.emit(OpCode::Ldstr, Operand::Str("a+".to_string()));
            body.emit(OpCode::Newobj, Operand::Method(ctor));
            body.emit(OpCode::Pop, Operand::None);
            body.emit(OpCode::Ret, Operand::None);
        });

        let references = fx.extract_all();
        let call_id = references[0].call;
        let accessors = fx.fake_accessors(&references[0].definition);

        rewrite_method(&mut fx.module, fx.host, &references, &accessors).unwrap();
        let body = fx.module.methods[fx.host.index()].body.as_ref().unwrap();
        // Same identity, new meaning.
        assert_eq!(body.position_of(call_id), Some(0));
        assert_eq!(body.get(call_id).unwrap().opcode, OpCode::Call);
    }

    #[test]
    fn static_replace_with_timeout_spills_and_reorders() {
        let definition_params = vec![
            ParamSig::named("input", TypeName::string()),
            ParamSig::named("pattern", TypeName::string()),
            ParamSig::named("replacement", TypeName::string()),
            ParamSig::named(
                "options",
                TypeName::new("System.Text.RegularExpressions", "RegexOptions"),
            ),
            ParamSig::named("matchTimeout", TypeName::timespan()),
        ];
        let mut fx = Fixture::new(|module, body| {
            let replace = import_regex_method(
                module,
                "Replace",
                definition_params,
                false,
                TypeName::string(),
            );
            body.emit(OpCode::Ldarg0, Operand::None); // input
            body.emit(OpCode::Ldstr, Operand::Str("a+".to_string())); // pattern
            body.emit(OpCode::Ldstr, Operand::Str("-".to_string())); // replacement
            body.emit(OpCode::LdcI4_1, Operand::None); // options
            body.emit(OpCode::Ldarg1, Operand::None); // timeout (runtime value)
            body.emit(OpCode::Call, Operand::Method(replace));
            body.emit(OpCode::Pop, Operand::None);
            body.emit(OpCode::Ret, Operand::None);
        });

        let references = fx.extract_all();
        assert_eq!(references.len(), 1);
        assert!(references[0].shape.has_timeout());
        let accessors = fx.fake_accessors(&references[0].definition);

        rewrite_method(&mut fx.module, fx.host, &references, &accessors).unwrap();
        assert_eq!(
            fx.host_mnemonics(),
            [
                "ldarg.0", "ldstr", "ldarg.1", // input, replacement, timeout remain
                "stloc", "stloc", "stloc", // spill timeout, replacement, input
                "ldloc", "call", // timeout into the accessor
                "ldloc", "ldloc", // input, replacement back
                "callvirt", "pop", "ret"
            ]
        );

        // The instance equivalent takes (input, replacement) on a receiver.
        let body = fx.module.methods[fx.host.index()].body.as_ref().unwrap();
        let callvirt = body
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::Callvirt)
            .unwrap();
        let method = match callvirt.operand {
            Operand::Method(method) => method,
            ref other => panic!("expected a method operand, got {other:?}"),
        };
        let (count, has_this, _, name) = fx.module.method_signature(method).unwrap();
        assert_eq!((count, has_this, name), (2, true, "Replace"));
        assert!(body.init_locals);
        assert_eq!(body.locals.len(), 3);
    }

    #[test]
    fn static_site_keeps_the_stack_balanced() {
        let mut fx = Fixture::new(|module, body| {
            let is_match = import_regex_method(
                module,
                "IsMatch",
                vec![
                    ParamSig::named("input", TypeName::string()),
                    ParamSig::named("pattern", TypeName::string()),
                ],
                false,
                TypeName::boolean(),
            );
            body.emit(OpCode::Ldarg0, Operand::None);
            body.emit(OpCode::Ldstr, Operand::Str("x".to_string()));
            body.emit(OpCode::Call, Operand::Method(is_match));
            body.emit(OpCode::Pop, Operand::None);
            body.emit(OpCode::Ret, Operand::None);
        });

        let references = fx.extract_all();
        let accessors = fx.fake_accessors(&references[0].definition);
        rewrite_method(&mut fx.module, fx.host, &references, &accessors).unwrap();

        // One value is pushed before the pop, exactly as before the rewrite: the
        // backward walk balances and its range starts at the accessor call.
        let body = fx.module.methods[fx.host.index()].body.as_ref().unwrap();
        let locator = ArgumentLocator::new(&fx.module, body);
        let pop = body
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::Pop)
            .unwrap()
            .id;
        let located = locator.locate(pop, 1).unwrap();
        let producer = body.get(located.producer(0).unwrap()).unwrap();
        assert_eq!(producer.opcode, OpCode::Call);
    }
}
