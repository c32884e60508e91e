//! Generation of cached-singleton accessor methods for merged regex types.
//!
//! Every definition gets a static accessor returning the shared instance of its
//! generated type, created on first use and cached in a private static field. A
//! second overload takes a match timeout; because the timeout is baked into a
//! `Regex` instance, that variant compares the cached instance's timeout with the
//! requested one and rebuilds the instance on mismatch. Call sites always pass a
//! constant-per-site timeout, so in practice the rebuild happens once per site.
//!
//! All accessors live on a single generated container type; the cache fields are
//! typed as the base `Regex` so the accessor signatures never mention the generated
//! subclasses.

use std::collections::BTreeMap;

use crate::cil::{
    FieldAttributes, FieldDef, FieldRef, MethodAttributes, MethodBody, MethodDef, MethodImport,
    MethodRef, MethodRefIndex, Module, OpCode, Operand, ParamSig, TypeAttributes, TypeDef,
    TypeImport, TypeIndex, TypeName, TypeRef,
};
use crate::extractor::RegexDefinition;
use crate::Result;

/// Namespace and name of the generated container type.
const ACCESSOR_NAMESPACE: &str = "PrecompiledRegex";
const ACCESSOR_TYPE_NAME: &str = "RegularExpressions";

/// The two accessors generated for one definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessorMethods {
    /// `Regex PrecompiledRegexN()`
    pub plain: MethodRef,
    /// `Regex PrecompiledRegexN(TimeSpan matchTimeout)`
    pub with_timeout: MethodRef,
}

/// External members every accessor body needs.
struct AccessorImports {
    object_base: TypeRef,
    regex: TypeName,
    get_match_timeout: MethodRefIndex,
    op_inequality: MethodRefIndex,
}

/// Generates the container type and its accessor methods in the target module.
pub struct AccessorGenerator<'a> {
    target: &'a mut Module,
}

impl<'a> AccessorGenerator<'a> {
    /// Create a generator over the target module.
    pub fn new(target: &'a mut Module) -> Self {
        AccessorGenerator { target }
    }

    /// Generate accessors for every compiled definition.
    ///
    /// `compiled` pairs each definition with the (already merged) generated type.
    ///
    /// # Errors
    /// Fails when a generated type or one of its expected constructors is missing
    /// from the target, which means the merge did not deliver what the batch promised.
    pub fn generate(
        &mut self,
        compiled: &[(RegexDefinition, TypeName)],
    ) -> Result<BTreeMap<RegexDefinition, AccessorMethods>> {
        let imports = self.import_prerequisites();
        let container = self.target.add_type(TypeDef::new(
            TypeName::new(ACCESSOR_NAMESPACE, ACCESSOR_TYPE_NAME),
            TypeAttributes::SEALED,
            Some(imports.object_base),
        ));

        let mut accessors = BTreeMap::new();
        for (definition, type_name) in compiled {
            let regex_type = self
                .target
                .find_type(&type_name.namespace, &type_name.name)
                .ok_or_else(|| {
                    weave_error!("Generated type {} was not merged into the target", type_name)
                })?;

            let methods = AccessorMethods {
                plain: self.generate_plain(container, &imports, type_name, regex_type)?,
                with_timeout: self.generate_with_timeout(
                    container,
                    &imports,
                    type_name,
                    regex_type,
                )?,
            };
            accessors.insert(definition.clone(), methods);
        }
        Ok(accessors)
    }

    /// `static Regex PrecompiledRegexN()` with a null-checked cache field.
    fn generate_plain(
        &mut self,
        container: TypeIndex,
        imports: &AccessorImports,
        type_name: &TypeName,
        regex_type: TypeIndex,
    ) -> Result<MethodRef> {
        let ctor = self.find_constructor(regex_type, &[])?;
        let field = FieldRef::Def(self.target.add_field(
            container,
            FieldDef {
                name: format!("cached{}", type_name.name),
                attributes: FieldAttributes::PRIVATE | FieldAttributes::STATIC,
                field_type: imports.regex.clone(),
                declaring: None,
            },
        ));

        let mut body = MethodBody::new();
        body.max_stack = 1;
        body.emit(OpCode::Ldsfld, Operand::Field(field));
        let epilog = body.fresh_id();
        body.emit(OpCode::Brtrue, Operand::Target(epilog));
        body.emit(OpCode::Newobj, Operand::Method(ctor));
        body.emit(OpCode::Stsfld, Operand::Field(field));
        body.emit_with_id(epilog, OpCode::Ldsfld, Operand::Field(field));
        body.emit(OpCode::Ret, Operand::None);
        body.validate()?;

        let mut method = MethodDef::new(
            &type_name.name,
            MethodAttributes::PUBLIC | MethodAttributes::STATIC,
            imports.regex.clone(),
            Vec::new(),
        );
        method.body = Some(body);
        Ok(MethodRef::Def(self.target.add_method(container, method)))
    }

    /// `static Regex PrecompiledRegexN(TimeSpan matchTimeout)`.
    ///
    /// The cached instance is rebuilt whenever its `MatchTimeout` differs from the
    /// requested one, via the `TimeSpan` inequality operator.
    fn generate_with_timeout(
        &mut self,
        container: TypeIndex,
        imports: &AccessorImports,
        type_name: &TypeName,
        regex_type: TypeIndex,
    ) -> Result<MethodRef> {
        let ctor = self.find_constructor(regex_type, &[TypeName::timespan()])?;
        let field = FieldRef::Def(self.target.add_field(
            container,
            FieldDef {
                name: format!("cached{}WithTimeout", type_name.name),
                attributes: FieldAttributes::PRIVATE | FieldAttributes::STATIC,
                field_type: imports.regex.clone(),
                declaring: None,
            },
        ));

        let mut body = MethodBody::new();
        body.init_locals = true;
        body.max_stack = 2;
        body.alloc_local(imports.regex.clone());

        // var regex = cached
        body.emit(OpCode::Ldsfld, Operand::Field(field));
        body.emit(OpCode::Stloc0, Operand::None);
        // if (regex == null
        body.emit(OpCode::Ldloc0, Operand::None);
        let build = body.fresh_id();
        body.emit(OpCode::Brfalse, Operand::Target(build));
        // || regex.MatchTimeout != matchTimeout)
        body.emit(OpCode::Ldloc0, Operand::None);
        body.emit(
            OpCode::Callvirt,
            Operand::Method(MethodRef::External(imports.get_match_timeout)),
        );
        body.emit(OpCode::Ldarg0, Operand::None);
        body.emit(
            OpCode::Call,
            Operand::Method(MethodRef::External(imports.op_inequality)),
        );
        let epilog = body.fresh_id();
        body.emit(OpCode::Brfalse, Operand::Target(epilog));
        // regex = new PrecompiledRegexN(matchTimeout); cached = regex
        body.emit_with_id(build, OpCode::Ldarg0, Operand::None);
        body.emit(OpCode::Newobj, Operand::Method(ctor));
        body.emit(OpCode::Stloc0, Operand::None);
        body.emit(OpCode::Ldloc0, Operand::None);
        body.emit(OpCode::Stsfld, Operand::Field(field));
        // return regex
        body.emit_with_id(epilog, OpCode::Ldloc0, Operand::None);
        body.emit(OpCode::Ret, Operand::None);
        body.validate()?;

        let mut method = MethodDef::new(
            &type_name.name,
            MethodAttributes::PUBLIC | MethodAttributes::STATIC,
            imports.regex.clone(),
            vec![ParamSig::named("matchTimeout", TypeName::timespan())],
        );
        method.body = Some(body);
        Ok(MethodRef::Def(self.target.add_method(container, method)))
    }

    /// Instance constructor of a generated type with the exact parameter types.
    fn find_constructor(&self, regex_type: TypeIndex, params: &[TypeName]) -> Result<MethodRef> {
        let type_def = &self.target.types[regex_type.index()];
        for &method_index in &type_def.methods {
            let method = &self.target.methods[method_index.index()];
            if method.is_constructor()
                && !method.is_static()
                && method.params.len() == params.len()
                && method.params.iter().zip(params).all(|(p, t)| p.ty == *t)
            {
                return Ok(MethodRef::Def(method_index));
            }
        }
        Err(weave_error!(
            "Generated type {} has no ({}) constructor",
            type_def.name,
            params
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn import_prerequisites(&mut self) -> AccessorImports {
        let object = self.target.import_type(TypeImport {
            name: TypeName::object(),
            assembly: "mscorlib".to_string(),
        });
        let regex_type = self.target.import_type(TypeImport {
            name: TypeName::regex(),
            assembly: "System.Text.RegularExpressions".to_string(),
        });
        let timespan_type = self.target.import_type(TypeImport {
            name: TypeName::timespan(),
            assembly: "mscorlib".to_string(),
        });

        let get_match_timeout = self.target.import_method(MethodImport {
            declaring: regex_type,
            name: "get_MatchTimeout".to_string(),
            params: Vec::new(),
            return_type: TypeName::timespan(),
            has_this: true,
        });
        let op_inequality = self.target.import_method(MethodImport {
            declaring: timespan_type,
            name: "op_Inequality".to_string(),
            params: vec![
                ParamSig::of(TypeName::timespan()),
                ParamSig::of(TypeName::timespan()),
            ],
            return_type: TypeName::boolean(),
            has_this: false,
        });

        AccessorImports {
            object_base: TypeRef::External(object),
            regex: TypeName::regex(),
            get_match_timeout,
            op_inequality,
        }
    }
}
