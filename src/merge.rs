//! Relocation of the artifact assembly's types into the target module.
//!
//! The merge runs in two phases. Phase one creates empty skeletons in the target for
//! every artifact type, field and method, recording an artifact-to-target mapping for
//! each. Phase two populates the skeletons: signatures, base types, custom attributes
//! and method bodies, translating every cross-reference through the mapping (for
//! definitions) or re-importing it into the target's import tables (for external
//! members). The split matters because artifact members reference each other freely;
//! by the time any body is copied, every definition already has a target identity.
//!
//! Instruction streams are copied positionally: instruction `i` of a target body
//! corresponds to instruction `i` of its artifact original, with fresh ids allocated
//! up front so branch targets and handler boundaries remap before they are emitted.
//!
//! The engine refuses constructs the generated-regex assembly never contains: generic
//! parameters, events, properties, nested types, P/Invoke and declarative security
//! all abort the merge rather than risk a silently wrong relocation.

use std::collections::{HashMap, HashSet};

use crate::cil::{
    CustomAttribute, ExceptionHandler, FieldIndex, FieldRef, InstrId, MethodBody, MethodIndex,
    MethodRef, Module, Operand, TypeDef, TypeIndex, TypeRef,
};
use crate::{Error, Result};

/// Artifact-space to target-space identity mapping produced by a merge.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeMap {
    types: HashMap<TypeIndex, TypeIndex>,
    fields: HashMap<FieldIndex, FieldIndex>,
    methods: HashMap<MethodIndex, MethodIndex>,
}

impl MergeMap {
    /// Target identity of an artifact type.
    ///
    /// # Errors
    /// Fails when the type was never mapped, which means the merge skipped it.
    pub fn type_of(&self, artifact: TypeIndex) -> Result<TypeIndex> {
        self.types
            .get(&artifact)
            .copied()
            .ok_or_else(|| weave_error!("Type {} has no merged counterpart", artifact.value()))
    }

    /// Target identity of an artifact field.
    ///
    /// # Errors
    /// Fails when the field was never mapped.
    pub fn field_of(&self, artifact: FieldIndex) -> Result<FieldIndex> {
        self.fields
            .get(&artifact)
            .copied()
            .ok_or_else(|| weave_error!("Field {} has no merged counterpart", artifact.value()))
    }

    /// Target identity of an artifact method.
    ///
    /// # Errors
    /// Fails when the method was never mapped.
    pub fn method_of(&self, artifact: MethodIndex) -> Result<MethodIndex> {
        self.methods
            .get(&artifact)
            .copied()
            .ok_or_else(|| weave_error!("Method {} has no merged counterpart", artifact.value()))
    }

    /// Check that every merged type's members are mapped and that no copied body
    /// still references anything outside the mapping.
    ///
    /// A definition operand in a copied body can only come out of the mapping, so
    /// one that is not a mapped target member means an artifact-space reference
    /// survived the remap.
    ///
    /// # Errors
    /// Fails when a member of a mapped type escaped the merge, or when a copied
    /// body's operand or catch type does not resolve to a merged definition.
    pub fn verify(&self, artifact: &Module, target: &Module) -> Result<()> {
        for (&artifact_type, _) in &self.types {
            let type_def = &artifact.types[artifact_type.index()];
            for field in &type_def.fields {
                self.field_of(*field)?;
            }
            for method in &type_def.methods {
                self.method_of(*method)?;
            }
        }

        let merged_types: HashSet<TypeIndex> = self.types.values().copied().collect();
        let merged_fields: HashSet<FieldIndex> = self.fields.values().copied().collect();
        let merged_methods: HashSet<MethodIndex> = self.methods.values().copied().collect();
        for &merged in self.methods.values() {
            let Some(body) = &target.methods[merged.index()].body else {
                continue;
            };
            for instruction in &body.instructions {
                let resolved = match &instruction.operand {
                    Operand::Method(MethodRef::Def(index)) => merged_methods.contains(index),
                    Operand::Field(FieldRef::Def(index)) => merged_fields.contains(index),
                    Operand::Type(TypeRef::Def(index)) => merged_types.contains(index),
                    _ => true,
                };
                if !resolved {
                    return Err(weave_error!(
                        "Instruction {} of a copied body references an unmerged definition",
                        instruction.id
                    ));
                }
            }
            for handler in &body.exception_handlers {
                if let Some(TypeRef::Def(index)) = handler.catch_type {
                    if !merged_types.contains(&index) {
                        return Err(weave_error!(
                            "Catch type {} of a copied body was not merged",
                            index.value()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Merges one artifact module's types into a target module.
pub struct TypeMerger<'a> {
    target: &'a mut Module,
}

impl<'a> TypeMerger<'a> {
    /// Create a merger over the target module.
    pub fn new(target: &'a mut Module) -> Self {
        TypeMerger { target }
    }

    /// Merge every type of `artifact` into the target.
    ///
    /// The synthetic `<Module>` type is skipped; the generated assembly's copy
    /// carries nothing, and the target already has its own.
    ///
    /// # Errors
    /// Fails on any construct listed in the module documentation; nothing is
    /// rolled back, so the caller must treat the target as poisoned on error.
    pub fn merge(&mut self, artifact: &Module) -> Result<MergeMap> {
        let mut map = MergeMap::default();

        // Phase one: skeletons, so forward references resolve during population.
        for (position, type_def) in artifact.types.iter().enumerate() {
            if is_module_type(type_def) {
                continue;
            }
            reject_unsupported_type(type_def)?;

            #[allow(clippy::cast_possible_truncation)]
            let artifact_index = TypeIndex(position as u32);
            let target_index = self.target.add_type(TypeDef::new(
                type_def.name.clone(),
                type_def.attributes,
                None,
            ));
            map.types.insert(artifact_index, target_index);

            for &field_index in &type_def.fields {
                let field = &artifact.fields[field_index.index()];
                let target_field = self.target.add_field(
                    target_index,
                    crate::cil::FieldDef {
                        name: field.name.clone(),
                        attributes: field.attributes,
                        field_type: field.field_type.clone(),
                        declaring: None,
                    },
                );
                map.fields.insert(field_index, target_field);
            }

            for &method_index in &type_def.methods {
                let method = &artifact.methods[method_index.index()];
                reject_unsupported_method(method)?;
                let target_method = self.target.add_method(
                    target_index,
                    crate::cil::MethodDef::new(
                        &method.name,
                        method.attributes,
                        method.return_type.clone(),
                        method.params.clone(),
                    ),
                );
                map.methods.insert(method_index, target_method);
            }
        }

        // Phase two: populate through the now-complete mapping, in artifact order
        // so import-table growth in the target is deterministic.
        for position in 0..artifact.types.len() {
            #[allow(clippy::cast_possible_truncation)]
            let artifact_index = TypeIndex(position as u32);
            let Some(&target_index) = map.types.get(&artifact_index) else {
                continue;
            };
            let type_def = &artifact.types[artifact_index.index()];

            let base = match type_def.base {
                Some(base) => Some(self.remap_type(artifact, &map, base)?),
                None => None,
            };
            let interfaces = type_def
                .interfaces
                .iter()
                .map(|&i| self.remap_type(artifact, &map, i))
                .collect::<Result<Vec<_>>>()?;
            let custom_attributes = type_def
                .custom_attributes
                .iter()
                .map(|a| self.remap_attribute(artifact, &map, a))
                .collect::<Result<Vec<_>>>()?;

            let target_type = &mut self.target.types[target_index.index()];
            target_type.base = base;
            target_type.interfaces = interfaces;
            target_type.custom_attributes = custom_attributes;
        }

        let mut method_pairs: Vec<(MethodIndex, MethodIndex)> =
            map.methods.iter().map(|(&a, &t)| (a, t)).collect();
        method_pairs.sort_unstable();
        for (artifact_index, target_index) in method_pairs {
            let method = &artifact.methods[artifact_index.index()];

            let overrides = method
                .overrides
                .iter()
                .map(|&m| self.remap_method(artifact, &map, m))
                .collect::<Result<Vec<_>>>()?;
            let custom_attributes = method
                .custom_attributes
                .iter()
                .map(|a| self.remap_attribute(artifact, &map, a))
                .collect::<Result<Vec<_>>>()?;
            let body = match &method.body {
                Some(body) => Some(self.copy_body(artifact, &map, body)?),
                None => None,
            };

            let target_method = &mut self.target.methods[target_index.index()];
            target_method.overrides = overrides;
            target_method.custom_attributes = custom_attributes;
            target_method.body = body;
        }

        map.verify(artifact, self.target)?;
        Ok(map)
    }

    /// Copy a body with fresh instruction identities and remapped operands.
    fn copy_body(&mut self, artifact: &Module, map: &MergeMap, body: &MethodBody) -> Result<MethodBody> {
        let mut copy = MethodBody::new();
        copy.init_locals = body.init_locals;
        copy.max_stack = body.max_stack;
        copy.locals = body.locals.clone();

        // Allocate every id first; branches may point forward.
        let mut id_map: HashMap<InstrId, InstrId> = HashMap::with_capacity(body.instructions.len());
        for instruction in &body.instructions {
            id_map.insert(instruction.id, copy.fresh_id());
        }
        let translate = |id: InstrId| -> Result<InstrId> {
            id_map
                .get(&id)
                .copied()
                .ok_or_else(|| {
                    weave_error!("Branch target {} is not part of the copied body", id)
                })
        };

        for instruction in &body.instructions {
            let operand = match &instruction.operand {
                Operand::Target(target) => Operand::Target(translate(*target)?),
                Operand::Switch(targets) => Operand::Switch(
                    targets
                        .iter()
                        .map(|&t| translate(t))
                        .collect::<Result<Vec<_>>>()?,
                ),
                Operand::Method(method) => {
                    Operand::Method(self.remap_method(artifact, map, *method)?)
                }
                Operand::Field(field) => Operand::Field(self.remap_field(artifact, map, *field)?),
                Operand::Type(type_ref) => {
                    Operand::Type(self.remap_type(artifact, map, *type_ref)?)
                }
                other => other.clone(),
            };
            copy.emit_with_id(id_map[&instruction.id], instruction.opcode, operand);
        }

        for handler in &body.exception_handlers {
            copy.exception_handlers.push(ExceptionHandler {
                kind: handler.kind,
                try_start: translate(handler.try_start)?,
                try_end: translate(handler.try_end)?,
                handler_start: translate(handler.handler_start)?,
                handler_end: translate(handler.handler_end)?,
                filter_start: handler.filter_start.map(translate).transpose()?,
                catch_type: handler
                    .catch_type
                    .map(|t| self.remap_type(artifact, map, t))
                    .transpose()?,
            });
        }

        copy.validate()?;
        Ok(copy)
    }

    fn remap_type(&mut self, artifact: &Module, map: &MergeMap, type_ref: TypeRef) -> Result<TypeRef> {
        match type_ref {
            TypeRef::Def(index) => Ok(TypeRef::Def(map.type_of(index)?)),
            TypeRef::External(index) => {
                let import = artifact
                    .type_imports
                    .get(index.index())
                    .ok_or_else(|| weave_error!("Type import {} out of range", index.value()))?;
                Ok(TypeRef::External(self.target.import_type(import.clone())))
            }
        }
    }

    fn remap_method(
        &mut self,
        artifact: &Module,
        map: &MergeMap,
        method: MethodRef,
    ) -> Result<MethodRef> {
        match method {
            MethodRef::Def(index) => Ok(MethodRef::Def(map.method_of(index)?)),
            MethodRef::External(index) => {
                let import = artifact
                    .method_imports
                    .get(index.index())
                    .ok_or_else(|| weave_error!("Method import {} out of range", index.value()))?;
                let mut import = import.clone();
                import.declaring = match self.remap_type(artifact, map, TypeRef::External(import.declaring))? {
                    TypeRef::External(declaring) => declaring,
                    TypeRef::Def(_) => {
                        return Err(weave_error!(
                            "Method import {} resolves to a definition",
                            import.name
                        ))
                    }
                };
                Ok(MethodRef::External(self.target.import_method(import)))
            }
        }
    }

    fn remap_field(&mut self, artifact: &Module, map: &MergeMap, field: FieldRef) -> Result<FieldRef> {
        match field {
            FieldRef::Def(index) => Ok(FieldRef::Def(map.field_of(index)?)),
            FieldRef::External(index) => {
                let import = artifact
                    .field_imports
                    .get(index.index())
                    .ok_or_else(|| weave_error!("Field import {} out of range", index.value()))?;
                let mut import = import.clone();
                import.declaring = match self.remap_type(artifact, map, TypeRef::External(import.declaring))? {
                    TypeRef::External(declaring) => declaring,
                    TypeRef::Def(_) => {
                        return Err(weave_error!(
                            "Field import {} resolves to a definition",
                            import.name
                        ))
                    }
                };
                Ok(FieldRef::External(self.target.import_field(import)))
            }
        }
    }

    fn remap_attribute(
        &mut self,
        artifact: &Module,
        map: &MergeMap,
        attribute: &CustomAttribute,
    ) -> Result<CustomAttribute> {
        Ok(CustomAttribute {
            ctor: self.remap_method(artifact, map, attribute.ctor)?,
            args: attribute.args.clone(),
            named: attribute.named.clone(),
        })
    }
}

fn is_module_type(type_def: &TypeDef) -> bool {
    type_def.base.is_none() && type_def.name.name == "<Module>"
}

fn reject_unsupported_type(type_def: &TypeDef) -> Result<()> {
    if !type_def.generic_params.is_empty() {
        return Err(Error::MergeUnsupported("generic type parameters"));
    }
    if !type_def.events.is_empty() {
        return Err(Error::MergeUnsupported("events"));
    }
    if !type_def.properties.is_empty() {
        return Err(Error::MergeUnsupported("properties"));
    }
    if !type_def.nested_types.is_empty() {
        return Err(Error::MergeUnsupported("nested types"));
    }
    Ok(())
}

fn reject_unsupported_method(method: &crate::cil::MethodDef) -> Result<()> {
    if method.pinvoke.is_some() {
        return Err(Error::MergeUnsupported("P/Invoke methods"));
    }
    if !method.generic_params.is_empty() {
        return Err(Error::MergeUnsupported("generic method parameters"));
    }
    if !method.security_declarations.is_empty() {
        return Err(Error::MergeUnsupported("declarative security"));
    }
    Ok(())
}
