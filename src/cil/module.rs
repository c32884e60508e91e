//! In-memory representation of a compiled module: types, fields, methods and import tables.
//!
//! The model is arena-style: all member definitions live in flat vectors on the [`Module`]
//! and are addressed by typed indices ([`TypeIndex`], [`FieldIndex`], [`MethodIndex`]).
//! References from instruction operands are two-armed: either a definition inside this
//! module, or an entry in one of the module's import tables describing a member of another
//! assembly. The merge engine relies on this split: relocating a definition means
//! translating `Def` arms through a mapping table and re-importing `External` arms into the
//! target's import tables.
//!
//! The surface is deliberately the minimum a call-site transformer needs; metadata this
//! crate never rewrites (generics, events, properties, marshaling) is carried only far
//! enough to be *detected and rejected* by the merge engine.

use bitflags::bitflags;

use crate::{cil::MethodBody, Result};

/// A namespace-qualified type name, e.g. `System.Text.RegularExpressions.Regex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeName {
    /// The namespace; empty for the global namespace
    pub namespace: String,
    /// The simple name
    pub name: String,
}

impl TypeName {
    /// Create a type name from namespace and simple name.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        TypeName {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// `System.Object`
    #[must_use]
    pub fn object() -> Self {
        TypeName::new("System", "Object")
    }

    /// `System.Void`
    #[must_use]
    pub fn void() -> Self {
        TypeName::new("System", "Void")
    }

    /// `System.String`
    #[must_use]
    pub fn string() -> Self {
        TypeName::new("System", "String")
    }

    /// `System.Boolean`
    #[must_use]
    pub fn boolean() -> Self {
        TypeName::new("System", "Boolean")
    }

    /// `System.TimeSpan`
    #[must_use]
    pub fn timespan() -> Self {
        TypeName::new("System", "TimeSpan")
    }

    /// `System.Text.RegularExpressions.Regex`
    #[must_use]
    pub fn regex() -> Self {
        TypeName::new("System.Text.RegularExpressions", "Regex")
    }

    /// Whether this is `System.Void`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.namespace == "System" && self.name == "Void"
    }

    /// The dotted full name.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// A four-part assembly version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version(pub u16, pub u16, pub u16, pub u16);

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0, self.1, self.2, self.3)
    }
}

/// Assembly identity: simple name plus version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyName {
    /// Simple name, without extension
    pub name: String,
    /// Four-part version
    pub version: Version,
}

macro_rules! arena_index {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Raw index value.
            #[must_use]
            pub fn value(self) -> u32 {
                self.0
            }

            /// The index as a `usize`, for direct slot access.
            #[must_use]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_index!(
    /// Index of a [`TypeDef`] in its module
    TypeIndex
);
arena_index!(
    /// Index of a [`FieldDef`] in its module
    FieldIndex
);
arena_index!(
    /// Index of a [`MethodDef`] in its module
    MethodIndex
);
arena_index!(
    /// Index of a [`TypeImport`] in its module's import table
    TypeRefIndex
);
arena_index!(
    /// Index of a [`MethodImport`] in its module's import table
    MethodRefIndex
);
arena_index!(
    /// Index of a [`FieldImport`] in its module's import table
    FieldRefIndex
);

/// Reference to a type: a definition in this module or an imported external type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// Defined in this module
    Def(TypeIndex),
    /// Imported from another assembly
    External(TypeRefIndex),
}

/// Reference to a method: a definition in this module or an imported external method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodRef {
    /// Defined in this module
    Def(MethodIndex),
    /// Imported from another assembly
    External(MethodRefIndex),
}

/// Reference to a field: a definition in this module or an imported external field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldRef {
    /// Defined in this module
    Def(FieldIndex),
    /// Imported from another assembly
    External(FieldRefIndex),
}

/// An external type described in the module's import table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeImport {
    /// Namespace-qualified name of the imported type
    pub name: TypeName,
    /// Simple name of the declaring assembly
    pub assembly: String,
}

/// One parameter of a method signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSig {
    /// Parameter name, when known
    pub name: Option<String>,
    /// Parameter type
    pub ty: TypeName,
}

impl ParamSig {
    /// Unnamed parameter of the given type.
    #[must_use]
    pub fn of(ty: TypeName) -> Self {
        ParamSig { name: None, ty }
    }

    /// Named parameter of the given type.
    #[must_use]
    pub fn named(name: &str, ty: TypeName) -> Self {
        ParamSig {
            name: Some(name.to_string()),
            ty,
        }
    }
}

/// An external method described in the module's import table.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodImport {
    /// The declaring type
    pub declaring: TypeRefIndex,
    /// Method name (`.ctor` for constructors)
    pub name: String,
    /// Parameter list (receiver excluded)
    pub params: Vec<ParamSig>,
    /// Return type (`System.Void` for none)
    pub return_type: TypeName,
    /// Whether the method takes a receiver
    pub has_this: bool,
}

/// An external field described in the module's import table.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldImport {
    /// The declaring type
    pub declaring: TypeRefIndex,
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: TypeName,
}

bitflags! {
    /// ECMA-335 type attributes (II.23.1.15), the subset this crate emits or inspects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeAttributes: u32 {
        /// Type is visible outside the assembly
        const PUBLIC = 0x0000_0001;
        /// Type cannot be derived from
        const SEALED = 0x0000_0100;
        /// Type is abstract
        const ABSTRACT = 0x0000_0080;
        /// Static initialization runs lazily
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

bitflags! {
    /// ECMA-335 field attributes (II.23.1.5), the subset this crate emits or inspects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldAttributes: u32 {
        /// Accessible only within the declaring type
        const PRIVATE = 0x0001;
        /// Accessible everywhere
        const PUBLIC = 0x0006;
        /// No per-instance storage
        const STATIC = 0x0010;
        /// Writable only inside a constructor
        const INIT_ONLY = 0x0020;
    }
}

bitflags! {
    /// ECMA-335 method attributes (II.23.1.10), the subset this crate emits or inspects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAttributes: u32 {
        /// Accessible only within the declaring type
        const PRIVATE = 0x0001;
        /// Accessible everywhere
        const PUBLIC = 0x0006;
        /// No receiver
        const STATIC = 0x0010;
        /// Hidden by signature, not just by name
        const HIDE_BY_SIG = 0x0080;
        /// Virtual dispatch
        const VIRTUAL = 0x0040;
        /// Name carries special meaning to tools
        const SPECIAL_NAME = 0x0800;
        /// Name carries special meaning to the runtime (`.ctor`, `.cctor`)
        const RT_SPECIAL_NAME = 0x1000;
    }
}

/// A constant value inside a custom-attribute payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// String argument
    Str(String),
    /// 32-bit integer argument
    Int32(i32),
    /// Boolean argument
    Bool(bool),
}

/// One custom attribute attached to a module, type, method or parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomAttribute {
    /// The attribute's constructor
    pub ctor: MethodRef,
    /// Positional constructor arguments
    pub args: Vec<AttrValue>,
    /// Named field/property arguments
    pub named: Vec<(String, AttrValue)>,
}

/// A type definition owned by a module.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    /// Namespace-qualified name
    pub name: TypeName,
    /// Visibility and layout attributes
    pub attributes: TypeAttributes,
    /// Base type; `None` only for the synthetic `<Module>` type
    pub base: Option<TypeRef>,
    /// Implemented interfaces
    pub interfaces: Vec<TypeRef>,
    /// Fields declared by this type
    pub fields: Vec<FieldIndex>,
    /// Methods declared by this type
    pub methods: Vec<MethodIndex>,
    /// Attached custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Generic parameter names; non-empty values are rejected by the merge engine
    pub generic_params: Vec<String>,
    /// Event names; non-empty values are rejected by the merge engine
    pub events: Vec<String>,
    /// Property names; non-empty values are rejected by the merge engine
    pub properties: Vec<String>,
    /// Nested types; non-empty values are rejected by the merge engine
    pub nested_types: Vec<TypeIndex>,
}

impl TypeDef {
    /// A plain class with the given name and attributes, no members.
    #[must_use]
    pub fn new(name: TypeName, attributes: TypeAttributes, base: Option<TypeRef>) -> Self {
        TypeDef {
            name,
            attributes,
            base,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            custom_attributes: Vec::new(),
            generic_params: Vec::new(),
            events: Vec::new(),
            properties: Vec::new(),
            nested_types: Vec::new(),
        }
    }
}

/// A field definition owned by a module.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Access and storage attributes
    pub attributes: FieldAttributes,
    /// Field type
    pub field_type: TypeName,
    /// Declaring type, set when the field is attached
    pub declaring: Option<TypeIndex>,
}

/// A method definition owned by a module.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Method name (`.ctor` for constructors)
    pub name: String,
    /// Access and dispatch attributes
    pub attributes: MethodAttributes,
    /// Return type (`System.Void` for none)
    pub return_type: TypeName,
    /// Parameter list (receiver excluded)
    pub params: Vec<ParamSig>,
    /// The body, absent for abstract/extern methods
    pub body: Option<MethodBody>,
    /// Declaring type, set when the method is attached
    pub declaring: Option<TypeIndex>,
    /// Attached custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Explicit interface/base overrides; remapped during merge
    pub overrides: Vec<MethodRef>,
    /// P/Invoke entry point, if any; rejected by the merge engine
    pub pinvoke: Option<String>,
    /// Generic parameter names; non-empty values are rejected by the merge engine
    pub generic_params: Vec<String>,
    /// Declarative security sets; non-empty values are rejected by the merge engine
    pub security_declarations: Vec<String>,
}

impl MethodDef {
    /// A method with the given signature and no body.
    #[must_use]
    pub fn new(
        name: &str,
        attributes: MethodAttributes,
        return_type: TypeName,
        params: Vec<ParamSig>,
    ) -> Self {
        MethodDef {
            name: name.to_string(),
            attributes,
            return_type,
            params,
            body: None,
            declaring: None,
            custom_attributes: Vec::new(),
            overrides: Vec::new(),
            pinvoke: None,
            generic_params: Vec::new(),
            security_declarations: Vec::new(),
        }
    }

    /// Whether the method is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.attributes.contains(MethodAttributes::STATIC)
    }

    /// Whether this is an instance constructor.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }
}

/// A mutable in-memory module: the unit the transformer reads and rewrites in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Assembly identity
    pub assembly: AssemblyName,
    /// All type definitions
    pub types: Vec<TypeDef>,
    /// All field definitions (arena; ownership recorded on the declaring type)
    pub fields: Vec<FieldDef>,
    /// All method definitions (arena; ownership recorded on the declaring type)
    pub methods: Vec<MethodDef>,
    /// External types referenced by this module
    pub type_imports: Vec<TypeImport>,
    /// External methods referenced by this module
    pub method_imports: Vec<MethodImport>,
    /// External fields referenced by this module
    pub field_imports: Vec<FieldImport>,
    /// Module-level custom attributes (assembly metadata)
    pub custom_attributes: Vec<CustomAttribute>,
}

impl Module {
    /// Create an empty module with the given assembly identity.
    #[must_use]
    pub fn new(name: &str, version: Version) -> Self {
        Module {
            assembly: AssemblyName {
                name: name.to_string(),
                version,
            },
            types: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            type_imports: Vec::new(),
            method_imports: Vec::new(),
            field_imports: Vec::new(),
            custom_attributes: Vec::new(),
        }
    }

    /// Add a type definition.
    pub fn add_type(&mut self, type_def: TypeDef) -> TypeIndex {
        self.types.push(type_def);
        #[allow(clippy::cast_possible_truncation)]
        let index = TypeIndex((self.types.len() - 1) as u32);
        index
    }

    /// Add a field definition and attach it to its declaring type.
    pub fn add_field(&mut self, declaring: TypeIndex, mut field: FieldDef) -> FieldIndex {
        field.declaring = Some(declaring);
        self.fields.push(field);
        #[allow(clippy::cast_possible_truncation)]
        let index = FieldIndex((self.fields.len() - 1) as u32);
        self.types[declaring.index()].fields.push(index);
        index
    }

    /// Add a method definition and attach it to its declaring type.
    pub fn add_method(&mut self, declaring: TypeIndex, mut method: MethodDef) -> MethodIndex {
        method.declaring = Some(declaring);
        self.methods.push(method);
        #[allow(clippy::cast_possible_truncation)]
        let index = MethodIndex((self.methods.len() - 1) as u32);
        self.types[declaring.index()].methods.push(index);
        index
    }

    /// Import an external type, reusing an identical existing entry.
    pub fn import_type(&mut self, import: TypeImport) -> TypeRefIndex {
        if let Some(position) = self.type_imports.iter().position(|t| *t == import) {
            #[allow(clippy::cast_possible_truncation)]
            return TypeRefIndex(position as u32);
        }
        self.type_imports.push(import);
        #[allow(clippy::cast_possible_truncation)]
        let index = TypeRefIndex((self.type_imports.len() - 1) as u32);
        index
    }

    /// Import an external method, reusing an identical existing entry.
    pub fn import_method(&mut self, import: MethodImport) -> MethodRefIndex {
        if let Some(position) = self.method_imports.iter().position(|m| *m == import) {
            #[allow(clippy::cast_possible_truncation)]
            return MethodRefIndex(position as u32);
        }
        self.method_imports.push(import);
        #[allow(clippy::cast_possible_truncation)]
        let index = MethodRefIndex((self.method_imports.len() - 1) as u32);
        index
    }

    /// Import an external field, reusing an identical existing entry.
    pub fn import_field(&mut self, import: FieldImport) -> FieldRefIndex {
        if let Some(position) = self.field_imports.iter().position(|f| *f == import) {
            #[allow(clippy::cast_possible_truncation)]
            return FieldRefIndex(position as u32);
        }
        self.field_imports.push(import);
        #[allow(clippy::cast_possible_truncation)]
        let index = FieldRefIndex((self.field_imports.len() - 1) as u32);
        index
    }

    /// Find a type definition by namespace-qualified name.
    #[must_use]
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<TypeIndex> {
        self.types
            .iter()
            .position(|t| t.name.namespace == namespace && t.name.name == name)
            .map(|p| {
                #[allow(clippy::cast_possible_truncation)]
                TypeIndex(p as u32)
            })
    }

    /// The declaring type name of a method reference, for either arm.
    ///
    /// # Errors
    /// Fails when an index does not resolve in this module.
    pub fn method_declaring_type(&self, method: MethodRef) -> Result<TypeName> {
        match method {
            MethodRef::Def(index) => {
                let def = self
                    .methods
                    .get(index.index())
                    .ok_or_else(|| weave_error!("Method index {} out of range", index.value()))?;
                let declaring = def
                    .declaring
                    .ok_or_else(|| weave_error!("Method {} has no declaring type", def.name))?;
                Ok(self.types[declaring.index()].name.clone())
            }
            MethodRef::External(index) => {
                let import = self
                    .method_imports
                    .get(index.index())
                    .ok_or_else(|| weave_error!("Method import {} out of range", index.value()))?;
                Ok(self.type_imports[import.declaring.index()].name.clone())
            }
        }
    }

    /// Signature facts of a method reference needed for stack-effect computation.
    ///
    /// Returns `(declared parameter count, has receiver, returns void, name)`.
    ///
    /// # Errors
    /// Fails when an index does not resolve in this module.
    pub fn method_signature(&self, method: MethodRef) -> Result<(usize, bool, bool, &str)> {
        match method {
            MethodRef::Def(index) => {
                let def = self
                    .methods
                    .get(index.index())
                    .ok_or_else(|| weave_error!("Method index {} out of range", index.value()))?;
                Ok((
                    def.params.len(),
                    !def.is_static(),
                    def.return_type.is_void(),
                    &def.name,
                ))
            }
            MethodRef::External(index) => {
                let import = self
                    .method_imports
                    .get(index.index())
                    .ok_or_else(|| weave_error!("Method import {} out of range", index.value()))?;
                Ok((
                    import.params.len(),
                    import.has_this,
                    import.return_type.is_void(),
                    &import.name,
                ))
            }
        }
    }

    /// Parameter list of a method reference, for either arm.
    ///
    /// # Errors
    /// Fails when an index does not resolve in this module.
    pub fn method_params(&self, method: MethodRef) -> Result<&[ParamSig]> {
        match method {
            MethodRef::Def(index) => self
                .methods
                .get(index.index())
                .map(|d| d.params.as_slice())
                .ok_or_else(|| weave_error!("Method index {} out of range", index.value())),
            MethodRef::External(index) => self
                .method_imports
                .get(index.index())
                .map(|i| i.params.as_slice())
                .ok_or_else(|| weave_error!("Method import {} out of range", index.value())),
        }
    }

    /// Name of a type reference, for either arm.
    #[must_use]
    pub fn type_ref_name(&self, type_ref: TypeRef) -> Option<TypeName> {
        match type_ref {
            TypeRef::Def(index) => self.types.get(index.index()).map(|t| t.name.clone()),
            TypeRef::External(index) => {
                self.type_imports.get(index.index()).map(|t| t.name.clone())
            }
        }
    }

    /// All namespaces of top-level type definitions, for the namespace heuristic.
    ///
    /// Only top-level types count, so a namespace is not double-counted just because it
    /// declares multiple nested types.
    pub fn top_level_namespaces(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|t| t.name.namespace.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_module() -> Module {
        Module::new("TestAssembly", Version(1, 2, 3, 4))
    }

    #[test]
    fn add_field_attaches_to_declaring_type() {
        let mut module = empty_module();
        let ty = module.add_type(TypeDef::new(
            TypeName::new("App", "Widget"),
            TypeAttributes::PUBLIC,
            None,
        ));
        let field = module.add_field(
            ty,
            FieldDef {
                name: "cached".to_string(),
                attributes: FieldAttributes::PRIVATE | FieldAttributes::STATIC,
                field_type: TypeName::regex(),
                declaring: None,
            },
        );

        assert_eq!(module.types[ty.index()].fields, vec![field]);
        assert_eq!(module.fields[field.index()].declaring, Some(ty));
    }

    #[test]
    fn import_type_deduplicates() {
        let mut module = empty_module();
        let a = module.import_type(TypeImport {
            name: TypeName::regex(),
            assembly: "System.Text.RegularExpressions".to_string(),
        });
        let b = module.import_type(TypeImport {
            name: TypeName::regex(),
            assembly: "System.Text.RegularExpressions".to_string(),
        });
        assert_eq!(a, b);
        assert_eq!(module.type_imports.len(), 1);
    }

    #[test]
    fn method_signature_resolves_both_arms() {
        let mut module = empty_module();
        let ty = module.add_type(TypeDef::new(
            TypeName::new("App", "Widget"),
            TypeAttributes::PUBLIC,
            None,
        ));
        let def = module.add_method(
            ty,
            MethodDef::new(
                "Run",
                MethodAttributes::PUBLIC | MethodAttributes::STATIC,
                TypeName::void(),
                vec![ParamSig::of(TypeName::string())],
            ),
        );
        let regex_ty = module.import_type(TypeImport {
            name: TypeName::regex(),
            assembly: "System.Text.RegularExpressions".to_string(),
        });
        let import = module.import_method(MethodImport {
            declaring: regex_ty,
            name: "IsMatch".to_string(),
            params: vec![ParamSig::of(TypeName::string())],
            return_type: TypeName::boolean(),
            has_this: true,
        });

        let (count, has_this, returns_void, name) =
            module.method_signature(MethodRef::Def(def)).unwrap();
        assert_eq!((count, has_this, returns_void, name), (1, false, true, "Run"));

        let (count, has_this, returns_void, name) =
            module.method_signature(MethodRef::External(import)).unwrap();
        assert_eq!(
            (count, has_this, returns_void, name),
            (1, true, false, "IsMatch")
        );
    }

    #[test]
    fn type_name_formatting() {
        assert_eq!(TypeName::regex().full_name(), "System.Text.RegularExpressions.Regex");
        assert_eq!(TypeName::new("", "Global").full_name(), "Global");
        assert!(TypeName::void().is_void());
    }
}
