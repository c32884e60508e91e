//! The end-to-end weaving pipeline over one target module.
//!
//! Execution order: scan every method body for rewritable references, compile (or
//! reuse) the artifact assembly for all distinct definitions, merge the artifact's
//! types into the target, generate the accessor methods, then rewrite every
//! recorded call site. Scanning is finished before anything mutates, so the
//! reference map is never invalidated by the pipeline's own edits.
//!
//! The pipeline reports problems through the context rather than failing fast
//! where it can: skipped call sites are informational, compile failures latch the
//! error flag and stop before any mutation, and only structural damage surfaces
//! as a hard [`crate::Error`].

use std::collections::BTreeMap;
use std::path::Path;

use crate::cil::{MethodIndex, Module};
use crate::compile::{RegexAssemblyCompiler, RegexCompiler};
use crate::context::WeaveContext;
use crate::extractor::{self, ExtractOutcome, RegexDefinition, RegexReference};
use crate::generator::AccessorGenerator;
use crate::merge::TypeMerger;
use crate::options::{IncludeFilter, NoOpBehavior};
use crate::rewriter;
use crate::Result;

/// Warning emitted when a module yields nothing to precompile.
const NO_OP_MESSAGE: &str = "The assembly does not contain any regular expressions \
                             that can be precompiled. View detailed build output for more information";

/// Weaves precompiled regular expressions into one module.
pub struct ModuleWeaver<'a, C> {
    context: &'a WeaveContext<'a>,
    backend: &'a C,
}

impl<'a, C: RegexAssemblyCompiler> ModuleWeaver<'a, C> {
    /// Create a weaver bound to one run's context and artifact backend.
    #[must_use]
    pub fn new(context: &'a WeaveContext<'a>, backend: &'a C) -> Self {
        ModuleWeaver { context, backend }
    }

    /// Run the full pipeline; `output_dir` is where the artifact assembly lives.
    ///
    /// # Errors
    /// Fails on structural damage or artifact I/O problems. Pattern compilation
    /// failures do not error here; they latch the context instead, and the caller
    /// decides via [`WeaveContext::has_errors`].
    pub fn execute(&self, module: &mut Module, output_dir: &Path) -> Result<()> {
        let references = {
            let _step = self.context.step("Finding Regex References");
            self.find_references(module)?
        };

        if references.is_empty() {
            match self.context.options.no_op_behavior {
                NoOpBehavior::Warn => self.context.log_warning(NO_OP_MESSAGE, None),
                NoOpBehavior::Silent => self.context.log_debug(NO_OP_MESSAGE),
            }
            return Ok(());
        }

        let _step = self.context.step("Rewriting Regex References");

        let definitions: Vec<RegexDefinition> = references
            .iter()
            .flat_map(|(_, refs)| refs.iter().map(|r| r.definition.clone()))
            .collect();

        let compiler = RegexCompiler::new(self.context, self.backend);
        let Some(compiled) = compiler.compile(module, &definitions, output_dir)? else {
            return Ok(()); // failures already reported and latched
        };

        TypeMerger::new(module).merge(&compiled.module)?;
        let accessors = AccessorGenerator::new(module).generate(&compiled.types)?;

        for (method, refs) in &references {
            rewriter::rewrite_method(module, *method, refs, &accessors)?;
        }
        Ok(())
    }

    /// Scan every method body, logging each candidate's fate.
    fn find_references(&self, module: &Module) -> Result<Vec<(MethodIndex, Vec<RegexReference>)>> {
        let mut references = Vec::new();
        for (position, method) in module.methods.iter().enumerate() {
            let Some(body) = &method.body else { continue };
            #[allow(clippy::cast_possible_truncation)]
            let index = MethodIndex(position as u32);

            let mut found = Vec::new();
            for (_, outcome) in extractor::scan(module, body)? {
                match outcome {
                    ExtractOutcome::Reference(reference) => {
                        if self.context.options.include == IncludeFilter::Compiled
                            && !reference.compiled_requested
                        {
                            self.context.log_info(&format!(
                                "Options argument to {} in {} does not have the 'Compiled' flag: it will not be precompiled",
                                reference.shape, method.name
                            ));
                            continue;
                        }
                        self.context.log_info(&format!(
                            "Found precompilable regex {} in {}",
                            reference.definition, method.name
                        ));
                        found.push(reference);
                    }
                    ExtractOutcome::Skipped(reason) => {
                        self.context.log_info(&format!(
                            "Could not precompile regex reference in {}: {reason}: it will not be precompiled",
                            method.name
                        ));
                    }
                    ExtractOutcome::NotARegexCall => {}
                }
            }
            if !found.is_empty() {
                references.push((index, found));
            }
        }
        Ok(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::{
        MethodAttributes, MethodBody, MethodDef, MethodImport, MethodRef, OpCode, Operand,
        ParamSig, TypeAttributes, TypeDef, TypeImport, TypeName, Version,
    };
    use crate::compile::CompilationPlan;
    use crate::context::MemorySink;
    use crate::options::Options;

    /// Builds plausible artifact modules in memory instead of invoking a real
    /// regex compiler: one sealed subclass per entry with both constructors.
    struct FakeBackend;

    impl RegexAssemblyCompiler for FakeBackend {
        fn existing_description(&self, _path: &Path) -> Option<String> {
            None
        }

        fn load(&self, _path: &Path) -> Result<Module> {
            Err(crate::Error::Error("no artifact on disk".to_string()))
        }

        fn compile(&self, plan: &CompilationPlan) -> Result<Module> {
            let mut artifact = Module::new(&plan.assembly_name, Version(1, 0, 0, 0));
            let regex_base = artifact.import_type(TypeImport {
                name: TypeName::regex(),
                assembly: "System.Text.RegularExpressions".to_string(),
            });
            for (_, type_name) in &plan.entries {
                let ty = artifact.add_type(TypeDef::new(
                    TypeName::new(&plan.namespace, type_name),
                    TypeAttributes::PUBLIC | TypeAttributes::SEALED,
                    Some(crate::cil::TypeRef::External(regex_base)),
                ));
                artifact.add_method(
                    ty,
                    MethodDef::new(
                        ".ctor",
                        MethodAttributes::PUBLIC | MethodAttributes::RT_SPECIAL_NAME,
                        TypeName::void(),
                        Vec::new(),
                    ),
                );
                artifact.add_method(
                    ty,
                    MethodDef::new(
                        ".ctor",
                        MethodAttributes::PUBLIC | MethodAttributes::RT_SPECIAL_NAME,
                        TypeName::void(),
                        vec![ParamSig::named("matchTimeout", TypeName::timespan())],
                    ),
                );
            }
            Ok(artifact)
        }

        fn validate(&self, _definition: &RegexDefinition) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    fn module_with_ctor_site(pattern: &str) -> (Module, MethodIndex) {
        let mut module = Module::new("MyApp", Version(1, 0, 0, 0));
        let regex = module.import_type(TypeImport {
            name: TypeName::regex(),
            assembly: "System.Text.RegularExpressions".to_string(),
        });
        let ctor = MethodRef::External(module.import_method(MethodImport {
            declaring: regex,
            name: ".ctor".to_string(),
            params: vec![ParamSig::named("pattern", TypeName::string())],
            return_type: TypeName::void(),
            has_this: true,
        }));

        let ty = module.add_type(TypeDef::new(
            TypeName::new("MyApp", "Program"),
            TypeAttributes::PUBLIC,
            None,
        ));
        let mut body = MethodBody::new();
        body.emit(OpCode::Ldstr, Operand::Str(pattern.to_string()));
        body.emit(OpCode::Newobj, Operand::Method(ctor));
        body.emit(OpCode::Pop, Operand::None);
        body.emit(OpCode::Ret, Operand::None);
        let mut method = MethodDef::new(
            "Run",
            MethodAttributes::PUBLIC | MethodAttributes::STATIC,
            TypeName::void(),
            Vec::new(),
        );
        method.body = Some(body);
        let index = module.add_method(ty, method);
        (module, index)
    }

    #[test]
    fn empty_module_warns_by_default() {
        let sink = MemorySink::default();
        let context = WeaveContext::new(Options::default(), &sink);
        let weaver = ModuleWeaver::new(&context, &FakeBackend);

        let mut module = Module::new("Empty", Version(1, 0, 0, 0));
        weaver.execute(&mut module, &std::env::temp_dir()).unwrap();

        let warnings = sink.warnings.borrow();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("does not contain any regular expressions"));
    }

    #[test]
    fn silent_no_op_stays_at_debug_level() {
        let sink = MemorySink::default();
        let options = Options {
            no_op_behavior: crate::options::NoOpBehavior::Silent,
            ..Options::default()
        };
        let context = WeaveContext::new(options, &sink);
        let weaver = ModuleWeaver::new(&context, &FakeBackend);

        let mut module = Module::new("Empty", Version(1, 0, 0, 0));
        weaver.execute(&mut module, &std::env::temp_dir()).unwrap();

        assert!(sink.warnings.borrow().is_empty());
        assert!(sink
            .debugs
            .borrow()
            .iter()
            .any(|m| m.contains("does not contain any regular expressions")));
    }

    #[test]
    fn constructor_site_is_woven_end_to_end() {
        let sink = MemorySink::default();
        let context = WeaveContext::new(Options::default(), &sink);
        let weaver = ModuleWeaver::new(&context, &FakeBackend);

        let (mut module, host) = module_with_ctor_site("^a+$");
        weaver.execute(&mut module, &std::env::temp_dir()).unwrap();
        assert!(!context.has_errors());

        // Generated regex type and accessor container both merged in.
        assert!(module
            .find_type("MyApp.PrecompiledRegex", "PrecompiledRegex0")
            .is_some());
        assert!(module
            .find_type("PrecompiledRegex", "RegularExpressions")
            .is_some());

        // The site now calls the accessor; nothing loads the pattern anymore.
        let body = module.methods[host.index()].body.as_ref().unwrap();
        let mnemonics: Vec<_> = body.instructions.iter().map(|i| i.opcode.mnemonic()).collect();
        assert_eq!(mnemonics, ["call", "pop", "ret"]);
        body.validate().unwrap();
    }

    #[test]
    fn compiled_filter_excludes_plain_sites() {
        let sink = MemorySink::default();
        let options = Options {
            include: IncludeFilter::Compiled,
            ..Options::default()
        };
        let context = WeaveContext::new(options, &sink);
        let weaver = ModuleWeaver::new(&context, &FakeBackend);

        let (mut module, host) = module_with_ctor_site("^a+$");
        weaver.execute(&mut module, &std::env::temp_dir()).unwrap();

        // Site untouched and the skip was explained.
        let body = module.methods[host.index()].body.as_ref().unwrap();
        assert_eq!(body.instructions.len(), 4);
        assert!(sink
            .infos
            .borrow()
            .iter()
            .any(|m| m.contains("does not have the 'Compiled' flag")));
    }

    #[test]
    fn identical_definitions_share_one_accessor() {
        let sink = MemorySink::default();
        let context = WeaveContext::new(Options::default(), &sink);
        let weaver = ModuleWeaver::new(&context, &FakeBackend);

        // Two methods, same pattern; one generated type must serve both.
        let (mut module, _) = module_with_ctor_site("^a+$");
        let regex = module.import_type(TypeImport {
            name: TypeName::regex(),
            assembly: "System.Text.RegularExpressions".to_string(),
        });
        let ctor = MethodRef::External(module.import_method(MethodImport {
            declaring: regex,
            name: ".ctor".to_string(),
            params: vec![ParamSig::named("pattern", TypeName::string())],
            return_type: TypeName::void(),
            has_this: true,
        }));
        let host_type = module.find_type("MyApp", "Program").unwrap();
        let mut body = MethodBody::new();
        body.emit(OpCode::Ldstr, Operand::Str("^a+$".to_string()));
        body.emit(OpCode::Newobj, Operand::Method(ctor));
        body.emit(OpCode::Pop, Operand::None);
        body.emit(OpCode::Ret, Operand::None);
        let mut method = MethodDef::new(
            "RunAgain",
            MethodAttributes::PUBLIC | MethodAttributes::STATIC,
            TypeName::void(),
            Vec::new(),
        );
        method.body = Some(body);
        module.add_method(host_type, method);

        weaver.execute(&mut module, &std::env::temp_dir()).unwrap();

        assert!(module
            .find_type("MyApp.PrecompiledRegex", "PrecompiledRegex0")
            .is_some());
        assert!(module
            .find_type("MyApp.PrecompiledRegex", "PrecompiledRegex1")
            .is_none());
    }
}
