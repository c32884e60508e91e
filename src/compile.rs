//! Batch compilation of regex definitions into a side artifact assembly.
//!
//! All distinct definitions in a module are compiled together, by an external
//! black-box compiler behind the [`RegexAssemblyCompiler`] trait. The batch is
//! deterministically ordered and content-hashed (generated type identity and
//! tool version included), and the
//! hash is embedded in the artifact's description so an unchanged batch reuses the
//! previous artifact instead of recompiling. A stale artifact is deleted before
//! recompilation so a failed run can never leave a mismatched file behind.
//!
//! The external compiler reports failure for the batch as a whole, so on failure
//! every definition is re-validated in isolation to attribute the error to the
//! specific offending pattern.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::cil::{Module, TypeName};
use crate::context::WeaveContext;
use crate::extractor::RegexDefinition;
use crate::namespace;
use crate::Result;

/// Version string baked into the batch hash, so a tool upgrade forces recompilation.
const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One batch handed to the external compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilationPlan {
    /// Simple name of the artifact assembly, `<target assembly>.RegularExpressions`
    pub assembly_name: String,
    /// Namespace of every generated type
    pub namespace: String,
    /// Sorted distinct definitions with their generated type names
    pub entries: Vec<(RegexDefinition, String)>,
    /// Description embedded in the artifact, carries the batch hash
    pub description: String,
    /// Where the artifact file is written
    pub output_path: PathBuf,
}

/// The compiled artifact plus the definition-to-type mapping the generator needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRegexes {
    /// The artifact assembly's module
    pub module: Module,
    /// Generated type per definition, in batch order
    pub types: Vec<(RegexDefinition, TypeName)>,
}

/// The external compiler producing real precompiled regex assemblies.
///
/// Kept behind a trait so the pipeline can be exercised end to end without the
/// platform toolchain present.
pub trait RegexAssemblyCompiler {
    /// Description embedded in an existing artifact, or `None` when unreadable.
    fn existing_description(&self, path: &Path) -> Option<String>;

    /// Load an existing artifact's module.
    ///
    /// # Errors
    /// Fails when the file is not a readable assembly.
    fn load(&self, path: &Path) -> Result<Module>;

    /// Compile the batch, writing the artifact at `plan.output_path`.
    ///
    /// # Errors
    /// Fails for the batch as a whole; per-pattern attribution is the caller's job.
    fn compile(&self, plan: &CompilationPlan) -> Result<Module>;

    /// Validate one definition in isolation, returning the compiler's message on failure.
    fn validate(&self, definition: &RegexDefinition) -> std::result::Result<(), String>;
}

/// Restores the process working directory on drop.
///
/// The external compiler writes its output into the current directory, so the
/// directory is switched for the duration of the call only.
pub struct CwdGuard {
    original: PathBuf,
}

impl CwdGuard {
    /// Switch the working directory to `path` until the guard drops.
    ///
    /// # Errors
    /// Fails when either directory cannot be resolved.
    pub fn enter(path: &Path) -> Result<Self> {
        let original = std::env::current_dir()?;
        std::env::set_current_dir(path)?;
        Ok(CwdGuard { original })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        // Nothing useful to do if the original directory vanished meanwhile.
        let _ = std::env::set_current_dir(&self.original);
    }
}

/// Drives the external compiler for one target module.
pub struct RegexCompiler<'a, C> {
    context: &'a WeaveContext<'a>,
    backend: &'a C,
}

impl<'a, C: RegexAssemblyCompiler> RegexCompiler<'a, C> {
    /// Create a compiler bound to one run's context and backend.
    #[must_use]
    pub fn new(context: &'a WeaveContext<'a>, backend: &'a C) -> Self {
        RegexCompiler { context, backend }
    }

    /// Compile (or reuse) the artifact for all given definitions.
    ///
    /// Returns `None` when compilation failed; the failures have already been
    /// reported through the context and latch the run as errored.
    ///
    /// # Errors
    /// Fails only on I/O problems around the artifact file itself.
    pub fn compile(
        &self,
        target: &Module,
        definitions: &[RegexDefinition],
        output_dir: &Path,
    ) -> Result<Option<CompiledRegexes>> {
        let plan = plan_batch(target, definitions, output_dir);

        if plan.output_path.exists() {
            if self.backend.existing_description(&plan.output_path).as_deref()
                == Some(plan.description.as_str())
            {
                self.context.log_debug(&format!(
                    "Reusing existing assembly {}",
                    plan.output_path.display()
                ));
                let module = self.backend.load(&plan.output_path)?;
                return Ok(Some(finish(&plan, module)));
            }
            self.context.log_debug(&format!(
                "Deleting stale assembly {}",
                plan.output_path.display()
            ));
            std::fs::remove_file(&plan.output_path)?;
        }

        self.context.log_info(&format!(
            "Compiling {} regular expression(s) to {}",
            plan.entries.len(),
            plan.output_path.display()
        ));

        let compiled = {
            let _cwd = CwdGuard::enter(output_dir)?;
            self.backend.compile(&plan)
        };

        match compiled {
            Ok(module) => Ok(Some(finish(&plan, module))),
            Err(batch_error) => {
                self.attribute_failures(&plan, &batch_error.to_string());
                Ok(None)
            }
        }
    }

    /// Re-validate each definition alone so the error names the bad pattern.
    fn attribute_failures(&self, plan: &CompilationPlan, batch_message: &str) {
        let mut attributed = false;
        for (definition, _) in &plan.entries {
            if let Err(message) = self.backend.validate(definition) {
                attributed = true;
                let error = crate::Error::PatternCompile {
                    definition: definition.to_string(),
                    message,
                };
                self.context.log_error(&error.to_string(), None);
            }
        }
        if !attributed {
            self.context.log_error(
                &format!("Failed to compile regular expressions: {batch_message}"),
                None,
            );
        }
    }
}

/// Build the deterministic batch for a set of definitions.
#[must_use]
pub fn plan_batch(
    target: &Module,
    definitions: &[RegexDefinition],
    output_dir: &Path,
) -> CompilationPlan {
    // BTreeSet both dedupes and fixes the (pattern, flags) order.
    let distinct: BTreeSet<&RegexDefinition> = definitions.iter().collect();
    let generated_namespace = namespace::generated_namespace(target);

    let entries: Vec<(RegexDefinition, String)> = distinct
        .into_iter()
        .enumerate()
        .map(|(index, definition)| (definition.clone(), format!("PrecompiledRegex{index}")))
        .collect();

    let assembly_name = format!("{}.RegularExpressions", target.assembly.name);
    let description = format!(
        "Precompiled regular expressions for {} (hash = {})",
        target.assembly.name,
        batch_hash(&generated_namespace, entries.iter())
    );
    let output_path = output_dir.join(format!("{assembly_name}.dll"));

    CompilationPlan {
        assembly_name,
        namespace: generated_namespace,
        entries,
        description,
        output_path,
    }
}

/// Content hash of an ordered batch: each entry's pattern, flag bits and generated
/// type identity, then the tool version.
///
/// The type identity matters as much as the pattern: a namespace shift between
/// builds moves the generated types, and an artifact holding the old ones must
/// not satisfy the reuse check.
fn batch_hash<'d>(
    namespace: &str,
    entries: impl Iterator<Item = &'d (RegexDefinition, String)>,
) -> String {
    let mut content = String::new();
    for (definition, name) in entries {
        // Generated types are always public.
        let _ = write!(
            content,
            "{}@@{}@@{namespace}@@{name}@@1@@",
            definition.pattern(),
            definition.flags().bits()
        );
    }
    content.push_str(TOOL_VERSION);

    format!("{:x}", Md5::digest(content.as_bytes()))
}

fn finish(plan: &CompilationPlan, module: Module) -> CompiledRegexes {
    let types = plan
        .entries
        .iter()
        .map(|(definition, type_name)| {
            (
                definition.clone(),
                TypeName::new(&plan.namespace, type_name),
            )
        })
        .collect();
    CompiledRegexes { module, types }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::{TypeAttributes, TypeDef, Version};
    use crate::context::MemorySink;
    use crate::extractor::RegexFlags;
    use crate::options::Options;

    fn target() -> Module {
        Module::new("MyApp", Version(1, 0, 0, 0))
    }

    fn def(pattern: &str, flags: RegexFlags) -> RegexDefinition {
        RegexDefinition::new(pattern, flags)
    }

    #[test]
    fn batch_is_deduplicated_and_ordered() {
        let defs = vec![
            def("b", RegexFlags::empty()),
            def("a", RegexFlags::IGNORE_CASE),
            def("b", RegexFlags::COMPILED), // same as "b" with no flags
            def("a", RegexFlags::empty()),
        ];
        let plan = plan_batch(&target(), &defs, Path::new("/tmp"));
        let names: Vec<&str> = plan.entries.iter().map(|(d, _)| d.pattern()).collect();
        assert_eq!(names, ["a", "a", "b"]);
        assert_eq!(plan.entries[0].1, "PrecompiledRegex0");
        assert_eq!(plan.entries[2].1, "PrecompiledRegex2");
        assert_eq!(plan.assembly_name, "MyApp.RegularExpressions");
    }

    #[test]
    fn hash_ignores_input_order_and_compiled_bit() {
        let forward = vec![def("a", RegexFlags::empty()), def("b", RegexFlags::MULTILINE)];
        let backward = vec![
            def("b", RegexFlags::MULTILINE | RegexFlags::COMPILED),
            def("a", RegexFlags::empty()),
        ];
        let a = plan_batch(&target(), &forward, Path::new("/tmp"));
        let b = plan_batch(&target(), &backward, Path::new("/tmp"));
        assert_eq!(a.description, b.description);

        let different = plan_batch(
            &target(),
            &[def("a", RegexFlags::MULTILINE)],
            Path::new("/tmp"),
        );
        assert_ne!(a.description, different.description);
    }

    #[test]
    fn hash_covers_the_generated_type_namespace() {
        let defs = [def("a+", RegexFlags::empty())];

        let mut alpha = target();
        alpha.add_type(TypeDef::new(
            TypeName::new("Alpha", "Widget"),
            TypeAttributes::PUBLIC,
            None,
        ));
        let mut beta = target();
        beta.add_type(TypeDef::new(
            TypeName::new("Beta", "Widget"),
            TypeAttributes::PUBLIC,
            None,
        ));

        // Same definitions, but the generated types land in different namespaces,
        // so an artifact built for one must not be reused for the other.
        let a = plan_batch(&alpha, &defs, Path::new("/tmp"));
        let b = plan_batch(&beta, &defs, Path::new("/tmp"));
        assert_eq!(a.namespace, "Alpha.PrecompiledRegex");
        assert_eq!(b.namespace, "Beta.PrecompiledRegex");
        assert_ne!(a.description, b.description);
    }

    #[test]
    fn description_names_the_assembly() {
        let plan = plan_batch(&target(), &[def("x", RegexFlags::empty())], Path::new("/tmp"));
        assert!(plan
            .description
            .starts_with("Precompiled regular expressions for MyApp (hash = "));
    }

    struct FailingBackend;

    impl RegexAssemblyCompiler for FailingBackend {
        fn existing_description(&self, _path: &Path) -> Option<String> {
            None
        }

        fn load(&self, _path: &Path) -> Result<Module> {
            unreachable!("nothing to load")
        }

        fn compile(&self, _plan: &CompilationPlan) -> Result<Module> {
            Err(crate::Error::ArtifactCompile("batch failed".to_string()))
        }

        fn validate(&self, definition: &RegexDefinition) -> std::result::Result<(), String> {
            if definition.pattern() == "(broken" {
                Err("unterminated group".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn batch_failure_is_attributed_to_the_bad_pattern() {
        let sink = MemorySink::default();
        let context = WeaveContext::new(Options::default(), &sink);
        let compiler = RegexCompiler::new(&context, &FailingBackend);

        let result = compiler
            .compile(
                &target(),
                &[def("ok", RegexFlags::empty()), def("(broken", RegexFlags::empty())],
                &std::env::temp_dir(),
            )
            .unwrap();

        assert!(result.is_none());
        assert!(context.has_errors());
        let errors = sink.errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("(broken"), "{}", errors[0]);
        assert!(errors[0].contains("unterminated group"), "{}", errors[0]);
    }
}
