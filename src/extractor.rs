//! Extraction of precompilable regex references from instruction streams.
//!
//! A *reference* is a `newobj`/`call` whose target matches a catalog shape and whose
//! pattern and options arguments are decodable literals. Extraction composes the
//! catalog, the argument locator and the literal decoder, and reports exactly why a
//! candidate site was skipped so the caller can surface it; the timeout argument is
//! deliberately *not* required to be constant, since it stays a runtime value passed
//! through to the accessor.

use bitflags::bitflags;

use crate::catalog::{self, RegexCallShape, ShapeKind};
use crate::cil::{InstrId, MethodBody, Module, OpCode, Operand};
use crate::literal;
use crate::locator::{ArgumentLocator, LocateError, LocatedArguments};
use crate::Result;

bitflags! {
    /// `System.Text.RegularExpressions.RegexOptions` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct RegexFlags: i32 {
        /// Case-insensitive matching
        const IGNORE_CASE = 0x0001;
        /// `^`/`$` match line boundaries
        const MULTILINE = 0x0002;
        /// Only explicitly named groups capture
        const EXPLICIT_CAPTURE = 0x0004;
        /// Request ahead-of-time compilation; the very bit this tool makes moot
        const COMPILED = 0x0008;
        /// `.` matches newlines
        const SINGLELINE = 0x0010;
        /// Unescaped whitespace in the pattern is ignored
        const IGNORE_PATTERN_WHITESPACE = 0x0020;
        /// Matching proceeds right to left
        const RIGHT_TO_LEFT = 0x0040;
        /// ECMAScript-compatible behavior
        const ECMA_SCRIPT = 0x0100;
        /// Culture-invariant case folding
        const CULTURE_INVARIANT = 0x0200;
    }
}

/// A pattern/options pair identifying one precompiled `Regex` instance.
///
/// `Compiled` is masked out on construction: whether the author asked for runtime
/// compilation does not change which precompiled instance can serve the site, so two
/// definitions differing only in that bit must share one cache slot and one artifact
/// entry. Ordering is (pattern, flags), the order definitions appear in the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegexDefinition {
    /// The literal pattern text
    pattern: String,
    /// Options with `Compiled` removed
    flags: RegexFlags,
}

impl RegexDefinition {
    /// Create a definition, masking the cache-irrelevant `Compiled` bit.
    #[must_use]
    pub fn new(pattern: &str, flags: RegexFlags) -> Self {
        RegexDefinition {
            pattern: pattern.to_string(),
            flags: flags - RegexFlags::COMPILED,
        }
    }

    /// The pattern text.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The effective options (never contains `Compiled`).
    #[must_use]
    pub fn flags(&self) -> RegexFlags {
        self.flags
    }
}

impl std::fmt::Display for RegexDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({:?})", self.pattern, self.flags)
    }
}

/// One rewritable call site.
#[derive(Debug, Clone, PartialEq)]
pub struct RegexReference {
    /// The regex this site constructs or uses
    pub definition: RegexDefinition,
    /// The matched catalog shape
    pub shape: &'static RegexCallShape,
    /// The `newobj`/`call` instruction
    pub call: InstrId,
    /// Producers of every argument, in declaration order
    pub arguments: LocatedArguments,
    /// Whether the site asked for `RegexOptions.Compiled`
    pub compiled_requested: bool,
}

impl RegexReference {
    /// Producers that become dead once the site uses a cached instance.
    ///
    /// These are the pattern and options loads; the rewriter deletes them. The
    /// timeout producer stays because its value is still consumed at runtime.
    pub fn doomed_producers(&self) -> impl Iterator<Item = InstrId> + '_ {
        let pattern = self.arguments.producer(self.shape.pattern_index());
        let options = self
            .shape
            .options_index()
            .and_then(|i| self.arguments.producer(i));
        pattern.into_iter().chain(options)
    }
}

/// Why a catalog-shaped call site was left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Argument producers could not be pinned down
    Arguments(LocateError),
    /// The pattern argument is not a string literal
    NonConstantPattern,
    /// The options argument is not an integer literal
    NonConstantOptions,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Arguments(inner) => write!(f, "{inner}"),
            SkipReason::NonConstantPattern => write!(f, "the pattern is not a constant"),
            SkipReason::NonConstantOptions => write!(f, "the options are not a constant"),
        }
    }
}

/// Outcome of probing one instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    /// Not a catalog-shaped `Regex` call at all
    NotARegexCall,
    /// Shaped like a catalog entry, but not transformable
    Skipped(SkipReason),
    /// A rewritable reference
    Reference(RegexReference),
}

/// Probe a single instruction for a precompilable regex reference.
///
/// # Errors
/// Fails only on structural damage (unresolvable member references); skips are
/// reported through [`ExtractOutcome::Skipped`].
pub fn extract(module: &Module, body: &MethodBody, call: InstrId) -> Result<ExtractOutcome> {
    let instruction = match body.get(call) {
        Some(instruction) => instruction,
        None => return Ok(ExtractOutcome::NotARegexCall),
    };
    let is_newobj = match instruction.opcode {
        OpCode::Newobj => true,
        OpCode::Call | OpCode::Callvirt => false,
        _ => return Ok(ExtractOutcome::NotARegexCall),
    };
    let method = match instruction.operand {
        Operand::Method(method) => method,
        _ => return Ok(ExtractOutcome::NotARegexCall),
    };

    let shape = match catalog::match_shape(module, method, is_newobj)? {
        Some(shape) => shape,
        None => return Ok(ExtractOutcome::NotARegexCall),
    };
    // Catalog statics are non-receiver calls, so the stack argument count equals
    // the declared parameter count for every shape kind.
    debug_assert!(shape.kind == ShapeKind::Constructor || !is_newobj);

    let locator = ArgumentLocator::new(module, body);
    let arguments = match locator.locate(call, shape.params.len()) {
        Ok(arguments) => arguments,
        Err(reason) => return Ok(ExtractOutcome::Skipped(SkipReason::Arguments(reason))),
    };

    let pattern_producer = arguments
        .producer(shape.pattern_index())
        .and_then(|id| body.get(id));
    let pattern = match pattern_producer.and_then(literal::str_literal) {
        Some(pattern) => pattern.to_string(),
        None => return Ok(ExtractOutcome::Skipped(SkipReason::NonConstantPattern)),
    };

    let flags = match shape.options_index() {
        Some(index) => {
            let producer = arguments.producer(index).and_then(|id| body.get(id));
            match producer.and_then(literal::int_literal) {
                Some(bits) => RegexFlags::from_bits_retain(bits),
                None => return Ok(ExtractOutcome::Skipped(SkipReason::NonConstantOptions)),
            }
        }
        None => RegexFlags::empty(),
    };

    Ok(ExtractOutcome::Reference(RegexReference {
        definition: RegexDefinition::new(&pattern, flags),
        shape,
        call,
        arguments,
        compiled_requested: flags.contains(RegexFlags::COMPILED),
    }))
}

/// Probe every instruction of a body, yielding each catalog-shaped site's outcome.
///
/// `NotARegexCall` outcomes are filtered out; what remains is one entry per `Regex`
/// construction or static-helper call, rewritable or not.
///
/// # Errors
/// Fails only on structural damage in the module.
pub fn scan(module: &Module, body: &MethodBody) -> Result<Vec<(InstrId, ExtractOutcome)>> {
    let mut outcomes = Vec::new();
    for instruction in &body.instructions {
        let outcome = extract(module, body, instruction.id)?;
        if outcome != ExtractOutcome::NotARegexCall {
            outcomes.push((instruction.id, outcome));
        }
    }
    Ok(outcomes)
}
