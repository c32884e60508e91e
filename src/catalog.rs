//! The closed catalog of `Regex` construction and static-call shapes the transformer
//! recognizes.
//!
//! Each [`RegexCallShape`] records where in the argument list the pattern, options and
//! timeout live, and (for static helpers) the instance method the call is rewritten to
//! once a cached `Regex` instance stands in for the pattern/options pair. Call sites
//! whose target does not match any shape are left untouched; there is no partial or
//! fuzzy matching.
//!
//! The catalog is exhaustive over the BCL surface where a constant pattern can be
//! precompiled: the three constructors and the `IsMatch`/`Match`/`Matches`/`Split`/
//! `Replace` static helpers in each of their arities.

use crate::cil::{MethodRef, Module, TypeName};
use crate::Result;

/// Whether a shape is matched at a `newobj` or at a static `call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    /// One of the three `Regex` constructors
    Constructor,
    /// A static helper on `Regex`
    Static,
}

/// One parameter position of a recognized shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeParam {
    /// `System.String input` - carried through to the instance call
    Input,
    /// `System.String pattern` - consumed by the accessor
    Pattern,
    /// `System.Text.RegularExpressions.RegexOptions options` - consumed by the accessor
    Options,
    /// `System.TimeSpan matchTimeout` - passed to the timeout accessor
    Timeout,
    /// `System.String replacement` - carried through to the instance call
    Replacement,
    /// `System.Text.RegularExpressions.MatchEvaluator evaluator` - carried through
    Evaluator,
}

impl ShapeParam {
    /// The parameter's CLR type.
    #[must_use]
    pub fn type_name(self) -> TypeName {
        match self {
            ShapeParam::Input | ShapeParam::Pattern | ShapeParam::Replacement => TypeName::string(),
            ShapeParam::Options => TypeName::new("System.Text.RegularExpressions", "RegexOptions"),
            ShapeParam::Timeout => TypeName::timespan(),
            ShapeParam::Evaluator => {
                TypeName::new("System.Text.RegularExpressions", "MatchEvaluator")
            }
        }
    }
}

/// Return type of a recognized shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeReturn {
    /// Constructors
    Void,
    /// `IsMatch`
    Bool,
    /// `Match`
    Match,
    /// `Matches`
    MatchCollection,
    /// `Split`
    StringArray,
    /// `Replace`
    String,
}

impl ShapeReturn {
    /// The return's CLR type.
    #[must_use]
    pub fn type_name(self) -> TypeName {
        match self {
            ShapeReturn::Void => TypeName::void(),
            ShapeReturn::Bool => TypeName::boolean(),
            ShapeReturn::Match => TypeName::new("System.Text.RegularExpressions", "Match"),
            ShapeReturn::MatchCollection => {
                TypeName::new("System.Text.RegularExpressions", "MatchCollection")
            }
            ShapeReturn::StringArray => TypeName::new("System", "String[]"),
            ShapeReturn::String => TypeName::string(),
        }
    }
}

/// One recognized `Regex` call shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegexCallShape {
    /// Constructor or static helper
    pub kind: ShapeKind,
    /// Method name (`.ctor` for constructors)
    pub name: &'static str,
    /// Full parameter list in declaration order
    pub params: &'static [ShapeParam],
    /// Return type
    pub returns: ShapeReturn,
}

impl RegexCallShape {
    /// Index of the pattern argument.
    #[must_use]
    pub fn pattern_index(&self) -> usize {
        self.param_index(ShapeParam::Pattern)
    }

    /// Index of the options argument, if the shape takes one.
    #[must_use]
    pub fn options_index(&self) -> Option<usize> {
        self.params.iter().position(|p| *p == ShapeParam::Options)
    }

    /// Index of the timeout argument, if the shape takes one.
    #[must_use]
    pub fn timeout_index(&self) -> Option<usize> {
        self.params.iter().position(|p| *p == ShapeParam::Timeout)
    }

    /// Whether the shape carries a match timeout.
    #[must_use]
    pub fn has_timeout(&self) -> bool {
        self.timeout_index().is_some()
    }

    /// Arguments that survive the rewrite, in declaration order.
    ///
    /// The pattern and options are absorbed into the cached instance; everything
    /// else (input, replacement/evaluator, timeout) still has to be on the stack
    /// after the rewrite, so the rewriter spills exactly these to locals.
    pub fn residual_params(&self) -> impl Iterator<Item = ShapeParam> + '_ {
        self.params
            .iter()
            .copied()
            .filter(|p| !matches!(p, ShapeParam::Pattern | ShapeParam::Options))
    }

    /// Parameters of the instance method a static shape is rewritten to.
    ///
    /// The timeout is excluded here: it is handed to the timeout accessor rather
    /// than to the instance call.
    pub fn instance_params(&self) -> impl Iterator<Item = ShapeParam> + '_ {
        self.residual_params().filter(|p| *p != ShapeParam::Timeout)
    }

    /// Printable form for diagnostics, e.g. `Regex.IsMatch(String, String)`.
    fn display_name(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|p| p.type_name().name)
            .collect::<Vec<_>>()
            .join(", ");
        match self.kind {
            ShapeKind::Constructor => format!("new Regex({params})"),
            ShapeKind::Static => format!("Regex.{}({params})", self.name),
        }
    }

    fn param_index(&self, param: ShapeParam) -> usize {
        self.params
            .iter()
            .position(|p| *p == param)
            .unwrap_or_else(|| unreachable!("every catalog shape has a pattern argument"))
    }
}

impl std::fmt::Display for RegexCallShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

const IS_MATCH_2: &[ShapeParam] = &[ShapeParam::Input, ShapeParam::Pattern];
const IS_MATCH_3: &[ShapeParam] = &[ShapeParam::Input, ShapeParam::Pattern, ShapeParam::Options];
const IS_MATCH_4: &[ShapeParam] = &[
    ShapeParam::Input,
    ShapeParam::Pattern,
    ShapeParam::Options,
    ShapeParam::Timeout,
];
const REPLACE_STR_3: &[ShapeParam] = &[
    ShapeParam::Input,
    ShapeParam::Pattern,
    ShapeParam::Replacement,
];
const REPLACE_STR_4: &[ShapeParam] = &[
    ShapeParam::Input,
    ShapeParam::Pattern,
    ShapeParam::Replacement,
    ShapeParam::Options,
];
const REPLACE_STR_5: &[ShapeParam] = &[
    ShapeParam::Input,
    ShapeParam::Pattern,
    ShapeParam::Replacement,
    ShapeParam::Options,
    ShapeParam::Timeout,
];
const REPLACE_EVAL_3: &[ShapeParam] = &[
    ShapeParam::Input,
    ShapeParam::Pattern,
    ShapeParam::Evaluator,
];
const REPLACE_EVAL_4: &[ShapeParam] = &[
    ShapeParam::Input,
    ShapeParam::Pattern,
    ShapeParam::Evaluator,
    ShapeParam::Options,
];
const REPLACE_EVAL_5: &[ShapeParam] = &[
    ShapeParam::Input,
    ShapeParam::Pattern,
    ShapeParam::Evaluator,
    ShapeParam::Options,
    ShapeParam::Timeout,
];

/// Every shape the transformer recognizes.
pub const SHAPES: &[RegexCallShape] = &[
    // Constructors
    RegexCallShape {
        kind: ShapeKind::Constructor,
        name: ".ctor",
        params: &[ShapeParam::Pattern],
        returns: ShapeReturn::Void,
    },
    RegexCallShape {
        kind: ShapeKind::Constructor,
        name: ".ctor",
        params: &[ShapeParam::Pattern, ShapeParam::Options],
        returns: ShapeReturn::Void,
    },
    RegexCallShape {
        kind: ShapeKind::Constructor,
        name: ".ctor",
        params: &[ShapeParam::Pattern, ShapeParam::Options, ShapeParam::Timeout],
        returns: ShapeReturn::Void,
    },
    // IsMatch
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "IsMatch",
        params: IS_MATCH_2,
        returns: ShapeReturn::Bool,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "IsMatch",
        params: IS_MATCH_3,
        returns: ShapeReturn::Bool,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "IsMatch",
        params: IS_MATCH_4,
        returns: ShapeReturn::Bool,
    },
    // Match
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Match",
        params: IS_MATCH_2,
        returns: ShapeReturn::Match,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Match",
        params: IS_MATCH_3,
        returns: ShapeReturn::Match,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Match",
        params: IS_MATCH_4,
        returns: ShapeReturn::Match,
    },
    // Matches
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Matches",
        params: IS_MATCH_2,
        returns: ShapeReturn::MatchCollection,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Matches",
        params: IS_MATCH_3,
        returns: ShapeReturn::MatchCollection,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Matches",
        params: IS_MATCH_4,
        returns: ShapeReturn::MatchCollection,
    },
    // Split
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Split",
        params: IS_MATCH_2,
        returns: ShapeReturn::StringArray,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Split",
        params: IS_MATCH_3,
        returns: ShapeReturn::StringArray,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Split",
        params: IS_MATCH_4,
        returns: ShapeReturn::StringArray,
    },
    // Replace with a string replacement
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Replace",
        params: REPLACE_STR_3,
        returns: ShapeReturn::String,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Replace",
        params: REPLACE_STR_4,
        returns: ShapeReturn::String,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Replace",
        params: REPLACE_STR_5,
        returns: ShapeReturn::String,
    },
    // Replace with a MatchEvaluator
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Replace",
        params: REPLACE_EVAL_3,
        returns: ShapeReturn::String,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Replace",
        params: REPLACE_EVAL_4,
        returns: ShapeReturn::String,
    },
    RegexCallShape {
        kind: ShapeKind::Static,
        name: "Replace",
        params: REPLACE_EVAL_5,
        returns: ShapeReturn::String,
    },
];

/// Match a call target against the catalog.
///
/// Returns `None` when the target is not a `Regex` member or no shape matches its
/// name and exact parameter types. The shape kind must agree with the call form:
/// constructors are only matched at `newobj` sites, statics at `call` sites.
///
/// # Errors
/// Fails only when the method reference does not resolve in the module.
pub fn match_shape(
    module: &Module,
    method: MethodRef,
    is_newobj: bool,
) -> Result<Option<&'static RegexCallShape>> {
    let declaring = module.method_declaring_type(method)?;
    if declaring != TypeName::regex() {
        return Ok(None);
    }

    let (_, _, _, name) = module.method_signature(method)?;
    let name = name.to_string();
    let params = module.method_params(method)?;

    for shape in SHAPES {
        let kind_matches = match shape.kind {
            ShapeKind::Constructor => is_newobj,
            ShapeKind::Static => !is_newobj,
        };
        if !kind_matches || shape.name != name || shape.params.len() != params.len() {
            continue;
        }
        let types_match = shape
            .params
            .iter()
            .zip(params.iter())
            .all(|(shape_param, param)| shape_param.type_name() == param.ty);
        if types_match {
            return Ok(Some(shape));
        }
    }
    Ok(None)
}
