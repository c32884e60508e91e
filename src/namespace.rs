//! Guessing a plausible root namespace for generated types.
//!
//! Generated container types should sit next to the module's own code, so the guess is
//! the most frequent namespace prefix across top-level types. This is naming cosmetics
//! only; any unique namespace would be correct.

use std::collections::HashMap;

use crate::cil::Module;

/// Suffix appended to the guessed base to keep generated types out of user namespaces.
pub const GENERATED_SUFFIX: &str = "PrecompiledRegex";

/// The namespace generated container types are placed in.
///
/// Falls back to the assembly name when the module has no namespaced types at all.
#[must_use]
pub fn generated_namespace(module: &Module) -> String {
    let base = guess_base_namespace(module.top_level_namespaces())
        .unwrap_or_else(|| module.assembly.name.clone());
    format!("{base}.{GENERATED_SUFFIX}")
}

/// The most frequent namespace prefix, or `None` when no namespace occurs.
///
/// Every prefix of every namespace is counted (`a.b.c` counts `a`, `a.b` and `a.b.c`),
/// with one pruning rule: once a longer prefix's count falls below its parent's running
/// count it can never catch up, so counting stops there for that namespace. Ties are
/// broken deterministically: the longer prefix wins when one is a prefix of the other,
/// otherwise the alphabetically smaller one wins.
#[must_use]
pub fn guess_base_namespace<'a>(namespaces: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut prefix_counts: HashMap<String, usize> = HashMap::new();

    for namespace in namespaces {
        let mut last_count = None;
        for prefix in prefixes(namespace) {
            let next_count = prefix_counts.get(&prefix).copied().unwrap_or(0) + 1;
            if last_count.is_some_and(|last| next_count < last) {
                break;
            }
            last_count = Some(next_count);
            prefix_counts.insert(prefix, next_count);
        }
    }

    prefix_counts
        .into_iter()
        .max_by(|(a, a_count), (b, b_count)| {
            a_count
                .cmp(b_count)
                .then_with(|| prefix_order(a, b).reverse())
        })
        .map(|(prefix, _)| prefix)
}

/// All dotted prefixes of a namespace, shortest first.
fn prefixes(namespace: &str) -> impl Iterator<Item = String> + '_ {
    let parts: Vec<&str> = namespace.split('.').filter(|p| !p.is_empty()).collect();
    (0..parts.len()).map(move |i| parts[..=i].join("."))
}

/// Tie-break order: prefix relationships put the longer first, otherwise alphabetical.
fn prefix_order(a: &str, b: &str) -> std::cmp::Ordering {
    let a_parts: Vec<&str> = a.split('.').collect();
    let b_parts: Vec<&str> = b.split('.').collect();
    let min = a_parts.len().min(b_parts.len());
    if a_parts[..min] == b_parts[..min] {
        // one is a prefix of the other; the longer (more specific) one goes first
        b_parts.len().cmp(&a_parts.len())
    } else {
        a.cmp(b)
    }
}
