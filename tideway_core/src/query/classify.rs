//! Static classification of query expressions by what input they consume.
//!
//! Partitioning a mapping by evaluation class is what lets the entity
//! evaluator compute constant fields once per batch instead of once per item,
//! and item-local fields without re-feeding the whole payload.

use regex::Regex;
use std::sync::LazyLock;

/// How much of the input document an expression needs to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvaluationClass {
    /// Computable with zero input: literals, placeholder arithmetic, bounded
    /// `range` calls over literals.
    None,
    /// Depends only on the bound "current item" name.
    Single,
    /// Depends on data outside the current item, or consumes the full input
    /// stream implicitly.
    All,
}

const STR_TOKEN: &str = "__lit__";
const NUM_TOKEN: &str = "__num__";

static STR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:[^"\\]|\\.)*""#).expect("string literal regex"));
static NUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("numeric literal regex"));

// Entire masked expression is literals, arithmetic over literals, or a
// boolean/null literal: nothing reads the input.
static NULLARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:__lit__|__num__|true|false|null|[+\-*/%()]|\s)+$").expect("nullary regex")
});

// `range` generates without consuming input; with literal-only arguments the
// whole call is input-free.
static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^range\(\s*__num__\s*(?:;\s*__num__\s*){0,2}\)$").expect("range regex")
});

/// Function identifiers that consume the full input stream regardless of
/// surrounding syntax. Presence triggers the root re-scan below; the roots
/// themselves decide the final class.
const STREAM_FUNCTIONS: &[&str] = &[
    "map",
    "map_values",
    "select",
    "sort",
    "sort_by",
    "unique",
    "unique_by",
    "group_by",
    "reduce",
    "foreach",
    "paths",
    "leaf_paths",
    "keys",
    "keys_unsorted",
    "values",
    "to_entries",
    "from_entries",
    "with_entries",
    "del",
    "walk",
    "limit",
    "first",
    "last",
    "nth",
    "recurse",
    "while",
    "until",
    "repeat",
    "bsearch",
    "combinations",
    "permutations",
    "flatten",
    "add",
    "any",
    "all",
    "min",
    "max",
    "min_by",
    "max_by",
    "reverse",
    "length",
    "tostream",
    "getpath",
];

/// Classify `expr` by how much input it needs.
///
/// `bound_name` is the identifier bound to "the current single item" during a
/// per-item iteration; without it, `Single` is unreachable.
#[tracing::instrument(level = "trace")]
pub fn classify(expr: &str, bound_name: Option<&str>) -> EvaluationClass {
    // Mask literals first so separators inside them are invisible to root and
    // function detection.
    let masked = STR_RE.replace_all(expr, STR_TOKEN);
    let masked = NUM_RE.replace_all(&masked, NUM_TOKEN);
    let masked = masked.trim();

    if masked.is_empty() || NULLARY_RE.is_match(masked) || RANGE_RE.is_match(masked) {
        return EvaluationClass::None;
    }

    let scan = scan_masked(masked);

    let all_roots_bound = match bound_name {
        Some(bound) => {
            !scan.roots.is_empty()
                && !scan.bare_dot
                && scan.roots.iter().all(|root| root == bound)
        }
        None => false,
    };

    if scan.has_stream_function {
        // A call like `map(.item.field)` stays Single: the function name alone
        // does not force All when every access root is the bound name.
        return if all_roots_bound {
            EvaluationClass::Single
        } else {
            EvaluationClass::All
        };
    }

    if scan.roots.is_empty() && !scan.bare_dot {
        // Not nullary-safe and no explicit root: the expression consumes the
        // input implicitly.
        return EvaluationClass::All;
    }

    if all_roots_bound {
        EvaluationClass::Single
    } else {
        EvaluationClass::All
    }
}

struct MaskedScan {
    /// Top-level data-access roots (first path segment after a leading `.`).
    roots: Vec<String>,
    /// A bare `.` (or `..`) root referencing the whole input.
    bare_dot: bool,
    has_stream_function: bool,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn scan_masked(masked: &str) -> MaskedScan {
    let bytes: Vec<char> = masked.chars().collect();
    let mut roots = Vec::new();
    let mut bare_dot = false;
    let mut has_stream_function = false;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];

        if c == '.' {
            // A root is a leading path token: its `.` must not continue a
            // prior path segment, index, or call result.
            let prev = if i == 0 { None } else { Some(bytes[i - 1]) };
            let continues_path =
                matches!(prev, Some(p) if is_ident_char(p) || p == ']' || p == ')' || p == '.');
            if !continues_path {
                let mut j = i + 1;
                while j < bytes.len() && is_ident_char(bytes[j]) {
                    j += 1;
                }
                let name: String = bytes[i + 1..j].iter().collect();
                if name.is_empty() {
                    bare_dot = true;
                } else {
                    roots.push(name);
                }
                i = j;
                continue;
            }
            i += 1;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            let mut j = i + 1;
            while j < bytes.len() && is_ident_char(bytes[j]) {
                j += 1;
            }
            // Identifier-boundary aware: `.map` is a field access, not the
            // `map` builtin.
            let prev = if start == 0 { None } else { Some(bytes[start - 1]) };
            let is_field_access = matches!(prev, Some('.'));
            if !is_field_access {
                let ident: String = bytes[start..j].iter().collect();
                if STREAM_FUNCTIONS.contains(&ident.as_str()) {
                    has_stream_function = true;
                }
            }
            i = j;
            continue;
        }

        i += 1;
    }

    MaskedScan {
        roots,
        bare_dot,
        has_stream_function,
    }
}
