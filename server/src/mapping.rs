//! # Mapping Resolver
//!
//! Picks the local target for a path from an agent's routing table. The
//! longest prefix that matches on a segment boundary wins; the matched
//! prefix is consumed from the path. With no match the default target is
//! used and the path passes through unchanged.

use crate::protocol::MappingEntry;

/// The outcome of resolving a path against a routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Base URL of the local service to call.
    pub target: String,

    /// Path to request on that service, always rooted at `/`.
    pub path: String,

    /// The table prefix that matched, if any.
    pub prefix: Option<String>,
}

/// Resolve `path` against `mappings`, falling back to `default_target`.
///
/// `api/v1/x` against prefix `api` becomes `/v1/x`; `api` alone becomes
/// `/`. Prefixes are unique within a table, so a length tie is impossible.
pub fn resolve(path: &str, mappings: &[MappingEntry], default_target: &str) -> Resolved {
    let stripped = path.strip_prefix('/').unwrap_or(path);

    let best = mappings
        .iter()
        .filter(|m| {
            !m.prefix.is_empty()
                && (stripped == m.prefix
                    || stripped
                        .strip_prefix(m.prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/')))
        })
        .max_by_key(|m| m.prefix.len());

    match best {
        Some(m) => {
            let rest = &stripped[m.prefix.len()..];
            let rewritten = if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            };
            Resolved {
                target: m.target.clone(),
                path: rewritten,
                prefix: Some(m.prefix.clone()),
            }
        }
        None => Resolved {
            target: default_target.to_string(),
            path: path.to_string(),
            prefix: None,
        },
    }
}
