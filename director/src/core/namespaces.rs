use common::path_utils::{normalize_object_path, path_components};
use common::schemas::{NamespaceAd, ServerAd};

/// Deepest consecutive match of `object_path` against configured mount
/// prefix components, where `""` denotes the root and `"*"` a wildcard
/// component. Returns the matched prefix rendered from the object path, or
/// `/` when nothing beyond the root matches.
pub fn compute_prefix(object_path: &str, mount: &[&str]) -> String {
    let components = path_components(object_path);

    let mut depth = 0usize;
    for (i, want) in mount.iter().enumerate() {
        if i >= components.len() {
            break;
        }
        if *want == "*" || *want == components[i] {
            depth = i + 1;
        } else {
            break;
        }
    }

    if depth <= 1 {
        "/".to_string()
    } else {
        format!("/{}", components[1..depth].join("/"))
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedNamespace {
    pub namespace: NamespaceAd,
    pub owner: String,
    /// The concrete prefix the object path matched, with wildcards expanded.
    pub prefix: String,
    pub depth: usize,
}

/// True when the namespace's path fully covers the object path as a
/// path-component prefix.
pub fn namespace_covers(namespace_path: &str, object_path: &str) -> Option<(String, usize)> {
    let ns_path = normalize_object_path(namespace_path).ok()?;
    let mount = path_components(&ns_path);
    let prefix = compute_prefix(object_path, &mount);
    let matched_depth = path_components(&prefix).len();
    if matched_depth == mount.len() {
        Some((prefix, matched_depth))
    } else {
        None
    }
}

/// Longest path-component prefix across all origin namespaces. Ties break by
/// lexicographic owning-server name so resolution is deterministic.
pub fn resolve(origins: &[ServerAd], object_path: &str) -> Option<ResolvedNamespace> {
    let mut best: Option<ResolvedNamespace> = None;

    for origin in origins {
        for ns in &origin.namespaces {
            let Some((prefix, depth)) = namespace_covers(&ns.path, object_path) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(b) => depth > b.depth || (depth == b.depth && origin.name < b.owner),
            };
            if better {
                best = Some(ResolvedNamespace {
                    namespace: ns.clone(),
                    owner: origin.name.clone(),
                    prefix,
                    depth,
                });
            }
        }
    }

    best
}
