//! Request route matching
//!
//! Five path shapes, evaluated in fixed priority order, first match wins.
//! Anything else is proxied to the upstream verbatim. Shapes 1 and 2 cannot
//! both match one path: shape 2 requires a leading dotted numeric triple and
//! shape 1 requires the literal `latest` segment.

use mirror_core::package::starts_with_version_triple;

/// Operation selected for an inbound request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/<name>/latest`
    LatestMeta { name: String },
    /// `/<name>/<version>` with a leading dotted numeric triple
    VersionMeta { name: String, version: String },
    /// `/<name>/-/<name>-<version>.tgz`
    Tarball { name: String, version: String },
    /// bare `/<name>`
    Meta { name: String },
    /// everything else, including the `/-/all/` package index
    PassThrough,
}

/// Match a request path against the recognized shapes.
pub fn match_route(path: &str) -> Route {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    // /<name>/latest
    if let [name, "latest"] = segments.as_slice()
        && is_name_segment(name)
    {
        return Route::LatestMeta {
            name: (*name).to_string(),
        };
    }

    // /<name>/<semver>
    if segments.len() >= 2
        && is_name_segment(segments[0])
        && starts_with_version_triple(segments[1])
    {
        return Route::VersionMeta {
            name: segments[0].to_string(),
            version: segments[1].to_string(),
        };
    }

    // the registry's "list all packages" index
    if path.contains("/-/all/") {
        return Route::PassThrough;
    }

    // /<name>/-/<name>-<version>.tgz
    if let Some((head, file)) = path.split_once("/-/")
        && let Some(name) = head.strip_prefix('/')
        && is_name_segment(name)
        && let Some(stem) = file.strip_suffix(".tgz")
    {
        let version = stem
            .strip_prefix(&format!("{name}-"))
            .unwrap_or(stem)
            .to_string();
        return Route::Tarball {
            name: name.to_string(),
            version,
        };
    }

    // /<name>
    if let [name] = segments.as_slice()
        && is_name_segment(name)
    {
        return Route::Meta {
            name: (*name).to_string(),
        };
    }

    Route::PassThrough
}

fn is_name_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
