//! Object-store path layout.
//!
//! ```text
//! attractors/global/<safe-name>/v<n>.dot
//! attractors/projects/<projectId>/<safe-name>/v<n>.dot
//! spec-bundles/<projectId>/<runId>/<file>
//! runs/<projectId>/<runId>/<artifactKey>
//! ```

/// Lowercase the name, fold non-alphanumeric runs to `-`, trim the ends.
pub fn safe_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

pub fn global_attractor_path(name: &str, version: u32) -> String {
    format!("attractors/global/{}/v{version}.dot", safe_name(name))
}

pub fn project_attractor_path(project_id: &str, name: &str, version: u32) -> String {
    format!(
        "attractors/projects/{project_id}/{}/v{version}.dot",
        safe_name(name)
    )
}

pub fn spec_bundle_path(project_id: &str, run_id: &str, file: &str) -> String {
    format!("spec-bundles/{project_id}/{run_id}/{file}")
}

pub fn run_artifact_path(project_id: &str, run_id: &str, artifact_key: &str) -> String {
    format!("runs/{project_id}/{run_id}/{artifact_key}")
}

/// Normalize an artifact key: never absolute, never escaping the run prefix.
/// Returns `None` when nothing valid remains.
pub fn normalize_artifact_key(key: &str) -> Option<String> {
    let segments: Vec<&str> = key
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Append `-2`, `-3`, … before the extension until the key is unused.
pub fn dedupe_artifact_key(key: &str, taken: &[String]) -> String {
    if !taken.iter().any(|existing| existing == key) {
        return key.to_string();
    }
    let (stem, extension) = match key.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (key.to_string(), None),
    };
    let mut counter = 2u32;
    loop {
        let candidate = match &extension {
            Some(ext) => format!("{stem}-{counter}.{ext}"),
            None => format!("{stem}-{counter}"),
        };
        if !taken.iter().any(|existing| *existing == candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_folds_and_trims() {
        assert_eq!(safe_name("Self Review (v2)"), "self-review-v2");
        assert_eq!(safe_name("  --weird__name--  "), "weird-name");
        assert_eq!(safe_name("plain"), "plain");
    }

    #[test]
    fn attractor_paths_expected_layout() {
        assert_eq!(
            global_attractor_path("Self Review", 3),
            "attractors/global/self-review/v3.dot"
        );
        assert_eq!(
            project_attractor_path("p-1", "Self Review", 1),
            "attractors/projects/p-1/self-review/v1.dot"
        );
    }

    #[test]
    fn normalize_artifact_key_strips_traversal() {
        assert_eq!(
            normalize_artifact_key("/reviewers/../notes.md"),
            Some("reviewers/notes.md".to_string())
        );
        assert_eq!(normalize_artifact_key("../.."), None);
        assert_eq!(
            normalize_artifact_key("implementation.patch"),
            Some("implementation.patch".to_string())
        );
    }

    #[test]
    fn dedupe_artifact_key_appends_counters() {
        let taken = vec![
            "reviewers/security.md".to_string(),
            "reviewers/security-2.md".to_string(),
        ];
        assert_eq!(
            dedupe_artifact_key("reviewers/security.md", &taken),
            "reviewers/security-3.md"
        );
        assert_eq!(
            dedupe_artifact_key("reviewers/style.md", &taken),
            "reviewers/style.md"
        );
    }
}
