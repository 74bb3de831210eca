#![forbid(unsafe_code)]

use std::fmt::Write as _;

use regex::Regex;
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

pub const MAX_WORKSPACE_NAME_LEN: usize = 50;
pub const MAX_NAME_SUFFIX: u32 = 100;

/// Reduce arbitrary input to `[a-z0-9-]`, at most 50 chars, without
/// leading/trailing hyphens. May return an empty string.
#[must_use]
pub fn sanitize_workspace_name(input: &str) -> String {
    let lower = input.trim().to_lowercase();
    let Ok(re) = Regex::new(r"[^a-z0-9]+") else {
        return String::new();
    };
    let replaced = re.replace_all(&lower, "-");
    let trimmed = replaced.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_WORKSPACE_NAME_LEN).collect();
    truncated.trim_end_matches('-').to_owned()
}

/// Derive a workspace name from the first few words of a task description.
#[must_use]
pub fn generate_workspace_name(description: &str) -> String {
    let head: Vec<&str> = description.split_whitespace().take(5).collect();
    let name = sanitize_workspace_name(&head.join(" "));
    if name.is_empty() {
        let id = Uuid::new_v4().simple().to_string();
        let short: String = id.chars().take(6).collect();
        format!("task-{short}")
    } else {
        name
    }
}

/// Expand `{{repo}}`, `{{name}}` and `{{hash}}` in a worktree path template.
#[must_use]
pub fn render_template(template: &str, repo: &str, name: &str) -> String {
    let hash = short_hash(repo, name);
    template
        .replace("{{repo}}", repo)
        .replace("{{name}}", name)
        .replace("{{hash}}", &hash)
}

/// Append `-2`, `-3`, ... to `base` until `taken` reports it free.
/// `Ok(None)` once every suffix up to `MAX_NAME_SUFFIX` is taken.
pub fn first_free<F, E>(base: &str, mut taken: F) -> Result<Option<String>, E>
where
    F: FnMut(&str) -> Result<bool, E>,
{
    if !taken(base)? {
        return Ok(Some(base.to_owned()));
    }
    for n in 2..=MAX_NAME_SUFFIX {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate)? {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn short_hash(repo: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.as_bytes());
    hasher.update(b"/");
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let bytes = &digest[..4];
    let mut s = String::with_capacity(8);
    for b in bytes {
        let _ = write!(&mut s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_workspace_names() {
        assert_eq!(sanitize_workspace_name("Fix Auth Bug!"), "fix-auth-bug");
        assert_eq!(sanitize_workspace_name("--feat/login__page--"), "feat-login-page");
        assert_eq!(sanitize_workspace_name("***"), "");

        let long = "a".repeat(49) + "-bcd";
        let s = sanitize_workspace_name(&long);
        assert!(s.len() <= MAX_WORKSPACE_NAME_LEN);
        assert!(!s.ends_with('-'));
        assert_eq!(s, "a".repeat(49));
    }

    #[test]
    fn generates_names_from_descriptions() {
        assert_eq!(
            generate_workspace_name("Add retry logic to the HTTP client please"),
            "add-retry-logic-to-the"
        );
        assert!(generate_workspace_name("!!!").starts_with("task-"));
    }

    #[test]
    fn renders_templates() {
        let rendered = render_template("{{repo}}-{{name}}-{{hash}}", "api", "fix");
        assert!(rendered.starts_with("api-fix-"));
        assert_eq!(rendered.rsplit('-').next().unwrap().len(), 8);
    }

    #[test]
    fn finds_first_free_suffix() {
        let taken = ["x", "x-2"];
        let found = first_free("x", |c| Ok::<_, ()>(taken.contains(&c)));
        assert_eq!(found, Ok(Some("x-3".to_owned())));
        let found = first_free("y", |c| Ok::<_, ()>(taken.contains(&c)));
        assert_eq!(found, Ok(Some("y".to_owned())));
    }

    #[test]
    fn suffix_search_stops() {
        let mut calls = 0;
        let found = first_free("x", |_| {
            calls += 1;
            Ok::<_, ()>(true)
        });
        assert_eq!(found, Ok(None));
        assert_eq!(calls, MAX_NAME_SUFFIX);

        let mut calls = 0;
        let found = first_free("x", |_| {
            calls += 1;
            Err::<bool, _>("git missing")
        });
        assert_eq!(found, Err("git missing"));
        assert_eq!(calls, 1);
    }
}
