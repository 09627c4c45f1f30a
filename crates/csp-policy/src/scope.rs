// scope.rs — Scope containment and execution-time re-checks.
//
// A scope is one of three shapes:
//
// - an absolute path (`/data/project-x`),
// - a URI (`fs://workspace/src`, `db://prod/users`), whose remainder is
//   treated as a path within that scheme,
// - an opaque name (`analytics`), which only contains itself.
//
// Path containment is a boundary check on lexically normalized paths:
// `inner` is inside `outer` iff they are equal, or `inner` starts with
// `outer` followed by a separator. `/tmp/scratchy` is NOT inside
// `/tmp/scratch`. Relative paths never contain and are never contained.
//
// Lexical normalization cannot see symlinks, so the enforcer additionally
// applies a `SymlinkPolicy` to path scopes that exist on disk.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::plan::PlanStep;
use crate::risk::{RiskLevel, ToolAction};

/// How symlinks on the local filesystem are treated before the boundary check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkPolicy {
    /// Pure lexical check. Only safe when scopes never name local paths.
    Lexical,
    /// Reject any action scope with an existing symlink among its ancestors.
    #[default]
    Refuse,
    /// Canonicalize the longest existing prefix of both scopes, then compare.
    Resolve,
}

#[derive(Debug, PartialEq, Eq)]
enum Scope<'a> {
    Path(String),
    Uri { scheme: String, path: String },
    Relative,
    Opaque(&'a str),
}

fn parse_scope(raw: &str) -> Scope<'_> {
    if let Some((scheme, rest)) = raw.split_once("://") {
        let valid_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if valid_scheme {
            return Scope::Uri {
                scheme: scheme.to_ascii_lowercase(),
                path: normalize_path(&format!("/{}", rest)),
            };
        }
    }
    if raw.starts_with('/') {
        return Scope::Path(normalize_path(raw));
    }
    if raw.contains('/') || raw.starts_with('.') || raw.starts_with('~') || raw.is_empty() {
        return Scope::Relative;
    }
    Scope::Opaque(raw)
}

/// Lexically normalize an absolute path: collapse repeated separators, drop
/// `.` segments, and resolve `..` against the preceding segment (`..` at the
/// root stays at the root).
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

fn path_within(outer: &str, inner: &str) -> bool {
    if outer == "/" {
        return true;
    }
    inner == outer
        || inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Whether `inner` lies within `outer`, lexically.
pub fn scope_contains(outer: &str, inner: &str) -> bool {
    match (parse_scope(outer), parse_scope(inner)) {
        (Scope::Path(o), Scope::Path(i)) => path_within(&o, &i),
        (
            Scope::Uri {
                scheme: os,
                path: op,
            },
            Scope::Uri {
                scheme: is,
                path: ip,
            },
        ) => os == is && path_within(&op, &ip),
        (Scope::Opaque(o), Scope::Opaque(i)) => o == i,
        _ => false,
    }
}

/// Which execution-time check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeCheck {
    Tool,
    Scope,
    Risk,
}

impl fmt::Display for ScopeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopeCheck::Tool => "tool",
            ScopeCheck::Scope => "scope",
            ScopeCheck::Risk => "risk",
        })
    }
}

/// An action stepped outside what was authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeViolation {
    pub check: ScopeCheck,
    pub detail: String,
}

impl fmt::Display for ScopeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} check failed: {}", self.check, self.detail)
    }
}

/// Re-checks an actual action against what was authorized.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeEnforcer {
    symlinks: SymlinkPolicy,
}

impl ScopeEnforcer {
    pub fn new(symlinks: SymlinkPolicy) -> Self {
        Self { symlinks }
    }

    pub fn symlink_policy(&self) -> SymlinkPolicy {
        self.symlinks
    }

    /// All three checks for executing `step` as `action` classified at `risk`.
    pub fn check(
        &self,
        step: &PlanStep,
        action: &ToolAction,
        risk: RiskLevel,
    ) -> Result<(), ScopeViolation> {
        if action.tool != step.tool {
            return Err(ScopeViolation {
                check: ScopeCheck::Tool,
                detail: format!(
                    "action tool '{}' is not the authorized tool '{}'",
                    action.tool, step.tool
                ),
            });
        }
        self.contains(&step.scope, &action.target_scope)?;
        if risk > step.risk {
            return Err(ScopeViolation {
                check: ScopeCheck::Risk,
                detail: format!(
                    "action risk {} exceeds the authorized ceiling {}",
                    risk, step.risk
                ),
            });
        }
        Ok(())
    }

    /// Scope containment with the configured symlink policy.
    pub fn contains(&self, outer: &str, inner: &str) -> Result<(), ScopeViolation> {
        let violation = |detail: String| ScopeViolation {
            check: ScopeCheck::Scope,
            detail,
        };

        let (outer_path, inner_path) = match (parse_scope(outer), parse_scope(inner)) {
            (Scope::Path(o), Scope::Path(i)) => (o, i),
            _ => {
                return if scope_contains(outer, inner) {
                    Ok(())
                } else {
                    Err(violation(format!(
                        "'{}' is not within the authorized scope '{}'",
                        inner, outer
                    )))
                };
            }
        };

        // The filesystem policies walk the path as written. Collapsing `..`
        // first would hide a symlink that `link/..` resolves through.
        let (outer_path, inner_path) = match self.symlinks {
            SymlinkPolicy::Lexical => (outer_path, inner_path),
            SymlinkPolicy::Refuse => {
                if let Some(link) = first_symlink(Path::new(inner)) {
                    return Err(violation(format!(
                        "'{}' passes through symlink '{}'",
                        inner,
                        link.display()
                    )));
                }
                (outer_path, inner_path)
            }
            SymlinkPolicy::Resolve => (resolve_existing(outer), resolve_existing(inner)),
        };

        if path_within(&outer_path, &inner_path) {
            Ok(())
        } else {
            Err(violation(format!(
                "'{}' is not within the authorized scope '{}'",
                inner, outer
            )))
        }
    }
}

/// The first existing ancestor of `path` (inclusive) that is a symlink.
fn first_symlink(path: &Path) -> Option<PathBuf> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if matches!(component, Component::RootDir) {
            continue;
        }
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Some(current),
            Ok(_) => {}
            // Nothing below a missing component can be a symlink yet.
            Err(_) => return None,
        }
    }
    None
}

/// Canonicalize the longest existing prefix of `path`, taken component by
/// component as written, then append and normalize whatever is left.
fn resolve_existing(path: &str) -> String {
    let components: Vec<Component<'_>> = Path::new(path).components().collect();
    for split in (1..=components.len()).rev() {
        let prefix: PathBuf = components[..split].iter().collect();
        if let Ok(mut resolved) = prefix.canonicalize() {
            resolved.extend(&components[split..]);
            return normalize_path(&resolved.to_string_lossy());
        }
    }
    normalize_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(scope: &str) -> PlanStep {
        PlanStep::new("shell", scope, RiskLevel::High)
    }

    #[test]
    fn sibling_prefix_is_not_contained() {
        assert!(scope_contains("/tmp/scratch", "/tmp/scratch"));
        assert!(scope_contains("/tmp/scratch", "/tmp/scratch/sub"));
        assert!(scope_contains("/tmp/scratch/", "/tmp/scratch/sub/file.txt"));
        assert!(!scope_contains("/tmp/scratch", "/tmp/scratchy"));
        assert!(!scope_contains("/data/project-x", "/data/project-x-backup"));
    }

    #[test]
    fn dot_dot_escapes_are_normalized_first() {
        assert_eq!(normalize_path("/tmp/scratch/../../etc"), "/etc");
        assert!(!scope_contains("/tmp/scratch", "/tmp/scratch/../../etc"));
        assert!(scope_contains("/tmp/scratch", "/tmp/scratch/a/../b"));
        assert_eq!(normalize_path("/../etc//passwd/."), "/etc/passwd");
    }

    #[test]
    fn relative_paths_fail_closed() {
        assert!(!scope_contains("/tmp", "tmp/file"));
        assert!(!scope_contains("./work", "./work/file"));
        assert!(!scope_contains("/", "~/secrets"));
    }

    #[test]
    fn uri_scopes_require_same_scheme() {
        assert!(scope_contains("fs://workspace", "fs://workspace/src/main.rs"));
        assert!(!scope_contains("fs://workspace", "fs://workspace-old/a"));
        assert!(!scope_contains("fs://workspace", "db://workspace/a"));
        assert!(!scope_contains("fs://workspace", "fs://workspace/../etc"));
    }

    #[test]
    fn opaque_scopes_require_equality() {
        assert!(scope_contains("analytics", "analytics"));
        assert!(!scope_contains("analytics", "analytics_prod"));
        assert!(!scope_contains("/data", "analytics"));
    }

    #[test]
    fn enforcer_reports_which_check_failed() {
        let enforcer = ScopeEnforcer::new(SymlinkPolicy::Lexical);
        let planned = step("/data/project-x");

        let ok = ToolAction::new("shell", "/data/project-x/build");
        assert!(enforcer.check(&planned, &ok, RiskLevel::High).is_ok());

        let wrong_tool = ToolAction::new("bash", "/data/project-x");
        assert_eq!(
            enforcer.check(&planned, &wrong_tool, RiskLevel::High).unwrap_err().check,
            ScopeCheck::Tool
        );

        let sibling = ToolAction::new("shell", "/data/project-x-backup");
        assert_eq!(
            enforcer.check(&planned, &sibling, RiskLevel::High).unwrap_err().check,
            ScopeCheck::Scope
        );

        assert_eq!(
            enforcer.check(&planned, &ok, RiskLevel::Critical).unwrap_err().check,
            ScopeCheck::Risk
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_scopes_are_refused_or_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let allowed = root.join("allowed");
        let outside = root.join("outside");
        std::fs::create_dir_all(&allowed).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, allowed.join("escape")).unwrap();

        let outer = allowed.to_string_lossy().into_owned();
        let through_link = allowed.join("escape/secret").to_string_lossy().into_owned();
        let plain = allowed.join("file.txt").to_string_lossy().into_owned();

        // Lexically the link target looks contained.
        assert!(ScopeEnforcer::new(SymlinkPolicy::Lexical)
            .contains(&outer, &through_link)
            .is_ok());

        let refuse = ScopeEnforcer::new(SymlinkPolicy::Refuse);
        assert!(refuse.contains(&outer, &through_link).is_err());
        assert!(refuse.contains(&outer, &plain).is_ok());

        let resolve = ScopeEnforcer::new(SymlinkPolicy::Resolve);
        assert!(resolve.contains(&outer, &through_link).is_err());
        assert!(resolve.contains(&outer, &plain).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn parent_of_a_symlink_is_the_target_parent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let allowed = root.join("allowed");
        let deep = root.join("outside").join("deep");
        std::fs::create_dir_all(&allowed).unwrap();
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(root.join("outside").join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(&deep, allowed.join("link")).unwrap();

        let outer = allowed.to_string_lossy().into_owned();
        let sneaky = format!("{}/link/../secret", outer);

        // Lexically this collapses to `allowed/secret`.
        assert!(scope_contains(&outer, &sneaky));

        let refuse = ScopeEnforcer::new(SymlinkPolicy::Refuse);
        let err = refuse.contains(&outer, &sneaky).unwrap_err();
        assert_eq!(err.check, ScopeCheck::Scope);
        assert!(err.detail.contains("symlink"));

        let resolve = ScopeEnforcer::new(SymlinkPolicy::Resolve);
        assert!(resolve.contains(&outer, &sneaky).is_err());
        assert_eq!(
            resolve_existing(&sneaky),
            root.join("outside").join("secret").to_string_lossy()
        );

        // `..` that stays inside real directories is still fine.
        std::fs::create_dir_all(allowed.join("sub")).unwrap();
        let benign = format!("{}/sub/../file.txt", outer);
        assert!(refuse.contains(&outer, &benign).is_ok());
        assert!(resolve.contains(&outer, &benign).is_ok());
    }
}
