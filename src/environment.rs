use std::collections::HashMap;
use std::path::PathBuf;

#[cfg(windows)]
const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_SEPARATOR: char = ':';

/// Build a child environment from an explicit parent environment.
///
/// Variables starting with any of `strip_prefixes` are dropped, `overrides`
/// are applied on top (and are never stripped), then `path_prepends` are put
/// in front of the search path in the given order.
pub fn derive_child_environment(
    parent: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
    strip_prefixes: &[String],
    path_prepends: &[PathBuf],
) -> HashMap<String, String> {
    let mut child: HashMap<String, String> = parent
        .iter()
        .filter(|(key, _)| !strip_prefixes.iter().any(|p| key.starts_with(p.as_str())))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    child.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    if !path_prepends.is_empty() {
        let key = path_key(&child);
        let mut entries: Vec<String> = path_prepends
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if let Some(existing) = child.get(&key).filter(|v| !v.is_empty()) {
            entries.push(existing.clone());
        }
        child.insert(key, entries.join(&PATH_SEPARATOR.to_string()));
    }

    child
}

/// Snapshot of this process' environment, for use as the parent.
pub fn current_environment() -> HashMap<String, String> {
    std::env::vars_os()
        .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
        .collect()
}

#[cfg(windows)]
fn path_key(env: &HashMap<String, String>) -> String {
    env.keys()
        .find(|k| k.eq_ignore_ascii_case("PATH"))
        .cloned()
        .unwrap_or_else(|| "Path".into())
}

#[cfg(not(windows))]
fn path_key(_env: &HashMap<String, String>) -> String {
    "PATH".into()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn strips_prefixed_variables() {
        let parent = env(&[
            ("VSCODE_IPC_HOOK", "/tmp/sock"),
            ("VSCODE_PID", "42"),
            ("HOME", "/home/user"),
        ]);
        let child =
            derive_child_environment(&parent, &HashMap::new(), &["VSCODE_".into()], &[]);

        assert_eq!(child, env(&[("HOME", "/home/user")]));
    }

    #[test]
    fn overrides_win_and_survive_stripping() {
        let parent = env(&[("EDITOR", "vim"), ("VSCODE_PID", "42")]);
        let overrides = env(&[("EDITOR", "vigil-edit --wait"), ("VSCODE_CWD", "/work")]);
        let child = derive_child_environment(&parent, &overrides, &["VSCODE_".into()], &[]);

        assert_eq!(child["EDITOR"], "vigil-edit --wait");
        assert_eq!(child["VSCODE_CWD"], "/work");
        assert!(!child.contains_key("VSCODE_PID"));
    }

    #[test]
    fn prepends_search_path_in_order() {
        let parent = env(&[("PATH", "/usr/bin:/bin")]);
        let child = derive_child_environment(
            &parent,
            &HashMap::new(),
            &[],
            &["/opt/a".into(), "/opt/b".into()],
        );

        assert_eq!(child["PATH"], "/opt/a:/opt/b:/usr/bin:/bin");
    }

    #[test]
    fn creates_search_path_when_missing() {
        let child =
            derive_child_environment(&HashMap::new(), &HashMap::new(), &[], &["/opt/a".into()]);
        assert_eq!(child["PATH"], "/opt/a");
    }

    #[test]
    fn parent_is_left_untouched() {
        let parent = env(&[("VSCODE_PID", "42")]);
        let _ = derive_child_environment(&parent, &HashMap::new(), &["VSCODE_".into()], &[]);
        assert_eq!(parent["VSCODE_PID"], "42");
    }
}
