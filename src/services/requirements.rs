//! Requirements file detection and line parsing.

use std::sync::OnceLock;

use regex::Regex;

static REQUIREMENT_LINE: OnceLock<Option<Regex>> = OnceLock::new();

fn requirement_line() -> Option<&'static Regex> {
    REQUIREMENT_LINE
        .get_or_init(|| {
            Regex::new(r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[[^\]]*\])?\s*(.*)$")
                .ok()
        })
        .as_ref()
}

/// Whether a repository path looks like a pip requirements file.
///
/// Matches `requirements*.txt`, `requirements*.in`, `constraints*.txt` and
/// any `.txt` file inside a `requirements/` directory.
pub fn is_requirements_path(path: &str) -> bool {
    let lowered = path.to_lowercase();
    let mut segments = lowered.rsplit('/');
    let file_name = segments.next().unwrap_or_default();

    let named = (file_name.starts_with("requirements") || file_name.starts_with("constraints"))
        && (file_name.ends_with(".txt") || file_name.ends_with(".in"));
    let in_dir = file_name.ends_with(".txt") && segments.any(|dir| dir == "requirements");

    named || in_dir
}

/// Normalize a distribution name (lowercase, separator runs become `-`).
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            normalized.extend(c.to_lowercase());
            in_separator = false;
        }
    }
    normalized
}

/// Parse one requirements line into `(name, version specifier)`.
///
/// Option lines (`-r`, `-e`, `--index-url`), comments and direct URL
/// references yield no version. A bare `==`/`===` pin is dropped so only the
/// version remains.
pub fn parse_line(line: &str) -> Option<(String, Option<String>)> {
    let line = line.split('#').next().unwrap_or_default().trim();
    if line.is_empty() || line.starts_with('-') {
        return None;
    }

    let caps = requirement_line()?.captures(line)?;
    let name = caps.get(1)?.as_str().to_string();
    let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let rest = rest.split(';').next().unwrap_or_default();

    if rest.trim_start().starts_with('@') {
        return Some((name, None));
    }

    let specifier: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
    if specifier.is_empty() {
        return Some((name, None));
    }
    if !specifier.starts_with(['=', '<', '>', '~', '!']) {
        // Not a specifier: prose that happens to start with a word.
        return None;
    }

    let version = specifier
        .strip_prefix("===")
        .or_else(|| specifier.strip_prefix("=="))
        .unwrap_or(&specifier)
        .to_string();
    Some((name, (!version.is_empty()).then_some(version)))
}

/// Scan text-match fragments for a line naming `package`.
///
/// Returns `None` if no line names the package, otherwise the version of the
/// first line that does.
pub fn find_requirement<S: AsRef<str>>(fragments: &[S], package: &str) -> Option<Option<String>> {
    let wanted = normalize_name(package);
    fragments
        .iter()
        .flat_map(|fragment| fragment.as_ref().lines())
        .filter_map(parse_line)
        .find(|(name, _)| normalize_name(name) == wanted)
        .map(|(_, version)| version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirements_paths() {
        assert!(is_requirements_path("requirements.txt"));
        assert!(is_requirements_path("app/requirements-dev.txt"));
        assert!(is_requirements_path("requirements.in"));
        assert!(is_requirements_path("Constraints.txt"));
        assert!(is_requirements_path("requirements/base.txt"));
        assert!(!is_requirements_path("src/numpy_utils.py"));
        assert!(!is_requirements_path("docs/requirements.md"));
        assert!(!is_requirements_path("notes.txt"));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Django_REST.framework"), "django-rest-framework");
        assert_eq!(normalize_name("zope..interface"), "zope-interface");
    }

    #[test]
    fn test_parse_line_versions() {
        assert_eq!(parse_line("numpy==1.21"), Some(("numpy".into(), Some("1.21".into()))));
        assert_eq!(parse_line("numpy === 1.21.0"), Some(("numpy".into(), Some("1.21.0".into()))));
        assert_eq!(
            parse_line("requests[socks] >= 2.0, < 3 ; python_version > '3.6'"),
            Some(("requests".into(), Some(">=2.0,<3".into())))
        );
        assert_eq!(parse_line("flask"), Some(("flask".into(), None)));
        assert_eq!(parse_line("flask  # web"), Some(("flask".into(), None)));
    }

    #[test]
    fn test_parse_line_skips_options_and_prose() {
        assert_eq!(parse_line("-r base.txt"), None);
        assert_eq!(parse_line("--index-url https://pypi.org/simple"), None);
        assert_eq!(parse_line("# numpy==1.0"), None);
        assert_eq!(parse_line("uses numpy heavily"), None);
        assert_eq!(
            parse_line("pkg @ https://example.com/pkg.whl"),
            Some(("pkg".into(), None))
        );
    }

    #[test]
    fn test_find_requirement_exact_name() {
        let fragments = ["numpy-financial==1.0\nnumpy>=1.20\n", "numpy==1.19"];
        assert_eq!(find_requirement(&fragments, "numpy"), Some(Some(">=1.20".into())));
        assert_eq!(find_requirement(&fragments, "NumPy"), Some(Some(">=1.20".into())));
        assert_eq!(find_requirement(&fragments, "numpy_financial"), Some(Some("1.0".into())));
        assert_eq!(find_requirement(&fragments, "pandas"), None);
    }

    #[test]
    fn test_find_requirement_without_version() {
        assert_eq!(find_requirement(&["requests\n"], "requests"), Some(None));
    }
}
