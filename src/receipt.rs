use std::cmp::Ordering;
use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::process;

/// Compare dotted versions component by component. Numeric components compare
/// numerically, the shorter version is padded with `0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.trim().split('.').collect();
    let right: Vec<&str> = b.trim().split('.').collect();
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or("0");
        let r = right.get(i).copied().unwrap_or("0");
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Pull the `version:` line out of `pkgutil --pkg-info` output.
pub fn parse_pkg_info(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "version" {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Installed version of `package_id` according to the package receipt
/// database, or `None` when there is no receipt.
pub fn installed_version(pkgutil: &Path, package_id: &str) -> Result<Option<String>> {
    let out = process::run(pkgutil, ["--pkg-info", package_id], true)?;
    if !out.success() {
        debug!(package_id, code = out.exit_code, "no receipt found");
        return Ok(None);
    }
    Ok(parse_pkg_info(&out.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_numeric_components() {
        assert_eq!(compare_versions("2.0", "1.5"), Ordering::Greater);
        assert_eq!(compare_versions("1.9", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("2", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.1", "1.0"), Ordering::Greater);
    }

    #[test]
    fn non_numeric_components_fall_back_to_text() {
        assert_eq!(compare_versions("1.0b", "1.0a"), Ordering::Greater);
        assert_eq!(compare_versions("1.b", "1.b"), Ordering::Equal);
    }

    #[test]
    fn parses_pkg_info_version_line() {
        let out = "package-id: com.x.a\nversion: 2.0.1\nvolume: /\nlocation: /\ninstall-time: 1700000000\n";
        assert_eq!(parse_pkg_info(out).as_deref(), Some("2.0.1"));
        assert_eq!(parse_pkg_info("package-id: com.x.a\n"), None);
        assert_eq!(parse_pkg_info("version:\n"), None);
    }
}
