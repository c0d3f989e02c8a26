//! Source template expansion (§3 Source Template): a path, optionally
//! containing the literal token `<int>`, that expands to an ordered series
//! of files.

use std::path::{Path, PathBuf};

pub const INT_TOKEN: &str = "<int>";

/// Expand `template` into the ordered list of files it names.
///
/// If `template` contains [`INT_TOKEN`], every matching file is found via a
/// glob over the token's position and ordered by the integer value found
/// there (not lexicographically over the filename — a series `file_2.csv`,
/// `file_10.csv` orders 2 before 10). Otherwise the template names exactly
/// one file.
pub fn expand(template: &str) -> anyhow::Result<Vec<PathBuf>> {
    let Some(token_pos) = template.find(INT_TOKEN) else {
        return Ok(vec![PathBuf::from(template)]);
    };

    let prefix = &template[..token_pos];
    let suffix = &template[token_pos + INT_TOKEN.len()..];
    let pattern = format!("{prefix}*{suffix}");

    let mut numbered: Vec<(i64, PathBuf)> = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = entry?;
        if let Some(n) = extract_int(&path, prefix, suffix) {
            numbered.push((n, path));
        }
    }
    numbered.sort_by_key(|(n, _)| *n);
    Ok(numbered.into_iter().map(|(_, p)| p).collect())
}

fn extract_int(path: &Path, prefix: &str, suffix: &str) -> Option<i64> {
    let path_str = path.to_str()?;
    let prefix_name = Path::new(prefix).file_name().map(|f| f.to_string_lossy().to_string());
    // Compare against the file name portion only, so directory components in
    // `prefix` don't have to be re-matched char-by-char against `path_str`.
    let file_name = path.file_name()?.to_str()?;
    let prefix_tail = prefix_name.as_deref().unwrap_or("");
    let suffix_name = Path::new(suffix).to_str().unwrap_or(suffix);
    if !file_name.starts_with(prefix_tail) || !file_name.ends_with(suffix_name) {
        // fall back to matching against the full path string
        let start = path_str.find(prefix)?;
        let after_prefix = &path_str[start + prefix.len()..];
        let end = after_prefix.rfind(suffix)?;
        return after_prefix[..end].parse().ok();
    }
    let middle = &file_name[prefix_tail.len()..file_name.len() - suffix_name.len()];
    middle.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn single_file_without_token() {
        let files = expand("data/table.csv").unwrap();
        assert_eq!(files, vec![PathBuf::from("data/table.csv")]);
    }

    #[test]
    fn numbered_series_orders_by_integer_value() {
        let dir = tempfile::tempdir().unwrap();
        for n in [2, 10, 1] {
            fs::write(dir.path().join(format!("table_{n}.csv")), "").unwrap();
        }
        let template = dir.path().join("table_<int>.csv");
        let files = expand(template.to_str().unwrap()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["table_1.csv", "table_2.csv", "table_10.csv"]);
    }
}
