fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn anchor_paths(paths: Vec<PathBuf>, cwd: Option<&Path>) -> Vec<PathBuf> {
    paths
        .into_iter()
        .map(|path| match cwd {
            Some(cwd) if path.is_relative() => cwd.join(path),
            _ => path,
        })
        .collect()
}

fn read_string_var<F>(var: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_var<F>(var: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    read_string_var(var, name)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_var<F>(var: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    read_string_var(var, name)
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// RFC 3339 rendering of a unix timestamp for status output.
pub fn format_unix_time(secs: i64) -> Option<String> {
    time::OffsetDateTime::from_unix_timestamp(secs)
        .ok()?
        .format(&time::format_description::well_known::Rfc3339)
        .ok()
}
