use acl_core::MatchMode;

/// Strips doubled backslashes left over from legacy escaping of class names.
///
/// Preserved for compatibility with databases migrated from the legacy
/// system; new deployments are expected to store single-backslash class
/// names already, making this a no-op for them.
pub fn normalize_class_type(class_type: &str) -> String {
    class_type.replace("\\\\", "\\")
}

pub fn match_mode_to_db(match_mode: MatchMode) -> &'static str {
    match match_mode {
        MatchMode::Equal => "equal",
        MatchMode::All => "all",
        MatchMode::Any => "any",
    }
}

pub fn match_mode_from_db(value: &str) -> anyhow::Result<MatchMode> {
    match value {
        "equal" => Ok(MatchMode::Equal),
        "all" => Ok(MatchMode::All),
        "any" => Ok(MatchMode::Any),
        other => anyhow::bail!("unknown granting_strategy value: {other}"),
    }
}

/// Generates SQL parameter placeholders for `IN (...)` clauses: `"?,?,?"` for n=3.
pub fn repeat_qm(n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let mut result = String::with_capacity(n * 2 - 1);
    result.push('?');
    for _ in 1..n {
        result.push(',');
        result.push('?');
    }
    result
}
