use std::cmp::Ordering;

/// Parse a dotted numeric version. `None` if any component is not a number.
pub fn parse_dotted(version: &str) -> Option<Vec<u64>> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .split('.')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect()
}

/// Compare two dotted versions; missing components count as zero.
pub fn compare_dotted(left: &[u64], right: &[u64]) -> Ordering {
    let len = left.len().max(right.len());
    (0..len)
        .map(|i| {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Whether `installed` satisfies `minimum`.
///
/// Fails open: when either side is not a dotted number the requirement
/// counts as met, matching what the generated detection script does.
pub fn requirement_met(installed: &str, minimum: &str) -> bool {
    match (parse_dotted(installed), parse_dotted(minimum)) {
        (Some(have), Some(want)) => compare_dotted(&have, &want) != Ordering::Less,
        _ => true,
    }
}
