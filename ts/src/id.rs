use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in Unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate an id of the form `<prefix>-<slug>-<short-uuid>`, where `slug` is a
/// lowercased, hyphenated prefix of `seed`. Collisions are astronomically
/// unlikely (uuid v7 suffix) and irrelevant for correctness: `Store::create`
/// always treats a duplicate id as a conflict rather than silently merging.
pub fn generate_id(prefix: &str, seed: &str) -> String {
    let slug: String = seed
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(4)
        .collect::<Vec<_>>()
        .join("-");

    let suffix = uuid::Uuid::now_v7().to_string();
    let short = &suffix[..8];

    if slug.is_empty() {
        format!("{prefix}-{short}")
    } else {
        format!("{prefix}-{slug}-{short}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_id_contains_prefix_and_slug() {
        let id = generate_id("task", "Add a helper function");
        assert!(id.starts_with("task-add-a-helper"));
    }

    #[test]
    fn generate_id_handles_empty_seed() {
        let id = generate_id("task", "");
        assert!(id.starts_with("task-"));
    }

    #[test]
    fn now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
