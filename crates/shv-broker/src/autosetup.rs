//! Mount point templates for auto-setup rules.
//!
//! A template may contain `%` stand-ins that are expanded when a device
//! logs in:
//!
//! - `%d` device id from the login options
//! - `%r` roles of the user, joined with `-`
//! - `%u` user name
//! - `%i` conflict counter: empty while the result is unique, then `1`, `2`, …
//! - `%I` counter that always appears, starting at `0`
//! - `%%` literal `%`

use std::collections::BTreeSet;

/// Expands `template` into a mount point that does not collide with any of
/// `existing`. Returns `None` when no unique mount point can be generated,
/// which happens when the template has no counter and the result is taken,
/// or when an existing mount point is a prefix of the constant part.
pub fn generate_mount_point(
    template: &str,
    existing: &BTreeSet<String>,
    device_id: &str,
    user: &str,
    roles: &[String],
) -> Option<String> {
    if template.is_empty() {
        return None;
    }
    for counter in 0..=existing.len() as u64 + 1 {
        let (candidate, const_len) = expand(template, device_id, user, roles, counter);

        let mut retry = false;
        for mount in existing {
            if *mount == candidate || candidate.starts_with(&format!("{mount}/")) {
                match const_len {
                    // Without a counter the conflict is permanent; with one,
                    // a conflict inside the constant prefix cannot be
                    // counted away either.
                    None => return None,
                    Some(cl) if mount.len() < cl => return None,
                    Some(_) => retry = true,
                }
            }
        }
        if !retry {
            return Some(candidate);
        }
    }
    None
}

/// One expansion pass; returns the result and the length of the prefix
/// before the first counter stand-in, if there is one.
fn expand(
    template: &str,
    device_id: &str,
    user: &str,
    roles: &[String],
    counter: u64,
) -> (String, Option<usize>) {
    let mut res = String::new();
    let mut const_len = None;
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            res.push(c);
            continue;
        }
        match chars.next() {
            Some('d') => res.push_str(device_id),
            Some('r') => res.push_str(&roles.join("-")),
            Some('u') => res.push_str(user),
            Some('i') => {
                const_len.get_or_insert(res.len());
                if counter > 0 {
                    res.push_str(&counter.to_string());
                }
            }
            Some('I') => {
                const_len.get_or_insert(res.len());
                res.push_str(&counter.to_string());
            }
            Some('%') => res.push('%'),
            Some(other) => {
                res.push('%');
                res.push(other);
            }
            None => res.push('%'),
        }
    }
    (res, const_len)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn mounts(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn roles(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_substitutions() {
        let (res, _) = expand("test/%d-%u-%r", "dev7", "alice", &roles(&["a", "b"]), 0);
        assert_eq!(res, "test/dev7-alice-a-b");
    }

    #[test]
    fn test_percent_escape_and_unknown_standin() {
        let (res, _) = expand("a%%b%x", "d", "u", &[], 0);
        assert_eq!(res, "a%b%x");
    }

    #[test]
    fn test_unique_without_counter() {
        let got =
            generate_mount_point("test/%d", &mounts(&["test/other"]), "dev", "u", &[]);
        assert_eq!(got.as_deref(), Some("test/dev"));
    }

    #[test]
    fn test_conflict_without_counter_fails() {
        let got = generate_mount_point("test/%d", &mounts(&["test/dev"]), "dev", "u", &[]);
        assert_eq!(got, None);
    }

    #[test]
    fn test_conflict_counter_expands_to_empty_when_unique() {
        let got = generate_mount_point("test/%d%i", &mounts(&[]), "dev", "u", &[]);
        assert_eq!(got.as_deref(), Some("test/dev"));
    }

    #[test]
    fn test_conflict_counter_counts_from_one() {
        let got = generate_mount_point("test/%d%i", &mounts(&["test/dev"]), "dev", "u", &[]);
        assert_eq!(got.as_deref(), Some("test/dev1"));
        let got = generate_mount_point(
            "test/%d%i",
            &mounts(&["test/dev", "test/dev1", "test/dev2"]),
            "dev",
            "u",
            &[],
        );
        assert_eq!(got.as_deref(), Some("test/dev3"));
    }

    #[test]
    fn test_always_numeric_counter_starts_at_zero() {
        let got = generate_mount_point("test/%I", &mounts(&[]), "d", "u", &[]);
        assert_eq!(got.as_deref(), Some("test/0"));
        let got = generate_mount_point("test/%I", &mounts(&["test/0"]), "d", "u", &[]);
        assert_eq!(got.as_deref(), Some("test/1"));
    }

    #[test]
    fn test_existing_prefix_of_constant_part_blocks_generation() {
        // "test" is mounted, so anything under test/… is shadowed and a
        // counter further right cannot fix it.
        let got = generate_mount_point("test/%d%i", &mounts(&["test"]), "dev", "u", &[]);
        assert_eq!(got, None);
    }

    #[test]
    fn test_empty_template_generates_nothing() {
        assert_eq!(generate_mount_point("", &mounts(&[]), "d", "u", &[]), None);
    }
}
