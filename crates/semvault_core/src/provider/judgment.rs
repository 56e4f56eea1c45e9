//! Defensive parsing of free-text model judgments.
//!
//! # Responsibility
//! - Turn model output into tagged results with an always-defined default.
//! - Never panic on malformed input.
//!
//! # Invariants
//! - Indices in prompts are 1-based; parsed indices are 0-based and in range.
//! - Group parses contain between 2 and 4 non-empty groups.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;

static YES_NO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(yes|no)\b").expect("valid yes/no regex"));
static INTEGER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid integer regex"));
static NONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(none|nothing)\b").expect("valid none regex"));

pub const MIN_GROUPS: usize = 2;
pub const MAX_GROUPS: usize = 4;

/// Parse outcome of one judgment call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Judgment<T> {
    Parsed(T),
    Unparsed { reason: &'static str },
}

impl<T> Judgment<T> {
    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Self::Parsed(value) => value,
            Self::Unparsed { .. } => default,
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Parsed(value) => Some(value),
            Self::Unparsed { .. } => None,
        }
    }
}

/// One labelled group of 0-based item indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub label: String,
    pub members: Vec<usize>,
}

/// Reads the first standalone `yes`/`no` in the answer.
pub fn parse_yes_no(raw: &str) -> Judgment<bool> {
    match YES_NO_RE.captures(raw) {
        Some(captures) => Judgment::Parsed(captures[1].eq_ignore_ascii_case("yes")),
        None => Judgment::Unparsed {
            reason: "no yes/no token",
        },
    }
}

/// Reads 1-based child numbers; returns deduplicated 0-based indices.
///
/// An explicit "none" with no numbers parses as an empty selection.
pub fn parse_selection(raw: &str, count: usize) -> Judgment<Vec<usize>> {
    let mut seen = BTreeSet::new();
    let mut selected = Vec::new();
    let mut saw_number = false;
    for found in INTEGER_RE.find_iter(raw) {
        saw_number = true;
        let Ok(number) = found.as_str().parse::<usize>() else {
            continue;
        };
        if number == 0 || number > count {
            continue;
        }
        if seen.insert(number) {
            selected.push(number - 1);
        }
    }

    if selected.is_empty() && !saw_number && !NONE_RE.is_match(raw) {
        return Judgment::Unparsed {
            reason: "no child numbers",
        };
    }
    Judgment::Parsed(selected)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawGroup {
    Labelled {
        #[serde(default)]
        label: Option<String>,
        #[serde(alias = "notes", alias = "items", alias = "children")]
        members: Vec<i64>,
    },
    Bare(Vec<i64>),
}

/// Reads a JSON array of groups embedded anywhere in the answer.
///
/// Accepts `[{"label": "...", "members": [1, 2]}, ...]` or `[[1, 2], [3]]`.
/// Out-of-range indices are dropped; groups left empty are discarded.
pub fn parse_groups(raw: &str, count: usize) -> Judgment<Vec<Group>> {
    let (Some(start), Some(end)) = (raw.find('['), raw.rfind(']')) else {
        return Judgment::Unparsed {
            reason: "no json array",
        };
    };
    if end <= start {
        return Judgment::Unparsed {
            reason: "no json array",
        };
    }

    let parsed: Vec<RawGroup> = match serde_json::from_str(&raw[start..=end]) {
        Ok(parsed) => parsed,
        Err(_) => {
            return Judgment::Unparsed {
                reason: "invalid group json",
            }
        }
    };

    let mut groups = Vec::new();
    for (index, group) in parsed.into_iter().enumerate() {
        let (label, members) = match group {
            RawGroup::Labelled { label, members } => (label, members),
            RawGroup::Bare(members) => (None, members),
        };
        let mut seen = BTreeSet::new();
        let members: Vec<usize> = members
            .into_iter()
            .filter(|number| *number >= 1 && (*number as usize) <= count)
            .map(|number| number as usize - 1)
            .filter(|index| seen.insert(*index))
            .collect();
        if members.is_empty() {
            continue;
        }
        let label = label
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("group {}", index + 1));
        groups.push(Group { label, members });
    }

    if groups.len() < MIN_GROUPS || groups.len() > MAX_GROUPS {
        return Judgment::Unparsed {
            reason: "group count out of range",
        };
    }
    Judgment::Parsed(groups)
}

/// Completes a parsed partition so no item is lost.
///
/// With `exclusive`, an item listed in several groups stays in the first.
/// Items no group mentions join the smallest group. Returns `None` when fewer
/// than two non-empty groups remain.
pub fn complete_partition(
    mut groups: Vec<Group>,
    count: usize,
    exclusive: bool,
) -> Option<Vec<Group>> {
    if exclusive {
        let mut claimed = BTreeSet::new();
        for group in &mut groups {
            group.members.retain(|member| claimed.insert(*member));
        }
        groups.retain(|group| !group.members.is_empty());
    }

    if groups.len() < MIN_GROUPS {
        return None;
    }

    let mentioned: BTreeSet<usize> = groups
        .iter()
        .flat_map(|group| group.members.iter().copied())
        .collect();
    for item in 0..count {
        if mentioned.contains(&item) {
            continue;
        }
        let smallest = groups
            .iter_mut()
            .min_by_key(|group| group.members.len())?;
        smallest.members.push(item);
    }
    Some(groups)
}

#[cfg(test)]
mod tests {
    use super::{complete_partition, parse_groups, parse_selection, parse_yes_no, Group, Judgment};

    #[test]
    fn yes_no_reads_first_token() {
        assert_eq!(parse_yes_no("Yes."), Judgment::Parsed(true));
        assert_eq!(
            parse_yes_no("No, they describe different things. Yes is wrong."),
            Judgment::Parsed(false)
        );
        assert!(matches!(parse_yes_no("maybe"), Judgment::Unparsed { .. }));
        assert!(matches!(parse_yes_no("yesterday"), Judgment::Unparsed { .. }));
    }

    #[test]
    fn selection_drops_out_of_range_and_duplicates() {
        assert_eq!(
            parse_selection("Children 2, 2 and 7 and 0, also 1", 3),
            Judgment::Parsed(vec![1, 0])
        );
        assert_eq!(parse_selection("none of them", 3), Judgment::Parsed(vec![]));
        assert!(matches!(
            parse_selection("I cannot tell", 3),
            Judgment::Unparsed { .. }
        ));
    }

    #[test]
    fn groups_tolerate_prose_and_bare_arrays() {
        let raw = "Here you go:\n[{\"label\": \"Rust\", \"members\": [1, 2]}, {\"notes\": [3, 9]}]\nDone.";
        let groups = parse_groups(raw, 3).ok().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].label, "Rust");
        assert_eq!(groups[0].members, vec![0, 1]);
        assert_eq!(groups[1].label, "group 2");
        assert_eq!(groups[1].members, vec![2]);

        let bare = parse_groups("[[1], [2, 3]]", 3).ok().unwrap();
        assert_eq!(bare[1].members, vec![1, 2]);
    }

    #[test]
    fn groups_reject_wrong_group_counts_and_bad_json() {
        assert!(matches!(parse_groups("[[1, 2, 3]]", 3), Judgment::Unparsed { .. }));
        assert!(matches!(
            parse_groups("[[1], [2], [3], [4], [5]]", 5),
            Judgment::Unparsed { .. }
        ));
        assert!(matches!(parse_groups("[oops", 3), Judgment::Unparsed { .. }));
        assert!(matches!(parse_groups("no array", 3), Judgment::Unparsed { .. }));
    }

    #[test]
    fn complete_partition_assigns_orphans_to_smallest_group() {
        let groups = vec![
            Group {
                label: "a".to_string(),
                members: vec![0, 1],
            },
            Group {
                label: "b".to_string(),
                members: vec![1],
            },
        ];
        let shared = complete_partition(groups.clone(), 3, false).unwrap();
        assert_eq!(shared[0].members, vec![0, 1]);
        assert_eq!(shared[1].members, vec![1, 2]);

        let exclusive = complete_partition(groups, 3, true);
        assert!(exclusive.is_none());
    }
}
