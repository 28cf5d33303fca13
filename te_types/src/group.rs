//! Named sets of samples processed together for counting.

use crate::errors::PipelineError;
use crate::validate_identifier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub members: BTreeSet<String>,
}

impl Group {
    pub fn new<S: ToString>(name: impl ToString, members: impl IntoIterator<Item = S>) -> Self {
        Group {
            name: name.to_string(),
            members: members.into_iter().map(|m| m.to_string()).collect(),
        }
    }

    /// One group per sample, named after the sample.
    pub fn singletons<S: ToString>(sample_ids: impl IntoIterator<Item = S>) -> Vec<Group> {
        sample_ids
            .into_iter()
            .map(|id| {
                let id = id.to_string();
                Group::new(id.clone(), [id])
            })
            .collect()
    }

    pub fn contains(&self, sample_id: &str) -> bool {
        self.members.contains(sample_id)
    }
}

/// Check that `groups` is a valid input for one processing run: every group has
/// a usable name and at least one member, names are unique and no sample is a
/// member of two groups.
pub fn validate_groups(groups: &[Group]) -> Result<(), PipelineError> {
    let mut problems = Vec::new();
    if groups.is_empty() {
        problems.push("no groups were supplied".to_string());
    }

    let mut names = BTreeSet::new();
    let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
    for group in groups {
        if let Err(e) = validate_identifier(&group.name) {
            problems.push(format!("group name '{}': {e}", group.name));
        }
        if !names.insert(group.name.as_str()) {
            problems.push(format!("group '{}' is listed more than once", group.name));
        }
        if group.members.is_empty() {
            problems.push(format!("group '{}' has no members", group.name));
        }
        for member in &group.members {
            if let Some(previous) = owner.insert(member.as_str(), group.name.as_str()) {
                problems.push(format!(
                    "sample '{member}' is a member of both '{previous}' and '{}'",
                    group.name
                ));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::InvalidGroups { problems })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_singletons() {
        let groups = Group::singletons(["A", "B"]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "A");
        assert!(groups[0].contains("A"));
        assert!(validate_groups(&groups).is_ok());
    }

    #[test]
    fn test_invalid_groups() {
        let groups = vec![
            Group::new("g1", ["A", "B"]),
            Group::new("g1", ["C"]),
            Group::new("g/2", ["B"]),
            Group::new("g3", Vec::<String>::new()),
        ];
        let PipelineError::InvalidGroups { problems } = validate_groups(&groups).unwrap_err()
        else {
            panic!("expected InvalidGroups");
        };
        assert_eq!(problems.len(), 4, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("more than once")));
        assert!(problems.iter().any(|p| p.contains("'B' is a member of both")));
        assert!(problems.iter().any(|p| p.contains("no members")));

        assert!(validate_groups(&[]).is_err());
    }

    proptest! {
        #[test]
        fn disjoint_groups_validate(sizes in proptest::collection::vec(1usize..5, 1..8)) {
            let mut next = 0;
            let groups: Vec<Group> = sizes
                .iter()
                .enumerate()
                .map(|(i, &n)| {
                    let members: Vec<String> = (next..next + n).map(|s| format!("S{s}")).collect();
                    next += n;
                    Group::new(format!("g{i}"), members)
                })
                .collect();
            prop_assert!(validate_groups(&groups).is_ok());
        }
    }
}
