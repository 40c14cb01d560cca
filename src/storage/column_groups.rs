//! Derived column groupings for very wide datasets.
//!
//! Each strategy is a pure function of the ordered column list. Groups are
//! non-authoritative browsing aids and are regenerated wholesale whenever a
//! dataset is stored.

use std::collections::HashMap;

use crate::models::Column;

/// Datasets wider than this get column groups instead of a full column listing
pub const GROUPING_THRESHOLD: usize = 1000;

/// Minimum number of members before a shared prefix becomes a group
pub const PREFIX_GROUP_MIN_MEMBERS: usize = 5;

/// Width of each sequential window group
pub const WINDOW_SIZE: usize = 500;

/// A group computed from the column list, before it is given a catalog id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedGroup {
    pub name: String,
    pub description: String,
    pub columns: Vec<String>,
}

pub fn needs_groups(column_count: usize) -> bool {
    column_count > GROUPING_THRESHOLD
}

/// One group per inferred type, in order of first appearance
pub fn group_by_type(columns: &[Column]) -> Vec<DerivedGroup> {
    bucket_in_order(columns.iter().map(|c| (c.column_type.as_str().to_string(), c.name.clone())))
        .into_iter()
        .map(|(ty, members)| DerivedGroup {
            name: format!("Type: {}", ty),
            description: format!("Columns with type {}", ty),
            columns: members,
        })
        .collect()
}

/// Groups of columns sharing the text before their first underscore.
///
/// Names without an underscore, or starting with one, have no prefix.
pub fn group_by_prefix(columns: &[Column]) -> Vec<DerivedGroup> {
    let keyed = columns.iter().filter_map(|c| {
        let (prefix, _) = c.name.split_once('_')?;
        if prefix.is_empty() {
            None
        } else {
            Some((prefix.to_string(), c.name.clone()))
        }
    });

    bucket_in_order(keyed)
        .into_iter()
        .filter(|(_, members)| members.len() >= PREFIX_GROUP_MIN_MEMBERS)
        .map(|(prefix, members)| DerivedGroup {
            name: format!("Prefix: {}", prefix),
            description: format!("Columns starting with {}_", prefix),
            columns: members,
        })
        .collect()
}

/// Consecutive windows of `window` columns, labelled with 1-based inclusive bounds
pub fn group_by_window(columns: &[Column], window: usize) -> Vec<DerivedGroup> {
    let window = window.max(1);
    columns
        .chunks(window)
        .enumerate()
        .map(|(idx, chunk)| {
            let start = idx * window + 1;
            let end = start + chunk.len() - 1;
            DerivedGroup {
                name: format!("Columns {}-{}", start, end),
                description: format!("Sequential group of columns from {} to {}", start, end),
                columns: chunk.iter().map(|c| c.name.clone()).collect(),
            }
        })
        .collect()
}

/// All groups for a dataset: type groups, then prefix groups, then windows
pub fn derive_groups(columns: &[Column]) -> Vec<DerivedGroup> {
    let mut groups = group_by_type(columns);
    groups.extend(group_by_prefix(columns));
    groups.extend(group_by_window(columns, WINDOW_SIZE));
    groups
}

fn bucket_in_order(items: impl Iterator<Item = (String, String)>) -> Vec<(String, Vec<String>)> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<(String, Vec<String>)> = Vec::new();

    for (key, value) in items {
        match positions.get(&key) {
            Some(&idx) => buckets[idx].1.push(value),
            None => {
                positions.insert(key.clone(), buckets.len());
                buckets.push((key, vec![value]));
            }
        }
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnType;

    fn cols(names: &[&str], ty: ColumnType) -> Vec<Column> {
        names.iter().map(|n| Column::new(*n, ty)).collect()
    }

    fn numbered(count: usize) -> Vec<Column> {
        (0..count)
            .map(|i| Column::new(format!("c{}", i), ColumnType::Integer))
            .collect()
    }

    #[test]
    fn test_threshold_is_exclusive() {
        assert!(!needs_groups(1000));
        assert!(needs_groups(1001));
    }

    #[test]
    fn test_group_by_type_keeps_first_seen_order() {
        let mut columns = cols(&["a", "b"], ColumnType::Text);
        columns.push(Column::new("c", ColumnType::Integer));
        columns.push(Column::new("d", ColumnType::Text));

        let groups = group_by_type(&columns);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "Type: text");
        assert_eq!(groups[0].columns, vec!["a", "b", "d"]);
        assert_eq!(groups[1].name, "Type: integer");
    }

    #[test]
    fn test_group_by_prefix_requires_five_members() {
        let columns = cols(
            &[
                "user_id", "user_name", "user_age", "user_email", "user_city",
                "order_id", "order_total", "_hidden", "plain",
            ],
            ColumnType::Text,
        );

        let groups = group_by_prefix(&columns);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "Prefix: user");
        assert_eq!(groups[0].description, "Columns starting with user_");
        assert_eq!(groups[0].columns.len(), 5);
    }

    #[test]
    fn test_group_by_window_bounds() {
        let groups = group_by_window(&numbered(1201), WINDOW_SIZE);
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Columns 1-500", "Columns 501-1000", "Columns 1001-1201"]);
        assert_eq!(groups[2].columns.len(), 201);
        assert_eq!(groups[1].columns[0], "c500");
    }

    #[test]
    fn test_two_thousand_columns_yield_four_windows() {
        let groups = derive_groups(&numbered(2000));
        let windows = groups.iter().filter(|g| g.name.starts_with("Columns ")).count();
        assert_eq!(windows, 4);
        // all integer -> one type group, no underscores -> no prefix groups
        assert_eq!(groups.len(), 5);
    }

    #[test]
    fn test_derive_groups_is_deterministic() {
        let columns = numbered(1500);
        assert_eq!(derive_groups(&columns), derive_groups(&columns));
    }
}
