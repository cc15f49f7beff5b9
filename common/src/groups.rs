// Group hierarchy index

use crate::models::GroupNode;
use std::collections::BTreeMap;
use tracing::debug;

/// Bidirectional id ↔ path maps over a group tree.
///
/// Built fresh for every resolution pass and owned by it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupIndex {
    by_id: BTreeMap<String, String>,
    by_path: BTreeMap<String, String>,
}

impl GroupIndex {
    /// Visit every node once, parents before children, siblings in input
    /// order. A repeated id or path keeps the last value seen.
    pub fn build(tree: &[GroupNode]) -> Self {
        let mut index = Self::default();
        let mut stack: Vec<&GroupNode> = tree.iter().rev().collect();

        while let Some(node) = stack.pop() {
            if let Some(previous) = index.by_id.insert(node.id.clone(), node.path.clone()) {
                debug!(group_id = %node.id, previous = %previous, path = %node.path, "Group id repeated in tree");
            }
            index.by_path.insert(node.path.clone(), node.id.clone());
            stack.extend(node.sub_groups.iter().rev());
        }

        index
    }

    pub fn path_of(&self, group_id: &str) -> Option<&str> {
        self.by_id.get(group_id).map(String::as_str)
    }

    pub fn id_of(&self, path: &str) -> Option<&str> {
        self.by_path.get(path).map(String::as_str)
    }

    pub fn by_id(&self) -> &BTreeMap<String, String> {
        &self.by_id
    }

    pub fn by_path(&self) -> &BTreeMap<String, String> {
        &self.by_path
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(id: &str, path: &str, children: Vec<GroupNode>) -> GroupNode {
        GroupNode {
            id: id.to_string(),
            path: path.to_string(),
            sub_groups: children,
        }
    }

    fn sample_tree() -> Vec<GroupNode> {
        vec![
            node(
                "g1",
                "/eng",
                vec![
                    node("g2", "/eng/payments", vec![node("g3", "/eng/payments/api", vec![])]),
                    node("g4", "/eng/web", vec![]),
                ],
            ),
            node("g5", "/ops", vec![]),
        ]
    }

    #[test]
    fn test_build_indexes_every_node() {
        let index = GroupIndex::build(&sample_tree());
        assert_eq!(index.len(), 5);
        assert_eq!(index.path_of("g3"), Some("/eng/payments/api"));
        assert_eq!(index.id_of("/ops"), Some("g5"));
        assert_eq!(index.path_of("missing"), None);
    }

    #[test]
    fn test_build_is_idempotent() {
        let tree = sample_tree();
        let first = GroupIndex::build(&tree);
        let second = GroupIndex::build(&tree);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(first.by_id()).unwrap(),
            serde_json::to_string(second.by_id()).unwrap()
        );
    }

    #[test]
    fn test_repeated_id_last_write_wins() {
        let tree = vec![
            node("g1", "/first", vec![node("g1", "/first/child", vec![])]),
            node("g1", "/second", vec![]),
        ];
        let index = GroupIndex::build(&tree);
        assert_eq!(index.path_of("g1"), Some("/second"));
        assert_eq!(index.id_of("/first/child"), Some("g1"));
    }

    #[test]
    fn test_empty_tree() {
        assert!(GroupIndex::build(&[]).is_empty());
    }

    fn arb_tree() -> impl Strategy<Value = Vec<GroupNode>> {
        let leaf = ("[a-z0-9]{1,4}", "/[a-z]{1,6}").prop_map(|(id, path)| node(&id, &path, vec![]));
        let tree = leaf.prop_recursive(3, 24, 4, |inner| {
            ("[a-z0-9]{1,4}", "/[a-z]{1,6}", prop::collection::vec(inner, 0..4))
                .prop_map(|(id, path, children)| node(&id, &path, children))
        });
        prop::collection::vec(tree, 0..4)
    }

    proptest! {
        #[test]
        fn prop_build_twice_is_identical(tree in arb_tree()) {
            prop_assert_eq!(GroupIndex::build(&tree), GroupIndex::build(&tree));
        }
    }
}
