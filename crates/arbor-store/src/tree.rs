//! Pure operations over the flat message map.
//!
//! The tree is an acyclic parent-pointer structure: messages are keyed by
//! integer id, `parent_id == 0` marks a root, and child lists are derived
//! on read. Branch selection (which child is "active") lives entirely with
//! the client; the server only persists the tree.

use crate::types::MessageMap;

/// Reconstruct the root-to-leaf path ending at `leaf`.
///
/// Walks parent pointers until a parent is 0 or absent, then reverses.
/// Unknown leaf ids yield an empty path. The walk is bounded by the map
/// size, so a corrupted parent cycle cannot loop forever.
pub fn path_to_root(messages: &MessageMap, leaf: i64) -> Vec<i64> {
    let mut path = Vec::new();
    let mut cursor = leaf;
    while cursor != 0 {
        let Some(msg) = messages.get(&cursor) else {
            break;
        };
        path.push(msg.id);
        if path.len() > messages.len() {
            break;
        }
        cursor = msg.parent_id;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, Role};
    use std::collections::HashMap;

    /// conv tree:  1 ── 2 ── 4
    ///              └─── 3
    fn sample_tree() -> MessageMap {
        let mut map = HashMap::new();
        for (id, parent, children) in [
            (1, 0, vec![2, 3]),
            (2, 1, vec![4]),
            (3, 1, vec![]),
            (4, 2, vec![]),
        ] {
            let mut msg = Message::new("conv", Role::User, format!("m{id}"));
            msg.id = id;
            msg.parent_id = parent;
            msg.children = children;
            map.insert(id, msg);
        }
        map
    }

    #[test]
    fn path_walks_to_root_and_reverses() {
        let map = sample_tree();
        assert_eq!(path_to_root(&map, 4), vec![1, 2, 4]);
        assert_eq!(path_to_root(&map, 3), vec![1, 3]);
        assert_eq!(path_to_root(&map, 1), vec![1]);
    }

    #[test]
    fn path_is_idempotent() {
        let map = sample_tree();
        assert_eq!(path_to_root(&map, 4), path_to_root(&map, 4));
    }

    #[test]
    fn unknown_leaf_yields_empty_path() {
        let map = sample_tree();
        assert!(path_to_root(&map, 99).is_empty());
    }
}
