//! Explicit-stack range iteration.

use crate::node::{NodePtr, NodeSource};
use arbor_common::Result;
use bytes::Bytes;

/// Bidirectional iterator over the key range `[start, end)`.
///
/// Holds an explicit stack of node pointers instead of recursing;
/// subtrees that cannot overlap the range are pruned using the branch
/// key alone. Stack depth is bounded by the tree height.
pub struct TreeIterator<'a, S: NodeSource> {
    source: &'a S,
    stack: Vec<NodePtr>,
    start: Option<Bytes>,
    end: Option<Bytes>,
    ascending: bool,
    finished: bool,
}

impl<'a, S: NodeSource> TreeIterator<'a, S> {
    /// Creates an iterator over `[start, end)` rooted at `root`.
    /// `None` bounds are unbounded.
    pub fn new(
        source: &'a S,
        root: NodePtr,
        start: Option<Bytes>,
        end: Option<Bytes>,
        ascending: bool,
    ) -> Self {
        let mut stack = Vec::new();
        if !root.is_empty() {
            stack.push(root);
        }
        Self {
            source,
            stack,
            start,
            end,
            ascending,
            finished: false,
        }
    }

    fn in_range(&self, key: &[u8]) -> bool {
        if let Some(start) = &self.start {
            if key < &start[..] {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if key >= &end[..] {
                return false;
            }
        }
        true
    }

    /// The left subtree holds keys strictly below the branch key, so
    /// it can only overlap the range if `start` lies below the key.
    fn visit_left(&self, branch_key: &[u8]) -> bool {
        match &self.start {
            Some(start) => &start[..] < branch_key,
            None => true,
        }
    }

    /// The right subtree holds keys at or above the branch key.
    fn visit_right(&self, branch_key: &[u8]) -> bool {
        match &self.end {
            Some(end) => &end[..] > branch_key,
            None => true,
        }
    }

    fn step(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        while let Some(ptr) = self.stack.pop() {
            let node = ptr.resolve(self.source)?;
            if node.is_leaf() {
                if self.in_range(node.key()) {
                    let value = node.value().cloned().expect("leaf has a value");
                    return Ok(Some((node.key().clone(), value)));
                }
                continue;
            }
            let left = self.visit_left(node.key()).then(|| node.left());
            let right = self.visit_right(node.key()).then(|| node.right());
            // Push the later-visited child first.
            if self.ascending {
                if let Some(right) = right {
                    self.stack.push(right);
                }
                if let Some(left) = left {
                    self.stack.push(left);
                }
            } else {
                if let Some(left) = left {
                    self.stack.push(left);
                }
                if let Some(right) = right {
                    self.stack.push(right);
                }
            }
        }
        Ok(None)
    }
}

impl<S: NodeSource> Iterator for TreeIterator<'_, S> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DetachedSource;
    use crate::ops::{set_kv, MutationContext};

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn build(n: usize) -> NodePtr {
        let mut ctx = MutationContext::new(1);
        let mut root = NodePtr::Empty;
        for i in 0..n {
            let (new_root, _) = set_kv(
                &root,
                &DetachedSource,
                &mut ctx,
                Bytes::from(format!("k{:03}", i)),
                Bytes::from(format!("v{:03}", i)),
            )
            .unwrap();
            root = new_root;
        }
        root
    }

    fn keys(iter: TreeIterator<'_, DetachedSource>) -> Vec<String> {
        iter.map(|r| String::from_utf8(r.unwrap().0.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_full_ascending_scan() {
        let root = build(100);
        let iter = TreeIterator::new(&DetachedSource, root, None, None, true);
        let got = keys(iter);
        assert_eq!(got.len(), 100);
        for (i, key) in got.iter().enumerate() {
            assert_eq!(key, &format!("k{:03}", i));
        }
    }

    #[test]
    fn test_full_descending_scan() {
        let root = build(20);
        let iter = TreeIterator::new(&DetachedSource, root, None, None, false);
        let got = keys(iter);
        assert_eq!(got.len(), 20);
        for (i, key) in got.iter().enumerate() {
            assert_eq!(key, &format!("k{:03}", 19 - i));
        }
    }

    #[test]
    fn test_range_is_half_open() {
        let root = build(100);
        let iter = TreeIterator::new(
            &DetachedSource,
            root,
            Some(b("k050")),
            Some(b("k080")),
            true,
        );
        let got = keys(iter);
        assert_eq!(got.first().unwrap(), "k050");
        assert_eq!(got.last().unwrap(), "k079");
        assert_eq!(got.len(), 30);
    }

    #[test]
    fn test_reverse_range() {
        let root = build(100);
        let iter = TreeIterator::new(
            &DetachedSource,
            root,
            Some(b("k050")),
            Some(b("k080")),
            false,
        );
        let got = keys(iter);
        assert_eq!(got.first().unwrap(), "k079");
        assert_eq!(got.last().unwrap(), "k050");
        assert_eq!(got.len(), 30);
    }

    #[test]
    fn test_empty_tree_and_empty_range() {
        let iter = TreeIterator::new(&DetachedSource, NodePtr::Empty, None, None, true);
        assert_eq!(iter.count(), 0);

        let root = build(10);
        let iter = TreeIterator::new(
            &DetachedSource,
            root,
            Some(b("k005")),
            Some(b("k005")),
            true,
        );
        assert_eq!(iter.count(), 0);
    }

    #[test]
    fn test_range_bounds_between_keys() {
        let root = build(10);
        // Bounds that fall between stored keys.
        let iter = TreeIterator::new(
            &DetachedSource,
            root,
            Some(b("k003x")),
            Some(b("k007x")),
            true,
        );
        let got = keys(iter);
        assert_eq!(got, vec!["k004", "k005", "k006", "k007"]);
    }
}
