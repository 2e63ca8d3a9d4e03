/// Bidirectional cursor over leaf entries.
///
/// Holds `(page, index)` where `index` is the slot of the next entry to
/// return going forward. Movement follows the doubly-linked leaf list, one
/// page in memory at a time. Cursors take no locks: any mutation of the
/// tree invalidates every open cursor.
use crate::btree::ops;
use crate::btree::page::BPage;
use crate::btree::BTree;
use crate::error::Result;
use crate::storage::RecordStore;
use crate::types::Datum;

pub struct Cursor {
    page: BPage,
    index: usize,
}

impl Cursor {
    pub(crate) fn new(page: BPage, index: usize) -> Self {
        Cursor { page, index }
    }

    /// Advance to the next entry, or `None` at the end of the tree.
    #[allow(clippy::should_implement_trait)]
    pub fn next(
        &mut self,
        tree: &BTree,
        store: &mut impl RecordStore,
    ) -> Result<Option<(Datum, Datum)>> {
        let ctx = tree.context();
        if self.index == self.page.capacity() || self.page.keys[self.index].is_none() {
            if self.page.next == 0 {
                return Ok(None);
            }
            self.page = ops::load_page(ctx, store, self.page.next)?;
            self.index = self.page.first;
        }
        let Some(key) = self.page.keys[self.index].clone() else {
            return Ok(None);
        };
        let value = ops::resolve_value(ctx, store, &self.page.values[self.index])?
            .ok_or_else(|| {
                crate::error::KuraError::Corruption("leaf entry without a value".into())
            })?;
        self.index += 1;
        Ok(Some((key, value)))
    }

    /// Step back to the previous entry, or `None` at the beginning.
    pub fn previous(
        &mut self,
        tree: &BTree,
        store: &mut impl RecordStore,
    ) -> Result<Option<(Datum, Datum)>> {
        let ctx = tree.context();
        if self.index == self.page.first {
            if self.page.previous == 0 {
                return Ok(None);
            }
            self.page = ops::load_page(ctx, store, self.page.previous)?;
            self.index = self.page.capacity();
        }
        self.index -= 1;
        let Some(key) = self.page.keys[self.index].clone() else {
            // stepped onto the sentinel slot: skip over it
            return self.previous(tree, store);
        };
        let value = ops::resolve_value(ctx, store, &self.page.values[self.index])?
            .ok_or_else(|| {
                crate::error::KuraError::Corruption("leaf entry without a value".into())
            })?;
        Ok(Some((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::TreeOptions;
    use crate::storage::MemStore;

    fn build_tree(keys: &[i32]) -> (BTree, MemStore) {
        let mut store = MemStore::new();
        let mut tree =
            BTree::create(&mut store, TreeOptions::new().capacity(4)).unwrap();
        for &k in keys {
            tree.insert(&mut store, Datum::Int(k), Datum::Int(k * 10), false)
                .unwrap();
        }
        (tree, store)
    }

    #[test]
    fn test_forward_iteration_across_leaves() {
        let (tree, mut store) = build_tree(&[40, 10, 30, 20, 50, 60]);
        let mut cursor = tree.find_first(&mut store).unwrap().unwrap();

        let mut seen = Vec::new();
        while let Some((key, value)) = cursor.next(&tree, &mut store).unwrap() {
            assert_eq!(value, Datum::Int(key.as_i64().unwrap() as i32 * 10));
            seen.push(key);
        }
        let expected: Vec<_> = [10, 20, 30, 40, 50, 60].map(Datum::Int).into();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_backward_iteration_from_end() {
        let (tree, mut store) = build_tree(&[1, 2, 3, 4, 5, 6, 7]);
        // position past every real key
        let mut cursor = tree.find(&mut store, &Datum::Int(i32::MAX)).unwrap().unwrap();

        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.previous(&tree, &mut store).unwrap() {
            seen.push(key);
        }
        let expected: Vec<_> = [7, 6, 5, 4, 3, 2, 1].map(Datum::Int).into();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_find_positions_before_key() {
        let (tree, mut store) = build_tree(&[10, 20, 30, 40]);
        let mut cursor = tree.find(&mut store, &Datum::Int(25)).unwrap().unwrap();
        let (key, _) = cursor.next(&tree, &mut store).unwrap().unwrap();
        assert_eq!(key, Datum::Int(30));
    }

    #[test]
    fn test_cursor_on_empty_root_leaf() {
        let (mut tree, mut store) = build_tree(&[5]);
        tree.remove(&mut store, &Datum::Int(5)).unwrap();

        let mut cursor = tree.find_first(&mut store).unwrap().unwrap();
        assert_eq!(cursor.next(&tree, &mut store).unwrap(), None);
        assert_eq!(cursor.previous(&tree, &mut store).unwrap(), None);
    }

    #[test]
    fn test_direction_change_midway() {
        let (tree, mut store) = build_tree(&[1, 2, 3, 4, 5]);
        let mut cursor = tree.find_first(&mut store).unwrap().unwrap();

        let (k1, _) = cursor.next(&tree, &mut store).unwrap().unwrap();
        let (k2, _) = cursor.next(&tree, &mut store).unwrap().unwrap();
        assert_eq!((k1, k2), (Datum::Int(1), Datum::Int(2)));

        // stepping back returns the entry just consumed
        let (back, _) = cursor.previous(&tree, &mut store).unwrap().unwrap();
        assert_eq!(back, Datum::Int(2));
    }
}
