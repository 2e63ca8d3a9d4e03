/// Recursive page operations: lookup, insert (with split), remove (with
/// sibling borrow and merge), full-subtree delete, and the defrag traversal.
///
/// Operations are performed on in-memory pages obtained from the record
/// store; every mutated page is persisted before the current frame returns,
/// so the on-disk image is consistent at each top-level boundary. `height`
/// counts down along the descent and is 1 when the current page is a leaf.
use std::cmp::Ordering;

use tracing::debug;

use crate::btree::cursor::Cursor;
use crate::btree::format;
use crate::btree::page::{BPage, LeafValue};
use crate::btree::TreeContext;
use crate::error::{KuraError, Result};
use crate::storage::RecordStore;
use crate::types::{Datum, Recid};
use crate::varint::Reader;

/// Result of `insert`: the prior value when the key already existed, and
/// the freshly allocated sibling when this page split.
pub(crate) struct InsertResult {
    pub existing: Option<Datum>,
    pub overflow: Option<BPage>,
}

/// Result of `remove`: the removed value, and whether this page fell under
/// minimum fill.
pub(crate) struct RemoveResult {
    pub value: Option<Datum>,
    pub underflow: bool,
}

pub(crate) fn load_page(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    recid: Recid,
) -> Result<BPage> {
    let data = store.fetch(recid)?;
    format::deserialize_page(ctx, recid, &data)
}

pub(crate) fn persist(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: &mut BPage,
) -> Result<()> {
    let data = format::serialize_page(ctx, store, page)?;
    store.update(page.recid, &data)
}

/// Serialize a fresh page and let the store assign its recid.
pub(crate) fn persist_new(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: &mut BPage,
) -> Result<Recid> {
    let data = format::serialize_page(ctx, store, page)?;
    page.recid = store.insert(&data)?;
    Ok(page.recid)
}

/// Materialize a leaf slot, fetching the backing record of a lazy value.
pub(crate) fn resolve_value(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    slot: &Option<LeafValue>,
) -> Result<Option<Datum>> {
    match slot {
        None => Ok(None),
        Some(LeafValue::Inline(value)) => Ok(Some(value.clone())),
        Some(LeafValue::Lazy(recid)) => {
            let data = store.fetch(*recid)?;
            Ok(Some(ctx.deserialize_value(&mut Reader::new(&data))?))
        }
    }
}

/// Descend to the leaf level and return a cursor positioned just before the
/// first key greater than or equal to `key`.
pub(crate) fn find(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: BPage,
    height: u32,
    key: &Datum,
) -> Result<Cursor> {
    let index = page.find_children(ctx, key);
    if height - 1 == 0 {
        return Ok(Cursor::new(page, index));
    }
    let child = load_page(ctx, store, page.children[index])?;
    find(ctx, store, child, height - 1, key)
}

/// Descend the left spine and return a cursor before the first entry.
pub(crate) fn find_first(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: BPage,
) -> Result<Cursor> {
    if page.is_leaf {
        let first = page.first;
        return Ok(Cursor::new(page, first));
    }
    let child = load_page(ctx, store, page.children[page.first])?;
    find_first(ctx, store, child)
}

pub(crate) fn find_value(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: &BPage,
    height: u32,
    key: &Datum,
) -> Result<Option<Datum>> {
    let index = page.find_children(ctx, key);
    if height - 1 == 0 {
        if ctx.compare(Some(key), page.keys[index].as_ref()) != Ordering::Equal {
            return Ok(None);
        }
        return resolve_value(ctx, store, &page.values[index]);
    }
    let child = load_page(ctx, store, page.children[index])?;
    find_value(ctx, store, &child, height - 1, key)
}

pub(crate) fn insert(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: &mut BPage,
    height: u32,
    key: Datum,
    value: Datum,
    replace: bool,
) -> Result<InsertResult> {
    let index = page.find_children(ctx, &key);
    let height = height - 1;

    if height == 0 {
        if ctx.compare(Some(&key), page.keys[index].as_ref()) == Ordering::Equal {
            // key already exists
            let existing = resolve_value(ctx, store, &page.values[index])?;
            if replace {
                if let Some(LeafValue::Lazy(recid)) = page.values[index] {
                    store.delete(recid)?;
                }
                page.values[index] = Some(LeafValue::Inline(value));
                persist(ctx, store, page)?;
            }
            return Ok(InsertResult {
                existing,
                overflow: None,
            });
        }
        return insert_here(ctx, store, page, index, key, Some(LeafValue::Inline(value)), 0);
    }

    // non-leaf: recurse, then deal with a child split if one comes back
    let mut child = load_page(ctx, store, page.children[index])?;
    let result = insert(ctx, store, &mut child, height, key, value, replace)?;
    if result.existing.is_some() {
        return Ok(result);
    }
    let Some(overflow) = result.overflow else {
        return Ok(result);
    };

    // the overflow sibling holds the lower half of the split child: its
    // separator goes in just before the child, whose own separator shrank
    let separator = overflow.largest_key().cloned().ok_or_else(|| {
        KuraError::Corruption("split sibling has no largest key".into())
    })?;
    page.keys[index] = child.largest_key().cloned();
    insert_here(ctx, store, page, index, separator, None, overflow.recid)
}

/// Place a new entry at `index-1`, splitting this page if it is full.
/// `value` carries the payload on leaves, `child` on non-leaf pages.
fn insert_here(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: &mut BPage,
    index: usize,
    key: Datum,
    value: Option<LeafValue>,
    child: Recid,
) -> Result<InsertResult> {
    if !page.is_full() {
        if page.is_leaf {
            page.insert_entry(index - 1, key, value.expect("BUG: leaf entry without value"));
        } else {
            page.insert_child(index - 1, key, child);
        }
        persist(ctx, store, page)?;
        return Ok(InsertResult {
            existing: None,
            overflow: None,
        });
    }

    // page is full: divide it, moving the lower half to a new sibling
    let half = ctx.half();
    let mut new_page = BPage::new_overflow(ctx.capacity(), page.is_leaf);
    persist_new(ctx, store, &mut new_page)?;

    if index < half {
        // the new entry belongs to the lower half and moves with it
        if page.is_leaf {
            page.move_entries_to(0, &mut new_page, half, index);
            new_page.set_entry(half + index, Some(key), value);
            page.move_entries_to(index, &mut new_page, half + index + 1, half - index - 1);
        } else {
            page.move_children_to(0, &mut new_page, half, index);
            new_page.set_child(half + index, Some(key), child);
            page.move_children_to(index, &mut new_page, half + index + 1, half - index - 1);
        }
    } else {
        // the new entry stays on this page
        if page.is_leaf {
            page.move_entries_to(0, &mut new_page, half, half);
            page.copy_entries_within(half, half - 1, index - half);
            page.set_entry(index - 1, Some(key), value);
        } else {
            page.move_children_to(0, &mut new_page, half, half);
            page.copy_children_within(half, half - 1, index - half);
            page.set_child(index - 1, Some(key), child);
        }
    }
    page.first = half - 1;

    if page.is_leaf {
        // splice the new page into the leaf list just before this one
        new_page.previous = page.previous;
        new_page.next = page.recid;
        if page.previous != 0 {
            let mut left = load_page(ctx, store, page.previous)?;
            left.next = new_page.recid;
            persist(ctx, store, &mut left)?;
        }
        page.previous = new_page.recid;
    }

    persist(ctx, store, page)?;
    persist(ctx, store, &mut new_page)?;
    debug!(
        page = page.recid,
        sibling = new_page.recid,
        leaf = page.is_leaf,
        "page split"
    );
    Ok(InsertResult {
        existing: None,
        overflow: Some(new_page),
    })
}

pub(crate) fn remove(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: &mut BPage,
    height: u32,
    key: &Datum,
) -> Result<RemoveResult> {
    let half = ctx.half();
    let index = page.find_children(ctx, key);
    let height = height - 1;

    if height == 0 {
        if ctx.compare(page.keys[index].as_ref(), Some(key)) != Ordering::Equal {
            return Err(KuraError::KeyNotFound);
        }
        let value = resolve_value(ctx, store, &page.values[index])?;
        if let Some(LeafValue::Lazy(recid)) = page.values[index] {
            store.delete(recid)?;
        }
        page.remove_entry(index);
        persist(ctx, store, page)?;
        return Ok(RemoveResult {
            value,
            underflow: page.first > half,
        });
    }

    // recurse, then refresh the child's separator key
    let mut child = load_page(ctx, store, page.children[index])?;
    let result = remove(ctx, store, &mut child, height, key)?;
    page.keys[index] = child.largest_key().cloned();
    persist(ctx, store, page)?;

    if result.underflow {
        if child.first != half + 1 {
            return Err(KuraError::Corruption(
                "underflowing page has unexpected fill".into(),
            ));
        }
        if index < ctx.capacity() - 1 {
            rebalance_from_right(ctx, store, page, &mut child, index, half)?;
        } else {
            rebalance_from_left(ctx, store, page, &mut child, index, half)?;
        }
    }

    Ok(RemoveResult {
        value: result.value,
        underflow: page.first > half,
    })
}

/// The underflowing child has a right sibling: borrow from it if it has
/// slack, otherwise merge the child into it.
fn rebalance_from_right(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: &mut BPage,
    child: &mut BPage,
    index: usize,
    half: usize,
) -> Result<()> {
    let mut sibling = load_page(ctx, store, page.children[index + 1])?;
    let sfirst = sibling.first;

    if sfirst < half {
        // borrow: steal the sibling's leading entries
        let steal = (half - sfirst + 1) / 2;
        sibling.first += steal;
        child.first -= steal;
        if child.is_leaf {
            child.copy_entries_within(half + 1, half + 1 - steal, half - 1);
            sibling.move_entries_to(sfirst, child, 2 * half - steal, steal);
        } else {
            child.copy_children_within(half + 1, half + 1 - steal, half - 1);
            sibling.move_children_to(sfirst, child, 2 * half - steal, steal);
        }
        page.keys[index] = child.largest_key().cloned();

        persist(ctx, store, page)?;
        persist(ctx, store, &mut sibling)?;
        persist(ctx, store, child)?;
        debug!(
            child = child.recid,
            sibling = sibling.recid,
            steal,
            "borrowed entries from right sibling"
        );
        return Ok(());
    }

    // sibling is at minimum fill: move everything into it, drop the child
    if sibling.first != half {
        return Err(KuraError::Corruption(
            "merge sibling has unexpected fill".into(),
        ));
    }
    sibling.first = 1;
    if child.is_leaf {
        child.move_entries_to(half + 1, &mut sibling, 1, half - 1);
    } else {
        child.move_children_to(half + 1, &mut sibling, 1, half - 1);
    }
    persist(ctx, store, &mut sibling)?;

    // drop the dead child's separator from this page
    let pfirst = page.first;
    page.copy_children_within(pfirst, pfirst + 1, index - pfirst);
    page.set_child(pfirst, None, 0);
    page.first += 1;
    persist(ctx, store, page)?;

    unlink_and_delete(ctx, store, child)?;
    debug!(
        survivor = sibling.recid,
        dropped = child.recid,
        "merged page into right sibling"
    );
    Ok(())
}

/// The underflowing child is the rightmost slot: borrow from or merge with
/// its left sibling. The child survives a merge here, keeping the pair's
/// rightmost position (and the sentinel, if any).
fn rebalance_from_left(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: &mut BPage,
    child: &mut BPage,
    index: usize,
    half: usize,
) -> Result<()> {
    let mut sibling = load_page(ctx, store, page.children[index - 1])?;
    let sfirst = sibling.first;

    if sfirst < half {
        // borrow: steal the sibling's trailing entries
        let steal = (half - sfirst + 1) / 2;
        sibling.first += steal;
        child.first -= steal;
        if child.is_leaf {
            sibling.move_entries_to(2 * half - steal, child, half + 1 - steal, steal);
            sibling.copy_entries_within(sfirst, sfirst + steal, 2 * half - sfirst - steal);
        } else {
            sibling.move_children_to(2 * half - steal, child, half + 1 - steal, steal);
            sibling.copy_children_within(sfirst, sfirst + steal, 2 * half - sfirst - steal);
        }
        page.keys[index - 1] = sibling.largest_key().cloned();

        persist(ctx, store, page)?;
        persist(ctx, store, &mut sibling)?;
        persist(ctx, store, child)?;
        debug!(
            child = child.recid,
            sibling = sibling.recid,
            steal,
            "borrowed entries from left sibling"
        );
        return Ok(());
    }

    if sibling.first != half {
        return Err(KuraError::Corruption(
            "merge sibling has unexpected fill".into(),
        ));
    }
    child.first = 1;
    if child.is_leaf {
        sibling.move_entries_to(half, child, 1, half);
    } else {
        sibling.move_children_to(half, child, 1, half);
    }
    persist(ctx, store, child)?;

    // drop the dead sibling's separator from this page
    let pfirst = page.first;
    page.copy_children_within(pfirst, pfirst + 1, index - 1 - pfirst);
    page.set_child(pfirst, None, 0);
    page.first += 1;
    persist(ctx, store, page)?;

    unlink_and_delete(ctx, store, &mut sibling)?;
    debug!(
        survivor = child.recid,
        dropped = sibling.recid,
        "merged left sibling into page"
    );
    Ok(())
}

/// Splice a dead page out of the leaf list (no-op for non-leaf pages, whose
/// link recids are zero) and free its record.
fn unlink_and_delete(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: &mut BPage,
) -> Result<()> {
    if page.previous != 0 {
        let mut left = load_page(ctx, store, page.previous)?;
        left.next = page.next;
        persist(ctx, store, &mut left)?;
    }
    if page.next != 0 {
        let mut right = load_page(ctx, store, page.next)?;
        right.previous = page.previous;
        persist(ctx, store, &mut right)?;
    }
    store.delete(page.recid)
}

/// Delete this page and everything beneath it, unlinking leaves from their
/// neighbours and freeing spilled value records along the way.
pub(crate) fn delete_subtree(
    ctx: &TreeContext,
    store: &mut impl RecordStore,
    page: BPage,
) -> Result<()> {
    if page.is_leaf {
        if page.next != 0 {
            let mut right = load_page(ctx, store, page.next)?;
            if right.previous != page.recid {
                return Err(KuraError::Corruption(
                    "leaf list back-pointer mismatch during delete".into(),
                ));
            }
            right.previous = page.previous;
            persist(ctx, store, &mut right)?;
        }
        if page.previous != 0 {
            let mut left = load_page(ctx, store, page.previous)?;
            if left.next != page.recid {
                return Err(KuraError::Corruption(
                    "leaf list forward-pointer mismatch during delete".into(),
                ));
            }
            left.next = page.next;
            persist(ctx, store, &mut left)?;
        }
        for slot in &page.values[page.first..] {
            if let Some(LeafValue::Lazy(recid)) = slot {
                store.delete(*recid)?;
            }
        }
    } else {
        for i in page.first..ctx.capacity() {
            let child = load_page(ctx, store, page.children[i])?;
            delete_subtree(ctx, store, child)?;
        }
    }
    store.delete(page.recid)
}

/// Copy every record reachable from the page persisted as `data` from `src`
/// to `dst`, preserving recids: child pages recursively, and for leaves the
/// spilled-value records their slots reference. Raw bytes are deserialized
/// only to recover the recids they mention and are never re-serialized.
pub(crate) fn defrag(
    ctx: &TreeContext,
    src: &mut impl RecordStore,
    dst: &mut impl RecordStore,
    recid: Recid,
    data: &[u8],
) -> Result<()> {
    let page = format::deserialize_partial(ctx, recid, data)?;
    if page.is_leaf {
        for value_recid in format::lazy_value_recids(ctx, recid, data)? {
            let value = src.fetch_raw(value_recid)?;
            dst.force_insert(value_recid, &value)?;
        }
        return Ok(());
    }
    for &child in &page.children {
        if child == 0 {
            continue;
        }
        let child_data = src.fetch_raw(child)?;
        dst.force_insert(child, &child_data)?;
        defrag(ctx, src, dst, child, &child_data)?;
    }
    Ok(())
}
