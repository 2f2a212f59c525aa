//! Coalescing rules and the grouping pass run at flush time.
//!
//! A flush hands the drained items, in enqueue order, to [`coalesce`]:
//!
//! 1. items sharing a coalesce key are folded pairwise with
//!    [`CoalescingRule::merge`]; items without a key are kept as-is
//! 2. survivors are grouped by target aggregate, keeping first-seen order
//! 3. [`CoalescingRule::finish`] runs once per group for final ordering or
//!    cross-item pruning

use std::collections::HashMap;

/// Result of merging two items that share a coalesce key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merged<T> {
    /// The pair collapsed into one item.
    One(T),
    /// Both items survive. Later items with the same key merge into the second.
    Both(T, T),
}

/// Per-event-class coalescing semantics.
pub trait CoalescingRule<T>: Send + Sync + 'static {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Target aggregate the item is written to (one writer call per group).
    fn group_key(&self, item: &T) -> String;

    /// Identity under which items may collapse. `None` never collapses.
    fn coalesce_key(&self, item: &T) -> Option<String>;

    /// Folds `incoming` (enqueued later) into `existing`.
    fn merge(&self, existing: T, incoming: T) -> Merged<T>;

    /// Final pass over one group's survivors.
    fn finish(&self, _items: &mut Vec<T>) {}
}

/// One aggregate's share of a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct Group<T> {
    /// Aggregate key.
    pub key: String,
    /// Items to write, in application order.
    pub items: Vec<T>,
}

/// Output of the coalescing pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescedBatch<T> {
    /// Groups in first-seen order.
    pub groups: Vec<Group<T>>,
    /// Items drained from the queue.
    pub input_len: usize,
}

impl<T> CoalescedBatch<T> {
    /// Returns the number of items left after coalescing.
    #[must_use]
    pub fn output_len(&self) -> usize {
        self.groups.iter().map(|g| g.items.len()).sum()
    }
}

/// Applies `rule` to `items` (in enqueue order).
pub fn coalesce<T, R>(rule: &R, items: Vec<T>) -> CoalescedBatch<T>
where
    R: CoalescingRule<T> + ?Sized,
{
    let input_len = items.len();
    let mut slots: Vec<Option<T>> = Vec::with_capacity(items.len());
    let mut latest: HashMap<String, usize> = HashMap::new();

    for item in items {
        let Some(key) = rule.coalesce_key(&item) else {
            slots.push(Some(item));
            continue;
        };
        let existing = latest.get(&key).and_then(|&idx| slots[idx].take().map(|e| (idx, e)));
        match existing {
            None => {
                latest.insert(key, slots.len());
                slots.push(Some(item));
            }
            Some((idx, existing)) => match rule.merge(existing, item) {
                Merged::One(merged) => slots[idx] = Some(merged),
                Merged::Both(first, second) => {
                    slots[idx] = Some(first);
                    latest.insert(key, slots.len());
                    slots.push(Some(second));
                }
            },
        }
    }

    let mut groups: Vec<Group<T>> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();
    for item in slots.into_iter().flatten() {
        let key = rule.group_key(&item);
        let idx = *group_index.entry(key.clone()).or_insert_with(|| {
            groups.push(Group {
                key,
                items: Vec::new(),
            });
            groups.len() - 1
        });
        groups[idx].items.push(item);
    }
    for group in &mut groups {
        rule.finish(&mut group.items);
    }

    CoalescedBatch { groups, input_len }
}
