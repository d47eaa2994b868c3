//! Ordered placement of children by display name.

use std::{cmp::Ordering, fmt, sync::Arc};

type CompareFn = dyn Fn(&str, &str) -> Ordering + Send + Sync;

/// A total order over display names.
///
/// Names that compare `Equal` are taken to denote the same logical entry, so
/// a comparator must only call two names equal if they really are the same
/// test or folder.
#[derive(Clone)]
pub struct Comparator {
    name: &'static str,
    compare: Arc<CompareFn>,
}

impl Comparator {
    pub fn lexical() -> Self {
        Self::custom("lexical", |a, b| a.cmp(b))
    }

    /// Orders case-insensitively, falling back to a byte comparison so that
    /// `Foo` and `foo` stay distinct entries.
    pub fn case_insensitive() -> Self {
        Self::custom("case-insensitive", |a, b| {
            a.chars()
                .flat_map(char::to_lowercase)
                .cmp(b.chars().flat_map(char::to_lowercase))
                .then_with(|| a.cmp(b))
        })
    }

    pub fn custom<F>(name: &'static str, compare: F) -> Self
    where
        F: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
    {
        Self {
            name,
            compare: Arc::new(compare),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        (self.compare)(a, b)
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Comparator({})", self.name)
    }
}

/// Where a candidate ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum Placement<T> {
    Inserted(usize),

    /// The candidate tied with an existing entry and took its slot.
    Replaced { index: usize, previous: T },
}

impl<T> Placement<T> {
    pub fn index(&self) -> usize {
        match self {
            Placement::Inserted(index) | Placement::Replaced { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Insert(usize),
    Tie(usize),
}

/// Places `candidate` into `siblings`.
///
/// With no comparator the candidate goes to the front (most recent first).
/// Otherwise `siblings` must already be sorted under `comparator`; the
/// candidate is placed by binary search and replaces an entry whose display
/// name compares equal.
pub fn insert_sorted<T, F>(
    siblings: &mut Vec<T>,
    candidate: T,
    comparator: Option<&Comparator>,
    display_name: F,
) -> Placement<T>
where
    F: Fn(&T) -> &str,
{
    profiling::scope!("insert_sorted");

    let slot = match comparator {
        Some(comparator) if !siblings.is_empty() => search(
            siblings,
            display_name(&candidate),
            comparator,
            &display_name,
            0,
            siblings.len() - 1,
        ),
        _ => Slot::Insert(0),
    };

    match slot {
        Slot::Insert(index) => {
            siblings.insert(index, candidate);
            Placement::Inserted(index)
        }
        Slot::Tie(index) => {
            let previous = std::mem::replace(&mut siblings[index], candidate);
            Placement::Replaced { index, previous }
        }
    }
}

/// Binary search over the inclusive range `[left, right]`.
fn search<T, F>(
    siblings: &[T],
    name: &str,
    comparator: &Comparator,
    display_name: &F,
    left: usize,
    right: usize,
) -> Slot
where
    F: Fn(&T) -> &str,
{
    let mid = left + (right - left) / 2;

    match comparator.compare(name, display_name(&siblings[mid])) {
        Ordering::Equal => Slot::Tie(mid),
        Ordering::Less if left == right => Slot::Insert(left),
        Ordering::Greater if left == right => Slot::Insert(left + 1),
        Ordering::Less if mid == left => Slot::Insert(left),
        Ordering::Less => search(siblings, name, comparator, display_name, left, mid - 1),
        Ordering::Greater => search(siblings, name, comparator, display_name, mid + 1, right),
    }
}
