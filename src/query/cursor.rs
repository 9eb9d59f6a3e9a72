//! # Find Execution
//!
//! `FindCursor` runs a plan and streams hydrated records. Index-range and
//! full-scan plans stream lazily; unions and explicit sorts buffer their
//! window first. Offset and limit apply after filtering and sorting, and
//! a bare index range with no residual skips its offset by rank seek
//! instead of walking the skipped entries.
//!
//! A range cursor holds its index's shared structural lock for its whole
//! lifetime, so conflicting writers time out rather than racing it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use eyre::Result;
use hashbrown::HashSet;

use crate::btree::{Cursor, Tree};
use crate::guid::ObjectId;
use crate::index::{id_of_entry, IndexFile};
use crate::objects::ObjectFile;
use crate::serial::{decode_record, FieldTables, GenericObject};
use crate::storage::StructureReadGuard;

use super::filter::Filter;
use super::plan::{Order, Plan, RangeScan};

/// Everything execution needs to hydrate records.
#[derive(Clone, Copy)]
pub struct QueryContext<'a> {
    pub objects: &'a ObjectFile,
    pub indexes: &'a [IndexFile],
    pub tables: &'a FieldTables,
}

impl<'a> QueryContext<'a> {
    fn hydrate_id(&self, id: &ObjectId) -> Result<GenericObject> {
        let bytes = self.objects.load(id)?;
        decode_record(&bytes, self.tables)
    }

    fn hydrate_value(&self, value: &[u8]) -> Result<GenericObject> {
        let bytes = self.objects.resolve(value)?;
        decode_record(&bytes, self.tables)
    }
}

enum State<'a> {
    Done,
    Scan {
        cursor: Cursor,
        reverse: bool,
        residual: Option<Filter>,
    },
    Range {
        scan: RangeScan,
        _guard: StructureReadGuard,
        tree: Tree<'a>,
        cursor: Cursor,
    },
    Buffered(std::vec::IntoIter<GenericObject>),
}

pub struct FindCursor<'a> {
    ctx: QueryContext<'a>,
    state: State<'a>,
    skip: u64,
    remaining: Option<u64>,
}

impl<'a> FindCursor<'a> {
    pub fn new(
        ctx: QueryContext<'a>,
        plan: Plan,
        order: Order,
        offset: u64,
        limit: Option<u64>,
        ascending: bool,
    ) -> Result<Self> {
        match (&order, &plan) {
            (Order::Natural, Plan::Union(_)) | (Order::SortBy(_), _) => {
                let fields = match order {
                    Order::SortBy(fields) => fields,
                    Order::Natural => Vec::new(),
                };
                return Self::buffered(ctx, &plan, &fields, offset, limit, ascending);
            }
            _ => {}
        }

        let mut cursor = Self {
            ctx,
            state: State::Done,
            skip: offset,
            remaining: limit,
        };

        match plan {
            Plan::Empty => {}
            Plan::FullScan { residual, reverse } => {
                ctx.objects.note_full_scan();
                cursor.seed_scan(residual, reverse)?;
            }
            Plan::IndexRange(scan) => cursor.seed_range(scan)?,
            Plan::Union(_) => {} // handled above
        }
        Ok(cursor)
    }

    fn seed_scan(&mut self, residual: Option<Filter>, reverse: bool) -> Result<()> {
        let tree = self.ctx.objects.tree();
        let walker = if residual.is_none() && self.skip > 0 {
            // Offset counts matches; with no residual every entry is a
            // match, so the offset becomes a rank.
            let total = tree.len();
            if self.skip >= total {
                return Ok(());
            }
            let target = if reverse {
                total - 1 - self.skip
            } else {
                self.skip
            };
            let Some(pos) = tree.seek_rank(target)? else {
                return Ok(());
            };
            self.skip = 0;
            Cursor::starting_at(&tree, pos)
        } else if reverse {
            Cursor::after_last()
        } else {
            Cursor::before_first()
        };
        self.state = State::Scan {
            cursor: walker,
            reverse,
            residual,
        };
        Ok(())
    }

    fn seed_range(&mut self, scan: RangeScan) -> Result<()> {
        let index = &self.ctx.indexes[scan.index];
        let guard = index.lock_shared()?;
        let tree = Tree::new(index.file());

        let base = if scan.reverse {
            match &scan.end {
                Some(end) => tree.seek_before(end)?,
                None => tree.last()?,
            }
        } else {
            match &scan.start {
                Some(start) => tree.seek_at_or_after(start)?,
                None => tree.first()?,
            }
        };
        let Some(base) = base else {
            return Ok(());
        };

        let pos = if scan.residual.is_none() && self.skip > 0 {
            let target = if scan.reverse {
                match base.rank.checked_sub(self.skip) {
                    Some(target) => target,
                    None => return Ok(()),
                }
            } else {
                let target = base.rank + self.skip;
                if target >= tree.len() {
                    return Ok(());
                }
                target
            };
            let Some(pos) = tree.seek_rank(target)? else {
                return Ok(());
            };
            self.skip = 0;
            pos
        } else {
            base
        };

        let cursor = Cursor::starting_at(&tree, pos);
        self.state = State::Range {
            scan,
            _guard: guard,
            tree,
            cursor,
        };
        Ok(())
    }

    /// Next matching record, or `None` when the result set is exhausted.
    pub fn next_record(&mut self) -> Result<Option<GenericObject>> {
        loop {
            if self.remaining == Some(0) {
                self.state = State::Done;
                return Ok(None);
            }

            let obj = match &mut self.state {
                State::Done => return Ok(None),
                State::Buffered(iter) => match iter.next() {
                    Some(obj) => Some(obj),
                    None => {
                        self.state = State::Done;
                        return Ok(None);
                    }
                },
                State::Scan {
                    cursor,
                    reverse,
                    residual,
                } => {
                    let _lock = self.ctx.objects.file().lock_shared()?;
                    let tree = self.ctx.objects.tree();
                    let entry = if *reverse {
                        cursor.prev(&tree)?
                    } else {
                        cursor.next(&tree)?
                    };
                    let Some((_, value)) = entry else {
                        self.state = State::Done;
                        return Ok(None);
                    };
                    let obj = self.ctx.hydrate_value(&value)?;
                    match residual {
                        Some(f) if !f.matches(&obj) => None,
                        _ => Some(obj),
                    }
                }
                State::Range {
                    scan,
                    tree,
                    cursor,
                    _guard,
                } => {
                    let entry = if scan.reverse {
                        cursor.prev(tree)?
                    } else {
                        cursor.next(tree)?
                    };
                    let Some((key, _)) = entry else {
                        self.state = State::Done;
                        return Ok(None);
                    };
                    let out_of_range = if scan.reverse {
                        scan.start.as_deref().is_some_and(|s| key.as_slice() < s)
                    } else {
                        scan.end.as_deref().is_some_and(|e| key.as_slice() >= e)
                    };
                    if out_of_range {
                        self.state = State::Done;
                        return Ok(None);
                    }
                    let id = id_of_entry(&key)?;
                    let obj = self.ctx.hydrate_id(&id)?;
                    match &scan.residual {
                        Some(f) if !f.matches(&obj) => None,
                        _ => Some(obj),
                    }
                }
            };

            let Some(obj) = obj else {
                continue; // residual rejected the record
            };
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
            return Ok(Some(obj));
        }
    }

    pub fn collect_all(mut self) -> Result<Vec<GenericObject>> {
        let mut out = Vec::new();
        while let Some(obj) = self.next_record()? {
            out.push(obj);
        }
        Ok(out)
    }

    // -- buffered path -------------------------------------------------

    fn buffered(
        ctx: QueryContext<'a>,
        plan: &Plan,
        sort_fields: &[String],
        offset: u64,
        limit: Option<u64>,
        ascending: bool,
    ) -> Result<Self> {
        let matches = collect_matches(&ctx, plan)?;
        let spec = SortSpec::parse(sort_fields, ascending);
        let items = sort_window(matches, &spec, offset, limit);
        Ok(Self {
            ctx,
            state: State::Buffered(items.into_iter()),
            skip: 0,
            remaining: None,
        })
    }
}

fn collect_matches(ctx: &QueryContext<'_>, plan: &Plan) -> Result<Vec<GenericObject>> {
    match plan {
        Plan::Empty => Ok(Vec::new()),
        Plan::FullScan { residual, .. } => {
            ctx.objects.note_full_scan();
            let _lock = ctx.objects.file().lock_shared()?;
            let tree = ctx.objects.tree();
            let mut cursor = Cursor::before_first();
            let mut out = Vec::new();
            while let Some((_, value)) = cursor.next(&tree)? {
                let obj = ctx.hydrate_value(&value)?;
                if residual.as_ref().is_none_or(|f| f.matches(&obj)) {
                    out.push(obj);
                }
            }
            Ok(out)
        }
        Plan::IndexRange(scan) => collect_range(ctx, scan),
        Plan::Union(scans) => {
            let mut seen: HashSet<ObjectId> = HashSet::new();
            let mut out = Vec::new();
            for scan in scans {
                for obj in collect_range(ctx, scan)? {
                    if seen.insert(obj.id) {
                        out.push(obj);
                    }
                }
            }
            Ok(out)
        }
    }
}

fn collect_range(ctx: &QueryContext<'_>, scan: &RangeScan) -> Result<Vec<GenericObject>> {
    let index = &ctx.indexes[scan.index];
    let _guard = index.lock_shared()?;
    let tree = Tree::new(index.file());

    let base = match &scan.start {
        Some(start) => tree.seek_at_or_after(start)?,
        None => tree.first()?,
    };
    let Some(base) = base else {
        return Ok(Vec::new());
    };

    let mut cursor = Cursor::starting_at(&tree, base);
    let mut out = Vec::new();
    while let Some((key, _)) = cursor.next(&tree)? {
        if scan.end.as_deref().is_some_and(|e| key.as_slice() >= e) {
            break;
        }
        let obj = ctx.hydrate_id(&id_of_entry(&key)?)?;
        if scan.residual.as_ref().is_none_or(|f| f.matches(&obj)) {
            out.push(obj);
        }
    }
    Ok(out)
}

// -- sorting -----------------------------------------------------------

struct SortSpec {
    fields: Vec<(String, bool)>,
    ascending: bool,
}

impl SortSpec {
    fn parse(fields: &[String], ascending: bool) -> Self {
        let fields = fields
            .iter()
            .map(|f| match f.strip_prefix('-') {
                Some(name) => (name.to_owned(), true),
                None => (f.clone(), false),
            })
            .collect();
        Self { fields, ascending }
    }

    fn compare(&self, a: &GenericObject, b: &GenericObject) -> Ordering {
        let mut ord = Ordering::Equal;
        for (name, descending) in &self.fields {
            ord = a.field(name).compare(&b.field(name));
            if *descending {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                break;
            }
        }
        if ord == Ordering::Equal {
            ord = a.id.cmp(&b.id);
        }
        if self.ascending {
            ord
        } else {
            ord.reverse()
        }
    }
}

struct HeapItem<'s> {
    obj: GenericObject,
    spec: &'s SortSpec,
}

impl PartialEq for HeapItem<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapItem<'_> {}
impl PartialOrd for HeapItem<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.spec.compare(&self.obj, &other.obj)
    }
}

/// Sorts and pages in one pass. With a limit, a max-heap of
/// `offset + limit` items bounds the window instead of sorting the whole
/// match set.
fn sort_window(
    matches: Vec<GenericObject>,
    spec: &SortSpec,
    offset: u64,
    limit: Option<u64>,
) -> Vec<GenericObject> {
    let offset = offset as usize;
    match limit {
        Some(limit) => {
            let window = offset + limit as usize;
            if window == 0 {
                return Vec::new();
            }
            let mut heap: BinaryHeap<HeapItem<'_>> = BinaryHeap::with_capacity(window + 1);
            for obj in matches {
                heap.push(HeapItem { obj, spec });
                if heap.len() > window {
                    heap.pop();
                }
            }
            heap.into_sorted_vec()
                .into_iter()
                .map(|item| item.obj)
                .skip(offset)
                .collect()
        }
        None => {
            let mut matches = matches;
            matches.sort_by(|a, b| spec.compare(a, b));
            matches.into_iter().skip(offset).collect()
        }
    }
}
