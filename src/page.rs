//! In-memory page layout: keys, records, slots and the in-page binary search.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;

use crate::rtree::Mbr;

pub type PageNo = u32;

/// Identity of a page: the tablespace and the page number inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    pub space: u32,
    pub page_no: PageNo,
}

impl PageId {
    pub fn new(space: u32, page_no: PageNo) -> PageId {
        PageId { space, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.page_no)
    }
}

/// A single key column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field {
    Int(i64),
    Bytes(Vec<u8>),
}

impl From<i64> for Field {
    fn from(v: i64) -> Field {
        Field::Int(v)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Field {
        Field::Bytes(v.as_bytes().to_vec())
    }
}

/// An ordered list of key fields.
///
/// Comparison against a record key only looks at the fields both sides have, so a tuple holding
/// the first `n` fields of a key compares equal to every record sharing that prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Tuple {
    fields: SmallVec<[Field; 4]>,
}

impl Tuple {
    pub fn new<I: IntoIterator<Item = Field>>(fields: I) -> Tuple {
        Tuple {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn from_ints(values: &[i64]) -> Tuple {
        Tuple::new(values.iter().map(|v| Field::Int(*v)))
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The first `n` fields, or the whole tuple if it is shorter.
    pub fn prefix(&self, n: usize) -> Tuple {
        Tuple {
            fields: self.fields.iter().take(n).cloned().collect(),
        }
    }

    /// Orders `self` relative to `other` over their common prefix.
    pub fn compare(&self, other: &Tuple) -> Ordering {
        for (a, b) in self.fields.iter().zip(other.fields.iter()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match field {
                Field::Int(v) => write!(f, "{}", v)?,
                Field::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b))?,
            }
        }
        write!(f, ")")
    }
}

/// A user record or, on non-leaf pages, a node pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: Tuple,
    #[serde(default)]
    pub mbr: Option<Mbr>,
    #[serde(default)]
    pub child: Option<PageNo>,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub trx_id: u64,
}

impl Record {
    pub fn leaf(key: Tuple, value: Vec<u8>) -> Record {
        Record {
            key,
            mbr: None,
            child: None,
            value,
            deleted: false,
            trx_id: 0,
        }
    }

    pub fn node_ptr(key: Tuple, child: PageNo) -> Record {
        Record {
            child: Some(child),
            ..Record::leaf(key, Vec::new())
        }
    }

    pub fn spatial(mbr: Mbr, key: Tuple, value: Vec<u8>) -> Record {
        Record {
            mbr: Some(mbr),
            ..Record::leaf(key, value)
        }
    }

    pub fn spatial_node_ptr(mbr: Mbr, child: PageNo) -> Record {
        Record {
            mbr: Some(mbr),
            child: Some(child),
            ..Record::leaf(Tuple::default(), Vec::new())
        }
    }
}

/// A position inside a page. The two sentinels sit before the first and after the last record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Infimum,
    Rec(usize),
    Supremum,
}

impl Slot {
    pub fn is_user_rec(&self) -> bool {
        matches!(self, Slot::Rec(_))
    }
}

/// How an in-page search positions relative to the search tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCurMode {
    /// Last record strictly less than the tuple.
    L,
    /// Last record less than or equal to the tuple.
    Le,
    /// First record strictly greater than the tuple.
    G,
    /// First record greater than or equal to the tuple.
    Ge,
}

/// Content of a buffer frame.
#[derive(Debug, Clone)]
pub struct Page {
    pub(crate) id: PageId,
    pub(crate) level: usize,
    pub(crate) ssn: u64,
    pub(crate) prev: Option<PageNo>,
    pub(crate) next: Option<PageNo>,
    pub(crate) records: Vec<Record>,
}

impl Page {
    pub fn new(id: PageId, level: usize) -> Page {
        Page {
            id,
            level,
            ssn: 0,
            prev: None,
            next: None,
            records: Vec::new(),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn page_no(&self) -> PageNo {
        self.id.page_no
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Split sequence number stamped on the page by its last split.
    pub fn ssn(&self) -> u64 {
        self.ssn
    }

    pub fn prev(&self) -> Option<PageNo> {
        self.prev
    }

    pub fn next(&self) -> Option<PageNo> {
        self.next
    }

    pub fn n_recs(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn rec(&self, slot: Slot) -> Option<&Record> {
        match slot {
            Slot::Rec(i) => self.records.get(i),
            _ => None,
        }
    }

    pub fn first_slot(&self) -> Slot {
        self.next_slot(Slot::Infimum)
    }

    pub fn last_slot(&self) -> Slot {
        self.prev_slot(Slot::Supremum)
    }

    pub fn next_slot(&self, slot: Slot) -> Slot {
        let next = match slot {
            Slot::Infimum => 0,
            Slot::Rec(i) => i + 1,
            Slot::Supremum => return Slot::Supremum,
        };
        if next < self.records.len() {
            Slot::Rec(next)
        } else {
            Slot::Supremum
        }
    }

    pub fn prev_slot(&self, slot: Slot) -> Slot {
        match slot {
            Slot::Infimum | Slot::Rec(0) => Slot::Infimum,
            Slot::Rec(i) => Slot::Rec(i - 1),
            Slot::Supremum if self.records.is_empty() => Slot::Infimum,
            Slot::Supremum => Slot::Rec(self.records.len() - 1),
        }
    }

    /// Binary search over the record keys.
    ///
    /// `L` and `Le` fall back to the infimum when no record qualifies, `G` and `Ge` to the
    /// supremum.
    pub fn search(&self, tuple: &Tuple, mode: PageCurMode) -> Slot {
        let n = self.records.len();
        match mode {
            PageCurMode::Le | PageCurMode::G => {
                let pos = self
                    .records
                    .partition_point(|r| tuple.compare(&r.key) != Ordering::Less);
                if mode == PageCurMode::Le {
                    if pos == 0 { Slot::Infimum } else { Slot::Rec(pos - 1) }
                } else if pos == n {
                    Slot::Supremum
                } else {
                    Slot::Rec(pos)
                }
            }
            PageCurMode::L | PageCurMode::Ge => {
                let pos = self
                    .records
                    .partition_point(|r| tuple.compare(&r.key) == Ordering::Greater);
                if mode == PageCurMode::L {
                    if pos == 0 { Slot::Infimum } else { Slot::Rec(pos - 1) }
                } else if pos == n {
                    Slot::Supremum
                } else {
                    Slot::Rec(pos)
                }
            }
        }
    }

    /// Where a record with `key` belongs: `Ok` if an equal key is already present.
    pub fn insert_position(&self, key: &Tuple) -> Result<usize, usize> {
        self.records.binary_search_by(|r| r.key.cmp(key))
    }

    pub(crate) fn insert_at(&mut self, pos: usize, rec: Record) {
        self.records.insert(pos, rec);
    }

    pub(crate) fn remove(&mut self, pos: usize) -> Record {
        self.records.remove(pos)
    }

    /// Position of the node pointer to `child`.
    pub fn child_position(&self, child: PageNo) -> Option<usize> {
        self.records.iter().position(|r| r.child == Some(child))
    }

    /// Smallest rectangle covering every record of the page.
    pub fn union_mbr(&self) -> Option<Mbr> {
        Mbr::union_all(self.records.iter().filter_map(|r| r.mbr.as_ref()))
    }
}

/// Copy of a page's identity and of some of its records, detached from the frame and its latch.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub id: PageId,
    pub level: usize,
    pub ssn: u64,
    pub modify_clock: usize,
    pub records: Vec<Record>,
}

impl PageSnapshot {
    /// Copies the header fields of `page`, without records.
    pub fn header(page: &Page, modify_clock: usize) -> PageSnapshot {
        PageSnapshot {
            id: page.id,
            level: page.level,
            ssn: page.ssn,
            modify_clock,
            records: Vec::new(),
        }
    }
}
