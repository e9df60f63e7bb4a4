//! Minimum bounding rectangles and the search predicates evaluated on them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Mbr {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Mbr {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Mbr {
        Mbr {
            xmin: x1.min(x2),
            ymin: y1.min(y2),
            xmax: x1.max(x2),
            ymax: y1.max(y2),
        }
    }

    pub fn point(x: f64, y: f64) -> Mbr {
        Mbr::new(x, y, x, y)
    }

    pub fn area(&self) -> f64 {
        (self.xmax - self.xmin) * (self.ymax - self.ymin)
    }

    /// `other` lies inside `self`, borders included.
    pub fn contains(&self, other: &Mbr) -> bool {
        self.xmin <= other.xmin
            && self.ymin <= other.ymin
            && self.xmax >= other.xmax
            && self.ymax >= other.ymax
    }

    /// `self` lies inside `other`.
    pub fn within(&self, other: &Mbr) -> bool {
        other.contains(self)
    }

    /// The rectangles share at least one point.
    pub fn intersects(&self, other: &Mbr) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }

    pub fn disjoint(&self, other: &Mbr) -> bool {
        !self.intersects(other)
    }

    pub fn union(&self, other: &Mbr) -> Mbr {
        Mbr {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }

    pub fn union_all<'a>(mut mbrs: impl Iterator<Item = &'a Mbr>) -> Option<Mbr> {
        let first = *mbrs.next()?;
        Some(mbrs.fold(first, |acc, m| acc.union(m)))
    }

    /// Area growth of `self` if it had to cover `other` too, and the resulting area.
    pub fn enlargement(&self, other: &Mbr) -> (f64, f64) {
        let area = self.union(other).area();
        (area - self.area(), area)
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0)
    }
}

/// What a spatial search looks for. Predicates read "query ⟨mode⟩ record".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// The query contains the record.
    Contain,
    Intersect,
    /// The query lies within the record.
    Within,
    Disjoint,
    Equal,
    /// Descent choosing the subtree that receives a new entry.
    Insert,
    /// The node pointer to a given child page.
    GetFather,
    /// One exact entry, identified by rectangle and key.
    Locate,
}

impl SearchMode {
    /// Modes that look for one specific entry instead of a set of matches.
    pub fn is_locate(&self) -> bool {
        matches!(self, SearchMode::Locate | SearchMode::GetFather)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Predicate {
    Contains,
    Within,
    Intersects,
    Disjoint,
    Equal,
    ContainsOrIntersects,
    DisjointOrIntersects,
}

impl Predicate {
    fn eval(self, query: &Mbr, rec: &Mbr) -> bool {
        match self {
            Predicate::Contains => query.contains(rec),
            Predicate::Within => query.within(rec),
            Predicate::Intersects => query.intersects(rec),
            Predicate::Disjoint => query.disjoint(rec),
            Predicate::Equal => query == rec,
            Predicate::ContainsOrIntersects => query.contains(rec) || query.intersects(rec),
            Predicate::DisjointOrIntersects => query.disjoint(rec) || query.intersects(rec),
        }
    }
}

/// The predicates of one search mode, chosen once when the search is opened.
///
/// On non-leaf levels the predicate must admit every subtree that may hold a match, so it is
/// looser than the leaf predicate for most modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    mode: SearchMode,
    node: Predicate,
    leaf: Predicate,
}

impl Strategy {
    pub fn new(mode: SearchMode) -> Strategy {
        use Predicate::*;
        let (node, leaf) = match mode {
            SearchMode::Contain => (ContainsOrIntersects, Contains),
            SearchMode::Intersect => (ContainsOrIntersects, Intersects),
            SearchMode::Equal => (ContainsOrIntersects, Equal),
            SearchMode::Disjoint => (DisjointOrIntersects, Disjoint),
            SearchMode::Within => (Within, Within),
            SearchMode::Locate => (Within, Equal),
            SearchMode::Insert => (Within, Within),
            SearchMode::GetFather => (Within, Equal),
        };
        Strategy { mode, node, leaf }
    }

    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    pub fn evaluate(&self, query: &Mbr, rec: &Mbr, at_leaf: bool) -> bool {
        if at_leaf {
            self.leaf.eval(query, rec)
        } else {
            self.node.eval(query, rec)
        }
    }
}
