use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::Arc;

use crate::btree::{Index, IndexKind};
use crate::buffer::{BufferPool, LatchMode};
use crate::config::IndexConfig;
use crate::page::{PageNo, Record, Tuple};
use crate::rtree::Mbr;

const POOL_FRAMES: usize = 20_000;

pub fn init_log() {
    let _ = env_logger::Builder::from_default_env().is_test(true).try_init();
}

fn index(kind: IndexKind, config: IndexConfig) -> Index {
    let pool = Arc::new(BufferPool::new(POOL_FRAMES));
    Index::create(pool, kind, 0, "test", config).unwrap()
}

pub fn btree(page_capacity: usize, n_unique: usize) -> Index {
    index(IndexKind::Clustered, IndexConfig { page_capacity, n_unique })
}

pub fn rtree(page_capacity: usize) -> Index {
    index(IndexKind::Spatial, IndexConfig { page_capacity, n_unique: 1 })
}

pub fn key(k: i64) -> Tuple {
    Tuple::from_ints(&[k])
}

pub fn int_rec(k: i64) -> Record {
    Record::leaf(key(k), k.to_le_bytes().to_vec())
}

/// A record with a two column key.
pub fn pk_rec(a: i64, b: i64) -> Record {
    Record::leaf(Tuple::from_ints(&[a, b]), Vec::new())
}

/// `n` small rectangles spread over `[0, 100)²`, keyed by their position in the list.
pub fn spatial_entries(n: usize, seed: u64) -> Vec<(Mbr, Tuple)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let x = rng.gen_range(0.0..95.0);
            let y = rng.gen_range(0.0..95.0);
            let w = rng.gen_range(0.0..5.0);
            let h = rng.gen_range(0.0..5.0);
            (Mbr::new(x, y, x + w, y + h), key(i as i64))
        })
        .collect()
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum PageLayout {
    Internal { children: Vec<PageLayout> },
    Leaf { keys: Vec<Vec<i64>> },
}

#[derive(Deserialize, Debug)]
struct TreeLayout {
    page_capacity: usize,
    n_unique: usize,
    root: PageLayout,
}

/// Allocates the pages below `layout` and returns the level and records of the page itself.
fn build(index: &Index, layout: &PageLayout, levels: &mut Vec<Vec<PageNo>>) -> (usize, Vec<Record>) {
    match layout {
        PageLayout::Leaf { keys } => {
            let records = keys
                .iter()
                .map(|k| Record::leaf(Tuple::from_ints(k), Vec::new()))
                .collect();
            (0, records)
        }
        PageLayout::Internal { children } => {
            let mut level = 1;
            let mut records = Vec::new();
            for child in children {
                let (child_level, child_records) = build(index, child, levels);
                let mut guard = index.pool().allocate(index.space(), child_level).unwrap();
                let page = guard.page_mut();
                page.records = child_records;
                records.push(index.node_ptr_for(page));

                if levels.len() <= child_level {
                    levels.resize(child_level + 1, Vec::new());
                }
                levels[child_level].push(page.page_no());
                level = child_level + 1;
            }
            (level, records)
        }
    }
}

/// Builds a clustered index with exactly the page layout described in a JSON file.
pub fn load_tree<P: AsRef<std::path::Path>>(path: P) -> Index {
    let file = std::fs::File::open(path).expect("failed to find file");
    let layout: TreeLayout = serde_json::from_reader(file).unwrap();
    let index = btree(layout.page_capacity, layout.n_unique);

    let mut levels = Vec::new();
    let (level, records) = build(&index, &layout.root, &mut levels);
    {
        let mut root = index.fetch(index.root(), LatchMode::Exclusive).unwrap();
        let page = root.page_mut();
        page.level = level;
        page.records = records;
    }

    for pages in &levels {
        for (i, page_no) in pages.iter().enumerate() {
            let mut guard = index.fetch(*page_no, LatchMode::Exclusive).unwrap();
            let page = guard.page_mut();
            page.prev = if i > 0 { Some(pages[i - 1]) } else { None };
            page.next = pages.get(i + 1).copied();
        }
    }
    index
}
