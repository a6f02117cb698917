//! Comparator-ordered heaps keyed by document id.
//!
//! [`IdHeap`] is a binary max-heap with an id index so entries can be
//! updated or removed in O(log n). [`MinMaxHeap`] pairs a max-heap with a
//! reversed one to answer both ends.

use std::cmp::Ordering;
use std::sync::Arc;

use oplive_core::{DocId, Document};
use rustc_hash::FxHashMap;

pub type Comparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

pub struct IdHeap {
    cmp: Comparator,
    items: Vec<(DocId, Document)>,
    index: FxHashMap<DocId, usize>,
}

impl IdHeap {
    pub fn new(cmp: Comparator) -> Self {
        Self { cmp, items: Vec::new(), index: FxHashMap::default() }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn has(&self, id: &str) -> bool { self.index.contains_key(id) }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.index.get(id).map(|&i| &self.items[i].1)
    }

    /// Id of the greatest element under the comparator.
    pub fn max_id(&self) -> Option<&DocId> {
        self.items.first().map(|(id, _)| id)
    }

    /// Insert or replace.
    pub fn set(&mut self, id: DocId, doc: Document) {
        if let Some(&i) = self.index.get(&id) {
            self.items[i].1 = doc;
            let i = self.sift_up(i);
            self.sift_down(i);
            return;
        }
        let i = self.items.len();
        self.index.insert(id.clone(), i);
        self.items.push((id, doc));
        self.sift_up(i);
    }

    pub fn remove(&mut self, id: &str) -> Option<Document> {
        let i = self.index.remove(id)?;
        let last = self.items.len() - 1;
        if i != last {
            self.items.swap(i, last);
            if let Some(slot) = self.index.get_mut(&self.items[i].0) {
                *slot = i;
            }
        }
        let (_, doc) = self.items.pop()?;
        if i < self.items.len() {
            let i = self.sift_up(i);
            self.sift_down(i);
        }
        Some(doc)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    /// Entries in heap order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = (&DocId, &Document)> {
        self.items.iter().map(|(id, d)| (id, d))
    }

    pub fn ids(&self) -> Vec<DocId> {
        self.items.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Documents sorted ascending under the comparator.
    pub fn sorted(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.items.iter().map(|(_, d)| d.clone()).collect();
        docs.sort_by(|a, b| (self.cmp)(a, b));
        docs
    }

    fn greater(&self, i: usize, j: usize) -> bool {
        (self.cmp)(&self.items[i].1, &self.items[j].1) == Ordering::Greater
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.items.swap(i, j);
        for k in [i, j] {
            if let Some(slot) = self.index.get_mut(&self.items[k].0) {
                *slot = k;
            }
        }
    }

    fn sift_up(&mut self, mut i: usize) -> usize {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.greater(i, parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
        i
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.items.len();
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut best = i;
            if l < n && self.greater(l, best) {
                best = l;
            }
            if r < n && self.greater(r, best) {
                best = r;
            }
            if best == i {
                return;
            }
            self.swap(i, best);
            i = best;
        }
    }
}

pub struct MinMaxHeap {
    max: IdHeap,
    min: IdHeap,
}

impl MinMaxHeap {
    pub fn new(cmp: Comparator) -> Self {
        let rev = Arc::clone(&cmp);
        let reversed: Comparator = Arc::new(move |a, b| rev(b, a));
        Self { max: IdHeap::new(cmp), min: IdHeap::new(reversed) }
    }

    pub fn len(&self) -> usize { self.max.len() }
    pub fn is_empty(&self) -> bool { self.max.is_empty() }
    pub fn has(&self, id: &str) -> bool { self.max.has(id) }
    pub fn get(&self, id: &str) -> Option<&Document> { self.max.get(id) }
    pub fn max_id(&self) -> Option<&DocId> { self.max.max_id() }
    pub fn min_id(&self) -> Option<&DocId> { self.min.max_id() }

    pub fn set(&mut self, id: DocId, doc: Document) {
        self.min.set(id.clone(), doc.clone());
        self.max.set(id, doc);
    }

    pub fn remove(&mut self, id: &str) -> Option<Document> {
        self.min.remove(id);
        self.max.remove(id)
    }

    pub fn clear(&mut self) {
        self.max.clear();
        self.min.clear();
    }

    pub fn ids(&self) -> Vec<DocId> { self.max.ids() }
    pub fn sorted(&self) -> Vec<Document> { self.max.sorted() }
}
