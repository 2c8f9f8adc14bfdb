use std::collections::HashMap;
use std::hash::Hash;

/// Union-find whose representative is always the smallest member, so class
/// identity does not depend on union order.
#[derive(Debug, Clone)]
pub struct DisjointSets<T> {
    parent: HashMap<T, T>,
}

impl<T> Default for DisjointSets<T> {
    fn default() -> Self {
        Self { parent: HashMap::new() }
    }
}

impl<T: Copy + Eq + Hash + Ord> DisjointSets<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, x: T) {
        self.parent.entry(x).or_insert(x);
    }

    pub fn contains(&self, x: T) -> bool {
        self.parent.contains_key(&x)
    }

    /// Representative of `x`; an unknown element is its own class.
    pub fn find(&self, x: T) -> T {
        let mut current = x;
        while let Some(&parent) = self.parent.get(&current) {
            if parent == current {
                break;
            }
            current = parent;
        }
        current
    }

    pub fn union(&mut self, a: T, b: T) {
        self.insert(a);
        self.insert(b);
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent.insert(child, root);
        // Keep chains short: repoint everything that reached the old root.
        let stale: Vec<T> = self.parent.iter().filter(|&(_, &p)| p == child).map(|(&k, _)| k).collect();
        for k in stale {
            self.parent.insert(k, root);
        }
    }

    pub fn same(&self, a: T, b: T) -> bool {
        a == b || self.find(a) == self.find(b)
    }

    /// Every member of the class of `x`, sorted.
    pub fn members(&self, x: T) -> Vec<T> {
        let root = self.find(x);
        let mut members: Vec<T> = self.parent.keys().copied().filter(|&k| self.find(k) == root).collect();
        if members.is_empty() {
            members.push(x);
        }
        members.sort();
        members
    }

    /// All classes, each sorted, ordered by representative.
    pub fn classes(&self) -> Vec<Vec<T>> {
        let mut by_root: HashMap<T, Vec<T>> = HashMap::new();
        for &k in self.parent.keys() {
            by_root.entry(self.find(k)).or_default().push(k);
        }
        let mut classes: Vec<(T, Vec<T>)> = by_root.into_iter().collect();
        classes.sort_by_key(|(root, _)| *root);
        classes
            .into_iter()
            .map(|(_, mut members)| {
                members.sort();
                members
            })
            .collect()
    }
}
