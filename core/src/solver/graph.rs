//! Bipartite entity/constraint graph over the active constraints.
//!
//! Only free entities are nodes that connect constraints: two constraints that
//! share nothing but a fixed entity belong to independent components.

use crate::constraint::Constraint;
use crate::error::Result;
use crate::store::{Entity, EntityId, EntityStore};
use std::collections::{HashMap, HashSet};

/// Disjoint sets over `0..n` with path compression and union by rank.
pub(crate) struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub(crate) fn new(n: usize) -> Self {
        Self { parent: (0..n).collect(), rank: vec![0; n] }
    }

    pub(crate) fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    pub(crate) fn union(&mut self, x: usize, y: usize) {
        let rx = self.find(x);
        let ry = self.find(y);
        if rx == ry {
            return;
        }
        match self.rank[rx].cmp(&self.rank[ry]) {
            std::cmp::Ordering::Less => self.parent[rx] = ry,
            std::cmp::Ordering::Greater => self.parent[ry] = rx,
            std::cmp::Ordering::Equal => {
                self.parent[ry] = rx;
                self.rank[rx] += 1;
            }
        }
    }
}

pub struct ConstraintGraph<'c> {
    constraints: Vec<&'c Constraint>,
    /// Free entities in creation order.
    free: Vec<EntityId>,
    seq: HashMap<EntityId, u64>,
    /// Free entity -> indices into `constraints`.
    adjacency: HashMap<EntityId, Vec<usize>>,
    /// Constraint index -> free entities it references.
    touched: Vec<Vec<EntityId>>,
}

impl<'c> ConstraintGraph<'c> {
    /// Build the graph over `constraints` (creation order). The entities of
    /// `store` accepted by `is_free` are the unknowns; every other entity is
    /// an input.
    ///
    /// Free entities that no constraint references are nodes too, so each
    /// ends up in a component of its own.
    pub fn build(
        store: &EntityStore,
        constraints: &[&'c Constraint],
        is_free: impl Fn(&Entity) -> bool,
    ) -> Result<Self> {
        let mut seq = HashMap::new();
        let mut free = Vec::new();
        for entity in store.iter() {
            seq.insert(entity.id, entity.seq);
            if is_free(entity) {
                free.push(entity.id);
            }
        }
        let free_set: HashSet<EntityId> = free.iter().copied().collect();

        let mut adjacency: HashMap<EntityId, Vec<usize>> = HashMap::new();
        let mut touched = Vec::with_capacity(constraints.len());
        for (ci, constraint) in constraints.iter().enumerate() {
            let mut mine = Vec::new();
            for entity in constraint.entities() {
                store.get(entity)?;
                if free_set.contains(&entity) {
                    adjacency.entry(entity).or_default().push(ci);
                    mine.push(entity);
                }
            }
            mine.sort_by_key(|e| seq.get(e).copied().unwrap_or(u64::MAX));
            touched.push(mine);
        }

        Ok(Self { constraints: constraints.to_vec(), free, seq, adjacency, touched })
    }

    pub fn constraints(&self) -> &[&'c Constraint] {
        &self.constraints
    }

    pub fn free_entities(&self) -> &[EntityId] {
        &self.free
    }

    pub fn seq(&self, entity: EntityId) -> u64 {
        self.seq.get(&entity).copied().unwrap_or(u64::MAX)
    }

    /// Free entities referenced by constraint `ci`, in creation order.
    pub fn touched(&self, ci: usize) -> &[EntityId] {
        &self.touched[ci]
    }

    pub fn constraints_of(&self, entity: EntityId) -> &[usize] {
        self.adjacency.get(&entity).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Constraints that reference no free entity.
    pub fn fixed_only(&self) -> Vec<usize> {
        (0..self.constraints.len()).filter(|&ci| self.touched[ci].is_empty()).collect()
    }

    /// Connected components of free entities, each in creation order,
    /// ordered by their oldest entity.
    pub fn components(&self) -> Vec<Vec<EntityId>> {
        let index: HashMap<EntityId, usize> = self.free.iter().enumerate().map(|(i, e)| (*e, i)).collect();
        let mut sets = UnionFind::new(self.free.len());
        for touched in &self.touched {
            let mut members = touched.iter().filter_map(|e| index.get(e));
            if let Some(&first) = members.next() {
                for &other in members {
                    sets.union(first, other);
                }
            }
        }

        let mut by_root: HashMap<usize, usize> = HashMap::new();
        let mut components: Vec<Vec<EntityId>> = Vec::new();
        for (i, entity) in self.free.iter().enumerate() {
            let root = sets.find(i);
            let slot = *by_root.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[slot].push(*entity);
        }
        components
    }
}
