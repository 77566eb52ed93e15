/// Double-buffered per-node partial likelihoods with dirty/changed flags,
/// indexed in parallel with the tree's node arena.
#[derive(Debug, Clone)]
pub struct PartialLikelihoodCache {
    n_states: usize,
    partials: Vec<[Vec<f64>; 2]>,
    scaling: Vec<[f64; 2]>,
    active: Vec<usize>,
    dirty: Vec<bool>,
    changed: Vec<bool>,
}

impl PartialLikelihoodCache {
    pub fn new(n_nodes: usize, n_states: usize) -> Self {
        let mut cache = Self {
            n_states,
            partials: Vec::new(),
            scaling: Vec::new(),
            active: Vec::new(),
            dirty: Vec::new(),
            changed: Vec::new(),
        };
        cache.resize(n_nodes, n_states);
        cache
    }

    /// Reallocates every slot and marks all nodes dirty.
    pub fn resize(&mut self, n_nodes: usize, n_states: usize) {
        self.n_states = n_states;
        self.partials = vec![[vec![0.0; 2 * n_states], vec![0.0; 2 * n_states]]; n_nodes];
        self.scaling = vec![[0.0; 2]; n_nodes];
        self.active = vec![0; n_nodes];
        self.dirty = vec![true; n_nodes];
        self.changed = vec![false; n_nodes];
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn is_dirty(&self, node: usize) -> bool {
        self.dirty[node]
    }

    pub fn is_changed(&self, node: usize) -> bool {
        self.changed[node]
    }

    pub fn active_index(&self, node: usize) -> usize {
        self.active[node]
    }

    pub fn partial(&self, node: usize) -> &[f64] {
        &self.partials[node][self.active[node]]
    }

    pub fn scale(&self, node: usize) -> f64 {
        self.scaling[node][self.active[node]]
    }

    pub fn store(&mut self, node: usize, values: &[f64], scale: f64) {
        let slot = self.active[node];
        self.partials[node][slot].copy_from_slice(values);
        self.scaling[node][slot] = scale;
        self.dirty[node] = false;
    }

    /// Marks one node dirty, flipping its buffer the first time it changes
    /// in this round. Returns false if it was already dirty.
    pub fn flag_dirty(&mut self, node: usize) -> bool {
        if self.dirty[node] {
            return false;
        }
        self.dirty[node] = true;
        if !self.changed[node] {
            self.active[node] ^= 1;
            self.changed[node] = true;
        }
        true
    }

    pub fn flag_all_dirty(&mut self) {
        for node in 0..self.len() {
            self.flag_dirty(node);
        }
    }

    /// Accepts the current slots. Nodes that were never computed stay dirty.
    pub fn keep(&mut self) {
        self.changed.fill(false);
    }

    /// Flips changed nodes back to their accepted slot. A node that is dirty
    /// without having changed has no accepted value and stays dirty.
    pub fn restore(&mut self) {
        for node in 0..self.len() {
            if self.changed[node] {
                self.active[node] ^= 1;
                self.dirty[node] = false;
                self.changed[node] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_returns_to_accepted_slot() {
        let mut c = PartialLikelihoodCache::new(2, 1);
        c.store(0, &[0.1, 0.2], -1.0);
        c.keep();
        assert!(c.flag_dirty(0));
        assert!(!c.flag_dirty(0));
        c.store(0, &[0.5, 0.5], -3.0);
        assert_eq!(c.partial(0), &[0.5, 0.5]);
        c.restore();
        assert_eq!(c.partial(0), &[0.1, 0.2]);
        assert_eq!(c.scale(0), -1.0);
        assert!(!c.is_dirty(0) && !c.is_changed(0));
    }

    #[test]
    fn keep_accepts_new_slot() {
        let mut c = PartialLikelihoodCache::new(1, 1);
        c.store(0, &[0.1, 0.2], 0.0);
        c.keep();
        c.flag_all_dirty();
        c.store(0, &[0.3, 0.4], 0.0);
        c.keep();
        c.flag_dirty(0);
        c.restore();
        assert_eq!(c.partial(0), &[0.3, 0.4]);
    }

    #[test]
    fn uncomputed_nodes_stay_dirty_through_keep_and_restore() {
        let mut c = PartialLikelihoodCache::new(2, 1);
        c.store(0, &[0.1, 0.2], 0.0);
        c.keep();
        assert!(!c.is_dirty(0));
        assert!(c.is_dirty(1));
        c.flag_all_dirty();
        assert!(!c.is_changed(1));
        c.restore();
        assert!(!c.is_dirty(0));
        assert_eq!(c.partial(0), &[0.1, 0.2]);
        assert!(c.is_dirty(1));
    }
}
