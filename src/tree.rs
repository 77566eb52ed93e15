use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{SseError, SseResult};

const AGE_EPS: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub name: Option<String>,
    pub age: f64,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub sampled_ancestor: bool,
    pub fossil: bool,
}

impl TreeNode {
    pub fn tip(name: impl Into<String>, age: f64, parent: usize) -> Self {
        Self {
            name: Some(name.into()),
            age,
            parent: Some(parent),
            children: Vec::new(),
            sampled_ancestor: false,
            fossil: false,
        }
    }

    pub fn fossil(name: impl Into<String>, age: f64, parent: usize) -> Self {
        Self {
            fossil: true,
            ..Self::tip(name, age, parent)
        }
    }

    pub fn internal(age: f64, parent: Option<usize>) -> Self {
        Self {
            name: None,
            age,
            parent,
            children: Vec::new(),
            sampled_ancestor: false,
            fossil: false,
        }
    }

    pub fn sampled_ancestor(name: impl Into<String>, age: f64, parent: usize) -> Self {
        Self {
            name: Some(name.into()),
            age,
            parent: Some(parent),
            children: Vec::new(),
            sampled_ancestor: true,
            fossil: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// Per-listener queues of nodes whose age or structure changed.
#[derive(Debug, Default)]
pub struct TreeChangeEvents {
    queues: BTreeMap<ListenerId, Vec<usize>>,
    next_id: u64,
}

impl TreeChangeEvents {
    pub fn subscribe(&mut self) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.queues.insert(id, Vec::new());
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.queues.remove(&id).is_some()
    }

    pub fn is_subscribed(&self, id: ListenerId) -> bool {
        self.queues.contains_key(&id)
    }

    pub fn n_listeners(&self) -> usize {
        self.queues.len()
    }

    pub fn notify(&mut self, node: usize) {
        for queue in self.queues.values_mut() {
            if !queue.contains(&node) {
                queue.push(node);
            }
        }
    }

    pub fn take(&mut self, id: ListenerId) -> Vec<usize> {
        self.queues
            .get_mut(&id)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    root: usize,
    events: TreeChangeEvents,
}

impl Clone for Tree {
    // Subscriptions belong to the original tree, not to copies of it.
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            root: self.root,
            events: TreeChangeEvents::default(),
        }
    }
}

impl Tree {
    /// Builds a tree from nodes linked by `parent`; child lists are rebuilt
    /// from the parent links in index order.
    pub fn new(mut nodes: Vec<TreeNode>) -> SseResult<Self> {
        if nodes.is_empty() {
            return Err(SseError::Tree("tree has no nodes".into()));
        }
        for node in nodes.iter_mut() {
            node.children.clear();
        }
        let mut root = None;
        for i in 0..nodes.len() {
            match nodes[i].parent {
                None => {
                    if root.replace(i).is_some() {
                        return Err(SseError::Tree("more than one root".into()));
                    }
                }
                Some(p) => {
                    if p >= nodes.len() || p == i {
                        return Err(SseError::Tree(format!("node {i} has invalid parent {p}")));
                    }
                    nodes[p].children.push(i);
                }
            }
        }
        let root = root.ok_or_else(|| SseError::Tree("no root node".into()))?;
        for (i, node) in nodes.iter().enumerate() {
            if !node.children.is_empty() && node.children.len() != 2 {
                return Err(SseError::Tree(format!(
                    "internal node {i} has {} children; only bifurcations are supported",
                    node.children.len()
                )));
            }
            if node.sampled_ancestor && !node.children.is_empty() {
                return Err(SseError::Tree(format!(
                    "sampled ancestor {i} must be a tip"
                )));
            }
        }
        let tree = Self {
            nodes,
            root,
            events: TreeChangeEvents::default(),
        };
        if tree.post_order().len() != tree.nodes.len() {
            return Err(SseError::Tree("nodes are not all connected to the root".into()));
        }
        Ok(tree)
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn root_age(&self) -> f64 {
        self.nodes[self.root].age
    }

    pub fn node(&self, i: usize) -> &TreeNode {
        &self.nodes[i]
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn age(&self, i: usize) -> f64 {
        self.nodes[i].age
    }

    pub fn parent(&self, i: usize) -> Option<usize> {
        self.nodes[i].parent
    }

    pub fn children(&self, i: usize) -> &[usize] {
        &self.nodes[i].children
    }

    pub fn is_tip(&self, i: usize) -> bool {
        self.nodes[i].children.is_empty()
    }

    pub fn is_root(&self, i: usize) -> bool {
        i == self.root
    }

    pub fn branch_length(&self, i: usize) -> f64 {
        match self.nodes[i].parent {
            Some(p) => self.nodes[p].age - self.nodes[i].age,
            None => 0.0,
        }
    }

    pub fn tips(&self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&i| self.is_tip(i)).collect()
    }

    pub fn tip_names(&self) -> Vec<String> {
        self.tips()
            .into_iter()
            .map(|i| self.tip_label(i))
            .collect()
    }

    pub fn tip_label(&self, i: usize) -> String {
        self.nodes[i]
            .name
            .clone()
            .unwrap_or_else(|| format!("n{i}"))
    }

    pub fn tip_index(&self, name: &str) -> Option<usize> {
        (0..self.nodes.len()).find(|&i| self.is_tip(i) && self.nodes[i].name.as_deref() == Some(name))
    }

    pub fn num_tips(&self) -> usize {
        self.nodes.iter().filter(|n| n.children.is_empty()).count()
    }

    pub fn num_sampled_ancestors(&self) -> usize {
        self.nodes.iter().filter(|n| n.sampled_ancestor).count()
    }

    /// Tips that died out before the present (non-zero age, not sampled ancestors, not fossils).
    pub fn num_extinct_tips(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.children.is_empty() && n.age > AGE_EPS && !n.sampled_ancestor && !n.fossil)
            .count()
    }

    pub fn post_order(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((i, expanded)) = stack.pop() {
            if expanded || self.nodes[i].children.is_empty() {
                out.push(i);
                continue;
            }
            stack.push((i, true));
            for &c in self.nodes[i].children.iter().rev() {
                stack.push((c, false));
            }
        }
        out
    }

    /// Changes a node's age; the node and its children see their branch
    /// lengths change, so all of them are reported to listeners.
    pub fn set_age(&mut self, i: usize, age: f64) {
        self.nodes[i].age = age;
        self.events.notify(i);
        for k in 0..self.nodes[i].children.len() {
            let c = self.nodes[i].children[k];
            self.events.notify(c);
        }
    }

    /// Tip data is looked up by name, so a rename is reported like a change.
    pub fn set_name(&mut self, i: usize, name: impl Into<String>) {
        self.nodes[i].name = Some(name.into());
        self.events.notify(i);
    }

    pub fn events_mut(&mut self) -> &mut TreeChangeEvents {
        &mut self.events
    }

    pub fn events(&self) -> &TreeChangeEvents {
        &self.events
    }

    /// Keeps the flagged tips and suppresses the unary nodes left behind.
    /// Each kept node also reports the old nodes whose branches were merged
    /// into its own, ordered tip-ward first.
    pub fn prune(&self, keep_tip: &[bool]) -> SseResult<PrunedTree> {
        let n = self.nodes.len();
        let mut alive = vec![false; n];
        for i in self.post_order() {
            alive[i] = if self.is_tip(i) {
                keep_tip.get(i).copied().unwrap_or(false)
            } else {
                self.nodes[i].children.iter().any(|&c| alive[c])
            };
        }
        if !alive[self.root] {
            return Err(SseError::Tree("pruning removed every tip".into()));
        }

        let mut new_nodes: Vec<TreeNode> = Vec::new();
        let mut merged: Vec<Vec<usize>> = Vec::new();
        let mut stack: Vec<(usize, Option<usize>)> = vec![(self.root, None)];
        while let Some((old, new_parent)) = stack.pop() {
            let mut segment = vec![old];
            let mut cur = old;
            loop {
                let live: Vec<usize> = self.nodes[cur]
                    .children
                    .iter()
                    .copied()
                    .filter(|&c| alive[c])
                    .collect();
                if live.len() == 1 {
                    cur = live[0];
                    segment.push(cur);
                } else {
                    break;
                }
            }
            segment.reverse();
            let src = &self.nodes[cur];
            let idx = new_nodes.len();
            new_nodes.push(TreeNode {
                name: src.name.clone(),
                age: src.age,
                parent: new_parent,
                children: Vec::new(),
                sampled_ancestor: src.sampled_ancestor,
                fossil: src.fossil,
            });
            merged.push(segment);
            for &c in src.children.iter().rev() {
                if alive[c] {
                    stack.push((c, Some(idx)));
                }
            }
        }
        let tree = Tree::new(new_nodes)?;
        Ok(PrunedTree { tree, merged })
    }

    pub fn to_newick(&self) -> String {
        self.to_newick_with(|_| None)
    }

    /// Newick text with an optional `[&key=value]` parameter block per node.
    pub fn to_newick_with<F>(&self, annotate: F) -> String
    where
        F: Fn(usize) -> Option<String>,
    {
        let mut out = String::new();
        self.write_newick(self.root, &annotate, &mut out);
        out.push(';');
        out
    }

    fn write_newick<F>(&self, i: usize, annotate: &F, out: &mut String)
    where
        F: Fn(usize) -> Option<String>,
    {
        let node = &self.nodes[i];
        if !node.children.is_empty() {
            out.push('(');
            for (k, &c) in node.children.iter().enumerate() {
                if k > 0 {
                    out.push(',');
                }
                self.write_newick(c, annotate, out);
            }
            out.push(')');
        }
        if let Some(name) = &node.name {
            out.push_str(name);
        }
        if let Some(param) = annotate(i) {
            let _ = write!(out, "[&{param}]");
        }
        if node.parent.is_some() {
            let _ = write!(out, ":{}", self.branch_length(i));
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrunedTree {
    pub tree: Tree,
    pub merged: Vec<Vec<usize>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cherry() -> Tree {
        Tree::new(vec![
            TreeNode::internal(2.0, None),
            TreeNode::tip("A", 0.0, 0),
            TreeNode::internal(1.0, Some(0)),
            TreeNode::tip("B", 0.0, 2),
            TreeNode::fossil("C", 0.5, 2),
        ])
        .expect("valid tree")
    }

    #[test]
    fn post_order_visits_children_first() {
        let tree = cherry();
        let order = tree.post_order();
        assert_eq!(order.len(), 5);
        assert_eq!(*order.last().unwrap(), 0);
        let pos = |i: usize| order.iter().position(|&x| x == i).unwrap();
        assert!(pos(3) < pos(2));
        assert!(pos(4) < pos(2));
    }

    #[test]
    fn listeners_receive_changes_until_unsubscribed() {
        let mut tree = cherry();
        let id = tree.events_mut().subscribe();
        tree.set_age(2, 1.5);
        tree.set_age(2, 1.4);
        assert_eq!(tree.events_mut().take(id), vec![2, 3, 4]);
        assert!(tree.events_mut().unsubscribe(id));
        tree.set_age(2, 1.3);
        assert!(tree.events_mut().take(id).is_empty());
    }

    #[test]
    fn prune_suppresses_unary_nodes() {
        let tree = cherry();
        let keep = vec![false, true, false, true, false];
        let pruned = tree.prune(&keep).unwrap();
        assert_eq!(pruned.tree.n_nodes(), 3);
        assert!(pruned.merged.iter().any(|m| m == &vec![3, 2]));
        assert_eq!(pruned.tree.num_tips(), 2);
    }

    #[test]
    fn newick_includes_parameters() {
        let tree = cherry();
        let s = tree.to_newick_with(|i| (i == 1).then(|| "x=1".to_string()));
        assert_eq!(s, "(A[&x=1]:2,(B:1,C:0.5):1);");
    }

    #[test]
    fn rejects_multifurcations() {
        let err = Tree::new(vec![
            TreeNode::internal(1.0, None),
            TreeNode::tip("A", 0.0, 0),
            TreeNode::tip("B", 0.0, 0),
            TreeNode::tip("C", 0.0, 0),
        ]);
        assert!(err.is_err());
    }
}
