//! Typed genealogies built during reverse-time reconstruction.
//!
//! Lineages live in an arena owned by the [`LineageFactory`]; edges are
//! stored as indices, with each node holding a back-reference to at most one
//! parent.

/// Index of a lineage in its arena.
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Lineage {
    /// Population index the lineage belongs to.
    pub population: usize,
    /// Absolute time of the event that created the node.
    pub time: f64,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Leaves are numbered in creation order, internal nodes in postorder after them.
    pub number: usize,
    /// Time before the most recent node of the tree.
    pub age: f64,
}

impl Lineage {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Creates lineages while events are replayed backwards.
#[derive(Debug, Default)]
pub struct LineageFactory {
    nodes: Vec<Lineage>,
    n_leaves: usize,
}

impl LineageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> &Lineage {
        &self.nodes[id]
    }

    pub fn n_leaves(&self) -> usize {
        self.n_leaves
    }

    pub fn new_leaf(&mut self, population: usize, time: f64) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Lineage {
            population,
            time,
            parent: None,
            children: Vec::new(),
            number: self.n_leaves,
            age: 0.0,
        });
        self.n_leaves += 1;
        id
    }

    /// Create the ancestor of `children` at `time`.
    pub fn new_internal(&mut self, population: usize, time: f64, children: &[NodeId]) -> NodeId {
        let id = self.nodes.len();
        for &child in children {
            self.nodes[child].parent = Some(id);
        }
        self.nodes.push(Lineage {
            population,
            time,
            parent: None,
            children: children.to_vec(),
            number: 0,
            age: 0.0,
        });
        id
    }

    /// Number the internal nodes below `root` in postorder, after the leaves.
    pub fn number_internals(&mut self, root: NodeId) {
        let mut next = self.n_leaves;
        for id in postorder(&self.nodes, root) {
            if !self.nodes[id].is_leaf() {
                self.nodes[id].number = next;
                next += 1;
            }
        }
    }

    /// Derive node ages from absolute times, relative to the most recent node.
    pub fn compute_ages_from_times(&mut self, root: NodeId) {
        let order = postorder(&self.nodes, root);
        let latest = order
            .iter()
            .map(|&id| self.nodes[id].time)
            .fold(f64::NEG_INFINITY, f64::max);
        for id in order {
            self.nodes[id].age = latest - self.nodes[id].time;
        }
    }

    pub fn into_genealogy(self, root: NodeId) -> Genealogy {
        Genealogy {
            nodes: self.nodes,
            root,
        }
    }
}

/// A rooted, typed tree.
#[derive(Debug, Clone)]
pub struct Genealogy {
    nodes: Vec<Lineage>,
    root: NodeId,
}

impl Genealogy {
    pub fn root(&self) -> &Lineage {
        &self.nodes[self.root]
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Lineage {
        &self.nodes[id]
    }

    /// Node ids below (and including) the root, children before parents.
    pub fn postorder(&self) -> Vec<NodeId> {
        postorder(&self.nodes, self.root)
    }

    pub fn leaf_count(&self) -> usize {
        self.postorder()
            .into_iter()
            .filter(|&id| self.nodes[id].is_leaf())
            .count()
    }

    pub fn internal_count(&self) -> usize {
        self.postorder().len() - self.leaf_count()
    }

    /// Age of the root.
    pub fn height(&self) -> f64 {
        self.root().age
    }

    /// Copy of the tree with every single-child node removed.
    ///
    /// Internal nodes are renumbered in postorder starting at the leaf count.
    pub fn singleton_free(&self) -> Genealogy {
        let order = self.postorder();
        let mut nodes: Vec<Lineage> = Vec::new();
        let mut mapped: Vec<Option<NodeId>> = vec![None; self.nodes.len()];

        for &id in &order {
            let old = &self.nodes[id];
            if old.children.len() == 1 {
                mapped[id] = mapped[old.children[0]];
                continue;
            }
            let new_id = nodes.len();
            let children: Vec<NodeId> = old.children.iter().filter_map(|&c| mapped[c]).collect();
            for &child in &children {
                nodes[child].parent = Some(new_id);
            }
            nodes.push(Lineage {
                parent: None,
                children,
                ..old.clone()
            });
            mapped[id] = Some(new_id);
        }

        let mut tree = Genealogy {
            root: nodes.len() - 1,
            nodes,
        };
        let n_leaves = tree.leaf_count();
        let mut next = n_leaves;
        for id in tree.postorder() {
            if !tree.nodes[id].is_leaf() {
                tree.nodes[id].number = next;
                next += 1;
            }
        }
        tree
    }
}

fn postorder(nodes: &[Lineage], root: NodeId) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut stack = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        stack.push((id, true));
        for &child in nodes[id].children.iter().rev() {
            stack.push((child, false));
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    // ((a:1, b:2) at 0.5 --migration at 0.3--> , c:1.5) at 0.0
    fn build() -> (LineageFactory, NodeId) {
        let mut factory = LineageFactory::new();
        let a = factory.new_leaf(0, 1.0);
        let b = factory.new_leaf(0, 2.0);
        let c = factory.new_leaf(1, 1.5);
        let ab = factory.new_internal(0, 0.5, &[a, b]);
        let mig = factory.new_internal(1, 0.3, &[ab]);
        let root = factory.new_internal(1, 0.0, &[mig, c]);
        (factory, root)
    }

    #[test]
    fn numbering_and_ages() {
        let (mut factory, root) = build();
        factory.number_internals(root);
        factory.compute_ages_from_times(root);
        let tree = factory.into_genealogy(root);

        assert_eq!(tree.leaf_count(), 3);
        assert_eq!(tree.internal_count(), 3);
        assert_eq!(tree.root().number, 5);
        assert!((tree.height() - 2.0).abs() < 1e-12);
        assert_eq!(tree.node(1).age, 0.0);
        assert!((tree.node(0).age - 1.0).abs() < 1e-12);

        let numbers: Vec<_> = tree.postorder().iter().map(|&id| tree.node(id).number).collect();
        assert_eq!(numbers, vec![0, 1, 3, 4, 2, 5]);
    }

    #[test]
    fn parents_are_back_references() {
        let (factory, root) = build();
        let tree = factory.into_genealogy(root);
        assert_eq!(tree.root().parent, None);
        for id in tree.postorder() {
            for &child in &tree.node(id).children {
                assert_eq!(tree.node(child).parent, Some(id));
            }
        }
    }

    #[test]
    fn singleton_removal() {
        let (mut factory, root) = build();
        factory.number_internals(root);
        factory.compute_ages_from_times(root);
        let tree = factory.into_genealogy(root).singleton_free();

        assert_eq!(tree.leaf_count(), 3);
        assert_eq!(tree.internal_count(), 2);
        assert!(tree.postorder().iter().all(|&id| tree.node(id).children.len() != 1));
        let mut internal: Vec<_> = tree
            .postorder()
            .iter()
            .filter(|&&id| !tree.node(id).is_leaf())
            .map(|&id| tree.node(id).number)
            .collect();
        internal.sort();
        assert_eq!(internal, vec![3, 4]);
        assert_eq!(tree.root().number, 4);
    }

    #[test]
    fn single_leaf_tree() {
        let mut factory = LineageFactory::new();
        let leaf = factory.new_leaf(0, 3.0);
        factory.number_internals(leaf);
        factory.compute_ages_from_times(leaf);
        let tree = factory.into_genealogy(leaf);
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.internal_count(), 0);
        assert_eq!(tree.height(), 0.0);
    }
}
