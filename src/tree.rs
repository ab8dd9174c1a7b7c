use anyhow::{anyhow, bail, Result};
use log::warn;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fs,
    path::Path,
};

const EPSILON: f64 = 1e-9;

/// One node of an owned phylogenetic tree. Leaves carry a label and no
/// children; internal nodes may carry a label (e.g., ancestral node names).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub label: Option<String>,
    pub length: Option<f64>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tree {
    pub root: Node,
}

/// How internal node labels are handled when writing Newick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TreeStyle {
    InternalLabels,
    LeafLabelsOnly,
}

// --------------------------------------------------
impl Node {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

// --------------------------------------------------
impl Tree {
    pub fn from_newick(text: &str) -> Result<Self> {
        let mut parser = NewickParser {
            bytes: text.as_bytes(),
            pos: 0,
        };
        let root = parser.parse_tree()?;
        Ok(Tree { root })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read tree file {}: {e}", path.display()))?;
        Self::from_newick(&text)
    }

    // Labels are never quoted and no rooting annotation is emitted.
    pub fn to_newick(&self, style: TreeStyle) -> String {
        let mut out = String::new();
        write_node(&self.root, style, &mut out);
        out.push(';');
        out
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>, style: TreeStyle) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_newick(style) + "\n")
            .map_err(|e| anyhow!("Cannot write tree file {}: {e}", path.display()))?;
        Ok(())
    }

    pub fn leaf_labels(&self) -> Vec<String> {
        let mut labels = vec![];
        collect_leaf_labels(&self.root, &mut labels);
        labels
    }

    /// Leaf labels must be present and unique for downstream comparisons.
    pub fn validate(&self) -> Result<()> {
        fn walk(node: &Node, seen: &mut HashSet<String>) -> Result<()> {
            if node.is_leaf() {
                match &node.label {
                    Some(label) if !label.is_empty() => {
                        if !seen.insert(label.clone()) {
                            bail!("Tree contains the leaf label {label} more than once");
                        }
                    }
                    _ => bail!("Tree contains a leaf without a label"),
                }
            }
            for child in &node.children {
                walk(child, seen)?;
            }
            Ok(())
        }

        let mut seen = HashSet::new();
        walk(&self.root, &mut seen)
    }

    // --------------------------------------------------
    /// Turn every node with more than two children into a binary cascade:
    /// one child is kept and the rest are hung off a new zero-length node.
    /// The bipartitions of the tree are unchanged.
    pub fn resolve_polytomies(&mut self) {
        split_non_bifurcating(&mut self.root);
    }

    /// Collapse a bifurcating root into an unrooted (trifurcating)
    /// representation by splicing one internal child into the root.
    pub fn deroot(&mut self) {
        if self.root.children.len() != 2 {
            return;
        }
        if let Some(idx) = self.root.children.iter().rposition(|c| !c.is_leaf()) {
            let spliced = self.root.children.remove(idx);
            let extra = spliced.length;
            for mut grandchild in spliced.children {
                grandchild.length = add_lengths(grandchild.length, extra);
                self.root.children.push(grandchild);
            }
        }
    }

    /// Splice out internal nodes left with a single child, summing the two
    /// edge lengths. Rerooting can strand such nodes along the old root path.
    pub fn suppress_unifurcations(&mut self) {
        suppress_node(&mut self.root);
        while self.root.children.len() == 1 && !self.root.children[0].is_leaf() {
            let only = self.root.children.remove(0);
            self.root = only;
            self.root.length = None;
        }
    }

    // --------------------------------------------------
    /// Remove the named leaves, drop internal nodes left without any taxa
    /// beneath them, and splice out the resulting unary nodes.
    pub fn prune_taxa(&mut self, remove: &HashSet<String>) {
        let root = std::mem::take(&mut self.root);
        self.root = compress(root, remove).unwrap_or_default();
        self.root.length = None;
    }

    // --------------------------------------------------
    /// Reroot at the point minimizing the maximum leaf-to-point distance,
    /// then flatten back to an unrooted representation.
    pub fn midpoint_reroot(&mut self) -> Result<()> {
        self.resolve_polytomies();

        let mut arena = Arena::from_tree(self);
        let leaves = arena.leaf_indices();
        if leaves.len() < 2 {
            bail!("Cannot midpoint reroot a tree with fewer than 2 leaves");
        }

        let (from_root, _) = arena.distances_from(arena.root);
        let a = arena.farthest_leaf(arena.root);
        let b = arena.farthest_leaf(a);

        // Walk from the deeper diameter endpoint toward the shallower one.
        let (start, target) = if from_root[a] >= from_root[b] {
            (a, b)
        } else {
            (b, a)
        };
        let (dist, prev) = arena.distances_from(start);
        let diameter = dist[target];
        if diameter > EPSILON {
            let half = diameter / 2.0;

            let mut path = vec![target];
            while *path.last().unwrap() != start {
                match prev[*path.last().unwrap()] {
                    Some(p) => path.push(p),
                    _ => bail!("Tree is not connected"),
                }
            }
            path.reverse();

            let midpoint = match path.iter().find(|&&n| (dist[n] - half).abs() <= EPSILON) {
                Some(&node) => node,
                _ => {
                    // The midpoint falls strictly inside an edge: split it.
                    let mut split_at = None;
                    for pair in path.windows(2) {
                        let (u, v) = (pair[0], pair[1]);
                        if dist[u] < half && half < dist[v] {
                            split_at = Some((u, v));
                            break;
                        }
                    }
                    match split_at {
                        Some((u, v)) => {
                            let (child, offset) = if arena.parent_of(u) == Some(v) {
                                (u, half - dist[u])
                            } else {
                                (v, dist[v] - half)
                            };
                            arena.split_edge(child, offset)?
                        }
                        _ => bail!("Failed to locate the midpoint edge"),
                    }
                }
            };
            arena.reroot_at(midpoint);
            *self = arena.to_tree();
        }

        self.suppress_unifurcations();
        self.deroot();
        Ok(())
    }

    // --------------------------------------------------
    /// Reroot so that the clade spanning `outgroups` becomes one child of
    /// the new root, then flatten back to an unrooted representation.
    pub fn reroot_with_outgroup(&mut self, outgroups: &[String]) -> Result<()> {
        let wanted: HashSet<String> = outgroups.iter().cloned().collect();
        let mut arena = Arena::from_tree(self);
        let mrca = match arena.mrca(&wanted) {
            Some(idx) => idx,
            _ => bail!(
                "Outgroup taxa not found in the tree: {}",
                outgroups.join(", ")
            ),
        };

        if let Some(parent) = arena.parent_of(mrca) {
            arena.reroot_at(parent);
            *self = arena.to_tree();
        }
        self.suppress_unifurcations();
        self.deroot();
        Ok(())
    }

    // --------------------------------------------------
    /// A single requested taxon is trivially monophyletic. For more than
    /// one, the clade under their common ancestor must contain exactly the
    /// requested taxa; otherwise degrade to the first taxon alone.
    pub fn monophyletic_outgroup(&self, requested: &[String]) -> Result<Vec<String>> {
        if requested.len() == 1 {
            return Ok(requested.to_vec());
        }

        let mut work = self.clone();
        work.deroot();
        let arena = Arena::from_tree(&work);
        let wanted: HashSet<String> = requested.iter().cloned().collect();
        let mrca = match arena.mrca(&wanted) {
            Some(idx) => idx,
            _ => bail!(
                "Outgroup taxa not found in the tree: {}",
                requested.join(", ")
            ),
        };

        for leaf in arena.leaf_labels_under(mrca) {
            if !wanted.contains(&leaf) {
                warn!(
                    "Outgroup taxa do not form a clade: {leaf} is in the clade \
                     but not in the outgroup list. Using the first taxon {} \
                     as the outgroup",
                    requested[0]
                );
                return Ok(vec![requested[0].clone()]);
            }
        }

        Ok(requested.to_vec())
    }
}

// --------------------------------------------------
/// Reroot the tree file in place: at the given comma-separated outgroup if
/// one was supplied, otherwise at the midpoint. Internal node labels are
/// preserved for intermediate trees.
pub fn reroot_tree(path: impl AsRef<Path>, outgroup: Option<&str>) -> Result<()> {
    let path = path.as_ref();
    let mut tree = Tree::from_file(path)?;
    match outgroup {
        Some(spec) => {
            let requested: Vec<String> = spec.split(',').map(String::from).collect();
            let resolved = tree.monophyletic_outgroup(&requested)?;
            tree.reroot_with_outgroup(&resolved)?;
        }
        _ => tree.midpoint_reroot()?,
    }
    tree.write_to_file(path, TreeStyle::InternalLabels)
}

// --------------------------------------------------
pub fn remove_internal_node_labels(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> Result<()> {
    let tree = Tree::from_file(input)?;
    tree.write_to_file(output, TreeStyle::LeafLabelsOnly)
}

// --------------------------------------------------
/// Prune the given taxa out of a starting tree and write the result,
/// stripped of internal labels and derooted, to a new file.
pub fn filter_taxa_from_tree_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    removed: &[String],
) -> Result<()> {
    let mut tree = Tree::from_file(input)?;
    let remove: HashSet<String> = removed.iter().cloned().collect();
    tree.prune_taxa(&remove);
    tree.deroot();
    tree.write_to_file(output, TreeStyle::LeafLabelsOnly)
}

// --------------------------------------------------
/// Sum of absolute edge-length differences across the bipartitions of the
/// two trees, with absent bipartitions contributing length zero.
pub fn weighted_robinson_foulds_distance(t1: &Tree, t2: &Tree) -> Result<f64> {
    let namespace = shared_namespace(t1, t2)?;
    let b1 = bipartitions(t1, &namespace);
    let b2 = bipartitions(t2, &namespace);

    let mut keys: HashSet<&BTreeSet<String>> = b1.keys().collect();
    keys.extend(b2.keys());

    Ok(keys
        .iter()
        .map(|&key| {
            let w1 = b1.get(key).copied().unwrap_or(0.0);
            let w2 = b2.get(key).copied().unwrap_or(0.0);
            (w1 - w2).abs()
        })
        .sum())
}

// --------------------------------------------------
/// Count of bipartitions present in exactly one of the two trees.
pub fn symmetric_difference(t1: &Tree, t2: &Tree) -> Result<usize> {
    let namespace = shared_namespace(t1, t2)?;
    let b1 = bipartitions(t1, &namespace);
    let b2 = bipartitions(t2, &namespace);

    let only_1 = b1.keys().filter(|k| !b2.contains_key(*k)).count();
    let only_2 = b2.keys().filter(|k| !b1.contains_key(*k)).count();
    Ok(only_1 + only_2)
}

// --------------------------------------------------
fn shared_namespace(t1: &Tree, t2: &Tree) -> Result<Vec<String>> {
    let mut n1 = t1.leaf_labels();
    let mut n2 = t2.leaf_labels();
    n1.sort();
    n2.sort();
    if n1 != n2 {
        bail!("Cannot compare trees over different taxon sets");
    }
    Ok(n1)
}

// --------------------------------------------------
// Bipartitions are encoded as the leaf set on one side of an edge,
// normalized by complementing any set containing the first taxon of the
// shared namespace. Trivial whole-tree sets are skipped.
fn bipartitions(tree: &Tree, namespace: &[String]) -> HashMap<BTreeSet<String>, f64> {
    let arena = Arena::from_tree(tree);
    let leaf_sets = arena.leaf_label_sets();

    let mut map: HashMap<BTreeSet<String>, f64> = HashMap::new();
    for (idx, node) in arena.nodes.iter().enumerate() {
        if idx == arena.root {
            continue;
        }
        let set = &leaf_sets[idx];
        if set.is_empty() || set.len() == namespace.len() {
            continue;
        }
        let key: BTreeSet<String> = if set.contains(&namespace[0]) {
            namespace
                .iter()
                .filter(|t| !set.contains(*t))
                .cloned()
                .collect()
        } else {
            set.iter().cloned().collect()
        };
        *map.entry(key).or_insert(0.0) += node.length.unwrap_or(0.0);
    }
    map
}

// --------------------------------------------------
fn write_node(node: &Node, style: TreeStyle, out: &mut String) {
    if node.is_leaf() {
        if let Some(label) = &node.label {
            out.push_str(label);
        }
    } else {
        out.push('(');
        for (i, child) in node.children.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_node(child, style, out);
        }
        out.push(')');
        if style == TreeStyle::InternalLabels {
            if let Some(label) = &node.label {
                out.push_str(label);
            }
        }
    }

    if let Some(length) = node.length {
        out.push(':');
        out.push_str(&format!("{length}"));
    }
}

// --------------------------------------------------
fn collect_leaf_labels(node: &Node, labels: &mut Vec<String>) {
    if node.is_leaf() {
        if let Some(label) = &node.label {
            labels.push(label.clone());
        }
    } else {
        for child in &node.children {
            collect_leaf_labels(child, labels);
        }
    }
}

// --------------------------------------------------
fn split_non_bifurcating(node: &mut Node) {
    if node.children.len() > 2 {
        // Keep one child and hang the rest off a zero-length placeholder.
        let kept = node.children.pop().unwrap();
        let rest = std::mem::take(&mut node.children);
        node.children.push(kept);
        node.children.push(Node {
            label: None,
            length: Some(0.0),
            children: rest,
        });
    }
    for child in &mut node.children {
        split_non_bifurcating(child);
    }
}

// --------------------------------------------------
fn suppress_node(node: &mut Node) {
    for child in &mut node.children {
        suppress_node(child);
    }
    let mut i = 0;
    while i < node.children.len() {
        if !node.children[i].is_leaf() && node.children[i].children.len() == 1 {
            let spliced_length = node.children[i].length;
            let mut only = node.children[i].children.pop().unwrap();
            only.length = add_lengths(only.length, spliced_length);
            node.children[i] = only;
        } else {
            i += 1;
        }
    }
}

// --------------------------------------------------
fn compress(mut node: Node, remove: &HashSet<String>) -> Option<Node> {
    if node.is_leaf() {
        return match &node.label {
            Some(label) if remove.contains(label) => None,
            _ => Some(node),
        };
    }

    let mut children: Vec<Node> = std::mem::take(&mut node.children)
        .into_iter()
        .filter_map(|child| compress(child, remove))
        .collect();

    match children.len() {
        0 => None,
        1 => {
            let mut only = children.pop().unwrap();
            only.length = add_lengths(node.length, only.length);
            Some(only)
        }
        _ => {
            node.children = children;
            Some(node)
        }
    }
}

// --------------------------------------------------
fn add_lengths(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        _ => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
    }
}

// --------------------------------------------------
// Flat index-based view of the tree used for rerooting and clade queries.
#[derive(Debug)]
struct FlatNode {
    label: Option<String>,
    length: Option<f64>,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Debug)]
struct Arena {
    nodes: Vec<FlatNode>,
    root: usize,
}

impl Arena {
    fn from_tree(tree: &Tree) -> Self {
        let mut arena = Arena {
            nodes: vec![],
            root: 0,
        };
        arena.root = arena.add(&tree.root, None);
        arena
    }

    fn add(&mut self, node: &Node, parent: Option<usize>) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(FlatNode {
            label: node.label.clone(),
            length: node.length,
            parent,
            children: vec![],
        });
        for child in &node.children {
            let child_idx = self.add(child, Some(idx));
            self.nodes[idx].children.push(child_idx);
        }
        idx
    }

    fn to_tree(&self) -> Tree {
        Tree {
            root: self.build(self.root),
        }
    }

    fn build(&self, idx: usize) -> Node {
        Node {
            label: self.nodes[idx].label.clone(),
            length: self.nodes[idx].length,
            children: self.nodes[idx]
                .children
                .iter()
                .map(|&child| self.build(child))
                .collect(),
        }
    }

    fn parent_of(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].parent
    }

    fn leaf_indices(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].children.is_empty())
            .collect()
    }

    // --------------------------------------------------
    // Distances over the undirected tree; the weight of the edge between a
    // node and its parent is stored on the child.
    fn distances_from(&self, start: usize) -> (Vec<f64>, Vec<Option<usize>>) {
        let n = self.nodes.len();
        let mut dist = vec![f64::INFINITY; n];
        let mut prev = vec![None; n];
        dist[start] = 0.0;

        let mut stack = vec![start];
        while let Some(u) = stack.pop() {
            for &child in &self.nodes[u].children {
                if dist[child].is_infinite() {
                    dist[child] = dist[u] + self.nodes[child].length.unwrap_or(0.0);
                    prev[child] = Some(u);
                    stack.push(child);
                }
            }
            if let Some(parent) = self.nodes[u].parent {
                if dist[parent].is_infinite() {
                    dist[parent] = dist[u] + self.nodes[u].length.unwrap_or(0.0);
                    prev[parent] = Some(u);
                    stack.push(parent);
                }
            }
        }

        (dist, prev)
    }

    fn farthest_leaf(&self, start: usize) -> usize {
        let (dist, _) = self.distances_from(start);
        let mut best = start;
        let mut best_dist = -1.0;
        for leaf in self.leaf_indices() {
            if dist[leaf] > best_dist {
                best = leaf;
                best_dist = dist[leaf];
            }
        }
        best
    }

    // --------------------------------------------------
    fn split_edge(&mut self, child: usize, dist_from_child: f64) -> Result<usize> {
        let parent = match self.nodes[child].parent {
            Some(p) => p,
            _ => bail!("Cannot split the edge above the root"),
        };
        let old_length = self.nodes[child].length.unwrap_or(0.0);
        let new_idx = self.nodes.len();
        self.nodes.push(FlatNode {
            label: None,
            length: Some(old_length - dist_from_child),
            parent: Some(parent),
            children: vec![child],
        });
        if let Some(slot) = self.nodes[parent].children.iter_mut().find(|c| **c == child) {
            *slot = new_idx;
        }
        self.nodes[child].parent = Some(new_idx);
        self.nodes[child].length = Some(dist_from_child);
        Ok(new_idx)
    }

    // --------------------------------------------------
    // Reverse the parent-child relation along the path from the new root up
    // to the old one. Edge lengths travel with their edges.
    fn reroot_at(&mut self, new_root: usize) {
        if new_root == self.root {
            return;
        }

        let mut chain = vec![new_root];
        while let Some(parent) = self.nodes[*chain.last().unwrap()].parent {
            chain.push(parent);
        }

        let mut carry = self.nodes[new_root].length;
        self.nodes[new_root].parent = None;
        for pair in chain.windows(2) {
            let (child, parent) = (pair[0], pair[1]);
            let parent_old_length = self.nodes[parent].length;
            self.nodes[parent].children.retain(|&c| c != child);
            self.nodes[child].children.push(parent);
            self.nodes[parent].parent = Some(child);
            self.nodes[parent].length = carry;
            carry = parent_old_length;
        }
        self.nodes[new_root].length = None;
        self.root = new_root;
    }

    // --------------------------------------------------
    fn post_order(&self) -> Vec<usize> {
        let mut order = vec![];
        let mut stack = vec![(self.root, false)];
        while let Some((idx, visited)) = stack.pop() {
            if visited || self.nodes[idx].children.is_empty() {
                order.push(idx);
            } else {
                stack.push((idx, true));
                for &child in self.nodes[idx].children.iter().rev() {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    // Cached post-order aggregation of the leaf labels under each node.
    fn leaf_label_sets(&self) -> Vec<HashSet<String>> {
        let mut sets: Vec<HashSet<String>> = vec![HashSet::new(); self.nodes.len()];
        for idx in self.post_order() {
            if self.nodes[idx].children.is_empty() {
                if let Some(label) = &self.nodes[idx].label {
                    sets[idx].insert(label.clone());
                }
            } else {
                let mut combined = HashSet::new();
                for &child in &self.nodes[idx].children {
                    combined.extend(sets[child].iter().cloned());
                }
                sets[idx] = combined;
            }
        }
        sets
    }

    // --------------------------------------------------
    // Most recent common ancestor: the smallest clade covering all labels.
    fn mrca(&self, labels: &HashSet<String>) -> Option<usize> {
        if labels.is_empty() {
            return None;
        }
        let sets = self.leaf_label_sets();
        (0..self.nodes.len())
            .filter(|&i| labels.iter().all(|l| sets[i].contains(l)))
            .min_by_key(|&i| sets[i].len())
    }

    fn leaf_labels_under(&self, idx: usize) -> Vec<String> {
        let mut labels = vec![];
        let mut stack = vec![idx];
        while let Some(u) = stack.pop() {
            if self.nodes[u].children.is_empty() {
                if let Some(label) = &self.nodes[u].label {
                    labels.push(label.clone());
                }
            } else {
                for &child in self.nodes[u].children.iter().rev() {
                    stack.push(child);
                }
            }
        }
        labels
    }
}

// --------------------------------------------------
struct NewickParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl NewickParser<'_> {
    fn parse_tree(&mut self) -> Result<Node> {
        let node = self.parse_subtree()?;
        self.skip_junk();
        match self.peek() {
            Some(b';') => {
                self.pos += 1;
                Ok(node)
            }
            _ => bail!("Newick string is missing its terminating semicolon"),
        }
    }

    fn parse_subtree(&mut self) -> Result<Node> {
        self.skip_junk();
        let mut node = Node::default();

        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                node.children.push(self.parse_subtree()?);
                self.skip_junk();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => bail!("Malformed Newick string: expected ',' or ')'"),
                }
            }
        }

        node.label = self.parse_label()?;
        node.length = self.parse_length()?;
        Ok(node)
    }

    fn parse_label(&mut self) -> Result<Option<String>> {
        self.skip_junk();
        match self.peek() {
            Some(b'\'') => {
                self.pos += 1;
                let mut label = String::new();
                loop {
                    match self.bump() {
                        Some(b'\'') if self.peek() == Some(b'\'') => {
                            label.push('\'');
                            self.pos += 1;
                        }
                        Some(b'\'') => break,
                        Some(byte) => label.push(byte as char),
                        _ => bail!("Unterminated quoted label in Newick string"),
                    }
                }
                Ok(Some(label))
            }
            _ => {
                let start = self.pos;
                while let Some(byte) = self.peek() {
                    if b"(),:;[".contains(&byte) || byte.is_ascii_whitespace() {
                        break;
                    }
                    self.pos += 1;
                }
                if self.pos == start {
                    Ok(None)
                } else {
                    Ok(Some(
                        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned(),
                    ))
                }
            }
        }
    }

    fn parse_length(&mut self) -> Result<Option<f64>> {
        self.skip_junk();
        if self.peek() != Some(b':') {
            return Ok(None);
        }
        self.pos += 1;
        self.skip_junk();
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte.is_ascii_digit() || b"+-.eE".contains(&byte) {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])?;
        match text.parse::<f64>() {
            Ok(value) => Ok(Some(value)),
            _ => bail!("Invalid branch length {text:?} in Newick string"),
        }
    }

    fn skip_junk(&mut self) {
        loop {
            match self.peek() {
                Some(byte) if byte.is_ascii_whitespace() => self.pos += 1,
                Some(b'[') => {
                    while let Some(byte) = self.bump() {
                        if byte == b']' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }
}
