use ferry_format::{GraphNode, ROOT_PARENT};

/// Flat transform hierarchy, parents stored ahead of their children.
pub struct SceneGraph {
    locals: Vec<glam::Mat4>,
    parents: Vec<u32>,
    worlds: Vec<glam::Mat4>,
}

impl SceneGraph {
    pub fn new(nodes: &[GraphNode]) -> Self {
        Self {
            locals: nodes
                .iter()
                .map(|node| glam::Mat4::from_cols_array_2d(&node.local))
                .collect(),
            parents: nodes.iter().map(|node| node.parent_index).collect(),
            worlds: nodes
                .iter()
                .map(|node| glam::Mat4::from_cols_array_2d(&node.world))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        match self.parents.get(index) {
            Some(&ROOT_PARENT) | None => None,
            Some(&parent) => Some(parent as usize),
        }
    }

    pub fn local(&self, index: usize) -> glam::Mat4 {
        self.locals[index]
    }

    pub fn world(&self, index: usize) -> glam::Mat4 {
        self.worlds[index]
    }

    pub fn worlds(&self) -> &[glam::Mat4] {
        &self.worlds
    }

    /// Evaluate world transforms in stored order, with `root` above the root node.
    #[profiling::function]
    pub fn update(&mut self, root: glam::Mat4) {
        debug_assert!(
            self.parents.first().map_or(true, |&parent| parent == ROOT_PARENT),
            "node 0 is not the root"
        );
        for index in 0..self.locals.len() {
            let parent_world = match self.parents[index] {
                ROOT_PARENT => root,
                parent => {
                    debug_assert!(
                        (parent as usize) < index,
                        "node {} is evaluated before its parent {}",
                        index,
                        parent
                    );
                    self.worlds.get(parent as usize).copied().unwrap_or(root)
                }
            };
            self.worlds[index] = parent_world * self.locals[index];
        }
    }
}
