//! Sort-tile-recursive packed R-tree over vector features.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use thiserror::Error;

use crate::vector::{BoundingBox, VectorFeature};

const NODE_CAPACITY: usize = 8;

/// Distance within which a point feature matches a point query.
pub const POINT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("feature {id} has a non-finite bounding box")]
    InvalidGeometry { id: u64 },
    #[error("feature id {id} appears more than once")]
    DuplicateId { id: u64 },
}

#[derive(Debug)]
enum Node {
    Leaf(Vec<usize>),
    Branch(Vec<usize>),
}

#[derive(Debug)]
struct Entry {
    bbox: BoundingBox,
    node: Node,
}

/// Immutable once built; safe to share across worker threads.
#[derive(Debug)]
pub struct SpatialIndex {
    features: Vec<VectorFeature>,
    boxes: Vec<BoundingBox>,
    nodes: Vec<Entry>,
    root: Option<usize>,
}

impl SpatialIndex {
    pub fn build(mut features: Vec<VectorFeature>) -> Result<Self, IndexError> {
        features.sort_by_key(|feature| feature.id);
        if let Some(pair) = features.windows(2).find(|pair| pair[0].id == pair[1].id) {
            return Err(IndexError::DuplicateId { id: pair[0].id });
        }
        let boxes = features
            .iter()
            .map(|feature| {
                let bbox = feature.geometry.bbox();
                let finite = [bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y]
                    .iter()
                    .all(|v| v.is_finite());
                finite
                    .then_some(bbox)
                    .ok_or(IndexError::InvalidGeometry { id: feature.id })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut index = Self {
            features,
            boxes,
            nodes: Vec::new(),
            root: None,
        };
        if !index.features.is_empty() {
            let items: Vec<usize> = (0..index.features.len()).collect();
            let mut level = index.pack_level(items, true);
            while level.len() > 1 {
                level = index.pack_level(level, false);
            }
            index.root = level.first().copied();
        }
        tracing::debug!(
            target: "forage::vector",
            features = index.features.len(),
            nodes = index.nodes.len(),
            "spatial_index.built"
        );
        Ok(index)
    }

    fn item_box(&self, item: usize, leaf_level: bool) -> BoundingBox {
        if leaf_level {
            self.boxes[item]
        } else {
            self.nodes[item].bbox
        }
    }

    /// Groups `items` into nodes: slice by x-centre, then pack each slice by
    /// y-centre.
    fn pack_level(&mut self, mut items: Vec<usize>, leaf_level: bool) -> Vec<usize> {
        let node_count = items.len().div_ceil(NODE_CAPACITY);
        let slices = (node_count as f64).sqrt().ceil() as usize;
        let slice_len = slices * NODE_CAPACITY;

        let center = |index: &Self, item: usize, axis: usize| {
            let (x, y) = index.item_box(item, leaf_level).center();
            if axis == 0 {
                x
            } else {
                y
            }
        };
        items.sort_by(|a, b| {
            center(self, *a, 0)
                .partial_cmp(&center(self, *b, 0))
                .unwrap_or(Ordering::Equal)
        });

        let mut parents = Vec::with_capacity(node_count);
        for slice in items.chunks_mut(slice_len) {
            slice.sort_by(|a, b| {
                center(self, *a, 1)
                    .partial_cmp(&center(self, *b, 1))
                    .unwrap_or(Ordering::Equal)
            });
            for group in slice.chunks(NODE_CAPACITY) {
                let bbox = group
                    .iter()
                    .map(|item| self.item_box(*item, leaf_level))
                    .reduce(|a, b| a.union(&b))
                    .unwrap_or(BoundingBox::point(0.0, 0.0));
                let node = if leaf_level {
                    Node::Leaf(group.to_vec())
                } else {
                    Node::Branch(group.to_vec())
                };
                self.nodes.push(Entry { bbox, node });
                parents.push(self.nodes.len() - 1);
            }
        }
        parents
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[VectorFeature] {
        &self.features
    }

    fn visit(&self, bbox: &BoundingBox, mut on_feature: impl FnMut(usize)) {
        let Some(root) = self.root else {
            return;
        };
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let entry = &self.nodes[node];
            if !entry.bbox.intersects(bbox) {
                continue;
            }
            match &entry.node {
                Node::Branch(children) => stack.extend(children.iter().copied()),
                Node::Leaf(items) => items
                    .iter()
                    .filter(|item| self.boxes[**item].intersects(bbox))
                    .for_each(|item| on_feature(*item)),
            }
        }
    }

    /// Features whose bounding box intersects `bbox`, ordered by id.
    pub fn query_range(&self, bbox: &BoundingBox) -> Vec<&VectorFeature> {
        let mut hits = Vec::new();
        self.visit(bbox, |item| hits.push(item));
        hits.sort_unstable();
        hits.into_iter().map(|item| &self.features[item]).collect()
    }

    /// The feature containing the point; the lowest id wins on overlap.
    pub fn query_point(&self, x: f64, y: f64) -> Option<&VectorFeature> {
        let query = BoundingBox::new(
            x - POINT_TOLERANCE,
            y - POINT_TOLERANCE,
            x + POINT_TOLERANCE,
            y + POINT_TOLERANCE,
        );
        let mut best: Option<usize> = None;
        self.visit(&query, |item| {
            if best.is_some_and(|current| current < item) {
                return;
            }
            if self.features[item].geometry.contains(x, y, POINT_TOLERANCE) {
                best = Some(item);
            }
        });
        best.map(|item| &self.features[item])
    }

    /// Closest point feature within `max_distance`, ties broken by id.
    pub fn nearest(&self, x: f64, y: f64, max_distance: f64) -> Option<&VectorFeature> {
        #[derive(PartialEq)]
        struct Candidate {
            distance: f64,
            is_feature: bool,
            slot: usize,
        }
        impl Eq for Candidate {}
        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> Ordering {
                self.distance
                    .total_cmp(&other.distance)
                    .then(self.is_feature.cmp(&other.is_feature))
                    .then(self.slot.cmp(&other.slot))
            }
        }

        let root = self.root?;
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(Candidate {
            distance: self.nodes[root].bbox.distance_to(x, y),
            is_feature: false,
            slot: root,
        }));
        while let Some(Reverse(candidate)) = heap.pop() {
            if candidate.distance > max_distance {
                return None;
            }
            if candidate.is_feature {
                return Some(&self.features[candidate.slot]);
            }
            match &self.nodes[candidate.slot].node {
                Node::Branch(children) => {
                    for &child in children {
                        heap.push(Reverse(Candidate {
                            distance: self.nodes[child].bbox.distance_to(x, y),
                            is_feature: false,
                            slot: child,
                        }));
                    }
                }
                Node::Leaf(items) => {
                    for &item in items {
                        if !self.features[item].geometry.is_point() {
                            continue;
                        }
                        heap.push(Reverse(Candidate {
                            distance: self.boxes[item].distance_to(x, y),
                            is_feature: true,
                            slot: item,
                        }));
                    }
                }
            }
        }
        None
    }
}
