//! Connected-component labeling over 3D voxel grids
//!
//! Two-pass algorithm: a single raster scan assigns provisional labels,
//! consulting only already-visited neighbors (same slice plus one slice
//! back) and recording label collisions in an equivalence table instead of
//! relabeling; a second pass rewrites the volume through the resolved table
//! and compacts ids into a dense 1..=K range. Auxiliary structures are
//! bounded by O(volume size) and nothing recurses.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Neighbor connectivity in 3D.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Face neighbors only.
    Faces = 6,
    /// Face and edge neighbors.
    FacesEdges = 18,
    /// Face, edge and corner neighbors.
    FacesEdgesCorners = 26,
}

impl Connectivity {
    /// Number of neighbors per voxel.
    pub fn neighbor_count(self) -> usize {
        self as usize
    }
}

/// Maps provisional labels to canonical representatives.
///
/// Labels are 1-based. Merging links every involved root to the smallest,
/// so parents only ever decrease and lookups cannot cycle; `flatten`
/// path-compresses the whole table so transitively merged labels resolve in
/// one hop.
#[derive(Debug, Default)]
pub struct EquivalenceTable {
    parent: Vec<u32>,
}

impl EquivalenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of provisional labels issued.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Issue a fresh provisional label.
    pub fn fresh_label(&mut self) -> u32 {
        let label = self.parent.len() as u32 + 1;
        self.parent.push(label);
        label
    }

    /// Canonical representative of a label.
    pub fn find(&self, mut label: u32) -> u32 {
        loop {
            let p = self.parent[(label - 1) as usize];
            if p == label {
                return label;
            }
            label = p;
        }
    }

    /// Record that all given labels belong to one component.
    pub fn merge(&mut self, labels: &[u32]) {
        let mut min_root = u32::MAX;
        let mut roots = [0u32; 27];
        for (slot, &label) in roots.iter_mut().zip(labels.iter()) {
            let root = self.find(label);
            min_root = min_root.min(root);
            *slot = root;
        }
        for &root in roots.iter().take(labels.len()) {
            self.parent[(root - 1) as usize] = min_root;
        }
    }

    /// Path-compress every entry to its canonical representative.
    pub fn flatten(&mut self) {
        for i in 0..self.parent.len() {
            let root = self.find(i as u32 + 1);
            self.parent[i] = root;
        }
    }

    /// Resolved representative after `flatten`.
    fn resolved(&self, label: u32) -> u32 {
        self.parent[(label - 1) as usize]
    }
}

/// Result of a labeling pass: dense component count and the relabeled array.
#[derive(Debug, Clone)]
pub struct LabelResult {
    /// Number of components (or, in largest-per-value mode, the largest
    /// surviving input value).
    pub count: u32,
    /// 0 = background, 1..=count = dense sequential ids.
    pub labels: Vec<u32>,
}

#[inline]
fn idx(x: usize, y: usize, z: usize, dims: [usize; 3]) -> usize {
    x + y * dims[0] + z * dims[0] * dims[1]
}

/// Raster pass: provisional labels plus the equivalence table.
fn initial_labeling(
    bw: &[u32],
    dims: [usize; 3],
    conn: Connectivity,
) -> (EquivalenceTable, Vec<u32>) {
    let mut table = EquivalenceTable::new();
    let mut il = vec![0u32; bw.len()];
    let mut nabo = [0u32; 27];

    let wide = conn.neighbor_count() >= 18;
    let full = conn.neighbor_count() == 26;

    for z in 0..dims[2] {
        for y in 0..dims[1] {
            for x in 0..dims[0] {
                let here = idx(x, y, z, dims);
                let val = bw[here];
                if val == 0 {
                    continue;
                }

                let mut n = 0usize;
                let mut push = |xx: usize, yy: usize, zz: usize, n: &mut usize| {
                    let i = idx(xx, yy, zz, dims);
                    if bw[i] == val {
                        nabo[*n] = il[i];
                        *n += 1;
                    }
                };

                // previous slice
                if z > 0 {
                    push(x, y, z - 1, &mut n);
                    if wide {
                        if x > 0 {
                            push(x - 1, y, z - 1, &mut n);
                        }
                        if x + 1 < dims[0] {
                            push(x + 1, y, z - 1, &mut n);
                        }
                        if y > 0 {
                            push(x, y - 1, z - 1, &mut n);
                        }
                        if y + 1 < dims[1] {
                            push(x, y + 1, z - 1, &mut n);
                        }
                    }
                    if full {
                        if x > 0 && y > 0 {
                            push(x - 1, y - 1, z - 1, &mut n);
                        }
                        if x + 1 < dims[0] && y > 0 {
                            push(x + 1, y - 1, z - 1, &mut n);
                        }
                        if x > 0 && y + 1 < dims[1] {
                            push(x - 1, y + 1, z - 1, &mut n);
                        }
                        if x + 1 < dims[0] && y + 1 < dims[1] {
                            push(x + 1, y + 1, z - 1, &mut n);
                        }
                    }
                }
                // current slice, already-visited neighbors only
                if x > 0 {
                    push(x - 1, y, z, &mut n);
                }
                if y > 0 {
                    push(x, y - 1, z, &mut n);
                }
                if wide {
                    if x > 0 && y > 0 {
                        push(x - 1, y - 1, z, &mut n);
                    }
                    if x + 1 < dims[0] && y > 0 {
                        push(x + 1, y - 1, z, &mut n);
                    }
                }

                if n > 0 {
                    il[here] = nabo[0];
                    if n > 1 {
                        table.merge(&nabo[..n]);
                    }
                } else {
                    il[here] = table.fresh_label();
                }
            }
        }
    }

    table.flatten();
    (table, il)
}

/// Rewrite provisional labels through the resolved table, compacting ids
/// into a dense range ordered by first appearance in the raster scan.
fn translate_labels(il: &[u32], table: &EquivalenceTable) -> LabelResult {
    let mut first_seen = vec![0u32; table.len() + 1];
    let mut labels = vec![0u32; il.len()];
    let mut count = 0u32;
    for (out, &provisional) in labels.iter_mut().zip(il.iter()) {
        if provisional == 0 {
            continue;
        }
        let root = table.resolved(provisional) as usize;
        if first_seen[root] == 0 {
            count += 1;
            first_seen[root] = count;
        }
        *out = first_seen[root];
    }
    LabelResult { count, labels }
}

/// For every distinct input value keep only its spatially largest connected
/// cluster, zeroing smaller same-valued clusters. Ties go to the cluster
/// first encountered in raster scan order. Output voxels carry the original
/// input value; the count is the largest surviving value.
fn largest_cluster_per_value(bw: &[u32], result: &LabelResult) -> LabelResult {
    let count = result.count as usize;
    let mut size = vec![0u32; count + 1];
    let mut value_of = vec![0u32; count + 1];
    for (&label, &val) in result.labels.iter().zip(bw.iter()) {
        size[label as usize] += 1;
        value_of[label as usize] = val;
    }

    // Winner per value: labels were issued in scan order, so walking them in
    // id order and keeping strict improvements implements first-encountered
    // tie-breaking.
    let mut winner: HashMap<u32, (u32, u32)> = HashMap::new();
    for label in 1..=count as u32 {
        let val = value_of[label as usize];
        let sz = size[label as usize];
        let entry = winner.entry(val).or_insert((0, 0));
        if sz > entry.0 {
            *entry = (sz, label);
        }
    }

    let mut max_value = 0u32;
    let labels: Vec<u32> = result
        .labels
        .iter()
        .zip(bw.iter())
        .map(|(&label, &val)| {
            if label != 0 && winner.get(&val).map(|w| w.1) == Some(label) {
                max_value = max_value.max(val);
                val
            } else {
                0
            }
        })
        .collect();
    LabelResult {
        count: max_value,
        labels,
    }
}

/// Label connected components of a 3D volume.
///
/// # Arguments
/// * `img` - Sample values; nonzero is foreground (values truncate to u32)
/// * `dims` - Volume dimensions (nx, ny, nz)
/// * `conn` - Neighbor connectivity
/// * `binarize` - Treat every nonzero value as one class before labeling
/// * `largest_per_value` - Keep only the largest cluster of each input value
///
/// Without `binarize`, voxels join a component only when their input values
/// match exactly. A count of zero (no foreground) is a valid result.
/// Label assignment depends solely on raster order, so identical inputs
/// always produce identical labelings.
pub fn label_components(
    img: &[f64],
    dims: [usize; 3],
    conn: Connectivity,
    binarize: bool,
    largest_per_value: bool,
) -> Result<LabelResult> {
    let nvox = dims[0] * dims[1] * dims[2];
    if img.len() != nvox {
        return Err(EngineError::dimension_mismatch(nvox, img.len()));
    }
    if dims[0] < 2 || dims[1] < 2 || dims[2] < 1 {
        warn!(?dims, "volume too small to label");
        return Ok(LabelResult {
            count: 0,
            labels: vec![0; nvox],
        });
    }

    let bw: Vec<u32> = if binarize {
        img.iter().map(|&v| u32::from(v != 0.0)).collect()
    } else {
        img.iter().map(|&v| v as u32).collect()
    };

    let (table, il) = initial_labeling(&bw, dims, conn);
    let result = translate_labels(&il, &table);
    debug!(
        conn = conn.neighbor_count(),
        clusters = result.count,
        "connected component labeling complete"
    );

    if largest_per_value {
        return Ok(largest_cluster_per_value(&bw, &result));
    }
    Ok(result)
}

/// Drop labeled clusters whose physical volume falls below `min_mm3`,
/// renumbering survivors densely in scan order.
///
/// # Arguments
/// * `result` - A dense labeling from [`label_components`]
/// * `spacing` - Voxel spacing in mm
/// * `min_mm3` - Minimum cluster volume in cubic millimeters
pub fn remove_small_clusters(
    result: &LabelResult,
    spacing: [f64; 3],
    min_mm3: f64,
) -> LabelResult {
    let voxel_mm3 = spacing[0].abs() * spacing[1].abs() * spacing[2].abs();
    let count = result.count as usize;
    let mut size = vec![0u64; count + 1];
    for &label in &result.labels {
        size[label as usize] += 1;
    }
    let mut renumber = vec![0u32; count + 1];
    let mut kept = 0u32;
    for label in 1..=count {
        if size[label] as f64 * voxel_mm3 >= min_mm3 {
            kept += 1;
            renumber[label] = kept;
        }
    }
    let labels = result
        .labels
        .iter()
        .map(|&l| renumber[l as usize])
        .collect();
    LabelResult {
        count: kept,
        labels,
    }
}
