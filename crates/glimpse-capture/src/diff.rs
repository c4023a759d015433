//! Software block diff between consecutive BGRA frames.
//!
//! The frame is cut into a 32x32 block grid (edge blocks are smaller).
//! Each block is compared row-by-row against the previous frame and
//! marked changed on the first differing row. Changed blocks are merged
//! into larger rectangles with a union-find over inflated bounds, so a
//! burst of adjacent small changes becomes one region instead of
//! dozens.

use crate::frame::{Rect, BYTES_PER_PIXEL};

/// Side length of a comparison block in pixels.
pub const BLOCK_SIZE: u32 = 32;

/// Compare `current` against `previous` and return merged changed
/// rectangles in pixel coordinates.
///
/// Returns `None` when more than 80% of blocks changed; the caller
/// should send a keyframe instead. Returns an empty vector when the
/// frames are identical.
#[must_use]
pub fn diff_frames(
    current: &[u8],
    previous: &[u8],
    width: u32,
    height: u32,
) -> Option<Vec<Rect>> {
    let stride = width as usize * BYTES_PER_PIXEL;
    let cols = width.div_ceil(BLOCK_SIZE);
    let rows = height.div_ceil(BLOCK_SIZE);
    let total = (cols * rows) as usize;

    let mut changed = Vec::new();

    // Row-major block enumeration keeps the output deterministic.
    for by in 0..rows {
        for bx in 0..cols {
            let x = bx * BLOCK_SIZE;
            let y = by * BLOCK_SIZE;
            let w = BLOCK_SIZE.min(width - x);
            let h = BLOCK_SIZE.min(height - y);

            if block_changed(current, previous, stride, x, y, w, h) {
                changed.push(Rect::from_size(x as i32, y as i32, w, h));
                // Abort once more than 80% of blocks differ.
                if changed.len() * 5 > total * 4 {
                    return None;
                }
            }
        }
    }

    Some(merge_rects(&changed, width, height))
}

fn block_changed(
    current: &[u8],
    previous: &[u8],
    stride: usize,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
) -> bool {
    let row_bytes = w as usize * BYTES_PER_PIXEL;
    for row in 0..h as usize {
        let start = (y as usize + row) * stride + x as usize * BYTES_PER_PIXEL;
        if current[start..start + row_bytes] != previous[start..start + row_bytes] {
            return true;
        }
    }
    false
}

/// Merge rectangles whose inflated bounds touch, then clamp the merged
/// bounds back to the frame.
fn merge_rects(rects: &[Rect], width: u32, height: u32) -> Vec<Rect> {
    let inflate = (BLOCK_SIZE / 2) as i32;
    let inflated: Vec<Rect> = rects.iter().map(|r| r.inflate(inflate)).collect();

    let mut uf = UnionFind::new(inflated.len());
    for i in 0..inflated.len() {
        for j in (i + 1)..inflated.len() {
            if inflated[i].intersects(&inflated[j]) {
                uf.union(i, j);
            }
        }
    }

    // Accumulate each group's bounding union onto its root, then emit
    // in root order (ascending index, hence row-major).
    let mut bounds: Vec<Option<Rect>> = vec![None; inflated.len()];
    for (i, rect) in inflated.iter().enumerate() {
        let root = uf.find(i);
        bounds[root] = Some(match bounds[root] {
            Some(acc) => acc.union(rect),
            None => *rect,
        });
    }

    bounds
        .into_iter()
        .flatten()
        .map(|r| r.clamp_to(width, height))
        .filter(|r| !r.is_empty())
        .collect()
}

/// Path-compressing union-find where the smaller root index wins, so
/// group representatives are deterministic.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        if ra < rb {
            self.parent[rb] = ra;
        } else {
            self.parent[ra] = rb;
        }
    }
}
