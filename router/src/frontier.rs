use crate::grid::RouteGrid;
use gridroute_common::db::core::NetData;
use gridroute_common::geom::coord::{Dir, GridCoord};
use gridroute_common::util::config::MaskMode;
use priority_queue::PriorityQueue;
use std::cmp::Reverse;

pub const F_SOURCE: u8 = 0x01;
pub const F_TARGET: u8 = 0x02;
/// The cell has been given a cost (it is or was on the frontier).
pub const F_COST: u8 = 0x04;
pub const F_PROCESSED: u8 = 0x08;
/// Stage 2 relaxed this cell through another net's route.
pub const F_CONFLICT: u8 = 0x10;

/// Sentinel for "no cost recorded yet".
pub const MAX_COST: u32 = u32::MAX;

/// Per-cell search state for one net's routing, parallel to the occupancy
/// grid. Clearing between nets is O(1) via an epoch tag; a cell whose tag
/// is stale reads as unseen.
pub struct SearchGrid {
    flags: Vec<u8>,
    cost: Vec<u32>,
    pred: Vec<Option<Dir>>,
    tag: Vec<u32>,
    current: u32,

    queue: PriorityQueue<usize, Reverse<(u32, u64)>>,
    seq: u64,
}

impl SearchGrid {
    pub fn new(size: usize) -> Self {
        Self {
            flags: vec![0; size],
            cost: vec![MAX_COST; size],
            pred: vec![None; size],
            tag: vec![0; size],
            current: 1,
            queue: PriorityQueue::new(),
            seq: 0,
        }
    }

    /// Forget all state from the previous net.
    pub fn reset(&mut self) {
        self.current = self.current.wrapping_add(1);
        if self.current == 0 {
            self.tag.fill(0);
            self.current = 1;
        }
        self.queue.clear();
        self.seq = 0;
    }

    #[inline(always)]
    fn sync(&mut self, idx: usize) {
        if self.tag[idx] != self.current {
            self.tag[idx] = self.current;
            self.flags[idx] = 0;
            self.cost[idx] = MAX_COST;
            self.pred[idx] = None;
        }
    }

    #[inline(always)]
    pub fn flags(&self, idx: usize) -> u8 {
        if self.tag[idx] == self.current {
            self.flags[idx]
        } else {
            0
        }
    }

    pub fn set_flags(&mut self, idx: usize, flags: u8) {
        self.sync(idx);
        self.flags[idx] |= flags;
    }

    pub fn clear_flags(&mut self, idx: usize, flags: u8) {
        self.sync(idx);
        self.flags[idx] &= !flags;
    }

    #[inline(always)]
    pub fn cost(&self, idx: usize) -> u32 {
        if self.tag[idx] == self.current {
            self.cost[idx]
        } else {
            MAX_COST
        }
    }

    pub fn set_cost(&mut self, idx: usize, cost: u32) {
        self.sync(idx);
        self.cost[idx] = cost;
    }

    #[inline(always)]
    pub fn pred(&self, idx: usize) -> Option<Dir> {
        if self.tag[idx] == self.current {
            self.pred[idx]
        } else {
            None
        }
    }

    pub fn set_pred(&mut self, idx: usize, pred: Option<Dir>) {
        self.sync(idx);
        self.pred[idx] = pred;
    }

    /// Queue a cell at the given cost. A cell already queued keeps its
    /// original insertion sequence, so equal costs pop in first-queued
    /// order.
    pub fn enqueue(&mut self, idx: usize, cost: u32) {
        let existing = self.queue.get(&idx).map(|(_, &Reverse((_, seq)))| seq);
        match existing {
            Some(seq) => {
                self.queue.change_priority(&idx, Reverse((cost, seq)));
            }
            None => {
                self.seq += 1;
                let seq = self.seq;
                self.queue.push(idx, Reverse((cost, seq)));
            }
        }
    }

    /// Pop the lowest-cost queued cell.
    pub fn pop(&mut self) -> Option<(usize, u32)> {
        self.queue.pop().map(|(idx, Reverse((cost, _)))| (idx, cost))
    }
}

/// Spatial restriction of one search to a window around the net's bounding
/// box. Cells outside are treated as unroutable for this search only.
#[derive(Clone, Copy, Debug)]
pub struct Mask {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Mask {
    #[inline(always)]
    pub fn contains(&self, c: GridCoord) -> bool {
        c.x >= self.x1 && c.x <= self.x2 && c.y >= self.y1 && c.y <= self.y2
    }
}

/// Build the search mask for a net. `auto` widens the margin as the net
/// keeps failing, eventually approaching an unmasked search.
pub fn build_mask(mode: MaskMode, net: &NetData, grid: &RouteGrid) -> Option<Mask> {
    let bbox = net.bbox?;
    let margin = match mode {
        MaskMode::None => return None,
        MaskMode::Bbox => 0,
        MaskMode::Margin(m) => m as i32,
        MaskMode::Auto => 2 + 2 * net.fail_count as i32,
    };
    Some(Mask {
        x1: (bbox.0 - margin).max(0),
        y1: (bbox.1 - margin).max(0),
        x2: (bbox.2 + margin).min(grid.nx() - 1),
        y2: (bbox.3 + margin).min(grid.ny() - 1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_cells_read_as_unseen() {
        let mut sg = SearchGrid::new(16);
        sg.set_flags(3, F_SOURCE);
        sg.set_cost(3, 7);
        assert_eq!(sg.flags(3), F_SOURCE);
        sg.reset();
        assert_eq!(sg.flags(3), 0);
        assert_eq!(sg.cost(3), MAX_COST);
    }

    #[test]
    fn pops_lowest_cost_in_insertion_order() {
        let mut sg = SearchGrid::new(16);
        sg.enqueue(1, 10);
        sg.enqueue(2, 5);
        sg.enqueue(3, 10);
        assert_eq!(sg.pop().unwrap().0, 2);
        // Equal costs: first queued pops first.
        assert_eq!(sg.pop().unwrap().0, 1);
        assert_eq!(sg.pop().unwrap().0, 3);
        assert!(sg.pop().is_none());
    }

    #[test]
    fn requeue_improves_cost_without_losing_order() {
        let mut sg = SearchGrid::new(16);
        sg.enqueue(1, 10);
        sg.enqueue(2, 8);
        sg.enqueue(1, 3);
        assert_eq!(sg.pop().unwrap(), (1, 3));
        assert_eq!(sg.pop().unwrap(), (2, 8));
    }
}
