/// A column/row/layer triple on the routing grid.
///
/// Coordinates are signed so that neighbour and rasterisation math can step
/// one cell off the die before being bounds-checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCoord {
    pub x: i32,
    pub y: i32,
    pub layer: u8,
}

impl GridCoord {
    pub fn new(x: i32, y: i32, layer: u8) -> Self {
        Self { x, y, layer }
    }
}

/// One maze step between adjacent grid cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    North,
    South,
    East,
    West,
    Up,
    Down,
}

impl Dir {
    /// Compass order used for deterministic neighbour expansion.
    pub const ALL: [Dir; 6] = [
        Dir::North,
        Dir::South,
        Dir::East,
        Dir::West,
        Dir::Up,
        Dir::Down,
    ];

    pub fn opposite(self) -> Dir {
        match self {
            Dir::North => Dir::South,
            Dir::South => Dir::North,
            Dir::East => Dir::West,
            Dir::West => Dir::East,
            Dir::Up => Dir::Down,
            Dir::Down => Dir::Up,
        }
    }

    /// The cell reached by taking this step from `c`.
    pub fn step(self, c: GridCoord) -> GridCoord {
        match self {
            Dir::North => GridCoord::new(c.x, c.y + 1, c.layer),
            Dir::South => GridCoord::new(c.x, c.y - 1, c.layer),
            Dir::East => GridCoord::new(c.x + 1, c.y, c.layer),
            Dir::West => GridCoord::new(c.x - 1, c.y, c.layer),
            Dir::Up => GridCoord::new(c.x, c.y, c.layer + 1),
            Dir::Down => GridCoord::new(c.x, c.y, c.layer - 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_and_opposite_cancel() {
        let c = GridCoord::new(3, 4, 1);
        for d in Dir::ALL {
            assert_eq!(d.opposite().step(d.step(c)), c);
        }
    }
}
