use forage_proto::TileId;
use serde::{Deserialize, Serialize};

/// Rectangular pixel window of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Window {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn intersection(&self, other: &Window) -> Option<Window> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x0 < x1 && y0 < y1 {
            Some(Window::new(x0, y0, x1 - x0, y1 - y0))
        } else {
            None
        }
    }
}

/// One of the eight neighbours of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    /// Column/row offset, with rows growing southward.
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::NorthEast => (1, -1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, 1),
            Direction::South => (0, 1),
            Direction::SouthWest => (-1, 1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::North => "n",
            Direction::NorthEast => "ne",
            Direction::East => "e",
            Direction::SouthEast => "se",
            Direction::South => "s",
            Direction::SouthWest => "sw",
            Direction::West => "w",
            Direction::NorthWest => "nw",
        }
    }
}

/// Fixed-size tiling of a raster grid. Tiles on the right and bottom edges
/// may be narrower than `tile_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileLayout {
    width: u32,
    height: u32,
    tile_size: u32,
}

impl TileLayout {
    pub fn new(width: u32, height: u32, tile_size: u32) -> Self {
        Self {
            width,
            height,
            tile_size: tile_size.max(1),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn cols(&self) -> u32 {
        self.width.div_ceil(self.tile_size)
    }

    pub fn rows(&self) -> u32 {
        self.height.div_ceil(self.tile_size)
    }

    pub fn tile_count(&self) -> usize {
        self.cols() as usize * self.rows() as usize
    }

    pub fn contains(&self, tile: TileId) -> bool {
        tile.col < self.cols() && tile.row < self.rows()
    }

    /// Tiles in row-major order.
    pub fn tiles(&self) -> impl Iterator<Item = TileId> + '_ {
        (0..self.rows()).flat_map(move |row| (0..self.cols()).map(move |col| TileId::new(col, row)))
    }

    pub fn window(&self, tile: TileId) -> Window {
        debug_assert!(self.contains(tile));
        let x = tile.col * self.tile_size;
        let y = tile.row * self.tile_size;
        Window::new(
            x,
            y,
            self.tile_size.min(self.width - x),
            self.tile_size.min(self.height - y),
        )
    }

    pub fn tile_of(&self, x: u32, y: u32) -> TileId {
        TileId::new(x / self.tile_size, y / self.tile_size)
    }

    pub fn neighbor(&self, tile: TileId, direction: Direction) -> Option<TileId> {
        let (dx, dy) = direction.offset();
        let col = tile.col as i64 + dx as i64;
        let row = tile.row as i64 + dy as i64;
        if col < 0 || row < 0 {
            return None;
        }
        let candidate = TileId::new(col as u32, row as u32);
        self.contains(candidate).then_some(candidate)
    }

    pub fn neighbors(&self, tile: TileId) -> Vec<(Direction, TileId)> {
        Direction::ALL
            .iter()
            .filter_map(|&direction| {
                self.neighbor(tile, direction)
                    .map(|neighbor| (direction, neighbor))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn window_len_does_not_wrap_at_u32() {
        let window = Window::new(0, 0, 70_000, 70_000);
        assert_eq!(window.len(), 4_900_000_000);
    }

    #[test]
    fn edge_tiles_are_clipped() {
        let layout = TileLayout::new(10, 7, 4);
        assert_eq!(layout.cols(), 3);
        assert_eq!(layout.rows(), 2);
        assert_eq!(layout.window(TileId::new(2, 1)), Window::new(8, 4, 2, 3));
        let covered: usize = layout.tiles().map(|tile| layout.window(tile).len()).sum();
        assert_eq!(covered, 70);
    }

    #[test]
    fn corner_tile_has_three_neighbors() {
        let layout = TileLayout::new(8, 8, 4);
        let neighbors = layout.neighbors(TileId::new(0, 0));
        assert_eq!(
            neighbors,
            vec![
                (Direction::East, TileId::new(1, 0)),
                (Direction::SouthEast, TileId::new(1, 1)),
                (Direction::South, TileId::new(0, 1)),
            ]
        );
    }

    #[test]
    fn window_intersection() {
        let a = Window::new(0, 0, 4, 4);
        let b = Window::new(2, 3, 4, 4);
        assert_eq!(a.intersection(&b), Some(Window::new(2, 3, 2, 1)));
        assert_eq!(a.intersection(&Window::new(4, 0, 1, 1)), None);
    }
}
