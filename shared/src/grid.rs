//! Cell occupancy for collision-as-death games.
//!
//! The outer ring of cells is wall. Every resolved position leaves a trail
//! cell behind, so a player can crash into anyone's past path, including its
//! own.

use crate::{Pid, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Wall,
    Trail(Pid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    width: i32,
    height: i32,
    // Column-major: index = x * height + y
    cells: Vec<Cell>,
}

impl Grid {
    pub fn new(width: i32, height: i32) -> Self {
        let width = width.max(0);
        let height = height.max(0);
        let mut cells = vec![Cell::Empty; (width * height) as usize];

        for x in 0..width {
            for y in 0..height {
                if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
                    cells[(x * height + y) as usize] = Cell::Wall;
                }
            }
        }

        Self {
            width,
            height,
            cells,
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if (0..self.width).contains(&x) && (0..self.height).contains(&y) {
            Some((x * self.height + y) as usize)
        } else {
            None
        }
    }

    /// Returns None outside the grid.
    pub fn cell(&self, x: i32, y: i32) -> Option<Cell> {
        self.index(x, y).map(|i| self.cells[i])
    }

    /// True for walls, trails, and anything out of bounds.
    pub fn is_blocked(&self, x: i32, y: i32) -> bool {
        !matches!(self.cell(x, y), Some(Cell::Empty))
    }

    /// Marks an empty cell as `pid`'s trail. Occupied cells keep their first
    /// owner; returns whether the cell was claimed.
    pub fn occupy(&mut self, position: &Position, pid: Pid) -> bool {
        match self.index(position.x, position.y) {
            Some(i) if self.cells[i] == Cell::Empty => {
                self.cells[i] = Cell::Trail(pid);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;

    #[test]
    fn test_border_is_wall() {
        let grid = Grid::new(30, 40);
        assert_eq!(grid.cell(0, 5), Some(Cell::Wall));
        assert_eq!(grid.cell(29, 5), Some(Cell::Wall));
        assert_eq!(grid.cell(5, 0), Some(Cell::Wall));
        assert_eq!(grid.cell(5, 39), Some(Cell::Wall));
        assert_eq!(grid.cell(5, 5), Some(Cell::Empty));
        assert_eq!(grid.cell(28, 38), Some(Cell::Empty));
    }

    #[test]
    fn test_out_of_bounds_is_blocked() {
        let grid = Grid::new(30, 30);
        assert_eq!(grid.cell(-1, 3), None);
        assert_eq!(grid.cell(3, 30), None);
        assert!(grid.is_blocked(-1, 3));
        assert!(grid.is_blocked(30, 3));
        assert!(!grid.is_blocked(3, 3));
    }

    #[test]
    fn test_occupy_keeps_first_owner() {
        let mut grid = Grid::new(30, 30);
        let spot = Position::new(10, 12, Direction::Left);

        assert!(grid.occupy(&spot, Pid(1)));
        assert!(!grid.occupy(&spot, Pid(2)));
        assert_eq!(grid.cell(10, 12), Some(Cell::Trail(Pid(1))));
        assert!(grid.is_blocked(10, 12));
    }

    #[test]
    fn test_walls_cannot_be_occupied() {
        let mut grid = Grid::new(30, 30);
        let wall = Position::new(0, 12, Direction::Left);
        assert!(!grid.occupy(&wall, Pid(1)));
        assert_eq!(grid.cell(0, 12), Some(Cell::Wall));
    }
}
