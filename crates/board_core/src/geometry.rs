//! Pointer-to-slot resolution for drop targets.
//!
//! Coordinates are screen coordinates: `y` grows downward.

use crate::drag::Slot;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Rendered vertical extent of a card.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CardBounds {
    pub top: f32,
    pub height: f32,
}

impl CardBounds {
    pub fn new(top: f32, height: f32) -> Self {
        Self { top, height }
    }

    pub fn midpoint(&self) -> f32 {
        self.top + self.height / 2.0
    }
}

/// Rendered horizontal extent of a column and its cards, in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBounds {
    pub left: f32,
    pub width: f32,
    pub cards: Vec<CardBounds>,
}

impl ColumnBounds {
    pub fn contains_x(&self, x: f32) -> bool {
        x >= self.left && x < self.left + self.width
    }
}

/// Insertion index for a pointer hovering over a column, in `[0, cards.len()]`.
///
/// Returns the index of the first card whose midpoint lies strictly below the
/// pointer. A pointer exactly on a midpoint inserts after that card.
pub fn resolve_index(cards: &[CardBounds], pointer_y: f32) -> usize {
    cards
        .iter()
        .position(|card| card.midpoint() > pointer_y)
        .unwrap_or(cards.len())
}

/// Slot under the pointer, or `None` when the pointer is outside every column.
pub fn resolve_target(columns: &[ColumnBounds], pointer: Point) -> Option<Slot> {
    let column = columns.iter().position(|column| column.contains_x(pointer.x))?;
    Some(Slot {
        column,
        index: resolve_index(&columns[column].cards, pointer.y),
    })
}

#[cfg(test)]
#[path = "tests/geometry_tests.rs"]
mod tests;
