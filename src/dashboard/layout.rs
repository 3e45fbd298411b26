//! Placement of new widgets on the dashboard grid.

use crate::widget::{Position, WidgetKind};

/// Picks a position for a new widget given the ones already placed.
pub trait Layout: Send + Sync {
  fn place(&self, kind: WidgetKind, existing: &[Position]) -> Position;
}

/// Fills a fixed-width grid top to bottom, left to right.
#[derive(Debug, Clone, Copy)]
pub struct StackLayout {
  pub columns: u32,
}

impl Default for StackLayout {
  fn default() -> Self {
    Self { columns: 12 }
  }
}

impl StackLayout {
  /// Default footprint (w, h) per widget kind.
  fn size(&self, kind: WidgetKind) -> (u32, u32) {
    let (w, h) = match kind {
      WidgetKind::Text => (6, 2),
      WidgetKind::Chart => (6, 4),
      WidgetKind::Kpi => (3, 2),
      WidgetKind::Table => (12, 4),
    };
    (w.min(self.columns), h)
  }
}

impl Layout for StackLayout {
  fn place(&self, kind: WidgetKind, existing: &[Position]) -> Position {
    let (w, h) = self.size(kind);
    let bottom = existing.iter().map(Position::bottom).max().unwrap_or(0);

    // The first free slot sits on row 0 or a bottom edge, and on column 0
    // or a right edge
    let mut rows: Vec<u32> = existing.iter().map(Position::bottom).collect();
    rows.push(0);
    rows.sort_unstable();
    rows.dedup();
    let mut columns: Vec<u32> = existing
      .iter()
      .map(Position::right)
      .filter(|&x| x <= self.columns - w)
      .collect();
    columns.push(0);
    columns.sort_unstable();
    columns.dedup();

    for &y in &rows {
      for &x in &columns {
        let candidate = Position::new(x, y, w, h);
        if !existing.iter().any(|p| p.overlaps(&candidate)) {
          return candidate;
        }
      }
    }
    // Below the lowest widget there is always room
    Position::new(0, bottom, w, h)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_first_widget_goes_top_left() {
    let layout = StackLayout::default();
    assert_eq!(layout.place(WidgetKind::Chart, &[]), Position::new(0, 0, 6, 4));
  }

  #[test]
  fn test_fills_row_before_stacking() {
    let layout = StackLayout::default();
    let existing = [Position::new(0, 0, 6, 4)];
    assert_eq!(layout.place(WidgetKind::Chart, &existing), Position::new(6, 0, 6, 4));

    let existing = [Position::new(0, 0, 6, 4), Position::new(6, 0, 6, 4)];
    assert_eq!(layout.place(WidgetKind::Table, &existing), Position::new(0, 4, 12, 4));
  }

  #[test]
  fn test_uses_gaps() {
    let layout = StackLayout::default();
    let existing = [Position::new(0, 0, 12, 2), Position::new(0, 2, 3, 2)];
    assert_eq!(layout.place(WidgetKind::Kpi, &existing), Position::new(3, 2, 3, 2));
  }

  #[test]
  fn test_never_collides() {
    let layout = StackLayout::default();
    let mut placed = Vec::new();
    for kind in [
      WidgetKind::Table,
      WidgetKind::Kpi,
      WidgetKind::Chart,
      WidgetKind::Text,
      WidgetKind::Kpi,
      WidgetKind::Chart,
    ] {
      let position = layout.place(kind, &placed);
      assert!(placed.iter().all(|p: &Position| !p.overlaps(&position)));
      placed.push(position);
    }
  }

  #[test]
  fn test_narrow_grid_clamps_width() {
    let layout = StackLayout { columns: 4 };
    assert_eq!(layout.place(WidgetKind::Table, &[]), Position::new(0, 0, 4, 4));
  }

  #[test]
  fn test_far_away_widget_does_not_overflow() {
    let layout = StackLayout::default();
    let far = Position::new(0, u32::MAX, 12, 4);
    assert_eq!(far.bottom(), u32::MAX);
    assert!(!far.overlaps(&Position::new(0, 0, 12, 4)));
    assert_eq!(layout.place(WidgetKind::Chart, &[far]), Position::new(0, 0, 6, 4));

    let existing = [Position::new(0, 0, 12, 2), far];
    assert_eq!(layout.place(WidgetKind::Kpi, &existing), Position::new(0, 2, 3, 2));
  }
}
