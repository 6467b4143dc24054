//! Integer pixel geometry shared by every graphics layer.

/// 2D point in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// 2D extent in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: i32,
    pub height: i32,
}

impl Extent {
    #[must_use]
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub const fn area(self) -> i64 {
        self.width as i64 * self.height as i64
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Rectangle with corner and extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub corner: Point,
    pub extent: Extent,
}

impl Rect {
    #[must_use]
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            corner: Point::new(x, y),
            extent: Extent::new(width, height),
        }
    }

    #[must_use]
    pub const fn from_parts(corner: Point, extent: Extent) -> Self {
        Self { corner, extent }
    }

    #[must_use]
    pub const fn x(self) -> i32 {
        self.corner.x
    }

    #[must_use]
    pub const fn y(self) -> i32 {
        self.corner.y
    }

    #[must_use]
    pub const fn width(self) -> i32 {
        self.extent.width
    }

    #[must_use]
    pub const fn height(self) -> i32 {
        self.extent.height
    }

    /// Exclusive right edge.
    #[must_use]
    pub const fn right(self) -> i32 {
        self.corner.x + self.extent.width
    }

    /// Exclusive bottom edge.
    #[must_use]
    pub const fn bottom(self) -> i32 {
        self.corner.y + self.extent.height
    }

    #[must_use]
    pub const fn area(self) -> i64 {
        self.extent.area()
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.extent.is_empty()
    }

    #[must_use]
    pub const fn contains_point(self, x: i32, y: i32) -> bool {
        x >= self.corner.x && y >= self.corner.y && x < self.right() && y < self.bottom()
    }

    #[must_use]
    pub const fn contains_rect(self, other: Rect) -> bool {
        other.corner.x >= self.corner.x
            && other.corner.y >= self.corner.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    #[must_use]
    pub fn intersect(self, other: Rect) -> Rect {
        let x0 = self.corner.x.max(other.corner.x);
        let y0 = self.corner.y.max(other.corner.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return Rect::new(0, 0, 0, 0);
        }
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    #[must_use]
    pub fn overlaps(self, other: Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Translate by `(dx, dy)`.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32) -> Rect {
        Rect::new(
            self.corner.x + dx,
            self.corner.y + dy,
            self.extent.width,
            self.extent.height,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_edges() {
        let r = Rect::new(2, 3, 10, 20);
        assert_eq!(r.right(), 12);
        assert_eq!(r.bottom(), 23);
        assert_eq!(r.area(), 200);
    }

    #[test]
    fn rect_contains() {
        let r = Rect::new(0, 0, 4, 4);
        assert!(r.contains_point(0, 0));
        assert!(r.contains_point(3, 3));
        assert!(!r.contains_point(4, 0));
        assert!(r.contains_rect(Rect::new(1, 1, 3, 3)));
        assert!(!r.contains_rect(Rect::new(1, 1, 4, 3)));
    }

    #[test]
    fn rect_intersect() {
        let a = Rect::new(0, 0, 4, 4);
        let b = Rect::new(2, 2, 4, 4);
        assert_eq!(a.intersect(b), Rect::new(2, 2, 2, 2));
        let c = Rect::new(4, 4, 2, 2);
        assert!(a.intersect(c).is_empty());
        assert!(!a.overlaps(c));
    }

    #[test]
    fn rect_offset() {
        let r = Rect::new(1, 2, 3, 4);
        assert_eq!(r.offset(10, -2), Rect::new(11, 0, 3, 4));
    }
}
