use render_protocol::{FloatRect, IntRect, IntSize};
use smallvec::SmallVec;

/// Rectangles kept before a [`DamageMode::Rectangles`] damage collapses to its bounds.
pub const MAX_DAMAGE_RECTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageMode {
    /// Individual rectangles, up to [`MAX_DAMAGE_RECTS`].
    Rectangles,
    /// A single rectangle covering everything added.
    BoundingBox,
    /// The whole frame.
    Full,
}

/// Region of a frame that changed, in device pixels, clipped to the frame size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Damage {
    mode: DamageMode,
    frame: IntRect,
    rects: SmallVec<[IntRect; 4]>,
}

impl Damage {
    pub fn new(size: IntSize, mode: DamageMode) -> Self {
        let mut damage = Self {
            mode,
            frame: IntRect::from_size(size),
            rects: SmallVec::new(),
        };
        if mode == DamageMode::Full && !damage.frame.is_empty() {
            damage.rects.push(damage.frame);
        }
        damage
    }

    pub fn full(size: IntSize) -> Self {
        Self::new(size, DamageMode::Full)
    }

    pub fn mode(&self) -> DamageMode {
        self.mode
    }

    pub fn size(&self) -> IntSize {
        self.frame.size()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[IntRect] {
        &self.rects
    }

    pub fn bounds(&self) -> IntRect {
        self.rects
            .iter()
            .fold(IntRect::default(), |bounds, rect| bounds.union(*rect))
    }

    /// Whether the damage covers the whole frame.
    pub fn is_full(&self) -> bool {
        self.bounds().contains(self.frame) && self.rects.len() == 1
    }

    pub fn add(&mut self, rect: IntRect) {
        let rect = rect.intersection(self.frame);
        if rect.is_empty() {
            return;
        }
        match self.mode {
            DamageMode::Full => {}
            DamageMode::BoundingBox => {
                let bounds = self.bounds().union(rect);
                self.rects.clear();
                self.rects.push(bounds);
            }
            DamageMode::Rectangles => {
                if self.rects.iter().any(|existing| existing.contains(rect)) {
                    return;
                }
                self.rects.retain(|existing| !rect.contains(*existing));
                self.rects.push(rect);
                if self.rects.len() > MAX_DAMAGE_RECTS {
                    let bounds = self.bounds();
                    self.rects.clear();
                    self.rects.push(bounds);
                }
            }
        }
    }

    pub fn add_float(&mut self, rect: FloatRect) {
        self.add(rect.enclosing_int_rect());
    }

    pub fn add_damage(&mut self, other: &Damage) {
        for rect in other.rects() {
            self.add(*rect);
        }
    }

    /// Covers the whole frame from now on.
    pub fn make_full(&mut self) {
        self.rects.clear();
        if !self.frame.is_empty() {
            self.rects.push(self.frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangles_are_clipped_and_deduplicated() {
        let mut damage = Damage::new(IntSize::new(100, 100), DamageMode::Rectangles);
        damage.add(IntRect::new(90, 90, 20, 20));
        damage.add(IntRect::new(92, 92, 4, 4));
        damage.add(IntRect::new(200, 200, 10, 10));
        assert_eq!(damage.rects(), &[IntRect::new(90, 90, 10, 10)]);

        damage.add(IntRect::new(0, 0, 100, 100));
        assert!(damage.is_full());
    }

    #[test]
    fn bounding_box_keeps_one_rect() {
        let mut damage = Damage::new(IntSize::new(100, 100), DamageMode::BoundingBox);
        damage.add(IntRect::new(0, 0, 10, 10));
        damage.add(IntRect::new(50, 40, 10, 10));
        assert_eq!(damage.rects(), &[IntRect::new(0, 0, 60, 50)]);
    }

    #[test]
    fn too_many_rectangles_collapse_to_bounds() {
        let mut damage = Damage::new(IntSize::new(1000, 10), DamageMode::Rectangles);
        for index in 0..=MAX_DAMAGE_RECTS as i32 {
            damage.add(IntRect::new(index * 20, 0, 10, 10));
        }
        assert_eq!(damage.rects().len(), 1);
        assert_eq!(damage.bounds(), IntRect::new(0, 0, 330, 10));
    }

    #[test]
    fn full_damage_ignores_additions() {
        let mut damage = Damage::full(IntSize::new(8, 8));
        damage.add(IntRect::new(1, 1, 2, 2));
        assert_eq!(damage.rects(), &[IntRect::new(0, 0, 8, 8)]);
        assert!(Damage::full(IntSize::default()).is_empty());
    }
}
