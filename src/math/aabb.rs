//! Axis-aligned bounding box

use crate::core::types::Vec3;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest AABB containing every point, or `None` for an empty input
    pub fn from_points<I>(points: I) -> Option<Aabb>
    where
        I: IntoIterator<Item = Vec3>,
    {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut aabb = Aabb::new(first, first);
        for p in iter {
            aabb.expand(p);
        }
        Some(aabb)
    }

    /// Get center point
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Check if point is inside AABB
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.x >= self.min.x && p.x <= self.max.x &&
        p.y >= self.min.y && p.y <= self.max.y &&
        p.z >= self.min.z && p.z <= self.max.z
    }

    /// Expand AABB to include point
    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Return merged AABB containing both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_points() {
        let aabb = Aabb::from_points([
            Vec3::new(1.0, 0.0, 2.0),
            Vec3::new(-1.0, 3.0, 0.5),
            Vec3::new(0.0, -2.0, 4.0),
        ])
        .expect("non-empty input");

        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, 0.5));
        assert_eq!(aabb.max, Vec3::new(1.0, 3.0, 4.0));
    }

    #[test]
    fn test_from_no_points() {
        assert!(Aabb::from_points(std::iter::empty()).is_none());
    }

    #[test]
    fn test_single_point_is_degenerate() {
        let p = Vec3::new(25.0, 0.0, 35.0);
        let aabb = Aabb::from_points([p]).expect("non-empty input");
        assert_eq!(aabb.size(), Vec3::ZERO);
        assert_eq!(aabb.center(), p);
        assert!(aabb.contains_point(p));
    }

    #[test]
    fn test_merged() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(-1.0), Vec3::splat(0.5));
        let m = a.merged(&b);
        assert_eq!(m.min, Vec3::splat(-1.0));
        assert_eq!(m.max, Vec3::ONE);
    }
}
