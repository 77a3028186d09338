//! Vertex ordering and deduplication.

use glam::Vec3;
use ordered_float::OrderedFloat;

/// Lexicographic (x, y, z) sort key for a vertex.
///
/// `OrderedFloat` gives every float a place in the order (NaN sorts last),
/// so sorting never panics on degenerate engine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VertexKey(OrderedFloat<f32>, OrderedFloat<f32>, OrderedFloat<f32>);

impl From<Vec3> for VertexKey {
    fn from(v: Vec3) -> Self {
        Self(OrderedFloat(v.x), OrderedFloat(v.y), OrderedFloat(v.z))
    }
}

/// Sort vertices ascending by (x, y, z) and drop adjacent exact duplicates.
///
/// Duplicates are detected with plain float equality, so two vertices that
/// differ in the last bit are both kept.
pub fn sort_and_dedup(mut vertices: Vec<Vec3>) -> Vec<Vec3> {
    vertices.sort_by_key(|v| VertexKey::from(*v));
    vertices.dedup_by(|a, b| a == b);
    vertices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_is_lexicographic() {
        let sorted = sort_and_dedup(vec![
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(0.0, 1.0, 5.0),
            Vec3::new(0.0, 1.0, -5.0),
        ]);
        assert_eq!(
            sorted,
            vec![
                Vec3::new(0.0, 1.0, -5.0),
                Vec3::new(0.0, 1.0, 5.0),
                Vec3::new(0.0, 2.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
            ]
        );
    }

    #[test]
    fn test_dedup_removes_exact_duplicates_only() {
        let a = Vec3::new(0.25, 0.5, 0.75);
        let nudged = Vec3::new(0.25, 0.5, f32::from_bits(0.75f32.to_bits() + 1));
        let result = sort_and_dedup(vec![a, nudged, a, a]);
        assert_eq!(result, vec![a, nudged]);
    }

    #[test]
    fn test_empty_input() {
        assert!(sort_and_dedup(Vec::new()).is_empty());
    }

    #[test]
    fn test_nan_sorts_last() {
        let result = sort_and_dedup(vec![Vec3::new(f32::NAN, 0.0, 0.0), Vec3::ZERO]);
        assert_eq!(result[0], Vec3::ZERO);
        assert!(result[1].x.is_nan());
    }
}
