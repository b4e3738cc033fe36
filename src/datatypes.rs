use std::collections::BTreeSet;

use nalgebra::Vector3;

/// Identifies one parameter stored at a node: the coordinate value or one of
/// its parametric derivatives.
///
/// The discriminant is a bit mask of the element directions the parameter is
/// differentiated in, so `D12` is `D1 | D2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueLabel {
    Value = 0,
    D1 = 1,
    D2 = 2,
    D12 = 3,
    D3 = 4,
    D13 = 5,
    D23 = 6,
    D123 = 7,
}

impl ValueLabel {
    pub const ALL: [ValueLabel; 8] = [
        ValueLabel::Value,
        ValueLabel::D1,
        ValueLabel::D2,
        ValueLabel::D12,
        ValueLabel::D3,
        ValueLabel::D13,
        ValueLabel::D23,
        ValueLabel::D123,
    ];

    pub fn from_mask(mask: usize) -> Option<ValueLabel> {
        ValueLabel::ALL.get(mask).copied()
    }

    pub fn mask(self) -> usize {
        self as usize
    }

    /// Number of element directions the parameter is differentiated in
    pub fn order(self) -> u32 {
        (self as usize).count_ones()
    }

    pub fn is_derivative(self) -> bool {
        self != ValueLabel::Value
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueLabel::Value => "value",
            ValueLabel::D1 => "d/ds1",
            ValueLabel::D2 => "d/ds2",
            ValueLabel::D12 => "d2/ds1ds2",
            ValueLabel::D3 => "d/ds3",
            ValueLabel::D13 => "d2/ds1ds3",
            ValueLabel::D23 => "d2/ds2ds3",
            ValueLabel::D123 => "d3/ds1ds2ds3",
        }
    }
}

/// All versions of one labelled parameter at a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeValue {
    pub label: ValueLabel,
    pub versions: Vec<Vector3<f64>>,
}

/// A mesh node and its coordinate parameters.
///
/// The first entry is always the coordinate value; derivatives follow in the
/// order they were added.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: usize,
    pub values: Vec<NodeValue>,
}

impl Node {
    pub fn new(id: usize, position: Vector3<f64>) -> Node {
        Node {
            id,
            values: vec![NodeValue {
                label: ValueLabel::Value,
                versions: vec![position],
            }],
        }
    }

    /// Adds a derivative parameter with one entry per version
    pub fn with_derivative(mut self, label: ValueLabel, versions: Vec<Vector3<f64>>) -> Node {
        self.values.push(NodeValue { label, versions });
        self
    }

    pub fn position(&self) -> Vector3<f64> {
        self.values
            .iter()
            .find(|v| v.label == ValueLabel::Value)
            .and_then(|v| v.versions.first().copied())
            .unwrap_or_else(Vector3::zeros)
    }

    pub fn value(&self, label: ValueLabel, version: usize) -> Option<Vector3<f64>> {
        self.values
            .iter()
            .find(|v| v.label == label)
            .and_then(|v| v.versions.get(version).copied())
    }
}

/// An element identifier together with element (xi) coordinates.
///
/// Only the first `dimension` entries of `xi` are meaningful for an element of
/// that dimension. Locations are weak references: they are recomputed every
/// time projections are recalculated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshLocation {
    pub element: usize,
    pub xi: [f64; 3],
}

impl MeshLocation {
    pub fn new(element: usize, xi: &[f64]) -> MeshLocation {
        let mut location = MeshLocation {
            element,
            xi: [0.0; 3],
        };
        for (target, value) in location.xi.iter_mut().zip(xi) {
            *target = *value;
        }
        location
    }
}

/// Result of projecting a data point onto the mesh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub location: MeshLocation,
    /// Dimension of the mesh the point was projected onto
    pub dimension: usize,
    /// Projected position minus data position
    pub residual: Vector3<f64>,
    pub error: f64,
    /// Unit vector of the residual, zero when the point lies on the mesh
    pub direction: Vector3<f64>,
    /// Mesh revision the projection was computed against
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub id: usize,
    pub position: Vector3<f64>,
    pub label: Option<String>,
    pub projection: Option<Projection>,
    /// Location of the model marker with the same name, for marker data
    pub marker_location: Option<MeshLocation>,
    pub active: bool,
}

impl DataPoint {
    pub fn new(id: usize, position: Vector3<f64>) -> DataPoint {
        DataPoint {
            id,
            position,
            label: None,
            projection: None,
            marker_location: None,
            active: true,
        }
    }

    pub fn with_label(mut self, label: &str) -> DataPoint {
        self.label = Some(label.to_owned());
        self
    }
}

/// A named location embedded in the highest dimension mesh
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub name: String,
    pub location: MeshLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerCorrespondence {
    pub name: String,
    pub model: Vector3<f64>,
    pub data: Vector3<f64>,
}

/// Named subset of the mesh
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Group {
    pub name: String,
    pub nodes: BTreeSet<usize>,
    pub elements: BTreeSet<usize>,
    pub markers: Vec<Marker>,
}

impl Group {
    pub fn new(name: &str) -> Group {
        Group {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_nodes(mut self, nodes: &[usize]) -> Group {
        self.nodes.extend(nodes.iter().copied());
        self
    }

    pub fn with_elements(mut self, elements: &[usize]) -> Group {
        self.elements.extend(elements.iter().copied());
        self
    }
}

/// Named subset of the point cloud
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataGroup {
    pub name: String,
    pub points: BTreeSet<usize>,
}

/// Canonical form used when matching group and marker names: surrounding
/// whitespace removed, case folded.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip_through_mask() {
        for label in ValueLabel::ALL {
            assert_eq!(ValueLabel::from_mask(label.mask()), Some(label));
        }
        assert_eq!(ValueLabel::from_mask(8), None);
        assert_eq!(ValueLabel::D123.order(), 3);
        assert!(!ValueLabel::Value.is_derivative());
    }

    #[test]
    fn node_lookup_by_label_and_version() {
        let node = Node::new(3, Vector3::new(1.0, 2.0, 3.0)).with_derivative(
            ValueLabel::D1,
            vec![Vector3::x(), Vector3::new(0.0, 2.0, 0.0)],
        );
        assert_eq!(node.position(), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(node.value(ValueLabel::D1, 1), Some(Vector3::new(0.0, 2.0, 0.0)));
        assert_eq!(node.value(ValueLabel::D2, 0), None);
    }

    #[test]
    fn names_ignore_case_and_surrounding_whitespace() {
        assert_eq!(normalize_name("  Top Surface "), normalize_name("top surface"));
        assert_ne!(normalize_name("top"), normalize_name("bottom"));
    }
}
