//! The scaffold: nodes with current and reference parameters, elements,
//! named groups and markers.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use nalgebra::{DVector, Matrix3, Vector3};

use crate::basis::{quadrature, Basis};
use crate::datatypes::{normalize_name, Group, Marker, MeshLocation, Node, NodeValue, ValueLabel};
use crate::error::{FitResult, FitterError};
use crate::transform::SimilarityTransform;

pub const DEFAULT_COORDINATES_FIELD: &str = "coordinates";

/// Quadrature points per direction used for measures and penalties
pub const QUADRATURE_POINTS: usize = 3;

/// Where a node's parameters live in the flat parameter arrays
#[derive(Debug, Clone)]
struct NodeLayout {
    id: usize,
    labels: Vec<(ValueLabel, usize)>,
    offset: usize,
}

impl NodeLayout {
    fn slot(&self, label: ValueLabel, version: usize) -> Option<usize> {
        let mut offset = self.offset;
        for (l, count) in &self.labels {
            if *l == label {
                return if version < *count {
                    Some(offset + version)
                } else {
                    None
                };
            }
            offset += count;
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementShape {
    /// Interpolated directly from its corner nodes. `versions` selects the
    /// derivative version used at each corner.
    Interpolated { basis: Basis, versions: Vec<usize> },
    /// Face or line of a higher dimension element. Local direction `i` runs
    /// along parent direction `axes[i]`; the remaining parent directions are
    /// held at the `fixed` values.
    Boundary {
        parent: usize,
        axes: Vec<usize>,
        fixed: Vec<(usize, f64)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub id: usize,
    pub dimension: usize,
    /// Corner node identifiers, first direction varying fastest
    pub nodes: Vec<usize>,
    pub shape: ElementShape,
}

impl Element {
    pub fn new(id: usize, basis: Basis, nodes: Vec<usize>) -> Element {
        let dimension = basis.dimension();
        let versions = vec![0; basis.corner_count()];
        Element {
            id,
            dimension,
            nodes,
            shape: ElementShape::Interpolated { basis, versions },
        }
    }

    /// Selects the derivative version read at each corner
    pub fn with_versions(mut self, corner_versions: Vec<usize>) -> Element {
        if let ElementShape::Interpolated { versions, .. } = &mut self.shape {
            *versions = corner_versions;
        }
        self
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self.shape, ElementShape::Boundary { .. })
    }
}

/// Coordinates and their derivatives with respect to element coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSample {
    pub dimension: usize,
    pub position: Vector3<f64>,
    pub derivatives: [Vector3<f64>; 3],
    pub second: [[Vector3<f64>; 3]; 3],
}

impl FieldSample {
    fn zero(dimension: usize) -> FieldSample {
        FieldSample {
            dimension,
            position: Vector3::zeros(),
            derivatives: [Vector3::zeros(); 3],
            second: [[Vector3::zeros(); 3]; 3],
        }
    }

    /// Length, area or volume scaling of the element map at this point
    pub fn jacobian_measure(&self) -> f64 {
        match self.dimension {
            1 => self.derivatives[0].norm(),
            2 => self.derivatives[0].cross(&self.derivatives[1]).norm(),
            _ => Matrix3::from_columns(&self.derivatives).determinant().abs(),
        }
    }
}

/// Weight of one parameter slot in the field at a point.
///
/// The field is linear in the node parameters, so a list of slot terms fully
/// describes position and derivatives at that point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotTerm {
    pub slot: usize,
    pub value: f64,
    pub first: [f64; 3],
    pub second: [[f64; 3]; 3],
}

/// How a line element sits on one of its adjacent faces
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSide {
    pub face: usize,
    /// Face direction held fixed along the line
    pub axis: usize,
    /// Value of the fixed face coordinate, 0 or 1
    pub at: f64,
    /// True when the line runs against the face's free direction
    pub reversed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineAdjacency {
    pub line: usize,
    pub sides: Vec<LineSide>,
}

#[derive(Debug, Clone)]
pub struct Mesh {
    coordinates_field: String,
    nodes: Vec<NodeLayout>,
    node_index: HashMap<usize, usize>,
    elements: Vec<Element>,
    element_index: HashMap<usize, usize>,
    current: Vec<Vector3<f64>>,
    reference: Vec<Vector3<f64>>,
    groups: Vec<Group>,
    face_parents: HashMap<usize, usize>,
    faces_defined: bool,
    revision: u64,
    change_depth: usize,
    pending_writes: usize,
}

impl Default for Mesh {
    fn default() -> Mesh {
        Mesh::new(DEFAULT_COORDINATES_FIELD)
    }
}

impl Mesh {
    pub fn new(coordinates_field: &str) -> Mesh {
        Mesh {
            coordinates_field: coordinates_field.to_owned(),
            nodes: Vec::new(),
            node_index: HashMap::new(),
            elements: Vec::new(),
            element_index: HashMap::new(),
            current: Vec::new(),
            reference: Vec::new(),
            groups: Vec::new(),
            face_parents: HashMap::new(),
            faces_defined: false,
            revision: 0,
            change_depth: 0,
            pending_writes: 0,
        }
    }

    pub fn coordinates_field(&self) -> &str {
        &self.coordinates_field
    }

    /// Adds a node. Its current parameters also become its reference state.
    pub fn add_node(&mut self, node: Node) -> FitResult<()> {
        if self.node_index.contains_key(&node.id) {
            return Err(FitterError::Configuration(format!(
                "Node {} is defined twice",
                node.id
            )));
        }
        if node.values.first().map(|v| v.label) != Some(ValueLabel::Value) {
            return Err(FitterError::Configuration(format!(
                "Node {} must start with its coordinate value",
                node.id
            )));
        }

        let mut labels: Vec<(ValueLabel, usize)> = Vec::with_capacity(node.values.len());
        for value in &node.values {
            if value.versions.is_empty() {
                return Err(FitterError::Configuration(format!(
                    "Node {} has no versions for {}",
                    node.id,
                    value.label.name()
                )));
            }
            if labels.iter().any(|(l, _)| *l == value.label) {
                return Err(FitterError::Configuration(format!(
                    "Node {} defines {} twice",
                    node.id,
                    value.label.name()
                )));
            }
            labels.push((value.label, value.versions.len()));
        }

        let layout = NodeLayout {
            id: node.id,
            labels,
            offset: self.current.len(),
        };
        for value in &node.values {
            self.current.extend(value.versions.iter().copied());
            self.reference.extend(value.versions.iter().copied());
        }
        self.node_index.insert(node.id, self.nodes.len());
        self.nodes.push(layout);

        Ok(())
    }

    /// Adds an interpolated element after checking every corner supplies the
    /// parameters its basis needs.
    pub fn add_element(&mut self, element: Element) -> FitResult<()> {
        if self.element_index.contains_key(&element.id) {
            return Err(FitterError::Configuration(format!(
                "Element {} is defined twice",
                element.id
            )));
        }
        let (basis, versions) = match &element.shape {
            ElementShape::Interpolated { basis, versions } => (basis, versions),
            ElementShape::Boundary { .. } => {
                return Err(FitterError::Configuration(format!(
                    "Element {} must be interpolated; faces and lines come from define_faces",
                    element.id
                )))
            }
        };
        if element.dimension != basis.dimension() {
            return Err(FitterError::Configuration(format!(
                "Element {} has dimension {} but a {}-D basis",
                element.id,
                element.dimension,
                basis.dimension()
            )));
        }
        if element.nodes.len() != basis.corner_count() || versions.len() != basis.corner_count() {
            return Err(FitterError::Configuration(format!(
                "Element {} needs {} nodes and versions, got {} and {}",
                element.id,
                basis.corner_count(),
                element.nodes.len(),
                versions.len()
            )));
        }
        for (corner, node_id) in element.nodes.iter().enumerate() {
            let layout = self.layout(*node_id).ok_or_else(|| {
                FitterError::Configuration(format!(
                    "Element {} references missing node {}",
                    element.id, node_id
                ))
            })?;
            for label in basis.labels() {
                let version = if label.is_derivative() {
                    versions[corner]
                } else {
                    0
                };
                if layout.slot(label, version).is_none() {
                    return Err(FitterError::Configuration(format!(
                        "Element {} needs {} version {} at node {}",
                        element.id,
                        label.name(),
                        version + 1,
                        node_id
                    )));
                }
            }
        }

        self.element_index.insert(element.id, self.elements.len());
        self.elements.push(element);
        self.faces_defined = false;

        Ok(())
    }

    /// Derives faces and lines from the interpolated elements of dimension 2
    /// and 3. Boundaries shared between elements are created once.
    ///
    /// # Returns
    /// The number of elements created
    pub fn define_faces(&mut self) -> usize {
        if self.faces_defined {
            return 0;
        }
        let mut next_id = self.elements.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let mut by_key: HashMap<(usize, Vec<usize>), usize> = self
            .elements
            .iter()
            .map(|e| ((e.dimension, sorted(&e.nodes)), e.id))
            .collect();
        let mut created = Vec::new();

        let parents: Vec<(usize, usize, Vec<usize>)> = self
            .elements
            .iter()
            .filter(|e| !e.is_boundary() && e.dimension >= 2)
            .map(|e| (e.id, e.dimension, e.nodes.clone()))
            .collect();

        for (parent, dimension, nodes) in parents {
            for (axes, fixed) in boundary_layouts(dimension) {
                let corners: Vec<usize> = (0..1usize << axes.len())
                    .map(|local| {
                        let mut corner = 0;
                        for (i, axis) in axes.iter().enumerate() {
                            corner |= ((local >> i) & 1) << axis;
                        }
                        for (axis, value) in &fixed {
                            corner |= (*value as usize) << axis;
                        }
                        nodes[corner]
                    })
                    .collect();
                let key = (axes.len(), sorted(&corners));
                // collapsed boundaries have repeated nodes
                if key.1.windows(2).any(|w| w[0] == w[1]) {
                    continue;
                }
                if let Some(existing) = by_key.get(&key) {
                    if axes.len() == 2 && dimension == 3 {
                        *self.face_parents.entry(*existing).or_insert(0) += 1;
                    }
                    continue;
                }
                let element = Element {
                    id: next_id,
                    dimension: axes.len(),
                    nodes: corners,
                    shape: ElementShape::Boundary {
                        parent,
                        axes,
                        fixed: fixed
                            .iter()
                            .map(|(axis, value)| (*axis, *value as f64))
                            .collect(),
                    },
                };
                if element.dimension == 2 && dimension == 3 {
                    self.face_parents.insert(next_id, 1);
                }
                by_key.insert(key, next_id);
                created.push(element);
                next_id += 1;
            }
        }

        let count = created.len();
        for element in created {
            self.element_index.insert(element.id, self.elements.len());
            self.elements.push(element);
        }
        self.faces_defined = true;
        count
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    /// Snapshot of a node's current parameters
    pub fn node(&self, id: usize) -> Option<Node> {
        self.layout(id).map(|layout| self.node_from(layout, &self.current))
    }

    /// Snapshot of a node's reference parameters
    pub fn reference_node(&self, id: usize) -> Option<Node> {
        self.layout(id)
            .map(|layout| self.node_from(layout, &self.reference))
    }

    pub fn node_position(&self, id: usize) -> Option<Vector3<f64>> {
        self.layout(id).map(|layout| self.current[layout.offset])
    }

    /// Overwrites one node's parameters. The layout of labels and versions
    /// must match the node as loaded.
    pub fn set_node(&mut self, node: &Node) -> FitResult<()> {
        let layout = self.layout(node.id).cloned().ok_or_else(|| {
            FitterError::Configuration(format!("Cannot set missing node {}", node.id))
        })?;
        let matches = layout.labels.len() == node.values.len()
            && layout
                .labels
                .iter()
                .zip(&node.values)
                .all(|((label, count), value)| *label == value.label && *count == value.versions.len());
        if !matches {
            return Err(FitterError::Configuration(format!(
                "Node {} parameters do not match its derivative/version structure",
                node.id
            )));
        }
        let values = node.values.iter().flat_map(|v| v.versions.iter().copied());
        for (slot, value) in (layout.offset..).zip(values) {
            self.current[slot] = value;
        }
        self.record_write();
        Ok(())
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, id: usize) -> Option<&Element> {
        self.element_index.get(&id).map(|i| &self.elements[*i])
    }

    pub fn highest_dimension(&self) -> usize {
        self.elements.iter().map(|e| e.dimension).max().unwrap_or(0)
    }

    pub fn elements_of_dimension(&self, dimension: usize) -> impl Iterator<Item = &Element> + '_ {
        self.elements
            .iter()
            .filter(move |e| e.dimension == dimension)
    }

    /// True for faces bounding exactly one volume element
    pub fn is_exterior_face(&self, id: usize) -> bool {
        self.face_parents.get(&id) == Some(&1)
    }

    /// Elements forming the outer boundary the data is fitted to: the
    /// exterior faces of a volume mesh, all faces of a surface mesh, or the
    /// lines of a curve mesh.
    pub fn fitting_surface(&self) -> Vec<usize> {
        let highest = self.highest_dimension();
        let faces: Vec<usize> = self
            .elements_of_dimension(2)
            .filter(|e| highest < 3 || self.is_exterior_face(e.id))
            .map(|e| e.id)
            .collect();
        if !faces.is_empty() {
            return faces;
        }
        self.elements_of_dimension(1).map(|e| e.id).collect()
    }

    pub fn parameter_count(&self) -> usize {
        3 * self.current.len()
    }

    /// All current node parameters as one flat vector, slot by slot
    pub fn parameters(&self) -> DVector<f64> {
        flatten(&self.current)
    }

    pub fn reference_parameters(&self) -> DVector<f64> {
        flatten(&self.reference)
    }

    pub(crate) fn current_slots(&self) -> &[Vector3<f64>] {
        &self.current
    }

    pub(crate) fn reference_slots(&self) -> &[Vector3<f64>] {
        &self.reference
    }

    /// Replaces all current node parameters in one write.
    ///
    /// # Arguments
    /// * `parameters` - Flat vector laid out as returned by `parameters`
    pub fn set_parameters(&mut self, parameters: &DVector<f64>) -> FitResult<()> {
        if parameters.len() != self.parameter_count() {
            return Err(FitterError::Configuration(format!(
                "Expected {} node parameters, got {}",
                self.parameter_count(),
                parameters.len()
            )));
        }
        for (slot, value) in self.current.iter_mut().enumerate() {
            *value = Vector3::new(
                parameters[3 * slot],
                parameters[3 * slot + 1],
                parameters[3 * slot + 2],
            );
        }
        self.record_write();
        Ok(())
    }

    /// Copies current parameters over the reference state used as the
    /// baseline of strain and curvature penalties.
    pub fn capture_reference(&mut self) {
        self.reference.clone_from(&self.current);
        self.record_write();
    }

    /// Applies a similarity transform to every node parameter. Values are
    /// rotated, scaled and translated; derivatives are only rotated and scaled.
    pub fn transform(&mut self, transform: &SimilarityTransform) {
        let rotation = transform.rotation_matrix();
        for layout in &self.nodes {
            let mut slot = layout.offset;
            for (label, count) in &layout.labels {
                for _ in 0..*count {
                    let value = self.current[slot];
                    self.current[slot] = if label.is_derivative() {
                        transform.scale * (rotation * value)
                    } else {
                        transform.scale * (rotation * value) + transform.translation
                    };
                    slot += 1;
                }
            }
        }
        self.record_write();
    }

    /// Parameter slots and basis weights contributing at a point of an
    /// element, with derivatives taken in that element's own coordinates.
    pub fn slot_terms(&self, element: usize, xi: &[f64]) -> FitResult<Vec<SlotTerm>> {
        let index = *self.element_index.get(&element).ok_or_else(|| {
            FitterError::Configuration(format!("Unknown element {element}"))
        })?;
        let dimension = self.elements[index].dimension;
        if xi.len() < dimension {
            return Err(FitterError::Configuration(format!(
                "Element {element} needs {dimension} element coordinates, got {}",
                xi.len()
            )));
        }
        self.slot_terms_at(index, xi)
    }

    fn slot_terms_at(&self, index: usize, xi: &[f64]) -> FitResult<Vec<SlotTerm>> {
        let element = &self.elements[index];
        match &element.shape {
            ElementShape::Interpolated { basis, versions } => {
                let mut terms = Vec::new();
                for term in basis.evaluate(xi) {
                    let node_id = element.nodes[term.corner];
                    let version = if term.label.is_derivative() {
                        versions[term.corner]
                    } else {
                        0
                    };
                    let slot = self
                        .layout(node_id)
                        .and_then(|layout| layout.slot(term.label, version))
                        .ok_or_else(|| {
                            FitterError::Configuration(format!(
                                "Element {} cannot find {} at node {}",
                                element.id,
                                term.label.name(),
                                node_id
                            ))
                        })?;
                    terms.push(SlotTerm {
                        slot,
                        value: term.value,
                        first: term.first,
                        second: term.second,
                    });
                }
                Ok(terms)
            }
            ElementShape::Boundary {
                parent,
                axes,
                fixed,
            } => {
                let mut parent_xi = [0.0; 3];
                for (axis, value) in fixed {
                    parent_xi[*axis] = *value;
                }
                for (local, axis) in axes.iter().enumerate() {
                    parent_xi[*axis] = xi[local];
                }
                let parent_index = *self.element_index.get(parent).ok_or_else(|| {
                    FitterError::Configuration(format!(
                        "Element {} has missing parent {}",
                        element.id, parent
                    ))
                })?;
                let parent_terms = self.slot_terms_at(parent_index, &parent_xi)?;
                Ok(parent_terms
                    .into_iter()
                    .map(|term| {
                        let mut mapped = SlotTerm {
                            slot: term.slot,
                            value: term.value,
                            first: [0.0; 3],
                            second: [[0.0; 3]; 3],
                        };
                        for (a, axis_a) in axes.iter().enumerate() {
                            mapped.first[a] = term.first[*axis_a];
                            for (b, axis_b) in axes.iter().enumerate() {
                                mapped.second[a][b] = term.second[*axis_a][*axis_b];
                            }
                        }
                        mapped
                    })
                    .collect())
            }
        }
    }

    /// Position and derivatives of the current coordinates at a location
    pub fn evaluate(&self, location: &MeshLocation) -> FitResult<FieldSample> {
        self.sample(location, &self.current)
    }

    /// Position and derivatives of the reference coordinates at a location
    pub fn evaluate_reference(&self, location: &MeshLocation) -> FitResult<FieldSample> {
        self.sample(location, &self.reference)
    }

    fn sample(&self, location: &MeshLocation, slots: &[Vector3<f64>]) -> FitResult<FieldSample> {
        let dimension = self
            .element(location.element)
            .map(|e| e.dimension)
            .ok_or_else(|| {
                FitterError::Configuration(format!("Unknown element {}", location.element))
            })?;
        let terms = self.slot_terms(location.element, &location.xi)?;
        Ok(combine(&terms, slots, dimension))
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn add_group(&mut self, group: Group) -> FitResult<()> {
        if self.group(&group.name).is_some() {
            return Err(FitterError::Configuration(format!(
                "Group {} is defined twice",
                group.name
            )));
        }
        if let Some(node) = group.nodes.iter().find(|n| !self.node_index.contains_key(n)) {
            return Err(FitterError::Configuration(format!(
                "Group {} references missing node {}",
                group.name, node
            )));
        }
        if let Some(element) = group
            .elements
            .iter()
            .find(|e| !self.element_index.contains_key(e))
        {
            return Err(FitterError::Configuration(format!(
                "Group {} references missing element {}",
                group.name, element
            )));
        }
        self.groups.push(group);
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    /// Group whose name matches ignoring case and surrounding whitespace
    pub fn find_group_matching(&self, name: &str) -> Option<&Group> {
        let wanted = normalize_name(name);
        self.group(name)
            .or_else(|| self.groups.iter().find(|g| normalize_name(&g.name) == wanted))
    }

    /// Adds to a group every element whose corner nodes all belong to it.
    ///
    /// # Returns
    /// The number of elements added
    pub fn add_group_elements_by_nodes(&mut self, name: &str) -> FitResult<usize> {
        let index = self
            .groups
            .iter()
            .position(|g| g.name == name)
            .ok_or_else(|| FitterError::Precondition(format!("No group named {name}")))?;
        let nodes = &self.groups[index].nodes;
        let members: Vec<usize> = self
            .elements
            .iter()
            .filter(|e| e.nodes.iter().all(|n| nodes.contains(n)))
            .map(|e| e.id)
            .collect();
        let group = &mut self.groups[index];
        let before = group.elements.len();
        group.elements.extend(members);
        Ok(group.elements.len() - before)
    }

    /// Embeds a named marker in the highest dimension mesh. The group is
    /// created when missing.
    pub fn add_marker(&mut self, group: &str, name: &str, element: usize, xi: &[f64]) -> FitResult<()> {
        let highest = self.highest_dimension();
        let dimension = self
            .element(element)
            .map(|e| e.dimension)
            .ok_or_else(|| {
                FitterError::Configuration(format!("Marker {name} references missing element {element}"))
            })?;
        if dimension != highest {
            return Err(FitterError::Configuration(format!(
                "Marker {name} must be in a {highest}-D element, element {element} is {dimension}-D"
            )));
        }
        if xi.len() < dimension || xi[..dimension].iter().any(|x| !x.is_finite() || *x < 0.0 || *x > 1.0) {
            return Err(FitterError::Configuration(format!(
                "Marker {name} element coordinates {xi:?} are outside the element"
            )));
        }
        if self.group(group).is_none() {
            self.groups.push(Group::new(group));
        }
        if let Some(g) = self.group_mut(group) {
            g.markers.push(Marker {
                name: name.to_owned(),
                location: MeshLocation::new(element, &xi[..dimension]),
            });
        }
        Ok(())
    }

    /// Current positions of a group's markers
    pub fn marker_positions(&self, group: &str) -> FitResult<Vec<(String, Vector3<f64>)>> {
        let group = self
            .group(group)
            .ok_or_else(|| FitterError::Precondition(format!("No marker group named {group}")))?;
        group
            .markers
            .iter()
            .map(|m| Ok((m.name.clone(), self.evaluate(&m.location)?.position)))
            .collect()
    }

    /// Mean of the current coordinate values of a group's nodes
    pub fn group_mean_coordinates(&self, name: &str) -> FitResult<Vector3<f64>> {
        let group = self
            .group(name)
            .ok_or_else(|| FitterError::Precondition(format!("No group named {name}")))?;
        if group.nodes.is_empty() {
            return Err(FitterError::Precondition(format!("Group {name} has no nodes")));
        }
        let sum: Vector3<f64> = group
            .nodes
            .iter()
            .filter_map(|id| self.node_position(*id))
            .sum();
        Ok(sum / group.nodes.len() as f64)
    }

    /// Total length, area or volume of the elements of one dimension. For
    /// area on a volume mesh only exterior faces count.
    pub fn measure(&self, dimension: usize) -> FitResult<f64> {
        let rule = quadrature(dimension, QUADRATURE_POINTS);
        let highest = self.highest_dimension();
        let mut total = 0.0;
        for element in self.elements_of_dimension(dimension) {
            if dimension == 2 && highest == 3 && !self.is_exterior_face(element.id) {
                continue;
            }
            for (xi, weight) in &rule {
                let sample = self.evaluate(&MeshLocation::new(element.id, &xi[..dimension]))?;
                total += weight * sample.jacobian_measure();
            }
        }
        Ok(total)
    }

    /// Lines together with the faces they border. Volume meshes only report
    /// their exterior faces.
    pub fn line_adjacency(&self) -> Vec<LineAdjacency> {
        let highest = self.highest_dimension();
        let lines: HashMap<Vec<usize>, usize> = self
            .elements_of_dimension(1)
            .map(|e| (sorted(&e.nodes), e.id))
            .collect();
        let mut adjacency: Vec<LineAdjacency> = Vec::new();
        let mut positions: HashMap<usize, usize> = HashMap::new();

        for face in self.elements_of_dimension(2) {
            if highest == 3 && !self.is_exterior_face(face.id) {
                continue;
            }
            for free in 0..2 {
                let axis = 1 - free;
                for at in 0..2 {
                    let start = at << axis;
                    let end = start | (1 << free);
                    let (a, b) = (face.nodes[start], face.nodes[end]);
                    let Some(line_id) = lines.get(&sorted(&[a, b])) else {
                        continue;
                    };
                    let reversed = self
                        .element(*line_id)
                        .map(|line| line.nodes[0] != a)
                        .unwrap_or(false);
                    let side = LineSide {
                        face: face.id,
                        axis,
                        at: at as f64,
                        reversed,
                    };
                    let position = *positions.entry(*line_id).or_insert_with(|| {
                        adjacency.push(LineAdjacency {
                            line: *line_id,
                            sides: Vec::new(),
                        });
                        adjacency.len() - 1
                    });
                    adjacency[position].sides.push(side);
                }
            }
        }

        adjacency
    }

    /// Incremented once per completed change scope that wrote anything
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Opens a batch-change scope. Writes made through the returned guard
    /// advance the revision once, when the outermost guard is dropped.
    pub fn begin_change(&mut self) -> ChangeScope<'_> {
        self.change_depth += 1;
        ChangeScope { mesh: self }
    }

    fn end_change(&mut self) {
        self.change_depth = self.change_depth.saturating_sub(1);
        if self.change_depth == 0 && self.pending_writes > 0 {
            self.pending_writes = 0;
            self.revision += 1;
        }
    }

    fn record_write(&mut self) {
        self.pending_writes += 1;
        if self.change_depth == 0 {
            self.pending_writes = 0;
            self.revision += 1;
        }
    }

    fn layout(&self, id: usize) -> Option<&NodeLayout> {
        self.node_index.get(&id).map(|i| &self.nodes[*i])
    }

    fn node_from(&self, layout: &NodeLayout, slots: &[Vector3<f64>]) -> Node {
        let mut offset = layout.offset;
        let values = layout
            .labels
            .iter()
            .map(|(label, count)| {
                let versions = slots[offset..offset + count].to_vec();
                offset += count;
                NodeValue {
                    label: *label,
                    versions,
                }
            })
            .collect();
        Node {
            id: layout.id,
            values,
        }
    }
}

/// Batch-change guard returned by [`Mesh::begin_change`].
///
/// Dereferences to the mesh; dropping it closes the scope on every exit path.
pub struct ChangeScope<'a> {
    mesh: &'a mut Mesh,
}

impl Deref for ChangeScope<'_> {
    type Target = Mesh;

    fn deref(&self) -> &Mesh {
        self.mesh
    }
}

impl DerefMut for ChangeScope<'_> {
    fn deref_mut(&mut self) -> &mut Mesh {
        self.mesh
    }
}

impl Drop for ChangeScope<'_> {
    fn drop(&mut self) {
        self.mesh.end_change();
    }
}

/// Sums slot terms against a parameter array
pub fn combine(terms: &[SlotTerm], slots: &[Vector3<f64>], dimension: usize) -> FieldSample {
    let mut sample = FieldSample::zero(dimension);
    for term in terms {
        let p = slots[term.slot];
        sample.position += term.value * p;
        for a in 0..dimension {
            sample.derivatives[a] += term.first[a] * p;
            for b in 0..dimension {
                sample.second[a][b] += term.second[a][b] * p;
            }
        }
    }
    sample
}

fn flatten(slots: &[Vector3<f64>]) -> DVector<f64> {
    DVector::from_iterator(3 * slots.len(), slots.iter().flat_map(|v| v.iter().copied()))
}

fn sorted(nodes: &[usize]) -> Vec<usize> {
    let mut key = nodes.to_vec();
    key.sort_unstable();
    key
}

/// Free and fixed parent directions of every face and line of an element
fn boundary_layouts(dimension: usize) -> Vec<(Vec<usize>, Vec<(usize, u8)>)> {
    let all: Vec<usize> = (0..dimension).collect();
    let mut layouts = Vec::new();
    // faces first so lines of a volume element follow its faces
    for free_count in (1..dimension).rev() {
        let combos: Vec<Vec<usize>> = (0..1usize << dimension)
            .filter(|mask| mask.count_ones() as usize == free_count)
            .map(|mask| all.iter().copied().filter(|a| mask >> a & 1 == 1).collect())
            .collect();
        for axes in combos {
            let fixed_axes: Vec<usize> = all.iter().copied().filter(|a| !axes.contains(a)).collect();
            for values in 0..1usize << fixed_axes.len() {
                let fixed = fixed_axes
                    .iter()
                    .enumerate()
                    .map(|(i, axis)| (*axis, ((values >> i) & 1) as u8))
                    .collect();
                layouts.push((axes.clone(), fixed));
            }
        }
    }
    layouts
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeSet;

    /// Unit cube as one trilinear element with groups for its faces
    pub(crate) fn unit_cube() -> Mesh {
        let mut mesh = Mesh::default();
        for id in 0..8 {
            let position = Vector3::new((id & 1) as f64, ((id >> 1) & 1) as f64, ((id >> 2) & 1) as f64);
            mesh.add_node(Node::new(id + 1, position)).unwrap();
        }
        mesh.add_element(Element::new(1, Basis::linear_lagrange(3).unwrap(), (1..=8).collect()))
            .unwrap();
        mesh.define_faces();
        mesh.add_group(Group::new("bottom").with_nodes(&[1, 2, 3, 4])).unwrap();
        mesh.add_group(Group::new("top").with_nodes(&[5, 6, 7, 8])).unwrap();
        mesh.add_group(Group::new("sides").with_nodes(&[1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        mesh.add_group_elements_by_nodes("bottom").unwrap();
        mesh.add_group_elements_by_nodes("top").unwrap();
        let side_faces: Vec<usize> = mesh
            .elements_of_dimension(2)
            .filter(|face| {
                let z: BTreeSet<usize> = face.nodes.iter().map(|n| (n - 1) >> 2).collect();
                z.len() == 2
            })
            .map(|face| face.id)
            .collect();
        mesh.group_mut("sides").unwrap().elements.extend(side_faces);
        mesh
    }

    #[test]
    fn cube_faces_and_lines_are_generated_once() {
        let mesh = unit_cube();
        assert_eq!(mesh.elements_of_dimension(2).count(), 6);
        assert_eq!(mesh.elements_of_dimension(1).count(), 12);
        assert_eq!(mesh.fitting_surface().len(), 6);
        assert_eq!(mesh.group("top").unwrap().elements.len(), 5);
        assert_eq!(mesh.group("sides").unwrap().elements.len(), 4);
    }

    #[test]
    fn shared_face_is_interior() {
        let mut mesh = Mesh::default();
        for id in 0..12 {
            let position = Vector3::new((id % 3) as f64, ((id / 3) % 2) as f64, (id / 6) as f64);
            mesh.add_node(Node::new(id, position)).unwrap();
        }
        let basis = Basis::linear_lagrange(3).unwrap();
        mesh.add_element(Element::new(1, basis.clone(), vec![0, 1, 3, 4, 6, 7, 9, 10]))
            .unwrap();
        mesh.add_element(Element::new(2, basis, vec![1, 2, 4, 5, 7, 8, 10, 11]))
            .unwrap();
        mesh.define_faces();
        assert_eq!(mesh.elements_of_dimension(2).count(), 11);
        assert_eq!(mesh.fitting_surface().len(), 10);
        assert_relative_eq!(mesh.measure(3).unwrap(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(mesh.measure(2).unwrap(), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn cube_measures() {
        let mesh = unit_cube();
        assert_relative_eq!(mesh.measure(3).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(mesh.measure(2).unwrap(), 6.0, epsilon = 1e-12);
        assert_relative_eq!(mesh.measure(1).unwrap(), 12.0, epsilon = 1e-12);
    }

    #[test]
    fn face_evaluates_through_parent() {
        let mesh = unit_cube();
        let top = mesh
            .elements_of_dimension(2)
            .find(|f| f.nodes.iter().all(|n| *n >= 5))
            .unwrap();
        let sample = mesh.evaluate(&MeshLocation::new(top.id, &[0.25, 0.75])).unwrap();
        assert_relative_eq!(sample.position, Vector3::new(0.25, 0.75, 1.0), epsilon = 1e-14);
        assert_relative_eq!(sample.derivatives[0], Vector3::x(), epsilon = 1e-14);
        assert_relative_eq!(sample.derivatives[1], Vector3::y(), epsilon = 1e-14);
    }

    #[test]
    fn cube_edges_border_two_faces() {
        let mesh = unit_cube();
        let adjacency = mesh.line_adjacency();
        assert_eq!(adjacency.len(), 12);
        assert!(adjacency.iter().all(|line| line.sides.len() == 2));
    }

    #[test]
    fn group_centroids() {
        let mesh = unit_cube();
        assert_relative_eq!(
            mesh.group_mean_coordinates("bottom").unwrap(),
            Vector3::new(0.5, 0.5, 0.0)
        );
        assert_relative_eq!(
            mesh.group_mean_coordinates("sides").unwrap(),
            Vector3::new(0.5, 0.5, 0.5)
        );
        assert!(mesh.group_mean_coordinates("missing").is_err());
    }

    #[test]
    fn rejects_mismatched_parameter_writes() {
        let mut mesh = unit_cube();
        let short = DVector::zeros(mesh.parameter_count() - 1);
        assert!(matches!(
            mesh.set_parameters(&short),
            Err(FitterError::Configuration(_))
        ));
        let wrong = Node::new(1, Vector3::zeros()).with_derivative(ValueLabel::D1, vec![Vector3::x()]);
        assert!(matches!(mesh.set_node(&wrong), Err(FitterError::Configuration(_))));
    }

    #[test]
    fn rejects_element_missing_hermite_derivatives() {
        let mut mesh = Mesh::default();
        mesh.add_node(Node::new(1, Vector3::zeros())).unwrap();
        mesh.add_node(Node::new(2, Vector3::x())).unwrap();
        let element = Element::new(1, Basis::cubic_hermite(1).unwrap(), vec![1, 2]);
        assert!(matches!(
            mesh.add_element(element),
            Err(FitterError::Configuration(_))
        ));
    }

    #[test]
    fn hermite_versions_select_derivatives() {
        let mut mesh = Mesh::default();
        mesh.add_node(Node::new(1, Vector3::zeros()).with_derivative(ValueLabel::D1, vec![Vector3::x()]))
            .unwrap();
        mesh.add_node(
            Node::new(2, Vector3::x()).with_derivative(ValueLabel::D1, vec![Vector3::x(), Vector3::y()]),
        )
        .unwrap();
        let basis = Basis::cubic_hermite(1).unwrap();
        mesh.add_element(Element::new(1, basis.clone(), vec![1, 2])).unwrap();
        mesh.add_element(Element::new(2, basis, vec![1, 2]).with_versions(vec![0, 1]))
            .unwrap();
        let straight = mesh.evaluate(&MeshLocation::new(1, &[1.0])).unwrap();
        let bent = mesh.evaluate(&MeshLocation::new(2, &[1.0])).unwrap();
        assert_relative_eq!(straight.derivatives[0], Vector3::x());
        assert_relative_eq!(bent.derivatives[0], Vector3::y());
    }

    #[test]
    fn change_scope_advances_revision_once() {
        let mut mesh = unit_cube();
        let start = mesh.revision();
        {
            let mut scope = mesh.begin_change();
            scope.transform(&SimilarityTransform::new(Vector3::zeros(), 2.0, Vector3::zeros()));
            scope.capture_reference();
            assert_eq!(scope.revision(), start);
        }
        assert_eq!(mesh.revision(), start + 1);
        mesh.capture_reference();
        assert_eq!(mesh.revision(), start + 2);
    }

    #[test]
    fn failed_write_still_closes_change_scope() {
        fn shift_then_fail(mesh: &mut Mesh) -> FitResult<()> {
            let mut scope = mesh.begin_change();
            let shifted = scope.parameters().add_scalar(1.0);
            scope.set_parameters(&shifted)?;
            scope.set_parameters(&DVector::zeros(2))?;
            Ok(())
        }

        let mut mesh = unit_cube();
        let start = mesh.revision();
        assert!(matches!(
            shift_then_fail(&mut mesh),
            Err(FitterError::Configuration(_))
        ));
        assert_eq!(mesh.revision(), start + 1);
        assert_relative_eq!(mesh.node_position(1).unwrap(), Vector3::new(1.0, 1.0, 1.0));

        // no scope left open
        mesh.capture_reference();
        assert_eq!(mesh.revision(), start + 2);
    }

    #[test]
    fn short_element_coordinates_are_rejected() {
        let mesh = unit_cube();
        assert!(matches!(
            mesh.slot_terms(1, &[0.5]),
            Err(FitterError::Configuration(_))
        ));
        let face = mesh.elements_of_dimension(2).next().unwrap().id;
        assert!(mesh.slot_terms(face, &[0.5, 0.5]).is_ok());
        assert!(mesh.slot_terms(face, &[0.5]).is_err());
    }

    #[test]
    fn groups_match_ignoring_case_and_whitespace() {
        let mesh = unit_cube();
        assert_eq!(mesh.find_group_matching(" TOP ").unwrap().name, "top");
        assert_eq!(mesh.find_group_matching("sides").unwrap().name, "sides");
        assert!(mesh.find_group_matching("front").is_none());
    }

    #[test]
    fn reference_node_keeps_baseline_until_captured() {
        let mut mesh = unit_cube();
        mesh.transform(&SimilarityTransform::new(Vector3::zeros(), 1.0, Vector3::new(0.0, 0.0, 2.0)));
        assert_relative_eq!(mesh.reference_node(8).unwrap().position(), Vector3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(mesh.node(8).unwrap().position(), Vector3::new(1.0, 1.0, 3.0));
        mesh.capture_reference();
        assert_eq!(mesh.reference_node(8), mesh.node(8));
    }

    #[test]
    fn transform_leaves_derivatives_untranslated() {
        let mut mesh = Mesh::default();
        mesh.add_node(Node::new(1, Vector3::zeros()).with_derivative(ValueLabel::D1, vec![Vector3::x()]))
            .unwrap();
        let t = SimilarityTransform::new(
            Vector3::new(std::f64::consts::FRAC_PI_2, 0.0, 0.0),
            2.0,
            Vector3::new(1.0, 1.0, 1.0),
        );
        mesh.transform(&t);
        let node = mesh.node(1).unwrap();
        assert_relative_eq!(node.position(), Vector3::new(1.0, 1.0, 1.0), epsilon = 1e-14);
        assert_relative_eq!(
            node.value(ValueLabel::D1, 0).unwrap(),
            Vector3::new(0.0, 2.0, 0.0),
            epsilon = 1e-14
        );
    }

    #[test]
    fn markers_follow_the_mesh() {
        let mut mesh = unit_cube();
        mesh.add_marker("marker", "apex", 1, &[1.0, 1.0, 1.0]).unwrap();
        assert!(mesh.add_marker("marker", "face", 2, &[0.5, 0.5]).is_err());
        mesh.transform(&SimilarityTransform::new(Vector3::zeros(), 1.0, Vector3::new(0.0, 0.0, 1.0)));
        let positions = mesh.marker_positions("marker").unwrap();
        assert_eq!(positions[0].0, "apex");
        assert_relative_eq!(positions[0].1, Vector3::new(1.0, 1.0, 2.0), epsilon = 1e-14);
    }
}
