use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::Vector3;

use crate::datatypes::{normalize_name, DataGroup, DataPoint};
use crate::diagnostics::Diagnostics;
use crate::error::{FitResult, FitterError};

pub const DEFAULT_DATA_COORDINATES_FIELD: &str = "data_coordinates";

/// Outcome of matching one data group against the mesh groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMatch {
    Found(String),
    Renamed { from: String, to: String },
    /// Renamed onto a data group that already had the mesh group's name
    Merged { from: String, into: String },
    Unmatched(String),
}

/// The data being fitted: points, optional labels and named groups
#[derive(Debug, Clone)]
pub struct PointCloud {
    coordinates_field: String,
    points: Vec<DataPoint>,
    point_index: HashMap<usize, usize>,
    groups: Vec<DataGroup>,
}

impl Default for PointCloud {
    fn default() -> PointCloud {
        PointCloud::new(DEFAULT_DATA_COORDINATES_FIELD)
    }
}

impl PointCloud {
    pub fn new(coordinates_field: &str) -> PointCloud {
        PointCloud {
            coordinates_field: coordinates_field.to_owned(),
            points: Vec::new(),
            point_index: HashMap::new(),
            groups: Vec::new(),
        }
    }

    pub fn coordinates_field(&self) -> &str {
        &self.coordinates_field
    }

    pub fn add_point(&mut self, point: DataPoint) -> FitResult<()> {
        if self.point_index.contains_key(&point.id) {
            return Err(FitterError::Configuration(format!(
                "Data point {} is defined twice",
                point.id
            )));
        }
        self.point_index.insert(point.id, self.points.len());
        self.points.push(point);
        Ok(())
    }

    /// Adds points to a group, creating the group when missing
    pub fn add_to_group(&mut self, name: &str, points: &[usize]) -> FitResult<()> {
        if let Some(missing) = points.iter().find(|id| !self.point_index.contains_key(id)) {
            return Err(FitterError::Configuration(format!(
                "Data group {name} references missing point {missing}"
            )));
        }
        let index = match self.groups.iter().position(|g| g.name == name) {
            Some(index) => index,
            None => {
                self.groups.push(DataGroup {
                    name: name.to_owned(),
                    points: BTreeSet::new(),
                });
                self.groups.len() - 1
            }
        };
        self.groups[index].points.extend(points.iter().copied());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[DataPoint] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut [DataPoint] {
        &mut self.points
    }

    pub fn point(&self, id: usize) -> Option<&DataPoint> {
        self.point_index.get(&id).map(|i| &self.points[*i])
    }

    pub fn point_mut(&mut self, id: usize) -> Option<&mut DataPoint> {
        self.point_index.get(&id).map(|i| &mut self.points[*i])
    }

    pub fn groups(&self) -> &[DataGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&DataGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Points of a group in identifier order; empty for an unknown group
    pub fn group_points(&self, name: &str) -> Vec<&DataPoint> {
        self.group(name)
            .map(|g| g.points.iter().filter_map(|id| self.point(*id)).collect())
            .unwrap_or_default()
    }

    /// Finds the point carrying a label, ignoring case and surrounding
    /// whitespace.
    ///
    /// # Arguments
    /// * `name` - Label to look for
    /// * `unique` - Fail when more than one point carries the label
    pub fn find_by_label(&self, name: &str, unique: bool) -> FitResult<Option<&DataPoint>> {
        let wanted = normalize_name(name);
        let mut matches = self
            .points
            .iter()
            .filter(|p| p.label.as_deref().map(normalize_name).as_deref() == Some(wanted.as_str()));
        let first = matches.next();
        if unique && first.is_some() && matches.next().is_some() {
            return Err(FitterError::Precondition(format!(
                "More than one data point is labelled {name}"
            )));
        }
        Ok(first)
    }

    /// Mean position of each distinct label among a group's active points,
    /// keyed by the first spelling seen.
    pub fn label_centres(&self, group: &str) -> Vec<(String, Vector3<f64>)> {
        let mut centres: BTreeMap<String, (String, Vector3<f64>, usize)> = BTreeMap::new();
        for point in self.group_points(group) {
            let Some(label) = point.label.as_deref() else {
                continue;
            };
            if !point.active {
                continue;
            }
            let entry = centres
                .entry(normalize_name(label))
                .or_insert_with(|| (label.to_owned(), Vector3::zeros(), 0));
            entry.1 += point.position;
            entry.2 += 1;
        }
        centres
            .into_values()
            .map(|(name, sum, count)| (name, sum / count as f64))
            .collect()
    }

    /// Mean position of a group's points
    pub fn group_mean_coordinates(&self, name: &str) -> FitResult<Vector3<f64>> {
        let points = self.group_points(name);
        if points.is_empty() {
            return Err(FitterError::Precondition(format!(
                "Data group {name} is missing or empty"
            )));
        }
        let sum: Vector3<f64> = points.iter().map(|p| p.position).sum();
        Ok(sum / points.len() as f64)
    }

    /// Renames data groups to the mesh group they match ignoring case and
    /// surrounding whitespace. A group whose new name is already taken is
    /// merged into that group. Groups without a match are kept and reported.
    pub fn match_groups(&mut self, mesh_groups: &[&str], diagnostics: &Diagnostics) -> Vec<GroupMatch> {
        let mut results = Vec::with_capacity(self.groups.len());
        let mut merged = Vec::new();
        for index in 0..self.groups.len() {
            let name = self.groups[index].name.clone();
            if mesh_groups.contains(&name.as_str()) {
                diagnostics.info(format_args!("Data group '{name}' found in model"));
                results.push(GroupMatch::Found(name));
                continue;
            }
            let wanted = normalize_name(&name);
            let Some(mesh_name) = mesh_groups.iter().find(|m| normalize_name(m) == wanted) else {
                diagnostics.warning("data", format_args!("Data group '{name}' not found in model"));
                results.push(GroupMatch::Unmatched(name));
                continue;
            };
            let mesh_name = (*mesh_name).to_owned();
            match self.groups.iter().position(|g| g.name == mesh_name) {
                Some(existing) => {
                    let points = std::mem::take(&mut self.groups[index].points);
                    self.groups[existing].points.extend(points);
                    merged.push(index);
                    diagnostics.warning(
                        "data",
                        format_args!("Data group '{name}' merged into existing group '{mesh_name}'"),
                    );
                    results.push(GroupMatch::Merged {
                        from: name,
                        into: mesh_name,
                    });
                }
                None => {
                    diagnostics.info(format_args!(
                        "Data group '{name}' renamed to '{mesh_name}' to match model"
                    ));
                    self.groups[index].name = mesh_name.clone();
                    results.push(GroupMatch::Renamed {
                        from: name,
                        to: mesh_name,
                    });
                }
            }
        }
        for index in merged.into_iter().rev() {
            self.groups.remove(index);
        }
        results
    }

    pub fn set_active(&mut self, id: usize, active: bool) -> FitResult<()> {
        let point = self.point_mut(id).ok_or_else(|| {
            FitterError::Configuration(format!("No data point {id}"))
        })?;
        point.active = active;
        Ok(())
    }

    pub fn activate_all(&mut self) {
        for point in &mut self.points {
            point.active = true;
        }
    }

    pub fn active_count(&self) -> usize {
        self.points.iter().filter(|p| p.active).count()
    }

    pub fn clear_projections(&mut self) {
        for point in &mut self.points {
            point.projection = None;
        }
    }

    /// True when any projection was computed against an older mesh revision
    pub fn has_stale_projections(&self, revision: u64) -> bool {
        self.points
            .iter()
            .filter_map(|p| p.projection.as_ref())
            .any(|p| p.revision != revision)
    }
}
