//! The fit pipeline: an ordered list of align and fit steps run against one
//! mesh and one point cloud.

use json::JsonValue;
use nalgebra::Vector3;

use crate::alignment::{
    align_markers, align_point_sets, marker_correspondences, AlignmentOutcome, PointSetSettings,
};
use crate::diagnostics::Diagnostics;
use crate::error::{FitResult, FitterError};
use crate::mesh::Mesh;
use crate::objective::{evaluate_objective, ObjectiveTerms};
use crate::point_cloud::{GroupMatch, PointCloud};
use crate::projection::{
    locate_marker_data, project_data, ElementSamples, MarkerLocationReport, ProjectionReport,
};
use crate::settings::{
    decode_settings, encode_settings, AlignSettings, FitSettings, FitterSettings, StepSettings,
};
use crate::solver::{optimise, FitState, OptimisationReport};
use crate::transform::SimilarityTransform;

/// Everything a step reads and writes
#[derive(Debug, Clone)]
pub struct FitContext {
    pub mesh: Mesh,
    pub data: PointCloud,
    pub settings: FitterSettings,
    pub diagnostics: Diagnostics,
}

impl FitContext {
    pub fn marker_group(&self) -> &str {
        self.settings.marker_group_name()
    }

    /// Reprojects all active data onto the current geometry
    pub fn project(&mut self) -> ProjectionReport {
        project_data(
            &self.mesh,
            &mut self.data,
            &self.settings.outlier_rejection,
            &self.diagnostics,
        )
    }

    pub fn locate_markers(&mut self) -> MarkerLocationReport {
        let group = self.settings.marker_group_name().to_owned();
        locate_marker_data(&self.mesh, &mut self.data, &group, &self.diagnostics)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignReport {
    /// The transform applied to the model
    pub transform: SimilarityTransform,
    /// Present when the transform was solved for
    pub outcome: Option<AlignmentOutcome>,
    pub projection: ProjectionReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    /// Objective after each projection, the last entry after the final one
    pub objectives: Vec<ObjectiveTerms>,
    pub optimisations: Vec<OptimisationReport>,
    pub projection: ProjectionReport,
    pub state: FitState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepReport {
    Align(AlignReport),
    Fit(FitReport),
}

/// Moves the model onto the data with a similarity transform
#[derive(Debug, Clone, PartialEq)]
pub struct AlignStep {
    settings: AlignSettings,
    has_run: bool,
}

impl AlignStep {
    pub fn new(settings: AlignSettings) -> FitResult<AlignStep> {
        settings.validate()?;
        Ok(AlignStep {
            settings,
            has_run: false,
        })
    }

    pub fn settings(&self) -> &AlignSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: AlignSettings) -> FitResult<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    pub fn has_run(&self) -> bool {
        self.has_run
    }

    /// Solves for the transform if markers or the point cloud are enabled,
    /// then applies the step's transform, captures the reference state and
    /// reprojects. Nothing is modified when solving fails.
    pub fn run(&mut self, context: &mut FitContext) -> FitResult<AlignReport> {
        self.settings.validate()?;
        let diagnostics = context.diagnostics;

        let outcome = if self.settings.use_markers {
            let group = context.marker_group().to_owned();
            if context.mesh.group(&group).is_none() {
                return Err(FitterError::Precondition(format!(
                    "Align: No marker group named {group}"
                )));
            }
            let correspondences = marker_correspondences(&context.mesh, &context.data, &group, &diagnostics)?;
            Some(align_markers(&correspondences, &diagnostics)?)
        } else if self.settings.use_point_cloud {
            let surface = context.mesh.fitting_surface();
            if surface.is_empty() {
                return Err(FitterError::Precondition(
                    "Align: model has no faces or lines to align".to_owned(),
                ));
            }
            let source = ElementSamples::new(&context.mesh, &surface)?.positions();
            let marker_group = context.data.group(context.marker_group());
            let target: Vec<Vector3<f64>> = context
                .data
                .points()
                .iter()
                .filter(|p| p.active && !marker_group.is_some_and(|g| g.points.contains(&p.id)))
                .map(|p| p.position)
                .collect();
            let settings = PointSetSettings {
                scale_threshold: self.settings.scale_threshold,
                ..PointSetSettings::default()
            };
            Some(align_point_sets(&source, &target, &settings, &diagnostics)?)
        } else {
            None
        };

        if let Some(outcome) = &outcome {
            self.settings = self.settings.with_transform(&outcome.transform);
        }
        let transform = self.settings.transform();
        {
            let mut scope = context.mesh.begin_change();
            scope.transform(&transform);
            scope.capture_reference();
        }
        let reported = transform.canonical();
        diagnostics.info(format_args!(
            "Align: rotation [{:.6}, {:.6}, {:.6}] scale {:.6} translation [{:.6}, {:.6}, {:.6}]",
            reported.rotation[0],
            reported.rotation[1],
            reported.rotation[2],
            reported.scale,
            reported.translation[0],
            reported.translation[1],
            reported.translation[2]
        ));

        let projection = context.project();
        self.has_run = true;
        Ok(AlignReport {
            transform,
            outcome,
            projection,
        })
    }
}

/// Deforms the model toward the data
#[derive(Debug, Clone, PartialEq)]
pub struct DeformFitStep {
    settings: FitSettings,
    has_run: bool,
    state: FitState,
}

impl DeformFitStep {
    pub fn new(settings: FitSettings) -> FitResult<DeformFitStep> {
        settings.validate()?;
        Ok(DeformFitStep {
            settings,
            has_run: false,
            state: FitState::NotStarted,
        })
    }

    pub fn settings(&self) -> &FitSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: FitSettings) -> FitResult<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    pub fn has_run(&self) -> bool {
        self.has_run
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    /// Alternates projection and optimisation `number_of_iterations` times.
    ///
    /// # Arguments
    /// * `context` - Mesh and data to fit; the mesh is modified in place
    ///
    /// # Returns
    /// The objective after every projection and the per-iteration solver
    /// reports
    pub fn run(&mut self, context: &mut FitContext) -> FitResult<FitReport> {
        self.settings.validate()?;
        let weights = self.settings.weights();
        let diagnostics = context.diagnostics;
        let iterations = self.settings.number_of_iterations;

        self.state = FitState::NotStarted;
        let mut projection = context.project();
        self.state = FitState::Projected;

        let mut objectives = Vec::with_capacity(iterations + 1);
        let mut optimisations = Vec::with_capacity(iterations);
        let bar = diagnostics.progress_bar(iterations as u64, "fit");
        for iteration in 0..iterations {
            let objective = evaluate_objective(&context.mesh, &context.data, &weights)?;
            diagnostics.info(format_args!("Fit iteration {}: {objective}", iteration + 1));
            objectives.push(objective);

            self.state = FitState::Optimizing;
            let report = optimise(
                &mut context.mesh,
                &context.data,
                &weights,
                self.settings.max_sub_iterations,
                &diagnostics,
            )?;
            diagnostics.report(format_args!(
                "Fit iteration {}: {:?} after {} steps",
                iteration + 1,
                report.state,
                report.iterations
            ));
            optimisations.push(report);

            projection = context.project();
            self.state = if iteration + 1 < iterations {
                FitState::Projected
            } else {
                report.state
            };
            bar.inc(1);
        }
        bar.finish_and_clear();

        let objective = evaluate_objective(&context.mesh, &context.data, &weights)?;
        diagnostics.info(format_args!("Fit END: {objective}"));
        objectives.push(objective);

        if self.settings.update_reference_state {
            context.mesh.capture_reference();
        }
        self.has_run = true;
        Ok(FitReport {
            objectives,
            optimisations,
            projection,
            state: self.state,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitterStep {
    Align(AlignStep),
    Fit(DeformFitStep),
}

impl FitterStep {
    pub fn from_settings(settings: StepSettings) -> FitResult<FitterStep> {
        Ok(match settings {
            StepSettings::Align(align) => FitterStep::Align(AlignStep::new(align)?),
            StepSettings::Fit(fit) => FitterStep::Fit(DeformFitStep::new(fit)?),
        })
    }

    pub fn settings(&self) -> StepSettings {
        match self {
            FitterStep::Align(step) => StepSettings::Align(*step.settings()),
            FitterStep::Fit(step) => StepSettings::Fit(*step.settings()),
        }
    }

    pub fn has_run(&self) -> bool {
        match self {
            FitterStep::Align(step) => step.has_run(),
            FitterStep::Fit(step) => step.has_run(),
        }
    }

    pub fn run(&mut self, context: &mut FitContext) -> FitResult<StepReport> {
        match self {
            FitterStep::Align(step) => step.run(context).map(StepReport::Align),
            FitterStep::Fit(step) => step.run(context).map(StepReport::Fit),
        }
    }
}

/// Owns the model, the data and the steps of one fit
#[derive(Debug, Clone)]
pub struct Fitter {
    context: FitContext,
    steps: Vec<FitterStep>,
    group_matches: Vec<GroupMatch>,
}

impl Fitter {
    /// Checks the settings against the inputs, matches data groups to model
    /// groups, locates marker data and projects the data.
    ///
    /// # Arguments
    /// * `mesh` - The model; faces and lines are derived if missing
    /// * `data` - The point cloud to fit
    /// * `settings` - Field names, marker group and diagnostic level
    pub fn new(mut mesh: Mesh, mut data: PointCloud, settings: FitterSettings) -> FitResult<Fitter> {
        settings.validate()?;
        if settings.model_coordinates_field != mesh.coordinates_field() {
            return Err(FitterError::Configuration(format!(
                "Model coordinates field '{}' not found, model uses '{}'",
                settings.model_coordinates_field,
                mesh.coordinates_field()
            )));
        }
        if settings.data_coordinates_field != data.coordinates_field() {
            return Err(FitterError::Configuration(format!(
                "Data coordinates field '{}' not found, data uses '{}'",
                settings.data_coordinates_field,
                data.coordinates_field()
            )));
        }
        if let Some(group) = &settings.marker_group {
            if mesh.group(group).is_none() {
                return Err(FitterError::Precondition(format!(
                    "Marker group '{group}' not found in model"
                )));
            }
        }
        let diagnostics = Diagnostics::new(settings.diagnostic_level);

        mesh.define_faces();
        let names: Vec<String> = mesh.groups().iter().map(|g| g.name.clone()).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let group_matches = data.match_groups(&name_refs, &diagnostics);

        let mut context = FitContext {
            mesh,
            data,
            settings,
            diagnostics,
        };
        context.locate_markers();
        context.project();

        Ok(Fitter {
            context,
            steps: Vec::new(),
            group_matches,
        })
    }

    /// Builds a fitter and its steps from encoded settings
    pub fn from_json(mesh: Mesh, data: PointCloud, value: &JsonValue) -> FitResult<Fitter> {
        let (settings, steps) = decode_settings(value)?;
        let mut fitter = Fitter::new(mesh, data, settings)?;
        for step in steps {
            fitter.add_step(FitterStep::from_settings(step)?);
        }
        Ok(fitter)
    }

    pub fn encode_settings(&self) -> JsonValue {
        let steps: Vec<StepSettings> = self.steps.iter().map(FitterStep::settings).collect();
        encode_settings(&self.context.settings, &steps)
    }

    pub fn context(&self) -> &FitContext {
        &self.context
    }

    pub fn mesh(&self) -> &Mesh {
        &self.context.mesh
    }

    pub fn data(&self) -> &PointCloud {
        &self.context.data
    }

    pub fn data_mut(&mut self) -> &mut PointCloud {
        &mut self.context.data
    }

    pub fn group_matches(&self) -> &[GroupMatch] {
        &self.group_matches
    }

    pub fn into_parts(self) -> (Mesh, PointCloud) {
        (self.context.mesh, self.context.data)
    }

    /// Appends a step, returning its index
    pub fn add_step(&mut self, step: FitterStep) -> usize {
        self.steps.push(step);
        self.steps.len() - 1
    }

    pub fn insert_step(&mut self, index: usize, step: FitterStep) -> FitResult<()> {
        if index > self.steps.len() {
            return Err(FitterError::Configuration(format!(
                "Cannot insert step at {index}, there are {} steps",
                self.steps.len()
            )));
        }
        self.steps.insert(index, step);
        Ok(())
    }

    pub fn remove_step(&mut self, index: usize) -> FitResult<FitterStep> {
        if index >= self.steps.len() {
            return Err(FitterError::Configuration(format!("No step {index} to remove")));
        }
        Ok(self.steps.remove(index))
    }

    pub fn step(&self, index: usize) -> Option<&FitterStep> {
        self.steps.get(index)
    }

    pub fn step_mut(&mut self, index: usize) -> Option<&mut FitterStep> {
        self.steps.get_mut(index)
    }

    pub fn steps(&self) -> &[FitterStep] {
        &self.steps
    }

    /// The step after `index`, or the one before it when it is the last
    pub fn next_step(&self, index: usize) -> Option<usize> {
        if index + 1 < self.steps.len() {
            Some(index + 1)
        } else if index > 0 && index + 1 == self.steps.len() {
            Some(index - 1)
        } else {
            None
        }
    }

    pub fn run_step(&mut self, index: usize) -> FitResult<StepReport> {
        let step = self
            .steps
            .get_mut(index)
            .ok_or_else(|| FitterError::Configuration(format!("No step {index} to run")))?;
        step.run(&mut self.context)
    }

    /// Runs every step in order, stopping at the first failure
    pub fn run_all(&mut self) -> FitResult<Vec<StepReport>> {
        let mut reports = Vec::with_capacity(self.steps.len());
        for step in &mut self.steps {
            reports.push(step.run(&mut self.context)?);
        }
        Ok(reports)
    }

    /// Mean current position of a model node group
    pub fn model_group_mean_coordinates(&self, name: &str) -> FitResult<Vector3<f64>> {
        self.context.mesh.group_mean_coordinates(name)
    }

    /// Mean position of a data group
    pub fn data_group_mean_coordinates(&self, name: &str) -> FitResult<Vector3<f64>> {
        self.context.data.group_mean_coordinates(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::DataPoint;
    use crate::mesh::tests::unit_cube;

    fn fitter() -> Fitter {
        let mut data = PointCloud::default();
        data.add_point(DataPoint::new(1, Vector3::new(0.5, 0.5, 1.2))).unwrap();
        data.add_to_group("Top ", &[1]).unwrap();
        Fitter::new(unit_cube(), data, FitterSettings::default()).unwrap()
    }

    fn fit_step(iterations: usize) -> FitterStep {
        FitterStep::Fit(DeformFitStep::new(FitSettings::default().with_iterations(iterations)).unwrap())
    }

    #[test]
    fn construction_matches_groups_and_projects() {
        let fitter = fitter();
        assert_eq!(
            fitter.group_matches()[0],
            GroupMatch::Renamed {
                from: "Top ".to_owned(),
                to: "top".to_owned()
            }
        );
        assert!(fitter.data().point(1).unwrap().projection.is_some());
    }

    #[test]
    fn field_names_and_marker_group_must_exist() {
        let wrong_field = FitterSettings::default().with_model_coordinates_field("geometry");
        assert!(matches!(
            Fitter::new(unit_cube(), PointCloud::default(), wrong_field),
            Err(FitterError::Configuration(_))
        ));
        let wrong_group = FitterSettings::default().with_marker_group("fiducials");
        assert!(matches!(
            Fitter::new(unit_cube(), PointCloud::default(), wrong_group),
            Err(FitterError::Precondition(_))
        ));
    }

    #[test]
    fn step_list_is_editable() {
        let mut fitter = fitter();
        assert_eq!(fitter.next_step(0), None);
        fitter.add_step(fit_step(1));
        fitter.add_step(fit_step(2));
        fitter
            .insert_step(0, FitterStep::Align(AlignStep::new(AlignSettings::default()).unwrap()))
            .unwrap();
        assert_eq!(fitter.steps().len(), 3);
        assert!(matches!(fitter.step(0), Some(FitterStep::Align(_))));
        assert_eq!(fitter.next_step(0), Some(1));
        assert_eq!(fitter.next_step(2), Some(1));
        assert!(fitter.insert_step(9, fit_step(1)).is_err());

        let removed = fitter.remove_step(1).unwrap();
        assert_eq!(removed.settings(), fit_step(1).settings());
        assert!(fitter.remove_step(5).is_err());
        if let Some(FitterStep::Fit(step)) = fitter.step_mut(1) {
            step.set_settings(FitSettings::default().with_iterations(0)).unwrap();
        }
        assert_eq!(
            fitter.step(1).unwrap().settings(),
            StepSettings::Fit(FitSettings::default().with_iterations(0))
        );
    }

    #[test]
    fn identity_align_step_only_reprojects() {
        let mut fitter = fitter();
        fitter.add_step(FitterStep::Align(AlignStep::new(AlignSettings::default()).unwrap()));
        let before = fitter.mesh().parameters();
        let report = fitter.run_step(0).unwrap();
        assert!(matches!(report, StepReport::Align(AlignReport { outcome: None, .. })));
        assert_eq!(fitter.mesh().parameters(), before);
        assert!(fitter.steps()[0].has_run());
        assert!(fitter.run_step(3).is_err());
    }

    #[test]
    fn json_settings_rebuild_the_steps() {
        let mut fitter = fitter();
        fitter.add_step(FitterStep::Align(
            AlignStep::new(AlignSettings::default().with_markers()).unwrap(),
        ));
        fitter.add_step(fit_step(4));
        let value = fitter.encode_settings();
        let (mesh, data) = fitter.into_parts();
        let rebuilt = Fitter::from_json(mesh, data, &value).unwrap();
        assert_eq!(rebuilt.steps().len(), 2);
        assert_eq!(rebuilt.encode_settings(), value);
    }
}
