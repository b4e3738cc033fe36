use std::f64::consts::PI;

use approx::assert_relative_eq;
use nalgebra::Vector3;
use scaffit::evaluate_objective;
use scaffit::settings::parse_settings;
use scaffit::{
    AlignSettings, AlignStep, Basis, DataPoint, DeformFitStep, Element, FitSettings, FitState,
    Fitter, FitterError, FitterSettings, FitterStep, Group, Mesh, Node, PointCloud, SimilarityTransform,
    StepReport, StepSettings,
};

const MARKERS: [(&str, [f64; 3]); 5] = [
    ("origin", [0.0, 0.0, 0.0]),
    ("x", [1.0, 0.0, 0.0]),
    ("y", [0.0, 1.0, 0.0]),
    ("z", [0.0, 0.0, 1.0]),
    ("far", [1.0, 1.0, 1.0]),
];

/// Unit cube as one trilinear element, with a top group and a group holding
/// its whole surface
fn cube() -> Mesh {
    let mut mesh = Mesh::default();
    for id in 0..8 {
        let position = Vector3::new((id & 1) as f64, ((id >> 1) & 1) as f64, ((id >> 2) & 1) as f64);
        mesh.add_node(Node::new(id + 1, position)).unwrap();
    }
    mesh.add_element(Element::new(1, Basis::linear_lagrange(3).unwrap(), (1..=8).collect()))
        .unwrap();
    mesh.define_faces();
    mesh.add_group(Group::new("top").with_nodes(&[5, 6, 7, 8])).unwrap();
    mesh.add_group(Group::new("surface").with_nodes(&[1, 2, 3, 4, 5, 6, 7, 8]))
        .unwrap();
    mesh.add_group_elements_by_nodes("top").unwrap();
    mesh.add_group_elements_by_nodes("surface").unwrap();
    for (name, xi) in MARKERS {
        mesh.add_marker("marker", name, 1, &xi).unwrap();
    }
    mesh
}

fn add_marker_points(data: &mut PointCloud, transform: &SimilarityTransform, count: usize, first_id: usize) {
    let mut ids = Vec::new();
    for (i, (name, xi)) in MARKERS.iter().take(count).enumerate() {
        let position = transform.apply_point(&Vector3::from(*xi));
        data.add_point(DataPoint::new(first_id + i, position).with_label(name)).unwrap();
        ids.push(first_id + i);
    }
    data.add_to_group("marker", &ids).unwrap();
}

fn marker_data(transform: &SimilarityTransform, count: usize) -> PointCloud {
    let mut data = PointCloud::default();
    add_marker_points(&mut data, transform, count, 1);
    data
}

fn cube_centre() -> Vector3<f64> {
    Vector3::new(0.5, 0.5, 0.5)
}

/// Points spread evenly over a sphere
fn sphere_data(centre: Vector3<f64>, radius: f64, count: usize) -> PointCloud {
    let golden = PI * (3.0 - 5f64.sqrt());
    let mut data = PointCloud::default();
    for i in 0..count {
        let z = 1.0 - 2.0 * (i as f64 + 0.5) / count as f64;
        let r = (1.0 - z * z).sqrt();
        let theta = golden * i as f64;
        let direction = Vector3::new(r * theta.cos(), r * theta.sin(), z);
        data.add_point(DataPoint::new(i + 1, centre + radius * direction)).unwrap();
    }
    let ids: Vec<usize> = (1..=count).collect();
    data.add_to_group("surface", &ids).unwrap();
    data
}

fn align_step() -> FitterStep {
    FitterStep::Align(AlignStep::new(AlignSettings::default().with_markers()).unwrap())
}

fn mean_error(fitter: &Fitter) -> f64 {
    let errors: Vec<f64> = fitter
        .data()
        .points()
        .iter()
        .filter_map(|p| p.projection.map(|projection| projection.error))
        .collect();
    errors.iter().sum::<f64>() / errors.len() as f64
}

#[test]
fn markers_recover_similarity_transform() {
    let truth = SimilarityTransform::new(
        Vector3::new(PI / 4.0, PI / 8.0, PI / 2.0),
        1.1,
        Vector3::new(0.1, -0.2, 0.3),
    );
    let original = cube();
    let mut fitter = Fitter::new(original.clone(), marker_data(&truth, 5), FitterSettings::default()).unwrap();
    fitter.add_step(align_step());

    let report = fitter.run_step(0).unwrap();
    let StepReport::Align(report) = report else {
        panic!("align step produced a fit report");
    };
    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.correspondences, 5);
    assert!(outcome.rms < 1e-8);
    assert_relative_eq!(report.transform.scale, 1.1, epsilon = 1e-8);
    assert_relative_eq!(
        report.transform.canonical().rotation,
        Vector3::new(PI / 4.0, PI / 8.0, PI / 2.0),
        epsilon = 1e-4
    );

    for id in original.node_ids() {
        let expected = truth.apply_point(&original.node_position(id).unwrap());
        assert_relative_eq!(fitter.mesh().node_position(id).unwrap(), expected, epsilon = 1e-7);
    }
    assert_relative_eq!(
        fitter.model_group_mean_coordinates("top").unwrap(),
        truth.apply_point(&Vector3::new(0.5, 0.5, 1.0)),
        epsilon = 1e-7
    );
    assert_eq!(fitter.mesh().reference_parameters(), fitter.mesh().parameters());

    let StepSettings::Align(stored) = fitter.step(0).unwrap().settings() else {
        panic!("step changed type");
    };
    assert_relative_eq!(stored.scale, 1.1, epsilon = 1e-8);
}

#[test]
fn too_few_markers_leave_model_untouched() {
    let truth = SimilarityTransform::new(Vector3::new(0.3, 0.0, 0.0), 2.0, Vector3::zeros());
    let mut fitter = Fitter::new(cube(), marker_data(&truth, 2), FitterSettings::default()).unwrap();
    fitter.add_step(align_step());
    let before = fitter.mesh().parameters();
    let revision = fitter.mesh().revision();

    let result = fitter.run_step(0);
    assert!(matches!(result, Err(FitterError::Precondition(_))));
    assert_eq!(fitter.mesh().parameters(), before);
    assert_eq!(fitter.mesh().revision(), revision);
    assert!(!fitter.steps()[0].has_run());
}

#[test]
fn zero_iterations_only_project() {
    let mut fitter = Fitter::new(cube(), sphere_data(cube_centre(), 0.75, 120), FitterSettings::default()).unwrap();
    fitter.add_step(FitterStep::Fit(
        DeformFitStep::new(FitSettings::default().with_iterations(0)).unwrap(),
    ));
    let before = fitter.mesh().parameters();

    let StepReport::Fit(report) = fitter.run_step(0).unwrap() else {
        panic!("fit step produced an align report");
    };
    assert_eq!(report.state, FitState::Projected);
    assert_eq!(report.objectives.len(), 1);
    assert!(report.optimisations.is_empty());
    assert_eq!(fitter.mesh().parameters(), before);
}

#[test]
fn cube_fits_toward_sphere_with_falling_objective() {
    let mut fitter = Fitter::new(cube(), sphere_data(cube_centre(), 0.75, 300), FitterSettings::default()).unwrap();
    let initial_error = mean_error(&fitter);
    let initial_volume = fitter.mesh().measure(3).unwrap();
    fitter.add_step(FitterStep::Fit(
        DeformFitStep::new(
            FitSettings::default()
                .with_strain_penalty(0.001)
                .with_iterations(3),
        )
        .unwrap(),
    ));

    let reports = fitter.run_all().unwrap();
    let StepReport::Fit(report) = &reports[0] else {
        panic!("fit step produced an align report");
    };
    assert_eq!(report.objectives.len(), 4);
    for pair in report.objectives.windows(2) {
        assert!(pair[1].total() <= pair[0].total() * (1.0 + 1e-9));
    }
    assert!(matches!(
        report.state,
        FitState::Converged | FitState::IterationLimitReached
    ));
    assert_eq!(report.projection.unprojected, 0);

    assert!(mean_error(&fitter) < 0.75 * initial_error);
    assert!(fitter.mesh().measure(3).unwrap() > initial_volume);
    assert_relative_eq!(
        fitter.model_group_mean_coordinates("surface").unwrap(),
        Vector3::new(0.5, 0.5, 0.5),
        epsilon = 2e-2
    );
}

#[test]
fn pipeline_runs_from_settings_text() {
    let text = r#"{
        "version": 1,
        "modelCoordinatesField": "coordinates",
        "dataCoordinatesField": "data_coordinates",
        "markerGroup": null,
        "diagnosticLevel": 0,
        "fitterSteps": [
            {
                "_FitterStepAlign": true,
                "alignMarkers": true,
                "alignPointCloud": false,
                "rotation": [0, 0, 0],
                "scale": 1,
                "translation": [0, 0, 0]
            },
            {
                "_FitterStepFit": true,
                "markerWeight": 1,
                "strainPenaltyWeight": 0,
                "curvaturePenaltyWeight": 0,
                "edgeDiscontinuityPenaltyWeight": 0,
                "numberOfIterations": 1,
                "maximumSubIterations": 1,
                "updateReferenceState": false
            }
        ]
    }"#;
    let (settings, steps) = parse_settings(text).unwrap();
    assert_eq!(steps.len(), 2);

    let shift = SimilarityTransform::new(Vector3::zeros(), 1.0, Vector3::new(0.5, 0.0, 0.0));
    let mut fitter = Fitter::new(cube(), marker_data(&shift, 5), settings).unwrap();
    for step in steps {
        fitter.add_step(FitterStep::from_settings(step).unwrap());
    }
    let reports = fitter.run_all().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(fitter.steps().iter().all(FitterStep::has_run));
    assert_relative_eq!(
        fitter.model_group_mean_coordinates("top").unwrap(),
        Vector3::new(1.0, 0.5, 1.0),
        epsilon = 1e-7
    );
    assert_relative_eq!(
        fitter.data_group_mean_coordinates("marker").unwrap(),
        shift.apply_point(&Vector3::new(0.4, 0.4, 0.4)),
        epsilon = 1e-12
    );
}

#[test]
fn point_cloud_align_step_recovers_transform() {
    let truth = SimilarityTransform::new(
        Vector3::new(0.05, -0.03, 0.04),
        1.03,
        Vector3::new(0.4, -0.3, 0.2),
    );
    let mut data = PointCloud::default();
    let mut id = 0;
    for i in 0..5 {
        for j in 0..5 {
            for k in 0..5 {
                if [i, j, k].iter().any(|c| *c == 0 || *c == 4) {
                    id += 1;
                    let grid = 0.25 * Vector3::new(i as f64, j as f64, k as f64);
                    data.add_point(DataPoint::new(id, truth.apply_point(&grid))).unwrap();
                }
            }
        }
    }
    let original = cube();
    let mut fitter = Fitter::new(original.clone(), data, FitterSettings::default()).unwrap();
    fitter.add_step(FitterStep::Align(
        AlignStep::new(AlignSettings::default().with_point_cloud()).unwrap(),
    ));

    let StepReport::Align(report) = fitter.run_step(0).unwrap() else {
        panic!("align step produced a fit report");
    };
    let outcome = report.outcome.unwrap();
    assert!(outcome.rms < 1e-6, "rms {}", outcome.rms);
    assert_relative_eq!(report.transform.scale, 1.03, epsilon = 1e-6);
    for id in original.node_ids() {
        let expected = truth.apply_point(&original.node_position(id).unwrap());
        assert_relative_eq!(fitter.mesh().node_position(id).unwrap(), expected, epsilon = 1e-6);
    }
}

#[test]
fn markers_and_smoothing_fit_cube_to_offset_sphere() {
    let offset = Vector3::new(0.2, -0.1, 0.15);
    let radius = 0.5;
    let mut data = sphere_data(cube_centre() + offset, radius, 300);
    let shift = SimilarityTransform::new(Vector3::zeros(), 1.0, offset);
    add_marker_points(&mut data, &shift, MARKERS.len(), 1000);
    // one marker off the cube so the marker term stays active
    data.point_mut(1004).unwrap().position.x += 0.05;

    let mut fitter = Fitter::new(cube(), data, FitterSettings::default()).unwrap();
    fitter.add_step(align_step());
    fitter.add_step(FitterStep::Fit(
        DeformFitStep::new(
            FitSettings::default()
                .with_marker_weight(1.0)
                .with_curvature_penalty(0.1)
                .with_edge_discontinuity_penalty(0.1)
                .with_iterations(3),
        )
        .unwrap(),
    ));

    let StepReport::Align(align) = fitter.run_step(0).unwrap() else {
        panic!("align step produced a fit report");
    };
    assert!(align.outcome.unwrap().rms < 0.05);
    let aligned_area = fitter.mesh().measure(2).unwrap();

    let StepReport::Fit(report) = fitter.run_step(1).unwrap() else {
        panic!("fit step produced an align report");
    };
    assert_eq!(report.objectives.len(), 4);
    assert!(report.objectives[0].marker > 0.0);
    for pair in report.objectives.windows(2) {
        assert!(pair[1].total() <= pair[0].total() * (1.0 + 1e-9));
    }

    let sphere_area = 4.0 * PI * radius * radius;
    let fitted_area = fitter.mesh().measure(2).unwrap();
    assert!((fitted_area - sphere_area).abs() < (aligned_area - sphere_area).abs());
    let volume = fitter.mesh().measure(3).unwrap();
    assert!(volume.is_finite() && volume > 0.0);
    assert_relative_eq!(
        fitter.model_group_mean_coordinates("surface").unwrap(),
        cube_centre() + offset,
        epsilon = 0.1
    );
}

#[test]
fn fit_can_reset_the_strain_baseline() {
    let mut fitter = Fitter::new(cube(), sphere_data(cube_centre(), 0.75, 200), FitterSettings::default()).unwrap();
    let settings = FitSettings::default()
        .with_strain_penalty(0.01)
        .with_iterations(2)
        .with_update_reference_state(true);
    fitter.add_step(FitterStep::Fit(DeformFitStep::new(settings).unwrap()));
    let original_reference = fitter.mesh().reference_parameters();

    let StepReport::Fit(report) = fitter.run_step(0).unwrap() else {
        panic!("fit step produced an align report");
    };
    let last = report.objectives.last().unwrap();
    assert!(last.strain > 0.0);
    assert_ne!(fitter.mesh().reference_parameters(), original_reference);
    assert_eq!(fitter.mesh().reference_parameters(), fitter.mesh().parameters());
    assert_eq!(fitter.mesh().reference_node(8), fitter.mesh().node(8));

    let after = evaluate_objective(fitter.mesh(), fitter.data(), &settings.weights()).unwrap();
    assert!(after.strain < 1e-20);
    assert!(after.total() < last.total());
}
