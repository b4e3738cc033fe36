//! Fits a Hermite/Lagrange scaffold mesh to a point cloud.
//!
//! A [`Fitter`] owns the model and the data and runs an ordered list of
//! steps against them: [`AlignStep`] moves the whole model with a similarity
//! transform, solved from markers or from the point cloud, and
//! [`DeformFitStep`] deforms the model toward its projected data under
//! strain, curvature and edge penalties.
//!
//! ```no_run
//! use scaffit::{AlignSettings, AlignStep, FitSettings, DeformFitStep, Fitter, FitterSettings, FitterStep};
//! # fn demo(mesh: scaffit::Mesh, data: scaffit::PointCloud) -> scaffit::FitResult<()> {
//! let mut fitter = Fitter::new(mesh, data, FitterSettings::default())?;
//! fitter.add_step(FitterStep::Align(AlignStep::new(AlignSettings::default().with_markers())?));
//! fitter.add_step(FitterStep::Fit(DeformFitStep::new(
//!     FitSettings::default().with_strain_penalty(0.01).with_iterations(3),
//! )?));
//! fitter.run_all()?;
//! # Ok(())
//! # }
//! ```

pub mod alignment;
pub mod basis;
pub mod datatypes;
pub mod diagnostics;
pub mod error;
pub mod fitter;
pub mod mesh;
pub mod objective;
pub mod point_cloud;
pub mod projection;
pub mod settings;
pub mod solver;
pub mod transform;

pub use alignment::{AlignmentOutcome, PointSetSettings};
pub use basis::Basis;
pub use datatypes::{DataPoint, Group, MeshLocation, Node, ValueLabel};
pub use diagnostics::Diagnostics;
pub use error::{FitResult, FitterError};
pub use fitter::{
    AlignReport, AlignStep, DeformFitStep, FitContext, FitReport, Fitter, FitterStep, StepReport,
};
pub use mesh::{Element, Mesh};
pub use objective::{evaluate_objective, ObjectiveTerms, ObjectiveWeights};
pub use point_cloud::PointCloud;
pub use projection::{OutlierRejection, ProjectionReport};
pub use settings::{AlignSettings, FitSettings, FitterSettings, StepSettings};
pub use solver::FitState;
pub use transform::SimilarityTransform;
