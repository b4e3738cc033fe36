use json::JsonValue;
use nalgebra::Vector3;

use crate::error::{FitResult, FitterError};
use crate::mesh::DEFAULT_COORDINATES_FIELD;
use crate::objective::ObjectiveWeights;
use crate::point_cloud::DEFAULT_DATA_COORDINATES_FIELD;
use crate::projection::OutlierRejection;
use crate::solver::DEFAULT_MAX_SUB_ITERATIONS;
use crate::transform::SimilarityTransform;

pub const SETTINGS_VERSION: u32 = 1;
pub const DEFAULT_MARKER_GROUP: &str = "marker";

const ALIGN_TAG: &str = "_FitterStepAlign";
const FIT_TAG: &str = "_FitterStepFit";

/// Settings shared by every step of a fit
#[derive(Debug, Clone, PartialEq)]
pub struct FitterSettings {
    pub model_coordinates_field: String,
    pub data_coordinates_field: String,
    /// Explicit marker group; the default group name is used when unset
    pub marker_group: Option<String>,
    pub diagnostic_level: u8,
    pub outlier_rejection: OutlierRejection,
}

impl Default for FitterSettings {
    fn default() -> FitterSettings {
        FitterSettings {
            model_coordinates_field: DEFAULT_COORDINATES_FIELD.to_owned(),
            data_coordinates_field: DEFAULT_DATA_COORDINATES_FIELD.to_owned(),
            marker_group: None,
            diagnostic_level: 0,
            outlier_rejection: OutlierRejection::default(),
        }
    }
}

impl FitterSettings {
    pub fn with_model_coordinates_field(mut self, name: &str) -> FitterSettings {
        self.model_coordinates_field = name.to_owned();
        self
    }

    pub fn with_data_coordinates_field(mut self, name: &str) -> FitterSettings {
        self.data_coordinates_field = name.to_owned();
        self
    }

    pub fn with_marker_group(mut self, name: &str) -> FitterSettings {
        self.marker_group = Some(name.to_owned());
        self
    }

    pub fn with_diagnostic_level(mut self, level: u8) -> FitterSettings {
        self.diagnostic_level = level;
        self
    }

    pub fn with_outlier_rejection(mut self, outliers: OutlierRejection) -> FitterSettings {
        self.outlier_rejection = outliers;
        self
    }

    pub fn marker_group_name(&self) -> &str {
        self.marker_group.as_deref().unwrap_or(DEFAULT_MARKER_GROUP)
    }

    pub fn validate(&self) -> FitResult<()> {
        if self.model_coordinates_field.trim().is_empty() || self.data_coordinates_field.trim().is_empty() {
            return Err(FitterError::Configuration(
                "Coordinate field names must not be empty".to_owned(),
            ));
        }
        self.outlier_rejection.validate()
    }
}

/// Settings of an align step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignSettings {
    pub use_markers: bool,
    pub use_point_cloud: bool,
    pub rotation: Vector3<f64>,
    pub scale: f64,
    pub translation: Vector3<f64>,
    /// Point cloud alignment penalises scales beyond this factor
    pub scale_threshold: Option<f64>,
}

impl Default for AlignSettings {
    fn default() -> AlignSettings {
        AlignSettings {
            use_markers: false,
            use_point_cloud: false,
            rotation: Vector3::zeros(),
            scale: 1.0,
            translation: Vector3::zeros(),
            scale_threshold: None,
        }
    }
}

impl AlignSettings {
    pub fn with_markers(mut self) -> AlignSettings {
        self.use_markers = true;
        self
    }

    pub fn with_point_cloud(mut self) -> AlignSettings {
        self.use_point_cloud = true;
        self
    }

    pub fn with_transform(mut self, transform: &SimilarityTransform) -> AlignSettings {
        self.rotation = transform.rotation;
        self.scale = transform.scale;
        self.translation = transform.translation;
        self
    }

    pub fn with_scale_threshold(mut self, threshold: f64) -> AlignSettings {
        self.scale_threshold = Some(threshold);
        self
    }

    pub fn transform(&self) -> SimilarityTransform {
        SimilarityTransform::new(self.rotation, self.scale, self.translation)
    }

    pub fn validate(&self) -> FitResult<()> {
        if self.use_markers && self.use_point_cloud {
            return Err(FitterError::Configuration(
                "Align: markers and point cloud alignment cannot both be enabled".to_owned(),
            ));
        }
        if !(self.scale > 0.0) || !self.scale.is_finite() {
            return Err(FitterError::Configuration(format!(
                "Align: scale {} must be positive",
                self.scale
            )));
        }
        if !self.rotation.iter().chain(self.translation.iter()).all(|v| v.is_finite()) {
            return Err(FitterError::Configuration(
                "Align: rotation and translation must be finite".to_owned(),
            ));
        }
        if let Some(threshold) = self.scale_threshold {
            if !(threshold >= 1.0) {
                return Err(FitterError::Configuration(format!(
                    "Align: scale threshold {threshold} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Settings of a deformation fit step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitSettings {
    pub marker_weight: f64,
    pub strain_penalty_weight: f64,
    pub curvature_penalty_weight: f64,
    pub edge_discontinuity_penalty_weight: f64,
    /// Project then optimise this many times; 0 only projects
    pub number_of_iterations: usize,
    pub max_sub_iterations: usize,
    pub update_reference_state: bool,
}

impl Default for FitSettings {
    fn default() -> FitSettings {
        FitSettings {
            marker_weight: 0.0,
            strain_penalty_weight: 0.0,
            curvature_penalty_weight: 0.0,
            edge_discontinuity_penalty_weight: 0.0,
            number_of_iterations: 1,
            max_sub_iterations: DEFAULT_MAX_SUB_ITERATIONS,
            update_reference_state: false,
        }
    }
}

impl FitSettings {
    pub fn with_marker_weight(mut self, weight: f64) -> FitSettings {
        self.marker_weight = weight;
        self
    }

    pub fn with_strain_penalty(mut self, weight: f64) -> FitSettings {
        self.strain_penalty_weight = weight;
        self
    }

    pub fn with_curvature_penalty(mut self, weight: f64) -> FitSettings {
        self.curvature_penalty_weight = weight;
        self
    }

    pub fn with_edge_discontinuity_penalty(mut self, weight: f64) -> FitSettings {
        self.edge_discontinuity_penalty_weight = weight;
        self
    }

    pub fn with_iterations(mut self, count: usize) -> FitSettings {
        self.number_of_iterations = count;
        self
    }

    pub fn with_max_sub_iterations(mut self, count: usize) -> FitSettings {
        self.max_sub_iterations = count;
        self
    }

    pub fn with_update_reference_state(mut self, update: bool) -> FitSettings {
        self.update_reference_state = update;
        self
    }

    pub fn weights(&self) -> ObjectiveWeights {
        ObjectiveWeights {
            marker: self.marker_weight,
            strain: self.strain_penalty_weight,
            curvature: self.curvature_penalty_weight,
            edge_discontinuity: self.edge_discontinuity_penalty_weight,
        }
    }

    pub fn validate(&self) -> FitResult<()> {
        self.weights().validate()?;
        if self.max_sub_iterations == 0 {
            return Err(FitterError::Configuration(
                "Fit: maximum sub-iterations must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Settings of one step, in the order the steps run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepSettings {
    Align(AlignSettings),
    Fit(FitSettings),
}

fn vector_json(v: &Vector3<f64>) -> JsonValue {
    JsonValue::from(vec![v.x, v.y, v.z])
}

/// Encodes the fitter and step settings as a tagged JSON object
pub fn encode_settings(settings: &FitterSettings, steps: &[StepSettings]) -> JsonValue {
    let mut root = JsonValue::new_object();
    root["version"] = SETTINGS_VERSION.into();
    root["modelCoordinatesField"] = settings.model_coordinates_field.as_str().into();
    root["dataCoordinatesField"] = settings.data_coordinates_field.as_str().into();
    root["markerGroup"] = match &settings.marker_group {
        Some(name) => name.as_str().into(),
        None => JsonValue::Null,
    };
    root["diagnosticLevel"] = settings.diagnostic_level.into();
    if settings.outlier_rejection.is_enabled() {
        let mut outliers = JsonValue::new_object();
        if let Some(percentile) = settings.outlier_rejection.error_percentile {
            outliers["errorPercentile"] = percentile.into();
        }
        if let Some(threshold) = settings.outlier_rejection.normal_cosine_threshold {
            outliers["normalCosineThreshold"] = threshold.into();
        }
        root["outlierRejection"] = outliers;
    }

    let mut encoded_steps: Vec<JsonValue> = Vec::with_capacity(steps.len());
    for step in steps {
        let mut object = JsonValue::new_object();
        match step {
            StepSettings::Align(align) => {
                object[ALIGN_TAG] = true.into();
                object["alignMarkers"] = align.use_markers.into();
                object["alignPointCloud"] = align.use_point_cloud.into();
                object["rotation"] = vector_json(&align.rotation);
                object["scale"] = align.scale.into();
                object["translation"] = vector_json(&align.translation);
                if let Some(threshold) = align.scale_threshold {
                    object["scaleThreshold"] = threshold.into();
                }
            }
            StepSettings::Fit(fit) => {
                object[FIT_TAG] = true.into();
                object["markerWeight"] = fit.marker_weight.into();
                object["strainPenaltyWeight"] = fit.strain_penalty_weight.into();
                object["curvaturePenaltyWeight"] = fit.curvature_penalty_weight.into();
                object["edgeDiscontinuityPenaltyWeight"] = fit.edge_discontinuity_penalty_weight.into();
                object["numberOfIterations"] = fit.number_of_iterations.into();
                object["maximumSubIterations"] = fit.max_sub_iterations.into();
                object["updateReferenceState"] = fit.update_reference_state.into();
            }
        }
        encoded_steps.push(object);
    }
    root["fitterSteps"] = JsonValue::Array(encoded_steps);
    root
}

fn required<'a>(value: &'a JsonValue, key: &str, context: &str) -> FitResult<&'a JsonValue> {
    if !value.has_key(key) {
        return Err(FitterError::Configuration(format!(
            "{context} settings missing {key} field"
        )));
    }
    Ok(&value[key])
}

fn required_f64(value: &JsonValue, key: &str, context: &str) -> FitResult<f64> {
    required(value, key, context)?.as_f64().ok_or_else(|| {
        FitterError::Configuration(format!("{context} settings have a bad value for {key}"))
    })
}

fn required_bool(value: &JsonValue, key: &str, context: &str) -> FitResult<bool> {
    required(value, key, context)?.as_bool().ok_or_else(|| {
        FitterError::Configuration(format!("{context} settings have a bad value for {key}"))
    })
}

fn required_usize(value: &JsonValue, key: &str, context: &str) -> FitResult<usize> {
    required(value, key, context)?.as_usize().ok_or_else(|| {
        FitterError::Configuration(format!("{context} settings have a bad value for {key}"))
    })
}

fn required_str<'a>(value: &'a JsonValue, key: &str, context: &str) -> FitResult<&'a str> {
    required(value, key, context)?.as_str().ok_or_else(|| {
        FitterError::Configuration(format!("{context} settings have a bad value for {key}"))
    })
}

fn required_vector(value: &JsonValue, key: &str, context: &str) -> FitResult<Vector3<f64>> {
    let array = required(value, key, context)?;
    let components: Vec<f64> = array.members().filter_map(|m| m.as_f64()).collect();
    if !array.is_array() || array.len() != 3 || components.len() != 3 {
        return Err(FitterError::Configuration(format!(
            "{context} settings {key} must be an array of 3 numbers"
        )));
    }
    Ok(Vector3::new(components[0], components[1], components[2]))
}

fn optional_f64(value: &JsonValue, key: &str, context: &str) -> FitResult<Option<f64>> {
    if !value.has_key(key) || value[key].is_null() {
        return Ok(None);
    }
    required_f64(value, key, context).map(Some)
}

fn decode_align(object: &JsonValue) -> FitResult<AlignSettings> {
    let align = AlignSettings {
        use_markers: required_bool(object, "alignMarkers", "Align step")?,
        use_point_cloud: required_bool(object, "alignPointCloud", "Align step")?,
        rotation: required_vector(object, "rotation", "Align step")?,
        scale: required_f64(object, "scale", "Align step")?,
        translation: required_vector(object, "translation", "Align step")?,
        scale_threshold: optional_f64(object, "scaleThreshold", "Align step")?,
    };
    align.validate()?;
    Ok(align)
}

fn decode_fit(object: &JsonValue) -> FitResult<FitSettings> {
    let fit = FitSettings {
        marker_weight: required_f64(object, "markerWeight", "Fit step")?,
        strain_penalty_weight: required_f64(object, "strainPenaltyWeight", "Fit step")?,
        curvature_penalty_weight: required_f64(object, "curvaturePenaltyWeight", "Fit step")?,
        edge_discontinuity_penalty_weight: required_f64(object, "edgeDiscontinuityPenaltyWeight", "Fit step")?,
        number_of_iterations: required_usize(object, "numberOfIterations", "Fit step")?,
        max_sub_iterations: required_usize(object, "maximumSubIterations", "Fit step")?,
        update_reference_state: required_bool(object, "updateReferenceState", "Fit step")?,
    };
    fit.validate()?;
    Ok(fit)
}

/// Decodes settings written by [`encode_settings`].
///
/// # Arguments
/// * `value` - The settings as a JsonValue object
///
/// # Returns
/// The fitter settings and the step settings in order
pub fn decode_settings(value: &JsonValue) -> FitResult<(FitterSettings, Vec<StepSettings>)> {
    if !value.is_object() {
        return Err(FitterError::Configuration(
            "Settings json must be an object".to_owned(),
        ));
    }
    let version = required(value, "version", "Fitter")?.as_u32();
    if version != Some(SETTINGS_VERSION) {
        return Err(FitterError::Configuration(format!(
            "Unsupported settings version {}",
            value["version"]
        )));
    }

    let marker_group = match required(value, "markerGroup", "Fitter")? {
        JsonValue::Null => None,
        group => Some(
            group
                .as_str()
                .ok_or_else(|| FitterError::Configuration("Fitter settings have a bad value for markerGroup".to_owned()))?
                .to_owned(),
        ),
    };
    let level = required_usize(value, "diagnosticLevel", "Fitter")?;

    let mut outlier_rejection = OutlierRejection::default();
    if value.has_key("outlierRejection") {
        let outliers = &value["outlierRejection"];
        outlier_rejection.error_percentile = optional_f64(outliers, "errorPercentile", "Outlier rejection")?;
        outlier_rejection.normal_cosine_threshold =
            optional_f64(outliers, "normalCosineThreshold", "Outlier rejection")?;
    }

    let settings = FitterSettings {
        model_coordinates_field: required_str(value, "modelCoordinatesField", "Fitter")?.to_owned(),
        data_coordinates_field: required_str(value, "dataCoordinatesField", "Fitter")?.to_owned(),
        marker_group,
        diagnostic_level: level.min(u8::MAX as usize) as u8,
        outlier_rejection,
    };
    settings.validate()?;

    let encoded_steps = required(value, "fitterSteps", "Fitter")?;
    if !encoded_steps.is_array() {
        return Err(FitterError::Configuration(
            "Fitter settings fitterSteps must be an array".to_owned(),
        ));
    }
    let mut steps = Vec::with_capacity(encoded_steps.len());
    for (index, object) in encoded_steps.members().enumerate() {
        if object[ALIGN_TAG].as_bool() == Some(true) {
            steps.push(StepSettings::Align(decode_align(object)?));
        } else if object[FIT_TAG].as_bool() == Some(true) {
            steps.push(StepSettings::Fit(decode_fit(object)?));
        } else {
            return Err(FitterError::Configuration(format!(
                "Fitter step {index} has no known step type"
            )));
        }
    }

    Ok((settings, steps))
}

/// Parses and decodes settings from JSON text
pub fn parse_settings(text: &str) -> FitResult<(FitterSettings, Vec<StepSettings>)> {
    let value = match json::parse(text) {
        Ok(v) => v,
        Err(err) => {
            return Err(FitterError::Configuration(format!(
                "Error in settings json: {err}"
            )))
        }
    };
    decode_settings(&value)
}
