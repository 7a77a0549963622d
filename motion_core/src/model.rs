//! Exercise models and the sources they are resolved from.
//!
//! A model directory holds one TOML manifest per model (`<id>.toml`) next to
//! its raw weights file:
//!
//! ```toml
//! id = "arms"
//! layers = [1200, 250, 100, 3]
//! channels = ["accelerometer@left-wrist"]
//! labels = ["biceps-curl", "triceps-extension", "lateral-raise"]
//! minimum_duration = 6.0
//! weights = "arms.raw"
//! ```
//!
//! Weights files are packed little-endian `f32` values in the layout
//! described in [`crate::inference`].

use crate::activation::Activation;
use crate::channel::ChannelType;
use crate::inference::{ForwardPropagator, NetworkConfig};
use crate::series::Duration;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A trained network together with what it expects and what it predicts
#[derive(Clone, Debug)]
pub struct ExerciseModel {
    id: String,
    network: ForwardPropagator,
    channel_types: Vec<ChannelType>,
    labels: Vec<String>,
    minimum_duration: Duration,
}

impl ExerciseModel {
    /// Build and validate a model
    ///
    /// Fails when the weights do not match the layer configuration, when no
    /// channel types are required, or when there is not exactly one label
    /// per output unit.
    pub fn new(
        id: impl Into<String>,
        config: NetworkConfig,
        weights: &[f32],
        channel_types: Vec<ChannelType>,
        labels: Vec<String>,
        minimum_duration: Duration,
    ) -> Result<Self> {
        let id = id.into();
        if channel_types.is_empty() {
            return Err(Error::Model(format!("model {} requires no channels", id)));
        }

        let network = ForwardPropagator::new(config, weights)?;
        if labels.len() != network.output_width() {
            return Err(Error::Model(format!(
                "model {} has {} labels for {} outputs",
                id,
                labels.len(),
                network.output_width()
            )));
        }

        Ok(Self {
            id,
            network,
            channel_types,
            labels,
            minimum_duration,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network(&self) -> &ForwardPropagator {
        &self.network
    }

    /// Channels the network input is projected onto
    pub fn channel_types(&self) -> &[ChannelType] {
        &self.channel_types
    }

    /// One label per output unit
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Shortest segment worth reporting
    pub fn minimum_duration(&self) -> Duration {
        self.minimum_duration
    }
}

/// Network configuration used by exercise models unless the manifest overrides it
pub fn default_network(layers: Vec<usize>) -> NetworkConfig {
    NetworkConfig::new(layers, Activation::Relu, Activation::Sigmoid)
}

/// Read a raw little-endian `f32` weights file
pub fn load_weights(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(Error::Model(format!(
            "weights file {:?} is {} bytes, not a whole number of f32 values",
            path,
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Write weights in the format [`load_weights`] reads
pub fn save_weights(path: &Path, weights: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = weights.iter().flat_map(|w| w.to_le_bytes()).collect();
    std::fs::write(path, bytes)?;
    Ok(())
}

/// On-disk description of a model
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModelManifest {
    pub id: String,
    pub layers: Vec<usize>,
    pub channels: Vec<ChannelType>,
    pub labels: Vec<String>,
    pub minimum_duration: Duration,
    /// Weights file, relative to the manifest
    pub weights: PathBuf,

    #[serde(default = "default_hidden_activation")]
    pub hidden_activation: Activation,

    #[serde(default = "default_output_activation")]
    pub output_activation: Activation,
}

fn default_hidden_activation() -> Activation {
    Activation::Relu
}

fn default_output_activation() -> Activation {
    Activation::Sigmoid
}

impl ModelManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Model(format!("Failed to serialize manifest: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Load the weights relative to `base_dir` and build the model
    pub fn into_model(self, base_dir: &Path) -> Result<ExerciseModel> {
        let weights = load_weights(&base_dir.join(&self.weights))?;
        let config =
            NetworkConfig::new(self.layers, self.hidden_activation, self.output_activation);
        ExerciseModel::new(
            self.id,
            config,
            &weights,
            self.channels,
            self.labels,
            self.minimum_duration,
        )
    }
}

/// Resolves model ids to loaded models
///
/// Implementations are shared between classification workers.
pub trait ModelSource: Send + Sync {
    fn exercise_model(&self, id: &str) -> Result<Arc<ExerciseModel>>;
}

/// Models stored as manifests plus weights in one directory, loaded on first use
pub struct DirectoryModelSource {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<ExerciseModel>>>,
}

impl DirectoryModelSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load(&self, id: &str) -> Result<ExerciseModel> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(Error::Model(format!("invalid model id {:?}", id)));
        }

        let manifest_path = self.dir.join(format!("{}.toml", id));
        if !manifest_path.exists() {
            return Err(Error::Model(format!(
                "no manifest for model {} in {:?}",
                id, self.dir
            )));
        }

        let manifest = ModelManifest::load(&manifest_path)?;
        if manifest.id != id {
            return Err(Error::Model(format!(
                "manifest {:?} describes model {}, expected {}",
                manifest_path, manifest.id, id
            )));
        }
        manifest.into_model(&self.dir)
    }
}

impl ModelSource for DirectoryModelSource {
    fn exercise_model(&self, id: &str) -> Result<Arc<ExerciseModel>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(model) = cache.get(id) {
            return Ok(Arc::clone(model));
        }

        let model = Arc::new(self.load(id)?);
        tracing::info!(
            "Loaded model {} ({} labels, {} layers) from {:?}",
            id,
            model.labels().len(),
            model.network().layer_count(),
            self.dir
        );
        cache.insert(id.to_string(), Arc::clone(&model));
        Ok(model)
    }
}

/// A fixed set of in-memory models
#[derive(Clone, Default)]
pub struct StaticModelSource {
    models: HashMap<String, Arc<ExerciseModel>>,
}

impl StaticModelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: ExerciseModel) -> Self {
        self.insert(model);
        self
    }

    pub fn insert(&mut self, model: ExerciseModel) {
        self.models.insert(model.id().to_string(), Arc::new(model));
    }
}

impl ModelSource for StaticModelSource {
    fn exercise_model(&self, id: &str) -> Result<Arc<ExerciseModel>> {
        self.models
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Model(format!("unknown model {}", id)))
    }
}

/// A heart-rate model of a single layer: label `"high"` fires when the
/// window mean is well above zero, `"low"` when it is well below.
#[cfg(test)]
pub(crate) fn mean_threshold_model(
    id: &str,
    window: usize,
    minimum_duration: Duration,
) -> ExerciseModel {
    let step = 1.0 / window as f32;
    let mut weights = vec![0.0];
    weights.extend(std::iter::repeat(step).take(window));
    weights.push(0.0);
    weights.extend(std::iter::repeat(-step).take(window));

    ExerciseModel::new(
        id,
        default_network(vec![window, 2]),
        &weights,
        vec![ChannelType::HeartRate],
        vec!["high".into(), "low".into()],
        minimum_duration,
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Location;

    fn manifest(id: &str) -> ModelManifest {
        ModelManifest {
            id: id.into(),
            layers: vec![3, 2],
            channels: vec![ChannelType::Accelerometer(Location::LeftWrist)],
            labels: vec!["curl".into(), "press".into()],
            minimum_duration: 4.0,
            weights: PathBuf::from(format!("{}.raw", id)),
            hidden_activation: Activation::Relu,
            output_activation: Activation::Sigmoid,
        }
    }

    fn write_model(dir: &Path, id: &str) {
        manifest(id).save(&dir.join(format!("{}.toml", id))).unwrap();
        save_weights(&dir.join(format!("{}.raw", id)), &[0.5; 8]).unwrap();
    }

    #[test]
    fn test_model_validation() {
        let accel = vec![ChannelType::Accelerometer(Location::LeftWrist)];
        let labels = vec!["a".to_string(), "b".to_string()];

        let network = || default_network(vec![3, 2]);
        let ok = ExerciseModel::new("m", network(), &[0.0; 8], accel.clone(), labels.clone(), 1.0);
        assert!(ok.is_ok());

        let err = ExerciseModel::new("m", network(), &[0.0; 7], accel.clone(), labels.clone(), 1.0)
            .unwrap_err();
        assert!(matches!(err, Error::Inference(_)));

        let err = ExerciseModel::new("m", network(), &[0.0; 8], accel, vec!["a".into()], 1.0)
            .unwrap_err();
        assert!(matches!(err, Error::Model(_)));

        let err = ExerciseModel::new("m", network(), &[0.0; 8], vec![], labels, 1.0).unwrap_err();
        assert!(matches!(err, Error::Model(_)));
    }

    #[test]
    fn test_load_weights() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("w.raw");

        save_weights(&path, &[1.5, -2.0, 0.25]).unwrap();
        assert_eq!(load_weights(&path).unwrap(), vec![1.5, -2.0, 0.25]);

        std::fs::write(&path, [0u8; 5]).unwrap();
        assert!(matches!(load_weights(&path), Err(Error::Model(_))));
    }

    #[test]
    fn test_manifest_defaults_activations() {
        let toml_str = r#"
id = "legs"
layers = [1, 1]
channels = ["heart-rate"]
labels = ["squat"]
minimum_duration = 2.0
weights = "legs.raw"
"#;
        let parsed: ModelManifest = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.hidden_activation, Activation::Relu);
        assert_eq!(parsed.output_activation, Activation::Sigmoid);
        assert_eq!(parsed.channels, vec![ChannelType::HeartRate]);
    }

    #[test]
    fn test_directory_source_loads_and_caches() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_model(temp_dir.path(), "arms");

        let source = DirectoryModelSource::new(temp_dir.path());
        let first = source.exercise_model("arms").unwrap();
        assert_eq!(first.id(), "arms");
        assert_eq!(first.labels(), &["curl".to_string(), "press".to_string()]);
        assert_eq!(first.minimum_duration(), 4.0);

        // Cached: deleting the files does not matter any more
        std::fs::remove_file(temp_dir.path().join("arms.raw")).unwrap();
        let second = source.exercise_model("arms").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_directory_source_errors() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_model(temp_dir.path(), "arms");
        let source = DirectoryModelSource::new(temp_dir.path());

        assert!(matches!(source.exercise_model("legs"), Err(Error::Model(_))));
        assert!(matches!(source.exercise_model("../arms"), Err(Error::Model(_))));

        // Manifest id must match the file name
        std::fs::copy(
            temp_dir.path().join("arms.toml"),
            temp_dir.path().join("chest.toml"),
        )
        .unwrap();
        assert!(matches!(source.exercise_model("chest"), Err(Error::Model(_))));
    }

    #[test]
    fn test_static_source() {
        let source = StaticModelSource::new().with_model(mean_threshold_model("hr", 4, 0.0));
        assert_eq!(source.exercise_model("hr").unwrap().network().input_width(), 4);
        assert!(source.exercise_model("other").is_err());
    }
}
