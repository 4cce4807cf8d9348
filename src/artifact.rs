//! On-disk layers-model format: a JSON manifest describing the topology and
//! weight layout, plus little-endian `f32` weight shards next to it.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::network::{Activation, Layer, NetworkError, Sequential, TrainingConfig};

pub const MANIFEST_EXTENSION: &str = "json";
pub const DEFAULT_MANIFEST_NAME: &str = "model.json";
const FORMAT: &str = "layers-model";
const SHARD_BYTES: usize = 4 * 1024 * 1024;
const DTYPE: &str = "float32";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("unsupported model format {0:?}")]
    UnsupportedFormat(String),
    #[error("unsupported weight dtype {0:?}")]
    UnsupportedDtype(String),
    #[error("weight {0} is missing from the weights manifest")]
    MissingWeight(String),
    #[error("weight shards hold {found} bytes, manifest expects {expected}")]
    WeightSize { expected: usize, found: usize },
    #[error("weight {name} has shape {found:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("{0}")]
    Network(#[from] NetworkError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub format: String,
    pub generated_by: String,
    pub model_topology: ModelTopology,
    pub training_config: TrainingConfig,
    pub weights_manifest: Vec<WeightGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTopology {
    pub class_name: String,
    pub config: SequentialConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialConfig {
    pub name: String,
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum LayerConfig {
    Flatten {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_input_shape: Option<Vec<Option<usize>>>,
    },
    Dense {
        name: String,
        units: usize,
        activation: Activation,
        use_bias: bool,
    },
    Dropout {
        name: String,
        rate: f32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightGroup {
    pub paths: Vec<String>,
    pub weights: Vec<WeightSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

impl WeightSpec {
    fn byte_len(&self) -> usize {
        self.shape.iter().product::<usize>() * 4
    }
}

/// Writes the weight shards and then the manifest into `dir`, replacing any
/// earlier save under the same manifest name. Returns the manifest path.
pub fn save(
    model: &Sequential,
    dir: &Path,
    manifest_name: &str,
) -> Result<PathBuf, ArtifactError> {
    fs::create_dir_all(dir)?;
    let stem = manifest_stem(manifest_name);

    let mut specs = Vec::new();
    let mut data = Vec::new();
    let mut layers = Vec::with_capacity(model.layers().len());
    for (index, layer) in model.layers().iter().enumerate() {
        layers.push(match layer {
            Layer::Flatten { name } => LayerConfig::Flatten {
                name: name.clone(),
                batch_input_shape: (index == 0).then(|| {
                    std::iter::once(None)
                        .chain(model.input_shape().iter().copied().map(Some))
                        .collect()
                }),
            },
            Layer::Dense {
                name,
                kernel,
                bias,
                activation,
            } => {
                specs.push(WeightSpec {
                    name: format!("{name}/kernel"),
                    shape: kernel.shape().to_vec(),
                    dtype: DTYPE.into(),
                });
                data.extend(kernel.iter().flat_map(|v| v.to_le_bytes()));
                specs.push(WeightSpec {
                    name: format!("{name}/bias"),
                    shape: bias.shape().to_vec(),
                    dtype: DTYPE.into(),
                });
                data.extend(bias.iter().flat_map(|v| v.to_le_bytes()));
                LayerConfig::Dense {
                    name: name.clone(),
                    units: bias.len(),
                    activation: *activation,
                    use_bias: true,
                }
            }
            Layer::Dropout { name, rate } => LayerConfig::Dropout {
                name: name.clone(),
                rate: *rate,
            },
        });
    }

    let chunks: Vec<&[u8]> = data.chunks(SHARD_BYTES).collect();
    let total = chunks.len();
    let mut paths = Vec::with_capacity(total);
    for (i, chunk) in chunks.into_iter().enumerate() {
        let shard = format!("{stem}-group1-shard{}of{total}.bin", i + 1);
        write_atomic(&dir.join(&shard), chunk)?;
        paths.push(shard);
    }
    remove_stale_shards(dir, stem, &paths)?;

    let manifest = Manifest {
        format: FORMAT.into(),
        generated_by: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).into(),
        model_topology: ModelTopology {
            class_name: "Sequential".into(),
            config: SequentialConfig {
                name: model.name().to_string(),
                layers,
            },
        },
        training_config: model.training().clone(),
        weights_manifest: vec![WeightGroup {
            paths,
            weights: specs,
        }],
        class_labels: Some(model.class_labels().to_vec()),
    };

    let manifest_path = dir.join(manifest_name);
    write_atomic(&manifest_path, &serde_json::to_vec_pretty(&manifest)?)?;
    debug!(
        "Saved {} ({} bytes of weights in {} shards)",
        manifest_path.display(),
        data.len(),
        total
    );
    Ok(manifest_path)
}

/// Rebuilds a model from its manifest and the shards it references.
/// Manifests without `classLabels` get the default label list.
pub fn load(manifest_path: &Path) -> Result<Sequential, ArtifactError> {
    let manifest: Manifest = serde_json::from_slice(&fs::read(manifest_path)?)?;
    if manifest.format != FORMAT {
        return Err(ArtifactError::UnsupportedFormat(manifest.format));
    }
    let dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let mut weights = read_weights(dir, &manifest.weights_manifest)?;

    let mut input_shape = None;
    let mut layers = Vec::with_capacity(manifest.model_topology.config.layers.len());
    for config in manifest.model_topology.config.layers {
        layers.push(match config {
            LayerConfig::Flatten {
                name,
                batch_input_shape,
            } => {
                if let Some(shape) = batch_input_shape {
                    input_shape = Some(shape.into_iter().skip(1).collect::<Option<Vec<_>>>());
                }
                Layer::Flatten { name }
            }
            LayerConfig::Dense {
                name,
                units,
                activation,
                use_bias,
            } => {
                let (kernel_shape, kernel) = take_weight(&mut weights, &format!("{name}/kernel"))?;
                if kernel_shape.len() != 2 || kernel_shape[1] != units {
                    return Err(ArtifactError::WeightShape {
                        name: format!("{name}/kernel"),
                        expected: vec![kernel_shape.first().copied().unwrap_or(0), units],
                        found: kernel_shape,
                    });
                }
                let kernel = Array2::from_shape_vec((kernel_shape[0], units), kernel)
                    .map_err(|e| NetworkError::Topology(e.to_string()))?;
                let bias = if use_bias {
                    let (bias_shape, bias) = take_weight(&mut weights, &format!("{name}/bias"))?;
                    if bias_shape != [units] {
                        return Err(ArtifactError::WeightShape {
                            name: format!("{name}/bias"),
                            expected: vec![units],
                            found: bias_shape,
                        });
                    }
                    Array1::from_vec(bias)
                } else {
                    Array1::zeros(units)
                };
                Layer::Dense {
                    name,
                    kernel,
                    bias,
                    activation,
                }
            }
            LayerConfig::Dropout { name, rate } => Layer::Dropout { name, rate },
        });
    }

    let input_shape = input_shape.flatten().ok_or_else(|| {
        NetworkError::Topology("first layer does not declare a complete batch_input_shape".into())
    })?;
    let labels = manifest
        .class_labels
        .unwrap_or_else(Sequential::default_labels);

    Ok(Sequential::new(
        manifest.model_topology.config.name,
        input_shape,
        layers,
        labels,
        manifest.training_config,
    )?)
}

fn read_weights(
    dir: &Path,
    groups: &[WeightGroup],
) -> Result<HashMap<String, (Vec<usize>, Vec<f32>)>, ArtifactError> {
    let mut weights = HashMap::new();
    for group in groups {
        let mut bytes = Vec::new();
        for path in &group.paths {
            bytes.extend(fs::read(dir.join(path))?);
        }

        let expected: usize = group.weights.iter().map(WeightSpec::byte_len).sum();
        if bytes.len() != expected {
            return Err(ArtifactError::WeightSize {
                expected,
                found: bytes.len(),
            });
        }

        let mut offset = 0;
        for spec in &group.weights {
            if spec.dtype != DTYPE {
                return Err(ArtifactError::UnsupportedDtype(spec.dtype.clone()));
            }
            let end = offset + spec.byte_len();
            let values = bytes[offset..end]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            weights.insert(spec.name.clone(), (spec.shape.clone(), values));
            offset = end;
        }
    }
    Ok(weights)
}

fn take_weight(
    weights: &mut HashMap<String, (Vec<usize>, Vec<f32>)>,
    name: &str,
) -> Result<(Vec<usize>, Vec<f32>), ArtifactError> {
    weights
        .remove(name)
        .ok_or_else(|| ArtifactError::MissingWeight(name.to_string()))
}

fn manifest_stem(manifest_name: &str) -> &str {
    manifest_name
        .strip_suffix(".json")
        .unwrap_or(manifest_name)
}

/// Writes to a hidden sibling first so readers only ever see whole files.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

fn remove_stale_shards(dir: &Path, stem: &str, keep: &[String]) -> io::Result<()> {
    let prefix = format!("{stem}-group1-shard");
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".bin") && !keep.contains(&name) {
            fs::remove_file(dir.join(&name))?;
        }
    }
    Ok(())
}
