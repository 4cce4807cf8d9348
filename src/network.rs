use ndarray::{Array1, Array2, ArrayView4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const INPUT_SHAPE: [usize; 3] = [224, 224, 3];
pub const HIDDEN_UNITS: usize = 128;
pub const DROPOUT_RATE: f32 = 0.2;
pub const DEFAULT_CLASS_LABELS: [&str; 3] = ["class1", "class2", "class3"];

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("expected input of shape [N, {expected:?}], got {found:?}")]
    InputShape {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("{labels} class labels for an output layer of {units} units")]
    LabelMismatch { labels: usize, units: usize },
    #[error("invalid topology: {0}")]
    Topology(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Softmax,
}

impl Activation {
    fn apply(self, z: &mut Array2<f32>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Activation::Softmax => {
                for mut row in z.rows_mut() {
                    let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row.mapv_inplace(|v| v / sum);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Flatten {
        name: String,
    },
    Dense {
        name: String,
        /// `[inputs, units]`
        kernel: Array2<f32>,
        bias: Array1<f32>,
        activation: Activation,
    },
    /// Only active while fitting, so it is the identity in `predict`.
    Dropout {
        name: String,
        rate: f32,
    },
}

impl Layer {
    pub fn name(&self) -> &str {
        match self {
            Layer::Flatten { name } | Layer::Dense { name, .. } | Layer::Dropout { name, .. } => {
                name
            }
        }
    }

    /// Glorot-uniform kernel and zero bias.
    pub fn dense<R: Rng>(
        rng: &mut R,
        name: impl Into<String>,
        inputs: usize,
        units: usize,
        activation: Activation,
    ) -> Self {
        let limit = (6.0 / (inputs + units) as f32).sqrt();
        let kernel = Array2::from_shape_fn((inputs, units), |_| rng.gen_range(-limit..limit));
        Layer::Dense {
            name: name.into(),
            kernel,
            bias: Array1::zeros(units),
            activation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub class_name: String,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub optimizer_config: OptimizerConfig,
    pub loss: String,
    pub metrics: Vec<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            optimizer_config: OptimizerConfig {
                class_name: "Adam".into(),
                learning_rate: 0.001,
            },
            loss: "sparse_categorical_crossentropy".into(),
            metrics: vec!["accuracy".into()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sequential {
    name: String,
    input_shape: Vec<usize>,
    layers: Vec<Layer>,
    class_labels: Vec<String>,
    training: TrainingConfig,
}

impl Sequential {
    /// Checks that the layers chain up from `input_shape` and that the
    /// final dense layer has one unit per class label.
    pub fn new(
        name: impl Into<String>,
        input_shape: Vec<usize>,
        layers: Vec<Layer>,
        class_labels: Vec<String>,
        training: TrainingConfig,
    ) -> Result<Self, NetworkError> {
        match layers.first() {
            Some(Layer::Flatten { .. }) => {}
            _ => return Err(NetworkError::Topology("first layer must be Flatten".into())),
        }

        let mut features: usize = input_shape.iter().product();
        let mut units = None;
        for layer in &layers {
            match layer {
                Layer::Flatten { .. } | Layer::Dropout { .. } => {}
                Layer::Dense {
                    name, kernel, bias, ..
                } => {
                    let (rows, cols) = kernel.dim();
                    if rows != features {
                        return Err(NetworkError::Topology(format!(
                            "layer {name} expects {rows} inputs but receives {features}"
                        )));
                    }
                    if bias.len() != cols {
                        return Err(NetworkError::Topology(format!(
                            "layer {name} has {cols} units but a bias of {}",
                            bias.len()
                        )));
                    }
                    features = cols;
                    units = Some(cols);
                }
            }
        }

        let units =
            units.ok_or_else(|| NetworkError::Topology("network has no dense layer".into()))?;
        if units != class_labels.len() {
            return Err(NetworkError::LabelMismatch {
                labels: class_labels.len(),
                units,
            });
        }

        Ok(Sequential {
            name: name.into(),
            input_shape,
            layers,
            class_labels,
            training,
        })
    }

    /// flatten → dense(128, relu) → dropout(0.2) → dense(labels, softmax),
    /// compiled with adam / sparse categorical cross-entropy / accuracy.
    pub fn classifier<R: Rng>(
        rng: &mut R,
        class_labels: Vec<String>,
    ) -> Result<Self, NetworkError> {
        let inputs = INPUT_SHAPE.iter().product();
        let layers = vec![
            Layer::Flatten {
                name: "flatten_1".into(),
            },
            Layer::dense(rng, "dense_1", inputs, HIDDEN_UNITS, Activation::Relu),
            Layer::Dropout {
                name: "dropout_1".into(),
                rate: DROPOUT_RATE,
            },
            Layer::dense(
                rng,
                "dense_2",
                HIDDEN_UNITS,
                class_labels.len(),
                Activation::Softmax,
            ),
        ];
        Sequential::new(
            "sequential_1",
            INPUT_SHAPE.to_vec(),
            layers,
            class_labels,
            TrainingConfig::default(),
        )
    }

    pub fn default_labels() -> Vec<String> {
        DEFAULT_CLASS_LABELS.iter().map(|s| s.to_string()).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn class_labels(&self) -> &[String] {
        &self.class_labels
    }

    pub fn training(&self) -> &TrainingConfig {
        &self.training
    }

    pub fn output_units(&self) -> usize {
        self.class_labels.len()
    }

    /// Forward pass over a `[N, H, W, C]` batch, returning `[N, units]`.
    pub fn predict(&self, batch: ArrayView4<f32>) -> Result<Array2<f32>, NetworkError> {
        let shape = batch.shape();
        if shape[1..] != self.input_shape[..] {
            return Err(NetworkError::InputShape {
                expected: self.input_shape.clone(),
                found: shape.to_vec(),
            });
        }

        let n = shape[0];
        let features: usize = self.input_shape.iter().product();
        // logical iteration order is row-major, same as Flatten
        let mut x = Array2::from_shape_vec((n, features), batch.iter().copied().collect())
            .map_err(|e| NetworkError::Topology(e.to_string()))?;

        for layer in &self.layers {
            if let Layer::Dense {
                kernel,
                bias,
                activation,
                ..
            } = layer
            {
                let mut z = x.dot(kernel);
                z += &bias.view().insert_axis(Axis(0));
                activation.apply(&mut z);
                x = z;
            }
        }

        Ok(x)
    }
}
