//! Feed-forward neural network inference.
//!
//! Weights come pre-trained as one flat vector. For every pair of adjacent
//! layers `j`, `j + 1` the vector holds a row-major matrix of shape
//! `(width[j + 1], width[j] + bias_units)`; the first `bias_units` columns of
//! each row are the bias weights.

use crate::activation::Activation;
use crate::error::InferenceError;

/// Shape and activation functions of a network
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkConfig {
    /// Number of units in each layer, input first
    pub layers: Vec<usize>,
    /// Applied to every layer but the last
    pub hidden_activation: Activation,
    /// Applied to the last layer
    pub output_activation: Activation,
    /// Value fed into every bias unit
    pub bias_value: f32,
    /// Bias units prepended to each layer's input
    pub bias_units: usize,
}

impl NetworkConfig {
    pub fn new(layers: Vec<usize>, hidden: Activation, output: Activation) -> Self {
        Self {
            layers,
            hidden_activation: hidden,
            output_activation: output,
            bias_value: 1.0,
            bias_units: 1,
        }
    }

    /// Number of weights this configuration consumes
    pub fn weight_count(&self) -> usize {
        self.layers
            .windows(2)
            .map(|pair| (pair[0] + self.bias_units) * pair[1])
            .sum()
    }
}

#[derive(Clone, Debug)]
struct Layer {
    rows: usize,
    columns: usize,
    weights: Vec<f32>,
    activation: Activation,
}

/// A configured network ready for batched prediction
#[derive(Clone, Debug)]
pub struct ForwardPropagator {
    config: NetworkConfig,
    layers: Vec<Layer>,
}

impl ForwardPropagator {
    /// Slice `weights` into per-layer matrices
    pub fn new(config: NetworkConfig, weights: &[f32]) -> Result<Self, InferenceError> {
        let expected = config.weight_count();
        // Needs an input and an output layer
        if config.layers.len() < 2
            || config.layers.contains(&0)
            || expected != weights.len()
        {
            return Err(InferenceError::InvalidWeightsForLayerConfiguration {
                expected,
                actual: weights.len(),
            });
        }

        let last = config.layers.len() - 2;
        let mut offset = 0;
        let layers = config
            .layers
            .windows(2)
            .enumerate()
            .map(|(j, pair)| {
                let rows = pair[1];
                let columns = pair[0] + config.bias_units;
                let matrix = weights[offset..offset + rows * columns].to_vec();
                offset += rows * columns;
                Layer {
                    rows,
                    columns,
                    weights: matrix,
                    activation: if j == last {
                        config.output_activation
                    } else {
                        config.hidden_activation
                    },
                }
            })
            .collect();

        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Number of features per example
    pub fn input_width(&self) -> usize {
        self.config.layers[0]
    }

    /// Number of predictions per example
    pub fn output_width(&self) -> usize {
        self.config.layers[self.config.layers.len() - 1]
    }

    /// Number of weight matrices
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Propagate a batch of examples through the network
    ///
    /// `features` holds `features.len() / input_width` examples back to back.
    /// The result holds `output_width` predictions per example, in the same
    /// example order.
    pub fn predict(&self, features: &[f32]) -> Result<Vec<f32>, InferenceError> {
        let input_width = self.input_width();
        if features.is_empty() || features.len() % input_width != 0 {
            return Err(InferenceError::InvalidFeatureMatrixSize {
                length: features.len(),
                input_width,
            });
        }

        let examples = features.len() / input_width;
        let bias_units = self.config.bias_units;
        let mut current = features.to_vec();
        let mut width = input_width;
        let mut biased = Vec::new();

        for layer in &self.layers {
            let mut next = vec![0.0f32; examples * layer.rows];
            for (example, output) in next.chunks_exact_mut(layer.rows).enumerate() {
                biased.clear();
                biased.extend(std::iter::repeat(self.config.bias_value).take(bias_units));
                biased.extend_from_slice(&current[example * width..(example + 1) * width]);

                for (row, out) in output.iter_mut().enumerate() {
                    let weights = &layer.weights[row * layer.columns..(row + 1) * layer.columns];
                    *out = weights.iter().zip(&biased).map(|(w, x)| w * x).sum();
                }
            }
            layer.activation.apply(&mut next);
            current = next;
            width = layer.rows;
        }

        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_BINARY_FEATURES: [f32; 8] = [1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

    fn base_config() -> NetworkConfig {
        NetworkConfig::new(vec![2, 1], Activation::Sigmoid, Activation::Sigmoid)
    }

    fn assert_close(actual: &[f32], expected: &[f32], accuracy: f32) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() <= accuracy, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn test_and() {
        let net = ForwardPropagator::new(base_config(), &[-30.0, 20.0, 20.0]).unwrap();
        let prediction = net.predict(&TWO_BINARY_FEATURES).unwrap();
        assert_close(&prediction, &[1.0, 0.0, 0.0, 0.0], 1e-4);
    }

    #[test]
    fn test_or() {
        let net = ForwardPropagator::new(base_config(), &[-10.0, 20.0, 20.0]).unwrap();
        let prediction = net.predict(&TWO_BINARY_FEATURES).unwrap();
        assert_close(&prediction, &[1.0, 1.0, 1.0, 0.0], 1e-4);
    }

    #[test]
    fn test_xnor_with_hidden_layer() {
        let mut conf = base_config();
        conf.layers = vec![2, 2, 1];
        let net = ForwardPropagator::new(
            conf,
            &[-30.0, 20.0, 20.0, 10.0, -20.0, -20.0, -10.0, 20.0, 20.0],
        )
        .unwrap();
        let prediction = net.predict(&TWO_BINARY_FEATURES).unwrap();
        assert_close(&prediction, &[1.0, 0.0, 0.0, 1.0], 1e-4);
    }

    #[test]
    fn test_nand_with_relu() {
        let conf = NetworkConfig::new(vec![2, 1], Activation::Relu, Activation::Relu);
        let net = ForwardPropagator::new(conf, &[20.0, -17.5, -14.5]).unwrap();
        let prediction = net.predict(&TWO_BINARY_FEATURES).unwrap();
        assert_close(&prediction, &[0.0, 2.5, 5.5, 20.0], 1e-4);
    }

    #[test]
    fn test_tanh_output() {
        let conf = NetworkConfig::new(vec![4, 2, 3], Activation::Tanh, Activation::Tanh);
        let weights = [
            -2.522_616_8, 1.379_419_1, 2.384_441_6, -4.411_65, -0.685_608,
            -10.887_684, -3.463_033_5, -3.561_827_8, 6.694_421, 5.847_634,
            -3.968_908_7, 8.456_454, -22.223_45, 8.545_524, -14.004_325,
            -16.865_896, -10.256_283, 3.198_517_8, 20.095_491,
        ];
        let net = ForwardPropagator::new(conf, &weights).unwrap();
        let prediction = net.predict(&[4.8, 3.3, 1.3, 0.2]).unwrap();
        assert_close(&prediction, &[1.0, 1.0, -1.0], 1e-6);
    }

    #[test]
    fn test_outputs_are_grouped_by_example() {
        let conf = NetworkConfig::new(vec![1, 2], Activation::Identity, Activation::Identity);
        // out0 = 1 + x, out1 = -x
        let net = ForwardPropagator::new(conf, &[1.0, 1.0, 0.0, -1.0]).unwrap();
        let prediction = net.predict(&[2.0, 5.0]).unwrap();
        assert_eq!(prediction, vec![3.0, -2.0, 6.0, -5.0]);
    }

    #[test]
    fn test_custom_bias_value() {
        let mut conf = NetworkConfig::new(vec![1, 1], Activation::Identity, Activation::Identity);
        conf.bias_value = 0.5;
        let net = ForwardPropagator::new(conf, &[4.0, 1.0]).unwrap();
        assert_eq!(net.predict(&[1.0]).unwrap(), vec![3.0]);
    }

    #[test]
    fn test_invalid_weights() {
        let err = ForwardPropagator::new(base_config(), &[1.0, 2.0]).unwrap_err();
        assert_eq!(
            err,
            InferenceError::InvalidWeightsForLayerConfiguration {
                expected: 3,
                actual: 2
            }
        );

        let empty = NetworkConfig::new(vec![], Activation::Sigmoid, Activation::Sigmoid);
        assert!(ForwardPropagator::new(empty, &[]).is_err());
    }

    #[test]
    fn test_single_layer_is_rejected() {
        let single = NetworkConfig::new(vec![3], Activation::Relu, Activation::Sigmoid);
        assert_eq!(
            ForwardPropagator::new(single, &[]).unwrap_err(),
            InferenceError::InvalidWeightsForLayerConfiguration {
                expected: 0,
                actual: 0
            }
        );
    }

    #[test]
    fn test_invalid_feature_matrix_size() {
        let net = ForwardPropagator::new(base_config(), &[-30.0, 20.0, 20.0]).unwrap();
        assert_eq!(
            net.predict(&[0.0, 0.0, 0.0]),
            Err(InferenceError::InvalidFeatureMatrixSize {
                length: 3,
                input_width: 2
            })
        );
        assert!(matches!(
            net.predict(&[]),
            Err(InferenceError::InvalidFeatureMatrixSize { .. })
        ));
    }

    #[test]
    fn test_shape_accessors() {
        let conf = NetworkConfig::new(vec![6, 4, 3], Activation::Relu, Activation::Sigmoid);
        let net = ForwardPropagator::new(conf, &vec![0.0; 7 * 4 + 5 * 3]).unwrap();
        assert_eq!(net.input_width(), 6);
        assert_eq!(net.output_width(), 3);
        assert_eq!(net.layer_count(), 2);
    }
}
