//! Darknet weights extractor
//!
//! Rebuilds the layer graph from a Darknet `.cfg`, infers every layer's
//! channel count, then streams the matching `.weights` file through it,
//! folding batch normalization into the convolution weights and optionally
//! re-encoding them as INT16 Q-format.

pub mod batch_norm;
pub mod cfg_parser;
pub mod error;
pub mod extractor;
pub mod int16_quant;
pub mod output;
pub mod shape;
pub mod weights_reader;

pub use batch_norm::{BatchNormFolder, FoldedLayer, NormParams, DEFAULT_EPSILON};
pub use cfg_parser::{
    parse_cfg_file, parse_cfg_str, LayerDescriptor, LayerKind, Network, NetworkConfig, WeightCounts,
};
pub use error::{ConfigError, ExtractError, FoldError, QuantizeError, ShapeError, Stage, StreamError};
pub use extractor::{ExtractOptions, ExtractSummary, Extractor, LayerReport};
pub use int16_quant::{quantize_layer, QuantizedLayer, QuantStats};
pub use output::{BinarySink, OutputFormat};
pub use shape::{resolve_channels, ResolvedNetwork, ShapeDiagnostic};
pub use weights_reader::{WeightBlock, WeightsHeader, WeightsReader};
