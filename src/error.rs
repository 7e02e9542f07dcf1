//! Error taxonomy for the extraction pipeline
//!
//! Every error is fatal to a run. Each variant names the graph index, key or
//! field that failed so a misaligned weight stream can be traced back to the
//! layer that caused it.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Malformed or unreadable text graph.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot open config file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: malformed section header `{text}`")]
    MalformedHeader { line: usize, text: String },

    #[error("line {line}: invalid value `{value}` for `{key}` in [{section}]")]
    InvalidValue {
        line: usize,
        section: String,
        key: String,
        value: String,
    },

    #[error("line {line}: `{key}` in [{section}] must be at least {min}, got {value}")]
    OutOfRange {
        line: usize,
        section: String,
        key: String,
        value: i64,
        min: i64,
    },
}

/// Unresolvable layer reference or impossible channel arithmetic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("layer {layer}: reference {reference} resolves to {resolved}, which is not an earlier layer")]
    InvalidReference {
        layer: usize,
        reference: i32,
        resolved: i64,
    },

    #[error("layer {layer}: route has no source layers")]
    EmptyRoute { layer: usize },

    #[error("layer {layer}: convolution has no input channels")]
    NoInputChannels { layer: usize },

    #[error("layer {layer}: {channels} input channels are not divisible by groups={groups}")]
    IndivisibleGroups {
        layer: usize,
        channels: usize,
        groups: usize,
    },

    #[error("layer {layer}: weight count overflows the addressable range")]
    WeightCountOverflow { layer: usize },
}

/// Weight stream failures.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("cannot open weights file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("weights header truncated after {bytes_read} bytes")]
    TruncatedHeader { bytes_read: u64 },

    #[error("short read at byte {offset}: requested {requested} floats, only {available} available")]
    ShortRead {
        offset: u64,
        requested: usize,
        available: usize,
    },

    #[error("float count {0} overflows the addressable byte range")]
    Oversized(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Degenerate or inconsistent normalization input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FoldError {
    #[error("filter {filter}: variance {variance} + epsilon {epsilon} is not positive")]
    DegenerateVariance {
        filter: usize,
        variance: f32,
        epsilon: f32,
    },

    #[error("{field} holds {actual} values, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Values that cannot be represented in fixed point at all.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantizeError {
    #[error("{field}[{index}] is {value}, only finite values can be quantized")]
    NonFinite {
        field: &'static str,
        index: usize,
        value: f32,
    },
}

/// Per-layer step of the extraction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    ReadBiases,
    ReadScales,
    ReadMeans,
    ReadVariances,
    ReadWeights,
    Fold,
    Quantize,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ReadBiases => "reading biases",
            Stage::ReadScales => "reading scales",
            Stage::ReadMeans => "reading means",
            Stage::ReadVariances => "reading variances",
            Stage::ReadWeights => "reading weights",
            Stage::Fold => "folding",
            Stage::Quantize => "quantizing",
            Stage::Write => "writing",
        };
        f.write_str(name)
    }
}

/// Top-level failure of an extraction run.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("weights header: {0}")]
    Header(#[source] StreamError),

    #[error("layer {layer} ({stage}): {source}")]
    Stream {
        layer: usize,
        stage: Stage,
        #[source]
        source: StreamError,
    },

    #[error("layer {layer} ({}): {source}", Stage::Fold)]
    Fold {
        layer: usize,
        #[source]
        source: FoldError,
    },

    #[error("layer {layer} ({}): {source}", Stage::Quantize)]
    Quantize {
        layer: usize,
        #[source]
        source: QuantizeError,
    },

    #[error("layer {layer} ({}): {source}", Stage::Write)]
    Io {
        layer: usize,
        #[source]
        source: io::Error,
    },

    #[error("flushing output streams: {0}")]
    Flush(#[source] io::Error),
}

impl ExtractError {
    /// Graph index of the layer that failed, if the failure is layer-bound.
    pub fn layer(&self) -> Option<usize> {
        match self {
            ExtractError::Stream { layer, .. }
            | ExtractError::Fold { layer, .. }
            | ExtractError::Quantize { layer, .. }
            | ExtractError::Io { layer, .. } => Some(*layer),
            _ => None,
        }
    }
}
