//! Layer-by-layer extraction pass
//!
//! Walks the convolution layers of a resolved network in graph order. For
//! each one it reads biases, optional normalization parameters and weights
//! from the stream, folds, optionally quantizes, and hands the result to the
//! sink before touching the next layer. Nothing is kept across layers except
//! the stream cursor and the running totals.

use std::io::{Read, Write};

use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::batch_norm::{BatchNormFolder, NormParams, DEFAULT_EPSILON};
use crate::cfg_parser::{ConvParams, LayerDescriptor};
use crate::error::{ExtractError, Stage};
use crate::int16_quant::{quantize_layer, QuantStats};
use crate::output::{BinarySink, OutputFormat};
use crate::shape::{ResolvedNetwork, ShapeDiagnostic};
use crate::weights_reader::{WeightBlock, WeightsHeader, WeightsReader};

/// Run-wide settings; `Default` matches the CLI defaults.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExtractOptions {
    pub epsilon: f32,
    pub format: OutputFormat,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            format: OutputFormat::Float32,
        }
    }
}

/// What was written for one convolution layer.
#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub index: usize,
    pub filters: usize,
    pub input_channels: usize,
    pub groups: usize,
    pub size: usize,
    pub batch_normalize: bool,
    pub weights: usize,
    pub biases: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QuantStats>,
    pub saturated: bool,
}

/// Totals and per-layer reports for a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractSummary {
    pub header: WeightsHeader,
    pub options: ExtractOptions,
    pub layers: Vec<LayerReport>,
    pub total_weights: usize,
    pub total_biases: usize,
    pub bytes_read: u64,
    pub diagnostics: Vec<ShapeDiagnostic>,
}

impl ExtractSummary {
    pub fn total_parameters(&self) -> usize {
        self.total_weights + self.total_biases
    }
}

fn read_field<R: Read>(
    reader: &mut WeightsReader<R>,
    layer: usize,
    stage: Stage,
    count: usize,
) -> Result<Vec<f32>, ExtractError> {
    trace!("layer {}: {} ({} floats)", layer, stage, count);
    reader
        .read_floats(count)
        .map_err(|source| ExtractError::Stream {
            layer,
            stage,
            source,
        })
}

/// Reads one layer's payload in the fixed stream order. Span lengths come
/// from the counts the shape resolver stored on `layer`.
pub fn read_block<R: Read>(
    reader: &mut WeightsReader<R>,
    layer: &LayerDescriptor,
    conv: &ConvParams,
) -> Result<WeightBlock, ExtractError> {
    let index = layer.index;
    let n = conv.filters;

    let biases = read_field(reader, index, Stage::ReadBiases, n)?;
    let norm = if conv.batch_normalize {
        Some(NormParams {
            scales: read_field(reader, index, Stage::ReadScales, n)?,
            means: read_field(reader, index, Stage::ReadMeans, n)?,
            variances: read_field(reader, index, Stage::ReadVariances, n)?,
        })
    } else {
        None
    };
    let weights = read_field(reader, index, Stage::ReadWeights, layer.counts.weights)?;

    Ok(WeightBlock {
        biases,
        norm,
        weights,
    })
}

/// Drives one extraction pass over a resolved network.
pub struct Extractor<'a> {
    network: &'a ResolvedNetwork,
    folder: BatchNormFolder,
    options: ExtractOptions,
}

impl<'a> Extractor<'a> {
    /// Create an extractor; the folder takes its epsilon from `options`.
    pub fn new(network: &'a ResolvedNetwork, options: ExtractOptions) -> Self {
        Self {
            network,
            folder: BatchNormFolder::new(options.epsilon),
            options,
        }
    }

    /// Number of layers that own weights.
    pub fn conv_count(&self) -> usize {
        self.network.conv_layers().count()
    }

    /// Runs the whole pass. The first failure aborts the run; layers already
    /// handed to `sink` stay written.
    pub fn run<R: Read, W: Write>(
        &self,
        reader: &mut WeightsReader<R>,
        sink: &mut BinarySink<W>,
        mut on_layer: impl FnMut(&LayerReport),
    ) -> Result<ExtractSummary, ExtractError> {
        let header = reader.read_header().map_err(ExtractError::Header)?;
        info!(
            "weights v{}.{}.{}, {} conv layers to extract",
            header.major,
            header.minor,
            header.revision,
            self.conv_count()
        );

        let mut layers = Vec::new();
        let mut total_weights = 0;
        let mut total_biases = 0;

        for (layer, conv) in self.network.conv_layers() {
            let report = self.process_layer(reader, sink, layer, conv)?;
            total_weights += report.weights;
            total_biases += report.biases;
            on_layer(&report);
            layers.push(report);
        }

        sink.flush().map_err(ExtractError::Flush)?;

        match reader.has_trailing_data() {
            Ok(true) => warn!(
                "weights file has data past byte {}; graph and weights may not match",
                reader.bytes_read()
            ),
            Ok(false) => {}
            Err(e) => warn!("could not probe for trailing weight data: {}", e),
        }

        Ok(ExtractSummary {
            header,
            options: self.options,
            layers,
            total_weights,
            total_biases,
            bytes_read: reader.bytes_read(),
            diagnostics: self.network.diagnostics.clone(),
        })
    }

    fn process_layer<R: Read, W: Write>(
        &self,
        reader: &mut WeightsReader<R>,
        sink: &mut BinarySink<W>,
        layer: &LayerDescriptor,
        conv: &ConvParams,
    ) -> Result<LayerReport, ExtractError> {
        let index = layer.index;
        let block = read_block(reader, layer, conv)?;

        trace!("layer {}: {}", index, Stage::Fold);
        let folded = self
            .folder
            .fold(
                &block.weights,
                &block.biases,
                block.norm.as_ref(),
                conv.filters,
                layer.counts.per_filter,
            )
            .map_err(|source| ExtractError::Fold {
                layer: index,
                source,
            })?;
        drop(block);

        let mut report = LayerReport {
            index,
            filters: conv.filters,
            input_channels: layer.input_channels,
            groups: conv.groups,
            size: conv.size,
            batch_normalize: conv.batch_normalize,
            weights: folded.weights.len(),
            biases: folded.biases.len(),
            q: None,
            error: None,
            saturated: false,
        };

        let written = match self.options.format {
            OutputFormat::Float32 => {
                trace!("layer {}: {}", index, Stage::Write);
                sink.write_folded(&folded)
            }
            OutputFormat::Int16 => {
                trace!("layer {}: {}", index, Stage::Quantize);
                let quantized = quantize_layer(&folded.weights, &folded.biases).map_err(
                    |source| ExtractError::Quantize {
                        layer: index,
                        source,
                    },
                )?;
                if quantized.saturated {
                    warn!("layer {}: values clamped at Q0", index);
                }
                report.q = Some(quantized.q);
                report.error = Some(quantized.stats);
                report.saturated = quantized.saturated;
                trace!("layer {}: {}", index, Stage::Write);
                sink.write_quantized(&quantized)
            }
        };
        written.map_err(|source| ExtractError::Io {
            layer: index,
            source,
        })?;

        debug!(
            "layer {}: out_ch={} in_ch={} groups={} kernel={}x{} weights={} bias={}{}",
            index,
            conv.filters,
            layer.input_channels,
            conv.groups,
            conv.size,
            conv.size,
            report.weights,
            report.biases,
            if conv.batch_normalize { " BN-folded" } else { "" }
        );
        Ok(report)
    }
}
