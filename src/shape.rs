//! Channel inference over the parsed graph
//!
//! One forward pass in index order. Each layer's output channel count is
//! final before the next layer is visited, so route and shortcut lookups only
//! ever see already-resolved layers.

use log::{debug, warn};
use serde::Serialize;

use crate::cfg_parser::{ConvParams, LayerDescriptor, LayerKind, Network};
use crate::error::ShapeError;

/// Non-fatal anomaly found while resolving channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ShapeDiagnostic {
    /// Shortcut operands disagree; the running channel count is kept.
    ShortcutChannelMismatch {
        layer: usize,
        from: usize,
        running: usize,
        source: usize,
    },
}

/// A `Network` whose descriptors carry input/output channel counts.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedNetwork {
    pub network: Network,
    pub diagnostics: Vec<ShapeDiagnostic>,
    total_weights: usize,
    stream_floats: usize,
}

impl ResolvedNetwork {
    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.network.layers
    }

    pub fn conv_layers(&self) -> impl Iterator<Item = (&LayerDescriptor, &ConvParams)> {
        self.network.conv_layers()
    }

    /// Weight floats the graph implies, excluding biases and norm params.
    pub fn total_weights(&self) -> usize {
        self.total_weights
    }

    /// Floats the graph implies for the whole weight stream after the header.
    pub fn stream_floats(&self) -> usize {
        self.stream_floats
    }
}

/// Converts a route/shortcut reference into an absolute index.
///
/// Non-negative values are absolute, negative values are relative to
/// `current`. The result must name a layer strictly before `current`.
pub fn resolve_reference(current: usize, reference: i32) -> Result<usize, ShapeError> {
    let resolved = if reference >= 0 {
        i64::from(reference)
    } else {
        current as i64 + i64::from(reference)
    };
    if resolved < 0 || resolved >= current as i64 {
        return Err(ShapeError::InvalidReference {
            layer: current,
            reference,
            resolved,
        });
    }
    Ok(resolved as usize)
}

/// Fills `input_channels`/`output_channels` on every descriptor, plus the
/// stream accounting of every convolution.
///
/// Weight counts and their totals are computed with checked arithmetic; the
/// stream total is also kept small enough to address in bytes.
pub fn resolve_channels(mut network: Network) -> Result<ResolvedNetwork, ShapeError> {
    let mut diagnostics = Vec::new();
    let mut running = network.config.channels;
    let mut total_weights: usize = 0;
    let mut stream_floats: usize = 0;

    for i in 0..network.layers.len() {
        let (earlier, rest) = network.layers.split_at_mut(i);
        let layer = &mut rest[0];
        layer.input_channels = running;

        layer.output_channels = match &layer.kind {
            LayerKind::Convolution(conv) => {
                if running == 0 {
                    return Err(ShapeError::NoInputChannels { layer: i });
                }
                if running % conv.groups != 0 {
                    return Err(ShapeError::IndivisibleGroups {
                        layer: i,
                        channels: running,
                        groups: conv.groups,
                    });
                }
                let overflow = ShapeError::WeightCountOverflow { layer: i };
                let counts = conv.weight_counts(running).ok_or(overflow.clone())?;
                total_weights = total_weights
                    .checked_add(counts.weights)
                    .ok_or(overflow.clone())?;
                stream_floats = stream_floats
                    .checked_add(counts.stream)
                    .filter(|total| total.checked_mul(4).is_some())
                    .ok_or(overflow)?;
                layer.counts = counts;
                conv.filters
            }
            LayerKind::Route { layers } => {
                if layers.is_empty() {
                    return Err(ShapeError::EmptyRoute { layer: i });
                }
                layers.iter().try_fold(0, |sum, &reference| {
                    let source = resolve_reference(i, reference)?;
                    Ok::<_, ShapeError>(sum + earlier[source].output_channels)
                })?
            }
            LayerKind::Shortcut { from, .. } => {
                let source = resolve_reference(i, *from)?;
                let source_channels = earlier[source].output_channels;
                if source_channels != running {
                    warn!(
                        "shortcut layer {} channel mismatch (prev={}, from={})",
                        i, running, source_channels
                    );
                    diagnostics.push(ShapeDiagnostic::ShortcutChannelMismatch {
                        layer: i,
                        from: source,
                        running,
                        source: source_channels,
                    });
                }
                running
            }
            LayerKind::Pool(_)
            | LayerKind::Upsample { .. }
            | LayerKind::DetectionHead { .. }
            | LayerKind::Other { .. } => running,
        };

        debug!(
            "[{}] {}: {} -> {} channels",
            i,
            layer.kind.name(),
            layer.input_channels,
            layer.output_channels
        );
        running = layer.output_channels;
    }

    Ok(ResolvedNetwork {
        network,
        diagnostics,
        total_weights,
        stream_floats,
    })
}
