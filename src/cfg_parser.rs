//! Darknet .cfg parser
//!
//! Turns the line-oriented `[section]` / `key=value` text into a
//! `NetworkConfig` and an ordered list of typed layer descriptors. Channel
//! counts are left at zero here and filled in by `shape::resolve_channels`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::{debug, warn};
use serde::Serialize;

use crate::error::ConfigError;

pub const COMMENT_MARKER: char = '#';

/// Global `[net]` settings. Only `channels` feeds the pipeline; the rest is
/// carried through for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkConfig {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub batch: usize,
    pub subdivisions: usize,
    pub momentum: f32,
    pub decay: f32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            width: 416,
            height: 416,
            channels: 3,
            batch: 1,
            subdivisions: 1,
            momentum: 0.9,
            decay: 0.0005,
        }
    }
}

/// Convolution hyper-parameters read from a `[convolutional]` section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvParams {
    pub filters: usize,
    pub size: usize,
    pub stride: usize,
    pub pad: usize,
    pub groups: usize,
    pub batch_normalize: bool,
    pub activation: String,
}

/// Float counts a convolution occupies in the weight stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WeightCounts {
    /// `(in / groups) * size * size`
    pub per_filter: usize,
    /// `filters * per_filter`
    pub weights: usize,
    /// Biases, optional scales/means/variances, then weights.
    pub stream: usize,
}

impl ConvParams {
    /// Checked weight accounting for the given input channel count; `None`
    /// when any product or sum overflows `usize`.
    pub fn weight_counts(&self, input_channels: usize) -> Option<WeightCounts> {
        let per_filter = (input_channels / self.groups)
            .checked_mul(self.size)?
            .checked_mul(self.size)?;
        let weights = self.filters.checked_mul(per_filter)?;
        let per_filter_params = if self.batch_normalize { 4 } else { 1 };
        let stream = self
            .filters
            .checked_mul(per_filter_params)?
            .checked_add(weights)?;
        Some(WeightCounts {
            per_filter,
            weights,
            stream,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolMode {
    Max,
    Average,
}

/// Pooling window; channels pass through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolParams {
    pub mode: PoolMode,
    pub size: usize,
    pub stride: usize,
}

/// Closed set of node kinds. Anything the parser does not recognise still
/// takes a graph index as `Other` so positional references stay aligned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LayerKind {
    Convolution(ConvParams),
    Pool(PoolParams),
    Route { layers: Vec<i32> },
    Shortcut { from: i32, activation: String },
    Upsample { stride: usize },
    DetectionHead { section: String },
    Other { section: String },
}

impl LayerKind {
    pub fn name(&self) -> &str {
        match self {
            LayerKind::Convolution(_) => "convolutional",
            LayerKind::Pool(PoolParams { mode: PoolMode::Max, .. }) => "maxpool",
            LayerKind::Pool(PoolParams { mode: PoolMode::Average, .. }) => "avgpool",
            LayerKind::Route { .. } => "route",
            LayerKind::Shortcut { .. } => "shortcut",
            LayerKind::Upsample { .. } => "upsample",
            LayerKind::DetectionHead { section } | LayerKind::Other { section } => section,
        }
    }
}

/// One graph node in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerDescriptor {
    pub index: usize,
    pub kind: LayerKind,
    /// Line of the section header in the source text.
    pub line: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Stream accounting, filled for convolutions by the shape resolver.
    pub counts: WeightCounts,
}

impl LayerDescriptor {
    fn new(index: usize, line: usize, kind: LayerKind) -> Self {
        Self {
            index,
            kind,
            line,
            input_channels: 0,
            output_channels: 0,
            counts: WeightCounts::default(),
        }
    }

    pub fn conv(&self) -> Option<&ConvParams> {
        match &self.kind {
            LayerKind::Convolution(conv) => Some(conv),
            _ => None,
        }
    }
}

/// Layer tallies by kind, for the CLI summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerCounts {
    pub convolutional: usize,
    pub pool: usize,
    pub other: usize,
}

/// Parsed graph: global settings plus layers in declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct Network {
    pub config: NetworkConfig,
    pub layers: Vec<LayerDescriptor>,
}

impl Network {
    /// Convolution layers in graph order, the only ones that own weights.
    pub fn conv_layers(&self) -> impl Iterator<Item = (&LayerDescriptor, &ConvParams)> {
        self.layers
            .iter()
            .filter_map(|layer| layer.conv().map(|conv| (layer, conv)))
    }

    pub fn kind_counts(&self) -> LayerCounts {
        let mut counts = LayerCounts::default();
        for layer in &self.layers {
            match layer.kind {
                LayerKind::Convolution(_) => counts.convolutional += 1,
                LayerKind::Pool(_) => counts.pool += 1,
                _ => counts.other += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone)]
struct OptionValue {
    value: String,
    line: usize,
}

/// Raw `[name]` block with its options, before any typing.
#[derive(Debug, Clone)]
struct Section {
    name: String,
    line: usize,
    options: BTreeMap<String, OptionValue>,
}

impl Section {
    fn new(name: String, line: usize) -> Self {
        Self {
            name,
            line,
            options: BTreeMap::new(),
        }
    }

    fn invalid(&self, key: &str, option: &OptionValue) -> ConfigError {
        ConfigError::InvalidValue {
            line: option.line,
            section: self.name.clone(),
            key: key.to_string(),
            value: option.value.clone(),
        }
    }

    /// Numeric option; present-but-unparsable is an error, absent is `default`.
    fn number<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.options.get(key) {
            Some(option) => option.value.parse().map_err(|_| self.invalid(key, option)),
            None => Ok(default),
        }
    }

    /// Integer that must be at least `min`.
    fn bounded(&self, key: &str, default: i64, min: i64) -> Result<usize, ConfigError> {
        let value: i64 = self.number(key, default)?;
        if value < min {
            let line = self.options.get(key).map_or(self.line, |o| o.line);
            return Err(ConfigError::OutOfRange {
                line,
                section: self.name.clone(),
                key: key.to_string(),
                value,
                min,
            });
        }
        Ok(value as usize)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.options
            .get(key)
            .map_or_else(|| default.to_string(), |o| o.value.clone())
    }

    fn int_list(&self, key: &str) -> Result<Vec<i32>, ConfigError> {
        let Some(option) = self.options.get(key) else {
            return Ok(Vec::new());
        };
        option
            .value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| item.parse().map_err(|_| self.invalid(key, option)))
            .collect()
    }
}

/// Fold state threaded through the line loop.
#[derive(Debug, Default)]
struct SectionFold {
    current: Option<Section>,
    finished: Vec<Section>,
}

impl SectionFold {
    fn step(mut self, line_no: usize, raw: &str) -> Result<Self, ConfigError> {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            return Ok(self);
        }

        if line.starts_with('[') {
            let name = parse_header(line, line_no)?;
            if let Some(done) = self.current.replace(Section::new(name, line_no)) {
                self.finished.push(done);
            }
        } else if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            match self.current.as_mut() {
                Some(section) => {
                    section.options.insert(
                        key.to_string(),
                        OptionValue {
                            value: value.trim().to_string(),
                            line: line_no,
                        },
                    );
                }
                None => warn!("line {}: option `{}` outside of any section, ignored", line_no, key),
            }
        } else {
            warn!("line {}: ignoring `{}` (expected key=value)", line_no, line);
        }
        Ok(self)
    }

    fn finish(mut self) -> Vec<Section> {
        self.finished.extend(self.current.take());
        self.finished
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(COMMENT_MARKER) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_header(line: &str, line_no: usize) -> Result<String, ConfigError> {
    let malformed = || ConfigError::MalformedHeader {
        line: line_no,
        text: line.to_string(),
    };
    let name = line
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::trim)
        .ok_or_else(malformed)?;
    if name.is_empty() || name.contains(['[', ']']) {
        return Err(malformed());
    }
    Ok(name.to_string())
}

fn parse_sections(text: &str) -> Result<Vec<Section>, ConfigError> {
    text.lines()
        .enumerate()
        .try_fold(SectionFold::default(), |fold, (i, raw)| fold.step(i + 1, raw))
        .map(SectionFold::finish)
}

fn parse_net(section: &Section) -> Result<NetworkConfig, ConfigError> {
    let defaults = NetworkConfig::default();
    Ok(NetworkConfig {
        width: section.bounded("width", defaults.width as i64, 0)?,
        height: section.bounded("height", defaults.height as i64, 0)?,
        channels: section.bounded("channels", defaults.channels as i64, 1)?,
        batch: section.bounded("batch", defaults.batch as i64, 1)?,
        subdivisions: section.bounded("subdivisions", defaults.subdivisions as i64, 1)?,
        momentum: section.number("momentum", defaults.momentum)?,
        decay: section.number("decay", defaults.decay)?,
    })
}

fn parse_conv(section: &Section) -> Result<ConvParams, ConfigError> {
    Ok(ConvParams {
        filters: section.bounded("filters", 1, 1)?,
        size: section.bounded("size", 1, 1)?,
        stride: section.bounded("stride", 1, 1)?,
        pad: section.bounded("pad", 0, 0)?,
        groups: section.bounded("groups", 1, 1)?,
        batch_normalize: section.number::<i64>("batch_normalize", 0)? != 0,
        activation: section.string("activation", "linear"),
    })
}

fn parse_layer_kind(section: &Section) -> Result<LayerKind, ConfigError> {
    let kind = match section.name.as_str() {
        "convolutional" | "conv" => LayerKind::Convolution(parse_conv(section)?),
        "maxpool" | "max" => LayerKind::Pool(PoolParams {
            mode: PoolMode::Max,
            size: section.bounded("size", 2, 1)?,
            stride: section.bounded("stride", 2, 1)?,
        }),
        "avgpool" | "avg" => LayerKind::Pool(PoolParams {
            mode: PoolMode::Average,
            size: section.bounded("size", 1, 1)?,
            stride: section.bounded("stride", 1, 1)?,
        }),
        "route" => LayerKind::Route {
            layers: section.int_list("layers")?,
        },
        "shortcut" => LayerKind::Shortcut {
            from: section.number("from", -3)?,
            activation: section.string("activation", "linear"),
        },
        "upsample" => LayerKind::Upsample {
            stride: section.bounded("stride", 2, 1)?,
        },
        "yolo" | "region" | "detection" => LayerKind::DetectionHead {
            section: section.name.clone(),
        },
        other => {
            debug!("line {}: unrecognised section [{}], passing channels through", section.line, other);
            LayerKind::Other {
                section: other.to_string(),
            }
        }
    };
    Ok(kind)
}

/// Parses cfg text into a `Network` with unresolved channel counts.
pub fn parse_cfg_str(text: &str) -> Result<Network, ConfigError> {
    let sections = parse_sections(text)?;

    let mut config = None;
    let mut layers = Vec::new();
    for section in &sections {
        match section.name.as_str() {
            "net" | "network" => {
                if config.is_some() {
                    warn!("line {}: repeated [{}] section overrides the earlier one", section.line, section.name);
                }
                config = Some(parse_net(section)?);
            }
            _ => {
                let index = layers.len();
                layers.push(LayerDescriptor::new(index, section.line, parse_layer_kind(section)?));
            }
        }
    }

    let config = config.unwrap_or_else(|| {
        warn!("no [net] section, using default 416x416x3 input");
        NetworkConfig::default()
    });

    debug!("parsed {} layers", layers.len());
    Ok(Network { config, layers })
}

/// Reads and parses a cfg file.
pub fn parse_cfg_file<P: AsRef<Path>>(path: P) -> Result<Network, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    parse_cfg_str(&text)
}
