//! Flat binary output streams
//!
//! Float32 mode writes two little-endian f32 streams (all weights, all
//! biases) in layer order. INT16 mode writes the same two streams as
//! little-endian i16 plus a third stream holding one little-endian i32 Q
//! value per convolution layer.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use serde::Serialize;

use crate::batch_norm::FoldedLayer;
use crate::int16_quant::QuantizedLayer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum OutputFormat {
    #[default]
    Float32,
    Int16,
}

impl OutputFormat {
    pub fn element_size(&self) -> usize {
        match self {
            OutputFormat::Float32 => 4,
            OutputFormat::Int16 => 2,
        }
    }
}

/// Owns the output streams for the duration of a run.
pub struct BinarySink<W: Write> {
    weights: W,
    biases: W,
    q_values: Option<W>,
}

impl BinarySink<BufWriter<File>> {
    /// Creates (truncating) the output files. `q_path` is required for INT16
    /// output and ignored otherwise.
    pub fn create(
        weights_path: &Path,
        bias_path: &Path,
        q_path: Option<&Path>,
    ) -> io::Result<Self> {
        let open = |path: &Path| File::create(path).map(BufWriter::new);
        Ok(Self::new(
            open(weights_path)?,
            open(bias_path)?,
            q_path.map(open).transpose()?,
        ))
    }
}

fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    for &v in values {
        w.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

fn write_i16s<W: Write>(w: &mut W, values: &[i16]) -> io::Result<()> {
    for &v in values {
        w.write_i16::<LittleEndian>(v)?;
    }
    Ok(())
}

impl<W: Write> BinarySink<W> {
    pub fn new(weights: W, biases: W, q_values: Option<W>) -> Self {
        Self {
            weights,
            biases,
            q_values,
        }
    }

    /// Append one layer's float32 weights and biases.
    pub fn write_folded(&mut self, layer: &FoldedLayer) -> io::Result<()> {
        write_f32s(&mut self.weights, &layer.weights)?;
        write_f32s(&mut self.biases, &layer.biases)
    }

    /// Append one layer's INT16 values and its Q. Fails before writing
    /// anything when no Q stream was configured.
    pub fn write_quantized(&mut self, layer: &QuantizedLayer) -> io::Result<()> {
        let q_values = self.q_values.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no Q-value stream configured")
        })?;
        write_i16s(&mut self.weights, &layer.weights)?;
        write_i16s(&mut self.biases, &layer.biases)?;
        q_values.write_i32::<LittleEndian>(layer.q as i32)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.weights.flush()?;
        self.biases.flush()?;
        if let Some(q) = self.q_values.as_mut() {
            q.flush()?;
        }
        Ok(())
    }

    pub fn into_parts(self) -> (W, W, Option<W>) {
        (self.weights, self.biases, self.q_values)
    }
}
