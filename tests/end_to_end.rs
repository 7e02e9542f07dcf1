use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use darknet_extract::{
    parse_cfg_file, resolve_channels, BinarySink, ExtractError, ExtractOptions, Extractor,
    OutputFormat, Stage, WeightsReader,
};
use tempfile::TempDir;

const CFG: &str = "\
[net]
width=32
height=32
channels=3

# folded layer
[convolutional]
batch_normalize=1
filters=4
size=3
stride=1
pad=1
activation=leaky

[convolutional]
filters=8
size=1
activation=linear
";

const L1_WEIGHTS: usize = 4 * 3 * 3 * 3;
const L2_WEIGHTS: usize = 8 * 4;

struct Fixture {
    dir: TempDir,
    l1_biases: Vec<f32>,
    l2_biases: Vec<f32>,
}

impl Fixture {
    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

fn write_weights(path: &Path, floats: &[f32], trailing: usize) {
    let mut buf = Vec::new();
    buf.write_i32::<LittleEndian>(0).unwrap();
    buf.write_i32::<LittleEndian>(2).unwrap();
    buf.write_i32::<LittleEndian>(5).unwrap();
    buf.write_i64::<LittleEndian>(32_013_312).unwrap();
    for &f in floats {
        buf.write_f32::<LittleEndian>(f).unwrap();
    }
    buf.extend(std::iter::repeat(0u8).take(trailing));
    fs::write(path, buf).unwrap();
}

fn fixture(trailing: usize) -> Fixture {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("net.cfg"), CFG).unwrap();

    let l1_biases = vec![0.1, -0.2, 0.3, -0.4];
    let scales = [1.0f32, 2.0, 0.5, 1.5];
    let means = [0.5f32, -0.5, 0.25, 0.0];
    let variances = [1.0f32, 4.0, 0.25, 9.0];
    let l1_weights: Vec<f32> = (0..L1_WEIGHTS).map(|i| (i as f32 - 50.0) / 100.0).collect();
    let l2_biases: Vec<f32> = (0..8).map(|i| i as f32 * 0.05).collect();
    let l2_weights: Vec<f32> = (0..L2_WEIGHTS).map(|i| (i as f32) / -64.0).collect();

    let mut floats = Vec::new();
    floats.extend_from_slice(&l1_biases);
    floats.extend_from_slice(&scales);
    floats.extend_from_slice(&means);
    floats.extend_from_slice(&variances);
    floats.extend_from_slice(&l1_weights);
    floats.extend_from_slice(&l2_biases);
    floats.extend_from_slice(&l2_weights);
    write_weights(&dir.path().join("net.weights"), &floats, trailing);

    Fixture {
        dir,
        l1_biases,
        l2_biases,
    }
}

fn read_f32s(path: &Path) -> Vec<f32> {
    let bytes = fs::read(path).unwrap();
    let mut values = vec![0.0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(&bytes, &mut values);
    values
}

fn run(fx: &Fixture, format: OutputFormat) -> Result<darknet_extract::ExtractSummary, ExtractError> {
    let network = parse_cfg_file(fx.path("net.cfg")).unwrap();
    let resolved = resolve_channels(network).unwrap();
    let mut reader = WeightsReader::open(fx.path("net.weights")).unwrap();
    let q_path = fx.path("q.bin");
    let mut sink = BinarySink::create(
        &fx.path("weights.bin"),
        &fx.path("bias.bin"),
        (format == OutputFormat::Int16).then_some(q_path.as_path()),
    )
    .unwrap();
    let options = ExtractOptions {
        format,
        ..Default::default()
    };
    Extractor::new(&resolved, options).run(&mut reader, &mut sink, |_| {})
}

#[test]
fn float32_extraction_writes_folded_streams() {
    let fx = fixture(0);
    let summary = run(&fx, OutputFormat::Float32).unwrap();

    assert_eq!(summary.layers.len(), 2);
    assert_eq!(summary.total_weights, L1_WEIGHTS + L2_WEIGHTS);
    assert_eq!(summary.total_biases, 4 + 8);
    assert_eq!(summary.header.seen, 32_013_312);

    let weights = read_f32s(&fx.path("weights.bin"));
    let biases = read_f32s(&fx.path("bias.bin"));
    assert_eq!(weights.len(), L1_WEIGHTS + L2_WEIGHTS);
    assert_eq!(biases.len(), 12);

    // layer 0, filter 0: alpha = 1 / sqrt(1 + eps)
    let alpha = 1.0 / (1.0f32 + 0.000001).sqrt();
    assert!((biases[0] - (0.1 - 0.5 * alpha)).abs() < 1e-6);
    assert!((weights[0] - (-0.5 * alpha)).abs() < 1e-6);
    assert_ne!(&biases[..4], fx.l1_biases.as_slice());

    // unnormalized layer passes through bit-exact
    assert_eq!(&biases[4..], fx.l2_biases.as_slice());
    let l2: Vec<f32> = (0..L2_WEIGHTS).map(|i| (i as f32) / -64.0).collect();
    assert_eq!(&weights[L1_WEIGHTS..], l2.as_slice());
}

#[test]
fn bytes_consumed_match_graph() {
    let fx = fixture(0);
    let network = parse_cfg_file(fx.path("net.cfg")).unwrap();
    let resolved = resolve_channels(network).unwrap();
    let summary = run(&fx, OutputFormat::Float32).unwrap();

    let file_len = fs::metadata(fx.path("net.weights")).unwrap().len();
    assert_eq!(summary.bytes_read, file_len);
    assert_eq!(
        summary.bytes_read,
        summary.header.encoded_len() + resolved.stream_floats() as u64 * 4
    );
}

#[test]
fn trailing_data_is_not_an_error() {
    let fx = fixture(16);
    let summary = run(&fx, OutputFormat::Float32).unwrap();
    let file_len = fs::metadata(fx.path("net.weights")).unwrap().len();
    assert_eq!(summary.bytes_read, file_len - 16);
}

#[test]
fn int16_extraction_writes_q_per_layer() {
    let fx = fixture(0);
    let summary = run(&fx, OutputFormat::Int16).unwrap();

    let weights = fs::read(fx.path("weights.bin")).unwrap();
    let biases = fs::read(fx.path("bias.bin")).unwrap();
    let q = fs::read(fx.path("q.bin")).unwrap();
    assert_eq!(weights.len(), (L1_WEIGHTS + L2_WEIGHTS) * 2);
    assert_eq!(biases.len(), 12 * 2);
    assert_eq!(q.len(), 2 * 4);

    let q_values: Vec<i32> = q.chunks_exact(4).map(LittleEndian::read_i32).collect();
    let reported: Vec<i32> = summary
        .layers
        .iter()
        .map(|l| l.q.unwrap() as i32)
        .collect();
    assert_eq!(q_values, reported);
    assert!(summary.layers.iter().all(|l| !l.saturated));

    // layer 1 spans [-0.484375, 0.35] -> Q15
    assert_eq!(q_values[1], 15);
    let first_bias = LittleEndian::read_i16(&biases[8..10]);
    assert_eq!(first_bias, 0);
}

#[test]
fn truncated_weights_report_failing_layer() {
    let fx = fixture(0);
    let path = fx.path("net.weights");
    let mut bytes = fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 8);
    fs::write(&path, bytes).unwrap();

    let err = run(&fx, OutputFormat::Float32).unwrap_err();
    assert_eq!(err.layer(), Some(1));
    assert!(matches!(
        err,
        ExtractError::Stream {
            stage: Stage::ReadWeights,
            ..
        }
    ));

    // layer 0 was written before the failure and stays on disk
    let weights = read_f32s(&fx.path("weights.bin"));
    let biases = read_f32s(&fx.path("bias.bin"));
    assert_eq!(weights.len(), L1_WEIGHTS);
    assert_eq!(biases.len(), 4);
    let alpha = 1.0 / (1.0f32 + 0.000001).sqrt();
    assert!((biases[0] - (0.1 - 0.5 * alpha)).abs() < 1e-6);
}

#[test]
fn missing_cfg_is_an_open_error() {
    let dir = TempDir::new().unwrap();
    let err = parse_cfg_file(dir.path().join("absent.cfg")).unwrap_err();
    assert!(err.to_string().contains("absent.cfg"));
}
