//! Marshaling benchmarks
//!
//! Benchmarks for the per-request conversion work:
//! - Wire tensor decode (raw_data vs float_data)
//! - Runtime tensor encode
//! - JSON request decode and route resolution

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use onnx_serving::api::json;
use onnx_serving::api::{Resolution, routes};
use onnx_serving::grpc::proto::onnx::TensorProto;
use onnx_serving::grpc::proto::onnx::tensor_proto::DataType;
use onnx_serving::tensor::{self, Tensor};
use onnx_serving::CpuAllocator;
use std::hint::black_box;

/// NCHW image input
const IMAGE_DIMS: [i64; 4] = [1, 3, 224, 224];

fn image_values() -> Vec<f32> {
    let count: i64 = IMAGE_DIMS.iter().product();
    (0..count).map(|i| (i % 255) as f32 / 255.0).collect()
}

fn typed_proto(values: &[f32]) -> TensorProto {
    TensorProto {
        dims: IMAGE_DIMS.to_vec(),
        data_type: DataType::Float as i32,
        float_data: values.to_vec(),
        ..Default::default()
    }
}

fn raw_proto(values: &[f32]) -> TensorProto {
    TensorProto {
        dims: IMAGE_DIMS.to_vec(),
        data_type: DataType::Float as i32,
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

fn bench_decode(c: &mut Criterion) {
    let values = image_values();
    let allocator = CpuAllocator::unbounded();
    let mut group = c.benchmark_group("tensor_decode");
    group.throughput(Throughput::Bytes((values.len() * 4) as u64));

    for (label, proto) in [("raw", raw_proto(&values)), ("typed", typed_proto(&values))] {
        group.bench_with_input(BenchmarkId::new("float_1x3x224x224", label), &proto, |b, proto| {
            b.iter(|| tensor::decode(black_box(proto), &allocator).unwrap())
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let values = image_values();
    let tensor = Tensor::from_f32(IMAGE_DIMS.to_vec(), &values).unwrap();
    let mut group = c.benchmark_group("tensor_encode");
    group.throughput(Throughput::Bytes((values.len() * 4) as u64));

    for use_raw in [true, false] {
        let label = if use_raw { "raw" } else { "typed" };
        group.bench_with_input(BenchmarkId::new("float_1x3x224x224", label), &use_raw, |b, &use_raw| {
            b.iter(|| tensor::encode(black_box(&tensor), use_raw))
        });
    }

    group.finish();
}

fn bench_json_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("json_request");

    for len in [16usize, 1024, 65536] {
        let values: Vec<f32> = (0..len).map(|i| i as f32 * 0.5).collect();
        let body = serde_json::to_vec(&serde_json::json!({
            "inputs": {
                "X": {
                    "dims": ["1", len.to_string()],
                    "dataType": 1,
                    "floatData": values,
                }
            },
            "outputFilter": ["Y"]
        }))
        .unwrap();

        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::new("decode_floats", len), &body, |b, body| {
            b.iter(|| json::decode_request(black_box(body)).unwrap())
        });
    }

    group.finish();
}

fn bench_route_resolution(c: &mut Criterion) {
    let routes = routes::model_routes().unwrap();
    let method = axum::http::Method::POST;

    c.bench_function("route_resolve_predict", |b| {
        b.iter(|| {
            let resolution = routes.resolve(&method, black_box("/v1/models/mnist/versions/3:predict"));
            assert!(matches!(resolution, Resolution::Matched { .. }));
        })
    });
}

criterion_group!(
    benches,
    bench_decode,
    bench_encode,
    bench_json_request,
    bench_route_resolution
);
criterion_main!(benches);
