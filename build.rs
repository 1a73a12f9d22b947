fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::env;
    use std::path::PathBuf;

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    // Descriptor set is served through gRPC reflection
    tonic_prost_build::configure()
        .file_descriptor_set_path(out_dir.join("descriptor.bin"))
        .compile_protos(
            &["proto/onnx/onnx-ml.proto", "proto/serving/v1/predict.proto"],
            &["proto"],
        )?;

    Ok(())
}
