fn main() -> Result<(), Box<dyn std::error::Error>> {
    let files = &["proto/hostnic.proto"];
    let dirs = &["proto"];

    let mut config = prost_build::Config::new();
    config.protoc_executable(protoc_bin_vendored::protoc_bin_path()?);

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos_with_config(config, files, dirs)?;

    // recompile protobufs only if any of the proto files changes.
    for file in files {
        println!("cargo:rerun-if-changed={}", file);
    }

    Ok(())
}
