fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().build_client(true).build_server(false).compile_protos(
        &["proto/runtime_image.proto", "proto/runtime_snapshot.proto"],
        &["proto"],
    )?;

    tonic_build::configure().build_client(false).build_server(true).compile_protos(
        &["proto/csi_node.proto"],
        &["proto"],
    )?;

    Ok(())
}
