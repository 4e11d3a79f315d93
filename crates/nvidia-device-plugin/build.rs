fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the bundled protoc when the host does not provide one
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true) // Clients are used by the integration tests
        .compile_protos(
            &[
                "proto/deviceplugin/v1alpha/api.proto",
                "proto/pluginregistration/v1beta/api.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
