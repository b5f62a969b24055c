fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/network/messages")
        .compile_protos(
            &["src/network/messages/tapestry.proto"],
            &["src/network/messages/"],
        )?;
    Ok(())
}
