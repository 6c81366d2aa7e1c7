use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: the build script sets this before spawning any threads.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }

    let includes = [
        PathBuf::from("proto"),
        protoc_bin_vendored::include_path()?,
    ];
    tonic_build::configure().compile_protos(&["proto/coderunner.proto"], &includes)?;

    println!("cargo:rerun-if-changed=proto/coderunner.proto");
    Ok(())
}
