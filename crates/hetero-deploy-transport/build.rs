use std::io::Result;

fn main() -> Result<()> {
    tonic_build::configure()
        .type_attribute(".", "#[allow(clippy::large_enum_variant)]")
        .compile_protos(&["../../proto/hetero_deploy.proto"], &["../../proto/"])?;

    println!("cargo:rerun-if-changed=../../proto/hetero_deploy.proto");

    Ok(())
}
