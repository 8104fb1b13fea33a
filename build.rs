//! Generate CSI message types from `proto/csi.proto`

use std::env;
use std::fs;
use std::path::Path;

/// The proto file of CSI messages and services
const CSI_PROTO: &str = "proto/csi.proto";
/// The directory to resolve proto imports
const PROTO_INCLUDE_DIR: &str = "proto";

fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-changed={}", PROTO_INCLUDE_DIR);

    let out_dir = env::var("OUT_DIR")?;
    protobuf_codegen_pure::Codegen::new()
        .out_dir(&out_dir)
        .include(PROTO_INCLUDE_DIR)
        .input(CSI_PROTO)
        .run()?;

    // `include!` rejects inner attributes and inner doc comments,
    // src/csi.rs carries its own allow list instead
    let generated = Path::new(&out_dir).join("csi.rs");
    let content = fs::read_to_string(&generated)?;
    let stripped = content
        .lines()
        .filter(|line| !line.starts_with("#![") && !line.starts_with("//!"))
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(&generated, stripped)?;
    Ok(())
}
