use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=proto/bep.proto");

    let out_dir = match env::var("OUT_DIR") {
        Ok(v) => PathBuf::from(v),
        Err(e) => {
            println!("cargo:warning=OUT_DIR not set: {}; skipping protobuf codegen", e);
            return;
        }
    };

    if let Err(e) = prost_build::Config::new()
        .out_dir(&out_dir)
        .compile_protos(&["proto/bep.proto"], &["proto"])
    {
        println!(
            "cargo:warning=Failed to compile proto/bep.proto: {}. Wire types will be unavailable.",
            e
        );
    }
}
