use std::env;
use std::path::PathBuf;

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo");
    let output_file = PathBuf::from(&crate_dir).join("include").join("titan.h");

    if let Some(include_dir) = output_file.parent() {
        std::fs::create_dir_all(include_dir).expect("failed to create include directory");
    }

    println!("cargo:rerun-if-changed=src/lib.rs");

    cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("TITAN_H")
        .generate()
        .expect("unable to generate titan.h bindings")
        .write_to_file(output_file);
}
