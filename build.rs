fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/ffi/mod.rs");
    println!("cargo:rerun-if-changed=include/shield.h");

    #[cfg(feature = "generate-header")]
    header::generate();
}

#[cfg(feature = "generate-header")]
mod header {
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    pub fn generate() {
        let crate_dir = match env::var("CARGO_MANIFEST_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(error) => panic!("CARGO_MANIFEST_DIR missing: {error}"),
        };
        let include_dir = crate_dir.join("include");
        if let Err(error) = fs::create_dir_all(&include_dir) {
            panic!("failed to create {}: {error}", include_dir.display());
        }
        let output = include_dir.join("shield.h");

        let bindings = cbindgen::Builder::new()
            .with_crate(&crate_dir)
            .with_language(cbindgen::Language::C)
            .with_include_guard("DNS_SHIELD_H")
            .with_documentation(true)
            .with_no_includes()
            .with_sys_include("stdbool.h")
            .with_sys_include("stdint.h")
            .generate();

        match bindings {
            Ok(bindings) => {
                if bindings.write_to_file(&output) {
                    println!("cargo:warning=regenerated {}", output.display());
                }
            }
            Err(error) => panic!("cbindgen failed: {error}"),
        }
    }
}
