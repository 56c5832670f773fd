use std::env;
use std::path::PathBuf;

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let out_dir = PathBuf::from(&crate_dir).join("include");

    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    std::fs::create_dir_all(&out_dir).ok();

    // Header for the host runtime and the engine vtable it registers
    let config = cbindgen::Config::from_file("cbindgen.toml")
        .unwrap_or_default();

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(out_dir.join("geospoof_tunnel.h"));
        }
        Err(e) => println!("cargo:warning=Unable to generate C bindings: {}", e),
    }
}
