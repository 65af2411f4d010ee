//! Wires the kernel linker script into the link step for the bare-metal target.

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let script = std::path::Path::new(&manifest_dir).join("linker.ld");
    println!("cargo:rustc-link-arg-bin=kestrel=-T{}", script.display());
    println!("cargo:rerun-if-changed={}", script.display());
}
