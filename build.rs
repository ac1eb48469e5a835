fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rustc-check-cfg=cfg(stripesync_tsan_enabled)");

    let sanitizer_list = std::env::var("CARGO_CFG_SANITIZE").unwrap_or_default();
    if sanitizer_list.contains("thread") {
        println!("cargo:rustc-cfg=stripesync_tsan_enabled");
    }
}
