#[must_use]
fn is_debug() -> bool {
    match std::env::var("PROFILE").as_deref() {
        Ok("release" | "bench") => false,
        Ok("debug") | Err(_) => true,
        Ok(other) => panic!("unknown profile {other:?}"),
    }
}

fn main() {
    println!("cargo:rustc-check-cfg=cfg(diagnostics)");
    if is_debug() {
        // enables duplicate residency tracking by default
        println!("cargo:rustc-cfg=diagnostics");
    }
}
