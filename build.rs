/// Build flow:
///
/// - Without the `ibverbs` feature, nothing is linked.
/// - Otherwise, probe `libibverbs` with `pkg-config` and generate bindings
///   from `src/bindings/verbs.h`.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    #[cfg(feature = "ibverbs")]
    link_ibverbs();
}

#[cfg(feature = "ibverbs")]
fn link_ibverbs() {
    use std::env;

    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rcverbs` only supports 64-bit platforms with the `ibverbs` feature");
    }

    println!("cargo:rerun-if-changed=src/bindings/verbs.h");
    println!("cargo:rerun-if-env-changed=IBVERBS_INCLUDE_DIR");

    let mut include_dirs = env::var("IBVERBS_INCLUDE_DIR")
        .map(|dir| vec![dir])
        .unwrap_or_default();
    match pkg_config::Config::new()
        .atleast_version("1.8.28")
        .statik(false)
        .probe("libibverbs")
    {
        Ok(lib) => include_dirs.extend(
            lib.include_paths
                .iter()
                .filter_map(|p| p.to_str().map(str::to_owned)),
        ),
        Err(e) => {
            // Fall back to the default search paths.
            println!("cargo:warning=pkg-config cannot find libibverbs ({}), linking -libverbs", e);
            println!("cargo:rustc-link-lib=ibverbs");
        }
    }
    gen_verb_bindings(include_dirs);
}

#[cfg(feature = "ibverbs")]
fn gen_verb_bindings(include_dirs: Vec<String>) {
    use std::env;
    use std::path::Path;

    let include_args = include_dirs.iter().map(|p| format!("-I{}", p));
    let bindings = bindgen::builder()
        .clang_args(include_args)
        .header("src/bindings/verbs.h")
        .allowlist_function("ibv_.*")
        .allowlist_type("ibv_.*")
        .allowlist_type("_compat_ibv_port_attr")
        .opaque_type("pthread_.*")
        .blocklist_type("in6_addr")
        .blocklist_type("sockaddr.*")
        .blocklist_type("timespec")
        .default_enum_style(bindgen::EnumVariation::Consts)
        .derive_copy(true)
        .derive_debug(false)
        .derive_default(true)
        .generate_comments(false)
        .layout_tests(false)
        .prepend_enum_name(false)
        .size_t_is_usize(true)
        .generate()
        .expect("failed to generate bindings");

    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR not set");
    let dest = Path::new(&out_dir).join("verbs_bindings.rs");
    bindings
        .write_to_file(dest)
        .expect("failed to write bindings");
}
