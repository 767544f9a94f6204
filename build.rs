use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CUDA_PATH");
    println!("cargo:rerun-if-env-changed=TRT_SHIM_DIR");

    // Only the TensorRT backend needs native libraries
    if env::var_os("CARGO_FEATURE_TENSORRT").is_none() {
        return;
    }

    // Look for the TensorRT shim in the project root unless told otherwise
    let shim_dir = env::var("TRT_SHIM_DIR").unwrap_or_else(|_| ".".to_string());
    println!("cargo:rustc-link-search=native={}", shim_dir);

    let cuda_path = env::var("CUDA_PATH").unwrap_or_else(|_| "/usr/local/cuda".to_string());
    println!("cargo:rustc-link-search=native={}/lib64", cuda_path);

    println!("cargo:rustc-link-lib=trt_shim");
    println!("cargo:rustc-link-lib=nvinfer");
    println!("cargo:rustc-link-lib=cudart");

    // Rerun if the shim changes
    println!("cargo:rerun-if-changed={}/libtrt_shim.so", shim_dir);
    println!("cargo:rerun-if-changed={}/libtrt_shim.a", shim_dir);
}
