// build.rs
// Compiles the demo's GLSL shaders to SPIR-V with glslc

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const STAGES: [&str; 2] = ["vert", "frag"];

fn compile_shader(glslc: &str, path: &Path, target_dir: &Path) -> bool {
    let Some(file_name) = path.file_name() else {
        return false;
    };
    // voxel.vert -> voxel.vert.spv
    let out_file = target_dir.join(format!("{}.spv", file_name.to_string_lossy()));

    let needs_compile = match (std::fs::metadata(path), std::fs::metadata(&out_file)) {
        (Ok(src), Ok(dst)) => match (src.modified(), dst.modified()) {
            (Ok(src_time), Ok(dst_time)) => src_time > dst_time,
            _ => true,
        },
        _ => true,
    };
    if !needs_compile {
        eprintln!("info: Shader {:?} is up to date", file_name);
        return false;
    }

    let status = Command::new(glslc).arg(path).arg("-o").arg(&out_file).status();
    match status {
        Ok(s) if s.success() => {
            eprintln!("info: Compiled {:?} -> {:?}", file_name, out_file);
            true
        }
        Ok(s) => {
            eprintln!("error: glslc failed for {:?} with exit code: {}", path, s.code().unwrap_or(-1));
            panic!("Shader compilation failed");
        }
        Err(e) => {
            eprintln!("error: Failed to run glslc for {:?}: {}", path, e);
            panic!("Failed to execute shader compiler");
        }
    }
}

fn main() {
    println!("cargo:rerun-if-changed=resources/shaders");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var("SKIP_SHADERS").is_ok() {
        eprintln!("info: Skipping shader compilation (SKIP_SHADERS set)");
        return;
    }

    let Ok(vulkan_sdk) = env::var("VULKAN_SDK") else {
        eprintln!("warning: VULKAN_SDK not set, shader compilation skipped");
        eprintln!("hint: Install Vulkan SDK and set VULKAN_SDK environment variable");
        return;
    };
    let glslc = if cfg!(target_os = "windows") {
        format!("{}\\Bin\\glslc.exe", vulkan_sdk)
    } else {
        format!("{}/bin/glslc", vulkan_sdk)
    };
    if !Path::new(&glslc).exists() {
        eprintln!("error: glslc not found at: {}", glslc);
        panic!("Shader compiler not found");
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()));
    let shader_dir = manifest_dir.join("resources/shaders");
    let target_dir = manifest_dir.join("../target/shaders");
    if let Err(e) = std::fs::create_dir_all(&target_dir) {
        eprintln!("warning: Failed to create target directory: {}", e);
        return;
    }

    let Ok(entries) = std::fs::read_dir(&shader_dir) else {
        eprintln!("info: No shader directory found at: {:?}", shader_dir);
        return;
    };
    let compiled = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map_or(false, |ext| STAGES.iter().any(|stage| ext == *stage))
        })
        .filter(|path| compile_shader(&glslc, path, &target_dir))
        .count();

    if compiled > 0 {
        eprintln!("info: Successfully compiled {} shader(s)", compiled);
    } else {
        eprintln!("info: All shaders are up to date");
    }
}
