// SPDX-License-Identifier: CEPL-1.0
use std::{env, fs, path::PathBuf};

// Compiles the built-in triangle shaders. The renderer prefers SPIR-V found
// in its shader directory and falls back to these.
fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
    let src = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR")).join("shaders");

    let comp = shaderc::Compiler::new().expect("shaderc compiler");
    let mut opts = shaderc::CompileOptions::new().expect("shaderc options");
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for (file, kind, out_name) in [
        ("triangle.vert", shaderc::ShaderKind::Vertex, "vert.spv"),
        ("triangle.frag", shaderc::ShaderKind::Fragment, "frag.spv"),
    ] {
        let path = src.join(file);
        println!("cargo:rerun-if-changed={}", path.display());

        let glsl = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
        let spv = comp
            .compile_into_spirv(&glsl, kind, file, "main", Some(&opts))
            .unwrap_or_else(|e| panic!("compile {file}: {e}"));
        fs::write(out.join(out_name), spv.as_binary_u8()).expect("write spv");
    }

    println!("cargo:rerun-if-changed=build.rs");
}
