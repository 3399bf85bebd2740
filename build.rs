use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct ShaderStage {
    entry_point: &'static str,
    profile: &'static str,
    cso_name: &'static str,
    env_name: &'static str,
    cfg_name: &'static str,
}

const SCALE_STAGES: [ShaderStage; 2] = [
    ShaderStage {
        entry_point: "vs_main",
        profile: "vs_4_0",
        cso_name: "scale_vs.cso",
        env_name: "SCALE_VS_CSO_PATH",
        cfg_name: "has_precompiled_scale_vs",
    },
    ShaderStage {
        entry_point: "ps_main",
        profile: "ps_4_0",
        cso_name: "scale_ps.cso",
        env_name: "SCALE_PS_CSO_PATH",
        cfg_name: "has_precompiled_scale_ps",
    },
];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/platform/windows/scale_quad.hlsl");
    for stage in &SCALE_STAGES {
        println!("cargo:rustc-check-cfg=cfg({})", stage.cfg_name);
    }
    println!("cargo:rerun-if-env-changed=SNOW_BRIDGE_FXC_PATH");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "windows" {
        return;
    }

    let Ok(out_dir) = env::var("OUT_DIR").map(PathBuf::from) else {
        return;
    };
    let hlsl_path = PathBuf::from("src/platform/windows/scale_quad.hlsl");

    if !hlsl_path.exists() {
        return;
    }

    // SNOW_BRIDGE_PRECOMPILE_SHADER=0 disables build-time fxc compilation.
    println!("cargo:rerun-if-env-changed=SNOW_BRIDGE_PRECOMPILE_SHADER");
    let precompile_enabled = env::var("SNOW_BRIDGE_PRECOMPILE_SHADER").map_or(true, |value| {
        !matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        )
    });
    if !precompile_enabled {
        println!("cargo:warning=shader precompilation disabled; using runtime D3DCompile");
        return;
    }

    for stage in &SCALE_STAGES {
        let cso_path = out_dir.join(stage.cso_name);
        match compile_with_fxc(&hlsl_path, &cso_path, stage.entry_point, stage.profile) {
            Ok(()) => {
                // gpu.rs include_bytes! the result when the cfg is set.
                println!("cargo:rustc-env={}={}", stage.env_name, cso_path.display());
                println!("cargo:rustc-cfg={}", stage.cfg_name);
            }
            Err(detail) => {
                println!(
                    "cargo:warning={} not precompiled ({detail}); using runtime D3DCompile",
                    stage.entry_point
                );
            }
        }
    }
}

/// Runs each fxc candidate in turn until one produces `cso_path`.
fn compile_with_fxc(
    hlsl_path: &Path,
    cso_path: &Path,
    entry_point: &str,
    profile: &str,
) -> Result<(), String> {
    let mut failures = Vec::new();
    for fxc in fxc_candidates() {
        let result = Command::new(&fxc)
            .args(["/nologo", "/T", profile, "/E", entry_point, "/O3", "/Fo"])
            .arg(cso_path)
            .arg(hlsl_path)
            .output();
        match result {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                failures.push(format!("{}: {}", fxc.display(), first_diagnostic(&output)));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => failures.push(format!("{}: {err}", fxc.display())),
        }
    }

    if failures.is_empty() {
        Err("fxc.exe not found; set SNOW_BRIDGE_FXC_PATH".to_string())
    } else {
        Err(failures.join(" | "))
    }
}

fn first_diagnostic(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    stderr
        .lines()
        .chain(stdout.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map_or_else(|| format!("{}", output.status), str::to_string)
}

/// The override, then `PATH`, then installed Windows 10 SDKs newest first.
fn fxc_candidates() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = env::var_os("SNOW_BRIDGE_FXC_PATH")
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .into_iter()
        .collect();
    candidates.push(PathBuf::from("fxc.exe"));

    let Some(program_files) = env::var_os("ProgramFiles(x86)") else {
        return candidates;
    };
    let sdk_bin = Path::new(&program_files)
        .join("Windows Kits")
        .join("10")
        .join("bin");
    if let Ok(entries) = fs::read_dir(sdk_bin) {
        let mut installed: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path().join("x64").join("fxc.exe"))
            .filter(|fxc| fxc.is_file())
            .collect();
        installed.sort_unstable_by(|a, b| b.cmp(a));
        candidates.extend(installed);
    }
    candidates
}
