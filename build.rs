//! Build-time metadata for `arcdeck --version` and the startup banner.
//!
//! Release pipelines inject ARCDECK_VERSION / ARCDECK_GIT_SHA; developer
//! builds fall back to the cargo package version and the local git head,
//! or "unreleased" outside a checkout.

use std::process::Command;

fn main() {
    for key in ["ARCDECK_VERSION", "ARCDECK_GIT_SHA"] {
        println!("cargo:rerun-if-env-changed={}", key);
    }

    let version = std::env::var("ARCDECK_VERSION")
        .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());
    let revision = std::env::var("ARCDECK_GIT_SHA").unwrap_or_else(|_| local_git_head());

    println!("cargo:rustc-env=ARCDECK_VERSION={}", version);
    println!("cargo:rustc-env=ARCDECK_GIT_SHA={}", revision);
}

fn local_git_head() -> String {
    let head = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output();
    match head {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        _ => "unreleased".into(),
    }
}
