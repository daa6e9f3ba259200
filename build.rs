use std::process::Command;

fn main() {
    // Pass the short commit id to programs to be picked up via
    // `env!("SVCFRAME_GIT_HASH")`. Building from a source tarball
    // (no git, or no repository) yields an empty string.
    let hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    println!("cargo:rustc-env=SVCFRAME_GIT_HASH={hash}");

    // Rebuild when HEAD moves (this does not see packed refs, but
    // covers the common case).
    println!("cargo::rerun-if-changed=.git/logs/HEAD");
}
