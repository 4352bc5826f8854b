//! Compile time configurations for the util crate
fn main() {
    // BEACON_PKG_NAME names the folders created under `~/.config` and
    // `~/.local/state`. Changing it orphans any previously persisted queue
    // and configuration documents.
    println!("cargo::rustc-env=BEACON_PKG_NAME=beacon");
}
