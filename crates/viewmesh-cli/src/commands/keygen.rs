//! Signing key generation

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;
use viewmesh_core::{Ed25519SigningIdentity, SigningIdentity};

/// Write a fresh hex-encoded Ed25519 secret key to `out`
pub fn run(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists (pass --force to overwrite)", out.display());
    }
    if let Some(dir) = out.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let key = Ed25519SigningIdentity::generate();
    write_secret(out, format!("{}\n", key.to_hex()).as_bytes())
        .with_context(|| format!("writing {}", out.display()))?;

    info!(path = %out.display(), "signing key written");
    println!("identity: {}", hex::encode(key.serialize()?));
    Ok(())
}

/// Write `bytes` to a file only its owner can read
#[cfg(unix)]
fn write_secret(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies to newly created files
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_secret(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
