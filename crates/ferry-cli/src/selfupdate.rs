//! Replace the running binary with the latest release asset.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::info;

const DEFAULT_RELEASE_URL: &str =
    "https://github.com/ferry-backup/ferry/releases/latest/download/ferry-linux-amd64";

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let url = std::env::var("FERRY_UPDATE_URL").unwrap_or_else(|_| DEFAULT_RELEASE_URL.into());
    let current = std::env::current_exe()?;

    info!(url, "downloading release binary");
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?;
    let response = client.get(&url).send()?;
    if !response.status().is_success() {
        return Err(format!("HTTP {} fetching {url}", response.status()).into());
    }
    let bytes = response.bytes()?;

    // Stage next to the target so the final rename stays on one filesystem.
    let staged = current.with_extension("update");
    std::fs::write(&staged, &bytes)?;
    std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))?;

    install(&staged, &current)?;
    info!(path = %current.display(), "binary updated");
    Ok(())
}

fn install(staged: &Path, current: &Path) -> std::io::Result<()> {
    match std::fs::rename(staged, current) {
        Ok(()) => Ok(()),
        Err(_) => {
            // rename can fail across mounts; fall back to copy + remove.
            std::fs::copy(staged, current)?;
            std::fs::remove_file(staged)
        }
    }
}
