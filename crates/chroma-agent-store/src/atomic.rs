//! Owner-only atomic file replacement.

use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Write `contents` to `path` by writing a sibling temp file and renaming it
/// over the target. The file is created with mode 0600.
pub(crate) fn write_owner_only(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;

    let mut tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
    restrict(&tmp)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn restrict(tmp: &NamedTempFile) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict(_tmp: &NamedTempFile) -> io::Result<()> {
    Ok(())
}
