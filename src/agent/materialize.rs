//! Ensemble materialisation: turning the tarball blob into an extracted,
//! runnable directory tree on local disk (§4.5, §6).

use std::fs;
use std::io::Read;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::{JoshuaError, JoshuaResult};

/// An EID never contains `/` in practice, but it still ends up as a
/// directory name, so this sanitises it defensively (§6).
pub fn sanitise_eid(eid: &str) -> String {
    eid.replace('/', "-")
}

/// Materialise `tarball` under `work_dir/ensembles/<sanitised EID>`,
/// returning the finished root. If the directory already exists (a prior
/// run, or a concurrent thread beat us to it), it's reused as-is.
pub fn materialise(work_dir: &Path, eid: &str, tarball: &[u8]) -> JoshuaResult<PathBuf> {
    let ensembles_dir = work_dir.join("ensembles");
    fs::create_dir_all(&ensembles_dir)?;
    let final_dir = ensembles_dir.join(sanitise_eid(eid));
    if final_dir.exists() {
        return Ok(final_dir);
    }

    let part_dir = ensembles_dir.join(format!("{}.part", sanitise_eid(eid)));
    if part_dir.exists() {
        fs::remove_dir_all(&part_dir)?;
    }
    fs::create_dir_all(&part_dir)?;

    extract_tarball(tarball, &part_dir)?;

    let global_data = work_dir.join("global_data");
    fs::create_dir_all(&global_data)?;
    let symlink_path = part_dir.join("global_data");
    if !symlink_path.exists() {
        unix_fs::symlink(&global_data, &symlink_path)
            .map_err(|e| JoshuaError::Tarball(format!("failed to link global_data: {e}")))?;
    }
    fs::create_dir_all(part_dir.join("tmp"))?;

    fs::rename(&part_dir, &final_dir)?;
    Ok(final_dir)
}

/// Extract a gzipped tar archive, rejecting any entry whose normalised
/// path starts with `/` or `..` (§6 "Tarball contract").
fn extract_tarball(tarball: &[u8], dest: &Path) -> JoshuaResult<()> {
    let decoder = GzDecoder::new(tarball);
    let mut archive = Archive::new(decoder);
    for entry in archive
        .entries()
        .map_err(|e| JoshuaError::Tarball(format!("failed to read tar entries: {e}")))?
    {
        let mut entry = entry.map_err(|e| JoshuaError::Tarball(format!("malformed tar entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| JoshuaError::Tarball(format!("invalid entry path: {e}")))?
            .into_owned();
        reject_unsafe_path(&path)?;
        entry
            .unpack_in(dest)
            .map_err(|e| JoshuaError::Tarball(format!("failed to unpack {}: {e}", path.display())))?;
    }
    if !dest.join("joshua_test").exists() {
        return Err(JoshuaError::Tarball(
            "tarball is missing mandatory joshua_test entry point".to_string(),
        ));
    }
    Ok(())
}

fn reject_unsafe_path(path: &Path) -> JoshuaResult<()> {
    if path.is_absolute() {
        return Err(JoshuaError::Tarball(format!(
            "refusing absolute tar entry path: {}",
            path.display()
        )));
    }
    if path.components().any(|c| c == std::path::Component::ParentDir) {
        return Err(JoshuaError::Tarball(format!(
            "refusing tar entry path containing '..': {}",
            path.display()
        )));
    }
    Ok(())
}

/// Garbage-collect local ensemble directories not in `active ∪ sanity`
/// (§4.5, main loop step 4).
pub fn gc_stale_ensembles(work_dir: &Path, live_eids: &std::collections::HashSet<String>) -> JoshuaResult<()> {
    let ensembles_dir = work_dir.join("ensembles");
    if !ensembles_dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&ensembles_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let name = name.strip_suffix(".part").unwrap_or(&name).to_string();
        if !live_eids.iter().any(|eid| sanitise_eid(eid) == name) {
            tracing::debug!(dir = %entry.path().display(), "garbage-collecting local ensemble directory");
            let _ = fs::remove_dir_all(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn materialise_extracts_joshua_test_and_injects_global_data_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = make_tarball(&[("joshua_test", b"#!/bin/sh\nexit 0\n")]);
        let root = materialise(tmp.path(), "20260101-000000-alice-deadbeef", &tarball).unwrap();

        assert!(root.join("joshua_test").exists());
        assert!(root.join("global_data").exists());
        assert!(root.join("tmp").is_dir());
    }

    #[test]
    fn materialise_reuses_an_existing_final_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = make_tarball(&[("joshua_test", b"x")]);
        let eid = "20260101-000000-alice-deadbeef";
        let first = materialise(tmp.path(), eid, &tarball).unwrap();
        fs::write(first.join("marker"), b"keep me").unwrap();

        let second = materialise(tmp.path(), eid, &tarball).unwrap();
        assert_eq!(first, second);
        assert!(second.join("marker").exists());
    }

    #[test]
    fn extraction_rejects_absolute_and_parent_escaping_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = make_tarball(&[("joshua_test", b"x"), ("../escape", b"evil")]);
        let err = materialise(tmp.path(), "20260101-000000-eve-deadbeef", &tarball).unwrap_err();
        assert!(matches!(err, JoshuaError::Tarball(_)));
    }

    #[test]
    fn materialise_fails_without_mandatory_joshua_test_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = make_tarball(&[("readme.txt", b"hi")]);
        let err = materialise(tmp.path(), "20260101-000000-eve-deadbeef", &tarball).unwrap_err();
        assert!(matches!(err, JoshuaError::Tarball(_)));
    }

    #[test]
    fn gc_removes_directories_not_in_the_live_set() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = make_tarball(&[("joshua_test", b"x")]);
        let live_eid = "20260101-000000-alice-aaaaaaaa";
        let dead_eid = "20260101-000000-bob-bbbbbbbb";
        materialise(tmp.path(), live_eid, &tarball).unwrap();
        materialise(tmp.path(), dead_eid, &tarball).unwrap();

        let mut live = std::collections::HashSet::new();
        live.insert(live_eid.to_string());
        gc_stale_ensembles(tmp.path(), &live).unwrap();

        assert!(tmp.path().join("ensembles").join(sanitise_eid(live_eid)).exists());
        assert!(!tmp.path().join("ensembles").join(sanitise_eid(dead_eid)).exists());
    }
}
