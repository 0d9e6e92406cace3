//! Reproduce-tarball writer: on request or on a failed link, captures every
//! input file consumed plus a response file that replays the exact
//! invocation (spec §4.2, §6 "Output formats"). Grounded on the teacher's
//! plain file-copy approach, generalized to a `tar`+`flate2` archive since
//! this core's spec calls for a single portable artifact rather than a
//! directory tree.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::Config;

/// Writes a reproduce tarball at `path` containing every file in
/// `consumed_paths` under `files/<basename>`, plus a `response.txt` replaying
/// the link with paths rewritten to the bundled copies. `compressed`
/// controls whether the tar stream is additionally gzipped (`.tar` vs
/// `.tar.gz`, per spec §6).
pub fn write_tarball(path: &Path, consumed_paths: &[PathBuf], config: &Config, compressed: bool) -> Result<()> {
    if compressed {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating reproduce tarball {}", path.display()))?;
        let gz = GzEncoder::new(file, Compression::default());
        write_archive(gz, consumed_paths, config)
    } else {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating reproduce tarball {}", path.display()))?;
        write_archive(file, consumed_paths, config)
    }
}

fn write_archive<W: Write>(writer: W, consumed_paths: &[PathBuf], config: &Config) -> Result<()> {
    let mut builder = tar::Builder::new(writer);

    let mut response = String::new();
    response.push_str("-o ");
    response.push_str(&config.output.to_string_lossy());
    response.push('\n');
    response.push_str("--entry ");
    response.push_str(&config.entry);
    response.push('\n');

    for path in consumed_paths {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let archive_name = format!("files/{basename}");
        if let Ok(mut f) = std::fs::File::open(path) {
            builder
                .append_file(&archive_name, &mut f)
                .with_context(|| format!("adding {} to reproduce tarball", path.display()))?;
        }
        response.push_str(&archive_name);
        response.push('\n');
    }

    let response_bytes = response.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(response_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "response.txt", response_bytes)
        .context("writing response file into reproduce tarball")?;

    builder.finish().context("finalizing reproduce tarball")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tarball_contains_response_file_and_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("a.o");
        std::fs::write(&input_path, b"not-a-real-object").unwrap();

        let tar_path = dir.path().join("repro.tar");
        let config = Config::default();
        write_tarball(&tar_path, &[input_path.clone()], &config, false).unwrap();

        let bytes = std::fs::read(&tar_path).unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"response.txt".to_string()));
        assert!(names.iter().any(|n| n.ends_with("a.o")));
    }

    #[test]
    fn compressed_tarball_round_trips_through_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("repro.tar.gz");
        let config = Config::default();
        write_tarball(&tar_path, &[], &config, true).unwrap();
        assert!(tar_path.exists());

        let file = std::fs::File::open(&tar_path).unwrap();
        let gz = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(gz);
        let count = archive.entries().unwrap().count();
        assert_eq!(count, 1);
    }
}
