//! Archive (`.a`) member access (C7 continued): thin and regular archives
//! via `object::read::archive`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use object::read::archive::{ArchiveFile, ArchiveKind};

use crate::pathcache::{MemoryArea, PathCache};

/// One archive member with its bytes resolved, ready to hand to
/// [`crate::reader::read_object`].
pub struct Member {
    pub name: String,
    pub data: Arc<MemoryArea>,
}

/// Reads every member out of the archive at `path`, backed by `area`'s
/// already-mapped bytes. Thin archive (`ar -T`) members store no data
/// inline; each member name is resolved relative to the archive's own
/// directory and mmap'd through `cache` like any other input (spec §6
/// "thin-archive support").
pub fn read_members(path: &Path, area: &Arc<MemoryArea>, cache: &PathCache) -> Result<Vec<Member>> {
    let data = area.data();
    let archive = ArchiveFile::parse(data).context("parsing archive header")?;
    let is_thin = archive.kind() == ArchiveKind::Thin;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut members = Vec::new();
    for member in archive.members() {
        let member = member.context("reading archive member header")?;
        let name = String::from_utf8_lossy(member.name()).into_owned();
        if name.is_empty() {
            // Symbol-table / string-table pseudo-members have no name and
            // carry no object data for us to read.
            continue;
        }
        let member_data = if is_thin {
            let member_path = base_dir.join(&name);
            cache
                .get(&member_path)
                .with_context(|| format!("resolving thin archive member {name}"))?
        } else {
            let bytes = member
                .data(data)
                .with_context(|| format!("reading archive member {name}"))?;
            Arc::new(MemoryArea::Owned(bytes.to_vec()))
        };
        members.push(Member {
            name,
            data: member_data,
        });
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Builds a minimal GNU `ar` archive with one member so the member
    /// walker can be exercised without a real `.a` fixture on disk.
    fn build_test_archive(member_name: &str, member_body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"!<arch>\n");
        let mut header = Vec::new();
        write!(header, "{member_name:<16}").unwrap();
        write!(header, "{:<12}", 0).unwrap(); // mtime
        write!(header, "{:<6}", 0).unwrap(); // uid
        write!(header, "{:<6}", 0).unwrap(); // gid
        write!(header, "{:<8}", "100644").unwrap(); // mode
        write!(header, "{:<10}", member_body.len()).unwrap(); // size
        header.extend_from_slice(b"`\n");
        out.extend_from_slice(&header);
        out.extend_from_slice(member_body);
        if member_body.len() % 2 == 1 {
            out.push(b'\n');
        }
        out
    }

    #[test]
    fn reads_a_single_member_regular_archive() {
        let bytes = build_test_archive("hello.o", b"not-a-real-elf-but-nonempty");
        let area: Arc<MemoryArea> = Arc::new(MemoryArea::Owned(bytes));
        let cache = PathCache::new(None);
        let members = read_members(Path::new("libtest.a"), &area, &cache).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "hello.o");
        assert_eq!(members[0].data.data(), b"not-a-real-elf-but-nonempty");
    }
}
