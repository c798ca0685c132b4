//! OVA archive member resolution
//!
//! An OVA package is a plain tar archive; a disk member is addressed by
//! the byte offset and size of its data inside the archive file. Archives
//! are read-only sources: members can be uploaded or checksummed but
//! never written.

use crate::error::{Error, Result};
use std::fs::File;
use std::path::Path;
use tar::Archive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberInfo {
    /// Offset of the member's data within the archive file.
    pub offset: u64,
    /// Size of the member's data in bytes.
    pub size: u64,
}

/// Look up `member` in the tar index of `archive`.
pub fn resolve(archive: &Path, member: &str) -> Result<MemberInfo> {
    let file = File::open(archive).map_err(|source| Error::SourceUnavailable {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut tar = Archive::new(file);
    for entry in tar.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        if path.as_os_str() == member {
            return Ok(MemberInfo {
                offset: entry.raw_file_position(),
                size: entry.size(),
            });
        }
    }
    Err(Error::MemberNotFound {
        member: member.to_string(),
        archive: archive.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tar::{Builder, Header};

    const BLOCK: u64 = 512;

    fn pad(n: u64) -> u64 {
        n.div_ceil(BLOCK) * BLOCK
    }

    fn build_archive(dir: &Path, members: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.join("test.ova");
        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(file);
        for (name, data) in members {
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().flush().unwrap();
        path
    }

    #[test]
    fn resolves_member_offset_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let ovf = b"<xml/>".as_slice();
        let disk = vec![7u8; 3000];
        let ova = build_archive(dir.path(), &[("vm.ovf", ovf), ("disk.img", &disk)]);

        // First member's data starts right after its 512-byte header; the
        // second follows the first member's padded data plus its header.
        let first = resolve(&ova, "vm.ovf").unwrap();
        assert_eq!(first.offset, BLOCK);
        assert_eq!(first.size, ovf.len() as u64);

        let second = resolve(&ova, "disk.img").unwrap();
        assert_eq!(second.offset, BLOCK + pad(ovf.len() as u64) + BLOCK);
        assert_eq!(second.size, disk.len() as u64);
    }

    #[test]
    fn window_reads_member_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let disk = (0u16..1024).map(|i| (i % 251) as u8).collect::<Vec<u8>>();
        let ova = build_archive(dir.path(), &[("disk.img", &disk)]);

        let info = resolve(&ova, "disk.img").unwrap();
        let raw = std::fs::read(&ova).unwrap();
        assert_eq!(
            &raw[info.offset as usize..(info.offset + info.size) as usize],
            &disk[..]
        );
    }

    #[test]
    fn missing_member_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ova = build_archive(dir.path(), &[("vm.ovf", b"<xml/>")]);
        match resolve(&ova, "missing.img") {
            Err(Error::MemberNotFound { member, .. }) => assert_eq!(member, "missing.img"),
            other => panic!("expected MemberNotFound, got {other:?}"),
        }
    }
}
