//! Transfer entry points
//!
//! upload / download / info / measure / checksum, as exposed by the CLI
//! and usable programmatically. Each transfer call owns one session: the
//! backend is negotiated once, a work plan is built from the source's
//! allocation map, and a fixed pool of connections executes it.

use crate::backend::Backend;
use crate::checksum::{checksum_reader, Algorithm};
use crate::error::Result;
use crate::extent::Extent;
use crate::logger::{Logger, NoopLogger};
use crate::ova;
use crate::plan::{plan, Action, PlanOptions};
use crate::progress::{Progress, ProgressSink};
use crate::qemu;
use crate::scheduler::{run_items, CHUNK_SIZE};
use crate::source::{FileSource, LogicalReader};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Default pool width: one connection per core, capped where more
/// connections stop helping the wire.
pub fn default_connections() -> u32 {
    num_cpus::get().clamp(1, 4) as u32
}

pub struct UploadOptions {
    pub proxy_url: Option<String>,
    pub member: Option<String>,
    pub backing_chain: bool,
    pub sparse: bool,
    pub connections: u32,
    pub progress: Option<Box<dyn ProgressSink>>,
    pub logger: Option<Arc<dyn Logger>>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            proxy_url: None,
            member: None,
            backing_chain: true,
            sparse: true,
            connections: default_connections(),
            progress: None,
            logger: None,
        }
    }
}

pub struct DownloadOptions {
    pub fmt: String,
    pub proxy_url: Option<String>,
    pub connections: u32,
    pub progress: Option<Box<dyn ProgressSink>>,
    pub logger: Option<Arc<dyn Logger>>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            fmt: qemu::FORMAT_RAW.to_string(),
            proxy_url: None,
            connections: default_connections(),
            progress: None,
            logger: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageDetails {
    pub format: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "member-offset", skip_serializing_if = "Option::is_none")]
    pub member_offset: Option<u64>,
    #[serde(rename = "member-size", skip_serializing_if = "Option::is_none")]
    pub member_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MeasureDetails {
    pub required: u64,
    #[serde(rename = "fully-allocated")]
    pub fully_allocated: u64,
    #[serde(rename = "member-offset", skip_serializing_if = "Option::is_none")]
    pub member_offset: Option<u64>,
    #[serde(rename = "member-size", skip_serializing_if = "Option::is_none")]
    pub member_size: Option<u64>,
}

/// Upload a local image (or archive member) to the transfer endpoint.
pub fn upload(
    src: &Path,
    transfer_url: &str,
    ca_file: Option<&Path>,
    opts: UploadOptions,
) -> Result<()> {
    let window = resolve_member(src, opts.member.as_deref())?;
    let source = open_source(src, window, opts.backing_chain)?;
    let size = source.size();

    let progress = Progress::new(opts.progress);
    progress.set_size(size);
    progress.set_phase("uploading image");
    let logger = opts.logger.unwrap_or_else(|| Arc::new(NoopLogger));

    let backend = Backend::negotiate(transfer_url, opts.proxy_url.as_deref(), ca_file)?;
    logger.session_start("upload", transfer_url, size, opts.connections);
    let started = Instant::now();

    // A server without the zero feature gets every byte on the wire.
    let sparse = opts.sparse && backend.options().can_zero();
    let extents = source.extents(0, size)?;
    let items = plan(
        extents,
        &PlanOptions {
            sparse,
            backing_chain: opts.backing_chain,
            ..Default::default()
        },
    );

    let reader: &dyn LogicalReader = source.as_ref();
    run_items(
        items,
        opts.connections as usize,
        || backend.connect(),
        |conn, item| {
            match item.action {
                Action::CopyData => {
                    let mut buf = vec![0u8; CHUNK_SIZE.min(item.length as usize)];
                    let mut pos = item.offset;
                    let end = item.offset + item.length;
                    while pos < end {
                        let n = ((end - pos) as usize).min(buf.len());
                        reader.read_at(&mut buf[..n], pos)?;
                        conn.put(pos, &buf[..n])?;
                        pos += n as u64;
                    }
                }
                Action::WriteZero => {
                    conn.zero(item.offset, item.length)?;
                }
            }
            Ok(())
        },
        &progress,
        logger.as_ref(),
    )?;

    if backend.options().can_flush() {
        backend.connect()?.flush()?;
    }

    progress.set_phase("upload completed");
    progress.finish();
    logger.session_done(progress.transferred(), started.elapsed().as_secs_f64());
    Ok(())
}

/// Download the endpoint's image into a local file, converting to the
/// requested format when it is not raw.
pub fn download(
    transfer_url: &str,
    dst: &Path,
    ca_file: Option<&Path>,
    opts: DownloadOptions,
) -> Result<()> {
    let backend = Backend::negotiate(transfer_url, opts.proxy_url.as_deref(), ca_file)?;

    // The remote does not expose its size directly; derive it from the
    // last extent like the rest of the tooling does.
    let extents = backend.connect()?.get_extents()?;
    let size = extents.last().map(Extent::end).unwrap_or(0);

    let progress = Progress::new(opts.progress);
    progress.set_size(size);
    progress.set_phase("downloading image");
    let logger = opts.logger.unwrap_or_else(|| Arc::new(NoopLogger));
    logger.session_start("download", transfer_url, size, opts.connections);
    let started = Instant::now();

    let raw_dst = if opts.fmt == qemu::FORMAT_RAW {
        dst.to_path_buf()
    } else {
        // Download raw to a scratch file next to the destination, then
        // let qemu-img produce the requested format.
        dst.with_extension("diskferry.tmp")
    };

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&raw_dst)?;
    file.set_len(size)?;

    let items = plan(extents, &PlanOptions::default());
    run_items(
        items,
        opts.connections as usize,
        || backend.connect(),
        |conn, item| {
            match item.action {
                Action::CopyData => {
                    let mut buf = vec![0u8; CHUNK_SIZE.min(item.length as usize)];
                    let mut pos = item.offset;
                    let end = item.offset + item.length;
                    while pos < end {
                        let n = ((end - pos) as usize).min(buf.len());
                        conn.get_range(pos, &mut buf[..n])?;
                        write_at(&file, &buf[..n], pos)?;
                        pos += n as u64;
                    }
                }
                // The destination was truncated to size: holes are
                // already zero.
                Action::WriteZero => {}
            }
            Ok(())
        },
        &progress,
        logger.as_ref(),
    )?;

    file.sync_all()?;
    drop(file);

    if raw_dst != dst {
        let result = qemu::convert(&raw_dst, dst, qemu::FORMAT_RAW, &opts.fmt);
        let _ = std::fs::remove_file(&raw_dst);
        result?;
    }

    progress.set_phase("download completed");
    progress.finish();
    logger.session_done(progress.transferred(), started.elapsed().as_secs_f64());
    Ok(())
}

/// Inspect an image (or archive member) without any network transfer.
pub fn info(image: &Path, member: Option<&str>) -> Result<ImageDetails> {
    let window = resolve_member(image, member)?;
    let sniffed = qemu::sniff_info(image, window)?;
    Ok(ImageDetails {
        format: sniffed.format,
        virtual_size: sniffed.virtual_size,
        member_offset: window.map(|(o, _)| o),
        member_size: window.map(|(_, s)| s),
    })
}

/// Measure the space needed to convert an image to `output_format`.
pub fn measure(image: &Path, output_format: &str, member: Option<&str>) -> Result<MeasureDetails> {
    let window = resolve_member(image, member)?;
    let sniffed = qemu::sniff_info(image, window)?;
    let measured = qemu::measure(image, &sniffed.format, output_format, window)?;
    Ok(MeasureDetails {
        required: measured.required,
        fully_allocated: measured.fully_allocated,
        member_offset: window.map(|(o, _)| o),
        member_size: window.map(|(_, s)| s),
    })
}

/// Block checksum of the image's logical content.
pub fn checksum(
    image: &Path,
    member: Option<&str>,
    block_size: usize,
    algorithm: Algorithm,
    digest_size: Option<usize>,
) -> Result<String> {
    let window = resolve_member(image, member)?;
    let source = open_source(image, window, true)?;
    checksum_reader(source.as_ref(), block_size, algorithm, digest_size)
}

fn resolve_member(image: &Path, member: Option<&str>) -> Result<Option<(u64, u64)>> {
    match member {
        Some(name) => {
            let info = ova::resolve(image, name)?;
            Ok(Some((info.offset, info.size)))
        }
        None => Ok(None),
    }
}

/// Open the logical reader for an image path: raw content directly,
/// qcow2 through a qemu-nbd export.
fn open_source(
    image: &Path,
    window: Option<(u64, u64)>,
    backing_chain: bool,
) -> Result<Box<dyn LogicalReader>> {
    let sniffed = qemu::sniff_info(image, window)?;
    if sniffed.format == qemu::FORMAT_RAW {
        let source = match window {
            Some((offset, size)) => FileSource::open_window(image, offset, size)?,
            None => FileSource::open(image)?,
        };
        return Ok(Box::new(source));
    }

    #[cfg(unix)]
    {
        let server = qemu::QemuNbd::serve(image, &sniffed.format, window, backing_chain)?;
        let client = crate::nbd::NbdClient::connect(server.socket())?;
        Ok(Box::new(NbdImage {
            source: crate::source::NbdSource::new(client),
            _server: server,
        }))
    }
    #[cfg(not(unix))]
    {
        let _ = backing_chain;
        Err(crate::error::Error::Image(format!(
            "{} images need a unix host with qemu-nbd",
            sniffed.format
        )))
    }
}

/// Keeps the qemu-nbd subprocess alive for as long as the reader is used.
#[cfg(unix)]
struct NbdImage {
    source: crate::source::NbdSource,
    _server: qemu::QemuNbd,
}

#[cfg(unix)]
impl LogicalReader for NbdImage {
    fn size(&self) -> u64 {
        self.source.size()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.source.read_at(buf, offset)
    }

    fn extents(&self, start: u64, length: u64) -> Result<Vec<Extent>> {
        self.source.extents(start, length)
    }
}

#[cfg(unix)]
fn write_at(file: &std::fs::File, buf: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &std::fs::File, mut buf: &[u8], mut offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tar::{Builder, Header};

    #[test]
    fn info_reports_member_fields_only_for_members() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("disk.img");
        std::fs::write(&img, vec![0u8; 8192]).unwrap();

        let plain = info(&img, None).unwrap();
        assert_eq!(plain.format, "raw");
        assert_eq!(plain.virtual_size, 8192);
        assert!(plain.member_offset.is_none());
        assert!(plain.member_size.is_none());

        let ova = dir.path().join("vm.ova");
        let file = std::fs::File::create(&ova).unwrap();
        let mut builder = Builder::new(file);
        let mut header = Header::new_gnu();
        header.set_size(8192);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "disk.img", std::fs::read(&img).unwrap().as_slice())
            .unwrap();
        builder.into_inner().unwrap().flush().unwrap();

        let from_ova = info(&ova, Some("disk.img")).unwrap();
        assert_eq!(from_ova.format, plain.format);
        assert_eq!(from_ova.virtual_size, plain.virtual_size);
        assert_eq!(from_ova.member_offset, Some(512));
        assert_eq!(from_ova.member_size, Some(8192));
    }

    #[test]
    fn info_serializes_with_kebab_keys() {
        let details = ImageDetails {
            format: "raw".into(),
            virtual_size: 100,
            member_offset: Some(512),
            member_size: Some(100),
        };
        let v = serde_json::to_value(&details).unwrap();
        assert_eq!(v["virtual-size"], 100);
        assert_eq!(v["member-offset"], 512);

        let bare = ImageDetails {
            format: "raw".into(),
            virtual_size: 100,
            member_offset: None,
            member_size: None,
        };
        let v = serde_json::to_value(&bare).unwrap();
        assert!(v.get("member-offset").is_none());
    }

    #[test]
    fn checksum_of_member_matches_standalone_file() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
        let img = dir.path().join("disk.img");
        std::fs::write(&img, &content).unwrap();

        let ova = dir.path().join("vm.ova");
        let file = std::fs::File::create(&ova).unwrap();
        let mut builder = Builder::new(file);
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "disk.img", content.as_slice())
            .unwrap();
        builder.into_inner().unwrap().flush().unwrap();

        let direct = checksum(&img, None, 64 * 1024, Algorithm::Sha1, None).unwrap();
        let member = checksum(&ova, Some("disk.img"), 64 * 1024, Algorithm::Sha1, None).unwrap();
        assert_eq!(direct, member);
    }
}
