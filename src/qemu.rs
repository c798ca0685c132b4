//! qemu tooling collaborators
//!
//! Format conversion and qcow2 decoding are delegated to qemu-img and
//! qemu-nbd subprocesses; this module owns that seam. Raw images and
//! archive members never touch qemu, so the pure-Rust paths work on
//! machines without the tools installed.

use crate::error::{Error, Result};
use serde_json::json;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;

pub const FORMAT_RAW: &str = "raw";
pub const FORMAT_QCOW2: &str = "qcow2";

const QCOW2_MAGIC: [u8; 4] = *b"QFI\xfb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: String,
    pub virtual_size: u64,
}

/// Detect format and virtual size by sniffing the image header. Only the
/// magic and the size field are read; format semantics stay in qemu.
pub fn sniff_info(path: &Path, window: Option<(u64, u64)>) -> Result<ImageInfo> {
    let mut file = File::open(path).map_err(|source| Error::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    let (offset, size) = match window {
        Some((offset, size)) => (offset, size),
        None => (0, file.metadata()?.len()),
    };

    let mut header = [0u8; 32];
    let read = read_at_most(&mut file, &mut header, offset)?;
    let header = &header[..read];

    if header.len() >= 32 && header[..4] == QCOW2_MAGIC {
        // Virtual size lives at byte 24 of the qcow2 header, big endian.
        let virtual_size = u64::from_be_bytes(header[24..32].try_into().unwrap());
        return Ok(ImageInfo {
            format: FORMAT_QCOW2.to_string(),
            virtual_size,
        });
    }
    Ok(ImageInfo {
        format: FORMAT_RAW.to_string(),
        virtual_size: size,
    })
}

fn read_at_most(file: &mut File, buf: &mut [u8], offset: u64) -> Result<usize> {
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureResult {
    pub required: u64,
    pub fully_allocated: u64,
}

/// `qemu-img measure` against the image (or an archive window of it).
pub fn measure(
    path: &Path,
    format: &str,
    output_format: &str,
    window: Option<(u64, u64)>,
) -> Result<MeasureResult> {
    let target = image_spec(path, format, window, true)?;
    let out = run_qemu_img(&["measure", "--output", "json", "-O", output_format, &target])?;
    let parsed: serde_json::Value = serde_json::from_slice(&out)
        .map_err(|e| Error::Image(format!("bad qemu-img measure output: {e}")))?;
    let required = parsed["required"]
        .as_u64()
        .ok_or_else(|| Error::Image("qemu-img measure: missing required".into()))?;
    let fully_allocated = parsed["fully-allocated"]
        .as_u64()
        .ok_or_else(|| Error::Image("qemu-img measure: missing fully-allocated".into()))?;
    Ok(MeasureResult {
        required,
        fully_allocated,
    })
}

/// `qemu-img convert` from a raw file to the requested output format.
pub fn convert(src: &Path, dst: &Path, src_format: &str, dst_format: &str) -> Result<()> {
    let status = Command::new("qemu-img")
        .args(["convert", "-f", src_format, "-O", dst_format])
        .arg(src)
        .arg(dst)
        .status()
        .map_err(|e| Error::Image(format!("cannot run qemu-img: {e}")))?;
    if !status.success() {
        return Err(Error::Image(format!("qemu-img convert failed: {status}")));
    }
    Ok(())
}

pub fn qemu_img_available() -> bool {
    Command::new("qemu-img")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Build a `json:` image spec so qemu can open archive-windowed members
/// in place. `with_format` wraps the raw window in the detected format
/// driver.
fn image_spec(
    path: &Path,
    format: &str,
    window: Option<(u64, u64)>,
    with_format: bool,
) -> Result<String> {
    let filename = path
        .to_str()
        .ok_or_else(|| Error::InvalidArgument("non-UTF-8 image path".into()))?;
    let Some((offset, size)) = window else {
        return Ok(filename.to_string());
    };

    let file = json!({
        "driver": "raw",
        "offset": offset,
        "size": size,
        "file": { "driver": "file", "filename": filename },
    });
    let spec = if with_format {
        json!({ "driver": format, "file": file })
    } else {
        file
    };
    Ok(format!("json:{spec}"))
}

fn run_qemu_img(args: &[&str]) -> Result<Vec<u8>> {
    let out = Command::new("qemu-img")
        .args(args)
        .output()
        .map_err(|e| Error::Image(format!("cannot run qemu-img: {e}")))?;
    if !out.status.success() {
        return Err(Error::Image(format!(
            "qemu-img {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(out.stdout)
}

/// A qemu-nbd subprocess exposing an image's logical content on a unix
/// socket. The process is killed when the handle drops.
#[cfg(unix)]
pub struct QemuNbd {
    child: std::process::Child,
    socket: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

#[cfg(unix)]
impl QemuNbd {
    /// Serve `path` read-only. With `backing_chain` false the backing
    /// file is masked so unallocated top-image clusters read as holes.
    pub fn serve(
        path: &Path,
        format: &str,
        window: Option<(u64, u64)>,
        backing_chain: bool,
    ) -> Result<QemuNbd> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("nbd.sock");

        let mut cmd = Command::new("qemu-nbd");
        cmd.arg(format!("--socket={}", socket.display()))
            .arg("--persistent")
            .arg("--shared=8")
            .arg("--read-only");

        if backing_chain && window.is_none() {
            cmd.arg(format!("--format={format}"));
            cmd.arg(path);
        } else {
            // json: spec handles both the backing mask and archive windows.
            cmd.arg(nbd_image_spec(path, format, window, backing_chain)?);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Image(format!("cannot run qemu-nbd: {e}")))?;

        // The socket appears once the export is ready.
        for _ in 0..200 {
            if socket.exists() {
                return Ok(QemuNbd {
                    child,
                    socket,
                    _dir: dir,
                });
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        let mut child = child;
        let _ = child.kill();
        Err(Error::Image("qemu-nbd did not create its socket".into()))
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

#[cfg(unix)]
impl Drop for QemuNbd {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// json: spec for the qemu-nbd export. A null backing masks the image's
/// backing chain, so unallocated top-image clusters read as holes.
#[cfg(unix)]
fn nbd_image_spec(
    path: &Path,
    format: &str,
    window: Option<(u64, u64)>,
    backing_chain: bool,
) -> Result<String> {
    let filename = path
        .to_str()
        .ok_or_else(|| Error::InvalidArgument("non-UTF-8 image path".into()))?;
    let file = match window {
        Some((offset, size)) => json!({
            "driver": "raw",
            "offset": offset,
            "size": size,
            "file": { "driver": "file", "filename": filename },
        }),
        None => json!({ "driver": "file", "filename": filename }),
    };
    let mut spec = json!({ "driver": format, "file": file });
    if !backing_chain && format != FORMAT_RAW {
        spec["backing"] = serde_json::Value::Null;
    }
    Ok(format!("json:{spec}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sniffs_raw_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let info = sniff_info(&path, None).unwrap();
        assert_eq!(info.format, FORMAT_RAW);
        assert_eq!(info.virtual_size, 4096);
    }

    #[test]
    fn sniffs_qcow2_magic_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.qcow2");
        let mut header = vec![0u8; 512];
        header[..4].copy_from_slice(&QCOW2_MAGIC);
        header[4..8].copy_from_slice(&3u32.to_be_bytes()); // version
        header[24..32].copy_from_slice(&(3 * 64 * 1024u64).to_be_bytes());
        let mut f = File::create(&path).unwrap();
        f.write_all(&header).unwrap();
        let info = sniff_info(&path, None).unwrap();
        assert_eq!(info.format, FORMAT_QCOW2);
        assert_eq!(info.virtual_size, 3 * 64 * 1024);
    }

    #[test]
    fn sniffs_inside_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container");
        let mut data = vec![0xffu8; 100];
        let mut header = vec![0u8; 512];
        header[..4].copy_from_slice(&QCOW2_MAGIC);
        header[24..32].copy_from_slice(&(1024u64 * 1024).to_be_bytes());
        data.extend_from_slice(&header);
        std::fs::write(&path, &data).unwrap();

        let info = sniff_info(&path, Some((100, 512))).unwrap();
        assert_eq!(info.format, FORMAT_QCOW2);
        assert_eq!(info.virtual_size, 1024 * 1024);

        let raw = sniff_info(&path, Some((0, 50))).unwrap();
        assert_eq!(raw.format, FORMAT_RAW);
        assert_eq!(raw.virtual_size, 50);
    }

    #[test]
    fn image_spec_plain_path_is_passthrough() {
        let spec = image_spec(Path::new("/tmp/disk.img"), FORMAT_RAW, None, true).unwrap();
        assert_eq!(spec, "/tmp/disk.img");
    }

    #[cfg(unix)]
    #[test]
    fn nbd_spec_masks_backing_chain() {
        let spec = nbd_image_spec(Path::new("/tmp/top.qcow2"), FORMAT_QCOW2, None, false).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(spec.strip_prefix("json:").unwrap()).unwrap();
        assert_eq!(v["driver"], "qcow2");
        assert!(v.as_object().unwrap().contains_key("backing"));
        assert!(v["backing"].is_null());

        let kept = nbd_image_spec(Path::new("/tmp/top.qcow2"), FORMAT_QCOW2, None, true).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(kept.strip_prefix("json:").unwrap()).unwrap();
        assert!(!v.as_object().unwrap().contains_key("backing"));
    }

    #[test]
    fn image_spec_window_builds_json() {
        let spec =
            image_spec(Path::new("/tmp/vm.ova"), FORMAT_QCOW2, Some((1536, 70000)), true).unwrap();
        let json_part = spec.strip_prefix("json:").unwrap();
        let v: serde_json::Value = serde_json::from_str(json_part).unwrap();
        assert_eq!(v["driver"], "qcow2");
        assert_eq!(v["file"]["driver"], "raw");
        assert_eq!(v["file"]["offset"], 1536);
        assert_eq!(v["file"]["size"], 70000);
        assert_eq!(v["file"]["file"]["filename"], "/tmp/vm.ova");
    }
}
