//! Raster and vector conversion engines. Pixels are never touched here; the work is
//! delegated to external tools through the dispatcher.

use std::fs;
use std::io::Read;
use std::path::Path;

use crate::dispatch::{DispatchOptions, dispatch_capture, to_unix_path};
use crate::error::{Error, Result};
use crate::logging::Log;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

pub trait RasterEngine: Send + Sync {
    /// Square resize of `src` to `size`x`size`.
    fn resize(&self, src: &Path, dst: &Path, size: u32) -> Result<()>;
    /// Single-image platform icon container.
    fn encode_ico(&self, src: &Path, dst: &Path) -> Result<()>;
    /// Multi-resolution icon bundle, assembled in `staging` (cleared first).
    fn encode_icns(&self, src: &Path, dst: &Path, sizes: &[u32], staging: &Path) -> Result<()>;
    fn rasterize_svg(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// ImageMagick for rasters, `rsvg-convert` for vectors, `iconutil` for icns bundles.
pub struct MagickEngine {
    pub magick: String,
    pub rsvg: String,
    pub iconutil: String,
    log: Log,
    opts: DispatchOptions,
}

impl MagickEngine {
    pub fn new(
        magick: impl Into<String>,
        rsvg: impl Into<String>,
        iconutil: impl Into<String>,
        log: Log,
        opts: DispatchOptions,
    ) -> Self {
        Self {
            magick: magick.into(),
            rsvg: rsvg.into(),
            iconutil: iconutil.into(),
            log,
            opts,
        }
    }

    fn run(&self, exe: &str, args: &[String]) -> Result<()> {
        let out = dispatch_capture(&self.log, exe, args, &self.opts)?;
        if out.success {
            return Ok(());
        }
        Err(Error::engine(
            &format!("{exe} {} failed", args.join(" ")),
            &out.diagnostic(),
        ))
    }
}

impl RasterEngine for MagickEngine {
    fn resize(&self, src: &Path, dst: &Path, size: u32) -> Result<()> {
        self.run(
            &self.magick,
            &[
                to_unix_path(src),
                "-resize".into(),
                format!("{size}x{size}"),
                to_unix_path(dst),
            ],
        )
    }

    fn encode_ico(&self, src: &Path, dst: &Path) -> Result<()> {
        self.run(&self.magick, &[to_unix_path(src), to_unix_path(dst)])
    }

    fn encode_icns(&self, src: &Path, dst: &Path, sizes: &[u32], staging: &Path) -> Result<()> {
        if staging.exists() {
            fs::remove_dir_all(staging).map_err(|e| {
                Error::io(format!("failed to clear {}: {e}", staging.display()))
            })?;
        }
        fs::create_dir_all(staging)
            .map_err(|e| Error::io(format!("failed to create {}: {e}", staging.display())))?;
        for &size in sizes {
            self.resize(src, &staging.join(format!("icon_{size}x{size}.png")), size)?;
        }
        self.run(
            &self.iconutil,
            &[
                "-c".into(),
                "icns".into(),
                to_unix_path(staging),
                "-o".into(),
                to_unix_path(dst),
            ],
        )
    }

    fn rasterize_svg(&self, src: &Path, dst: &Path) -> Result<()> {
        self.run(
            &self.rsvg,
            &[to_unix_path(src), "-o".into(), to_unix_path(dst)],
        )
    }
}

/// Reads width and height from a PNG header.
pub fn png_dimensions(path: &Path) -> Result<(u32, u32)> {
    let mut head = [0u8; 24];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut head))
        .map_err(|e| Error::precondition(format!("cannot read {}: {e}", path.display())))?;
    if head[..8] != PNG_SIGNATURE || &head[12..16] != b"IHDR" {
        return Err(Error::precondition(format!(
            "{} is not a PNG image",
            path.display()
        )));
    }
    let width = u32::from_be_bytes([head[16], head[17], head[18], head[19]]);
    let height = u32::from_be_bytes([head[20], head[21], head[22], head[23]]);
    Ok((width, height))
}

#[cfg(test)]
pub(crate) fn png_header(width: u32, height: u32) -> Vec<u8> {
    let mut out = PNG_SIGNATURE.to_vec();
    out.extend_from_slice(&13u32.to_be_bytes());
    out.extend_from_slice(b"IHDR");
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&[8, 6, 0, 0, 0]);
    out
}
