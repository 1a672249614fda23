use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use kiln_macros::{Module, Task};

use crate::config::{ConfigDoc, ProjectConfig};
use crate::executor::ExecCtx;
use crate::file_tree::FileTree;
use crate::hash_cache::{HashCache, file_digest};
use crate::logging::Log;
use crate::modules::util;
use crate::raster::{RasterEngine, png_dimensions};
use crate::{Error, Result};

/// Sizes rendered into the brand output; 512 only feeds the icon containers.
pub const RASTER_SIZES: [u32; 9] = [16, 22, 24, 32, 48, 64, 128, 256, 512];
const ICNS_SIZES: [u32; 6] = [16, 32, 64, 128, 256, 512];

const LOGO: &str = "logo.png";
const INSTALLER_SVG: &str = "MacOSInstaller.svg";
const INSTALLER_CACHE: &str = "background.png";
/// Digest of the source each set of config-dir copies was rendered from.
const RASTER_STAMP: &str = "logo.png.sha256";
const INSTALLER_STAMP: &str = "background.png.sha256";
const MANIFEST_FILE: &str = ".kiln-assets.json";
const THEME_VAR: &str = "var(--theme-bg)";

static HARDCODED_COLORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#130829|hsla\(235, 43%, 10%, .5\)").expect("color regex")
});

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(\w+)\}").expect("placeholder regex"));

fn default_true() -> bool {
    true
}

fn default_config_dir() -> String {
    "configs/branding".into()
}

fn default_template_dir() -> String {
    "templates/branding.optional".into()
}

fn default_background() -> String {
    "#2B2A33".into()
}

#[Task(
    id = "branding.apply",
    module = "branding",
    phase = "apply",
    provides = ["branding:applied"],
    after = ["core.init"],
    default_label = "Generate branding assets",
    config_path = "branding"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrandingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Brand to apply; every brand in `[brands]` (or on disk) when unset.
    pub brand: Option<String>,
    /// Root holding one directory of source assets per brand.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    #[serde(default = "default_template_dir")]
    pub template_dir: String,
    /// Regenerate rasters even when the logo is unchanged.
    pub force: bool,
    /// Raster workers; 0 uses the CPU count.
    pub jobs: usize,
    /// Also build the macOS-only assets on other hosts.
    pub macos: Option<bool>,
}

impl Default for BrandingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            brand: None,
            config_dir: default_config_dir(),
            template_dir: default_template_dir(),
            force: false,
            jobs: 0,
            macos: None,
        }
    }
}

/// One `[brands.<name>]` table. Unset names fall back to the project name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrandConfig {
    pub generic_name: Option<String>,
    pub vendor: Option<String>,
    pub background_color: Option<String>,
    pub brand_short_name: Option<String>,
    pub brand_shorter_name: Option<String>,
    pub brand_full_name: Option<String>,
}

/// Fully resolved brand strings, as substituted into templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrandValues {
    pub generic_name: String,
    pub vendor: String,
    pub background_color: String,
    pub short_name: String,
    pub shorter_name: String,
    pub full_name: String,
}

impl BrandConfig {
    pub fn resolve(&self, project: &ProjectConfig) -> BrandValues {
        let or_project = |v: &Option<String>| v.clone().unwrap_or_else(|| project.name.clone());
        BrandValues {
            generic_name: or_project(&self.generic_name),
            vendor: self
                .vendor
                .clone()
                .unwrap_or_else(|| project.vendor.clone()),
            background_color: self
                .background_color
                .clone()
                .unwrap_or_else(default_background),
            short_name: or_project(&self.brand_short_name),
            shorter_name: or_project(&self.brand_shorter_name),
            full_name: or_project(&self.brand_full_name),
        }
    }
}

impl BrandValues {
    fn placeholders(&self) -> [(&'static str, &str); 6] {
        [
            ("brandingGenericName", self.generic_name.as_str()),
            ("brandingVendor", self.vendor.as_str()),
            ("backgroundColor", self.background_color.as_str()),
            ("brandShorterName", self.shorter_name.as_str()),
            ("brandShortName", self.short_name.as_str()),
            ("brandFullName", self.full_name.as_str()),
        ]
    }
}

/// Everything `apply_brand` reads and writes.
#[derive(Debug, Clone)]
pub struct BrandJob {
    pub name: String,
    /// The brand's own source directory (`logo.png`, optional `MacOSInstaller.svg`).
    pub config_dir: PathBuf,
    pub output: PathBuf,
    /// Upstream default branding, overlaid for files the brand does not provide.
    pub defaults_dir: PathBuf,
    pub template_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub values: BrandValues,
    pub force: bool,
    pub jobs: usize,
    pub macos: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub brand: String,
    /// Output-relative, `/`-separated, sorted.
    pub files: Vec<String>,
    #[serde(skip)]
    pub rasters_reused: bool,
}

impl AssetManifest {
    pub fn contains(&self, rel: &str) -> bool {
        self.files.iter().any(|f| f == rel)
    }
}

/// Directories below `root`, one per brand, sorted.
pub fn list_brands(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(root)
        .map_err(|e| Error::io(format!("failed to list {}: {e}", root.display())))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    out.sort();
    Ok(out)
}

/// Fails before anything is written when the brand's inputs are unusable.
pub fn check_brand_inputs(name: &str, config_dir: &Path) -> Result<()> {
    if !config_dir.is_dir() {
        return Err(Error::precondition(format!(
            "brand '{name}' does not exist (expected {})",
            config_dir.display()
        )));
    }
    let logo = config_dir.join(LOGO);
    if !logo.is_file() {
        return Err(Error::precondition(format!(
            "brand '{name}' is missing required file {}",
            logo.display()
        )));
    }
    let (w, h) = png_dimensions(&logo)?;
    if w != h || w == 0 {
        return Err(Error::precondition(format!(
            "brand '{name}': {} must be square, got {w}x{h}",
            logo.display()
        )));
    }
    Ok(())
}

/// Replaces every `${key}` placeholder with its brand value. Unknown keys stay.
/// Values are inserted once and never expanded again.
pub fn substitute(text: &str, values: &BrandValues) -> String {
    let table = values.placeholders();
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures| {
            let key = &caps[1];
            match table.iter().find(|(k, _)| *k == key) {
                Some((_, value)) => (*value).to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Renders every template; files that are not UTF-8 pass through unchanged.
pub fn render_templates(templates: &FileTree, values: &BrandValues) -> FileTree {
    templates
        .iter()
        .map(|(rel, bytes)| {
            let out = match std::str::from_utf8(bytes) {
                Ok(text) => substitute(text, values).into_bytes(),
                Err(_) => bytes.to_vec(),
            };
            (rel.to_string(), out)
        })
        .collect()
}

/// Points the upstream hard-coded colors at the theme variable and declares it.
pub fn theme_stylesheet(css: &str, background: &str) -> String {
    let mut out = HARDCODED_COLORS.replace_all(css, THEME_VAR).into_owned();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!(":root {{ --theme-bg: {background} }}\n"));
    out
}

/// Default files the brand does not already provide, stylesheets themed.
pub fn overlay_defaults(defaults: &FileTree, present: &FileTree, background: &str) -> FileTree {
    defaults
        .iter()
        .filter(|(rel, _)| !present.contains(rel))
        .map(|(rel, bytes)| {
            let is_css = Path::new(rel)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("css"));
            let out = if is_css {
                theme_stylesheet(&String::from_utf8_lossy(bytes), background).into_bytes()
            } else {
                bytes.to_vec()
            };
            (rel.to_string(), out)
        })
        .collect()
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        util::ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::io(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

fn cached_rasters_present(config_dir: &Path) -> bool {
    RASTER_SIZES
        .iter()
        .all(|s| config_dir.join(format!("logo{s}.png")).is_file())
}

fn stamp_matches(stamp: &Path, digest: &str) -> bool {
    fs::read_to_string(stamp).is_ok_and(|s| s.trim() == digest)
}

fn clear_stamp(stamp: &Path) -> Result<()> {
    match fs::remove_file(stamp) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("failed to remove {}: {e}", stamp.display()))),
    }
}

// Workers only write their own sizes; the output dir exists before any starts.
fn render_rasters(raster: &dyn RasterEngine, job: &BrandJob, logo: &Path) -> Result<()> {
    let workers = job.jobs.clamp(1, RASTER_SIZES.len());
    let per_worker = RASTER_SIZES.len().div_ceil(workers);
    std::thread::scope(|s| {
        let handles: Vec<_> = RASTER_SIZES
            .chunks(per_worker)
            .map(|sizes| {
                s.spawn(move || -> Result<()> {
                    for &size in sizes {
                        let out = job.output.join(format!("default{size}.png"));
                        raster.resize(logo, &out, size)?;
                        copy_file(&out, &job.config_dir.join(format!("logo{size}.png")))?;
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(Error::msg("raster worker panicked")))
            })
            .collect::<Result<Vec<()>>>()
    })?;
    Ok(())
}

pub fn apply_brand(
    job: &BrandJob,
    raster: &dyn RasterEngine,
    cache: &mut HashCache,
    log: &Log,
) -> Result<AssetManifest> {
    check_brand_inputs(&job.name, &job.config_dir)?;
    let logo = job.config_dir.join(LOGO);

    if job.output.exists() {
        fs::remove_dir_all(&job.output).map_err(|e| {
            Error::io(format!("failed to clear {}: {e}", job.output.display()))
        })?;
    }
    util::ensure_dir(&job.output)?;

    let digest = file_digest(&logo)?;
    let stamp = job.config_dir.join(RASTER_STAMP);
    let reuse = !job.force
        && cache.has_been_processed(&logo)?
        && stamp_matches(&stamp, &digest)
        && cached_rasters_present(&job.config_dir);
    if reuse {
        log.debug("logo unchanged; reusing cached rasters");
        for size in RASTER_SIZES {
            copy_file(
                &job.config_dir.join(format!("logo{size}.png")),
                &job.output.join(format!("default{size}.png")),
            )?;
        }
    } else {
        log.debug("generating icons");
        clear_stamp(&stamp)?;
        render_rasters(raster, job, &logo)?;
        util::write_text(&stamp, &digest)?;
    }

    log.debug("generating icon containers");
    raster.encode_ico(
        &job.config_dir.join("logo512.png"),
        &job.output.join("firefox.ico"),
    )?;
    raster.encode_ico(
        &job.config_dir.join("logo64.png"),
        &job.output.join("firefox64.ico"),
    )?;
    if job.macos {
        raster.encode_icns(
            &logo,
            &job.output.join("firefox.icns"),
            &ICNS_SIZES,
            &job.staging_dir.join("macos_icon_info.iconset"),
        )?;
    }

    let content = job.output.join("content");
    util::ensure_dir(&content)?;
    raster.resize(&logo, &content.join("about-logo.png"), 512)?;
    raster.resize(&logo, &content.join("about-logo@2x.png"), 1024)?;
    cache.mark_processed(&logo)?;

    let svg = job.config_dir.join(INSTALLER_SVG);
    if job.macos && svg.is_file() {
        installer_background(job, raster, cache, log, &svg, &content)?;
    }

    let templates = FileTree::load(&job.template_dir)?;
    if templates.is_empty() {
        log.debug(&format!(
            "no branding templates under {}",
            job.template_dir.display()
        ));
    }
    render_templates(&templates, &job.values).store(&job.output)?;

    if job.defaults_dir.is_dir() {
        let present = FileTree::load(&job.output)?;
        let defaults = FileTree::load(&job.defaults_dir)?;
        overlay_defaults(&defaults, &present, &job.values.background_color)
            .store(&job.output)?;
    } else {
        log.warning(&format!(
            "default branding {} not found; skipping overlay",
            job.defaults_dir.display()
        ));
    }

    let manifest = AssetManifest {
        brand: job.name.clone(),
        files: FileTree::load(&job.output)?
            .paths()
            .map(str::to_string)
            .collect(),
        rasters_reused: reuse,
    };
    util::write_json_pretty(
        &job.output.join(MANIFEST_FILE),
        &serde_json::to_value(&manifest)?,
    )?;
    log.success(&format!(
        "brand '{}': {} file(s) in {}",
        job.name,
        manifest.files.len(),
        job.output.display()
    ));
    Ok(manifest)
}

// Cosmetic asset: conversion failures are reported and skipped.
fn installer_background(
    job: &BrandJob,
    raster: &dyn RasterEngine,
    cache: &mut HashCache,
    log: &Log,
    svg: &Path,
    content: &Path,
) -> Result<()> {
    let dst = content.join("background.png");
    let cached = job.config_dir.join(INSTALLER_CACHE);
    let stamp = job.config_dir.join(INSTALLER_STAMP);
    let digest = file_digest(svg)?;
    if !job.force
        && cached.is_file()
        && stamp_matches(&stamp, &digest)
        && cache.has_been_processed(svg)?
    {
        return copy_file(&cached, &dst);
    }
    clear_stamp(&stamp)?;
    match raster.rasterize_svg(svg, &dst) {
        Ok(()) => {
            copy_file(&dst, &cached)?;
            util::write_text(&stamp, &digest)?;
            cache.mark_processed(svg)
        }
        Err(e) => {
            log.warning(&format!("installer background skipped: {e}"));
            Ok(())
        }
    }
}

/// Builds the job for `name` from the build definition and workspace layout.
pub fn brand_job(
    doc: &ConfigDoc,
    ctx: &ExecCtx,
    cfg: &BrandingConfig,
    name: &str,
) -> Result<BrandJob> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let project = doc.project()?;
    let brand: BrandConfig = doc
        .deserialize_path(&format!("brands.{name}"))?
        .unwrap_or_default();
    let store = ws.engine_dir.join("browser").join("branding");
    Ok(BrandJob {
        name: name.to_string(),
        config_dir: ws.resolve(&cfg.config_dir)?.join(name),
        output: store.join(name),
        defaults_dir: store.join("unofficial"),
        template_dir: ws.resolve(&cfg.template_dir)?,
        staging_dir: ws.staging_dir(),
        values: brand.resolve(&project),
        force: cfg.force,
        jobs: if cfg.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            cfg.jobs
        },
        macos: cfg.macos.unwrap_or(cfg!(target_os = "macos")),
    })
}

/// Brands to apply: the configured one, else every `[brands]` entry, else every
/// brand directory on disk.
pub fn selected_brands(doc: &ConfigDoc, ctx: &ExecCtx, cfg: &BrandingConfig) -> Result<Vec<String>> {
    if let Some(b) = cfg.brand.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        return Ok(vec![b.to_string()]);
    }
    if let Some(tbl) = doc.table_path("brands") {
        return Ok(tbl.keys().cloned().collect());
    }
    let ws = ctx.workspace_paths_or_init(doc)?;
    list_brands(&ws.resolve(&cfg.config_dir)?)
}

impl BrandingConfig {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let brands = selected_brands(doc, ctx, cfg)?;
        if brands.is_empty() {
            ctx.logger().warning("no brands configured");
            return Ok(());
        }
        let ws = ctx.workspace_paths_or_init(doc)?;
        let mut cache = HashCache::open(ws.hash_cache_file())?;
        let raster = ctx.raster();
        for name in brands {
            let job = brand_job(doc, ctx, cfg, &name)?;
            ctx.log(&format!("applying brand '{name}'"));
            apply_brand(&job, raster.as_ref(), &mut cache, ctx.logger())
                .map_err(|e| e.context(format!("brand '{name}'")))?;
        }
        Ok(())
    }
}

#[Module(
    id = "branding",
    config = BrandingConfig,
    config_path = "branding",
    tasks = [BrandingConfig]
)]
pub struct BrandingModule;
