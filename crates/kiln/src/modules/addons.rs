use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use kiln_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::dispatch::{DispatchOptions, dispatch_capture, to_unix_path};
use crate::executor::ExecCtx;
use crate::file_tree::FileTree;
use crate::logging::Log;
use crate::modules::util;
use crate::vcs::VersionControl;
use crate::{Error, Result};

const WIRING_BEGIN: &str = "# kiln: add-ons begin";
const WIRING_END: &str = "# kiln: add-ons end";

fn default_true() -> bool {
    true
}

fn default_amo_api() -> String {
    "https://addons.mozilla.org/api/v5".into()
}

fn default_github_api() -> String {
    "https://api.github.com".into()
}

fn default_timeout_secs() -> u64 {
    120
}

/// Where a package comes from. Tagged by `source` in each `[addons.<id>]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum AddonSource {
    Url {
        url: String,
    },
    Amo {
        amo_id: String,
    },
    Github {
        repo: String,
        version: String,
        file_glob: String,
    },
}

#[Task(
    id = "addons.integrate",
    module = "addons",
    phase = "integrate",
    provides = ["addons:integrated"],
    after = ["core.init", "tree:ready?"],
    default_label = "Integrate add-ons",
    config_path = "addons"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AddonsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_amo_api")]
    pub amo_api: String,
    #[serde(default = "default_github_api")]
    pub github_api: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Every other key is one add-on table.
    #[serde(flatten)]
    pub entries: BTreeMap<String, toml::Value>,
}

impl Default for AddonsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            amo_api: default_amo_api(),
            github_api: default_github_api(),
            timeout_secs: default_timeout_secs(),
            entries: BTreeMap::new(),
        }
    }
}

impl AddonsConfig {
    /// Add-on tables in id order.
    pub fn addons(&self) -> Result<Vec<(String, AddonSource)>> {
        let mut out = Vec::new();
        for (id, v) in &self.entries {
            if !v.is_table() {
                continue;
            }
            validate_addon_id(id)?;
            let source: AddonSource = v
                .clone()
                .try_into()
                .map_err(|e| Error::config(format!("invalid config at 'addons.{id}': {e}")))?;
            out.push((id.clone(), source));
        }
        Ok(out)
    }
}

fn validate_addon_id(id: &str) -> Result<()> {
    let bad = id.trim().is_empty()
        || Path::new(id)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        || id.contains(['/', '\\']);
    if bad {
        return Err(Error::config(format!(
            "add-on id '{id}' must be a single directory name"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddonState {
    Resolved,
    Downloaded,
    Unpacked,
    Registered,
}

#[derive(Debug, Clone)]
pub struct AddonDescriptor {
    pub id: String,
    pub url: String,
    pub xpi: PathBuf,
    pub unpack_dir: PathBuf,
    pub build_file: PathBuf,
    pub state: AddonState,
}

/// Network and archive access. Kept behind a trait so the pipeline runs in tests
/// without either.
pub trait AddonIo {
    fn fetch_text(&self, url: &str) -> Result<String>;
    fn download(&self, url: &str, dst: &Path) -> Result<()>;
    fn unpack(&self, archive: &Path, dst: &Path) -> Result<()>;
}

/// `reqwest` for HTTP, the `unzip` tool for packages.
pub struct ToolAddonIo {
    client: reqwest::blocking::Client,
    unzip: String,
    log: Log,
    opts: DispatchOptions,
}

impl ToolAddonIo {
    pub fn new(
        timeout: Duration,
        unzip: impl Into<String>,
        log: Log,
        opts: DispatchOptions,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            unzip: unzip.into(),
            log,
            opts,
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let res = self.client.get(url).send()?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "GET {url} failed with status {}",
                res.status()
            )));
        }
        Ok(res)
    }
}

impl AddonIo for ToolAddonIo {
    fn fetch_text(&self, url: &str) -> Result<String> {
        Ok(self.get(url)?.text()?)
    }

    fn download(&self, url: &str, dst: &Path) -> Result<()> {
        let bytes = self.get(url)?.bytes()?;
        util::write_atomic(dst, &bytes)
    }

    fn unpack(&self, archive: &Path, dst: &Path) -> Result<()> {
        let args = [
            "-q".to_string(),
            "-o".to_string(),
            to_unix_path(archive),
            "-d".to_string(),
            to_unix_path(dst),
        ];
        let out = dispatch_capture(&self.log, &self.unzip, &args, &self.opts)?;
        if out.success {
            return Ok(());
        }
        Err(Error::engine(
            &format!("failed to unpack {}", archive.display()),
            &out.diagnostic(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct AmoAddon {
    current_version: AmoVersion,
}

#[derive(Debug, Deserialize)]
struct AmoVersion {
    file: AmoFile,
}

#[derive(Debug, Deserialize)]
struct AmoFile {
    url: String,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// `*` matches any run of characters; everything else is literal.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if name.len() < first.len() + last.len() || !name.starts_with(first) || !name.ends_with(last)
    {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for &mid in &parts[1..parts.len() - 1] {
        match rest.find(mid) {
            Some(i) => rest = &rest[i + mid.len()..],
            None => return false,
        }
    }
    true
}

pub fn resolve_download_url(
    io: &dyn AddonIo,
    cfg: &AddonsConfig,
    id: &str,
    source: &AddonSource,
) -> Result<String> {
    match source {
        AddonSource::Url { url } => Ok(url.clone()),
        AddonSource::Amo { amo_id } => {
            let api = format!(
                "{}/addons/addon/{amo_id}/",
                cfg.amo_api.trim_end_matches('/')
            );
            let body = io.fetch_text(&api)?;
            let addon: AmoAddon = serde_json::from_str(&body).map_err(|e| {
                Error::msg(format!("unexpected AMO response for '{id}' from {api}: {e}"))
            })?;
            Ok(addon.current_version.file.url)
        }
        AddonSource::Github {
            repo,
            version,
            file_glob,
        } => {
            let api = format!(
                "{}/repos/{repo}/releases/tags/{version}",
                cfg.github_api.trim_end_matches('/')
            );
            let body = io.fetch_text(&api)?;
            let release: GithubRelease = serde_json::from_str(&body).map_err(|e| {
                Error::msg(format!(
                    "unexpected GitHub response for '{id}' from {api}: {e}"
                ))
            })?;
            release
                .assets
                .into_iter()
                .find(|a| glob_match(file_glob, &a.name))
                .map(|a| a.browser_download_url)
                .ok_or_else(|| {
                    Error::config(format!(
                        "add-on '{id}': no asset of {repo}@{version} matches '{file_glob}'"
                    ))
                })
        }
    }
}

/// Downloads unless the package for this exact URL is already present.
pub fn download_package(io: &dyn AddonIo, log: &Log, desc: &mut AddonDescriptor) -> Result<()> {
    let stamp = desc.xpi.with_extension("xpi.url");
    let cached = desc.xpi.is_file()
        && fs::read_to_string(&stamp).is_ok_and(|u| u.trim() == desc.url);
    if cached {
        log.debug(&format!("{}: using cached package", desc.id));
    } else {
        log.info(&format!("{}: downloading {}", desc.id, desc.url));
        io.download(&desc.url, &desc.xpi)?;
        util::write_text(&stamp, &desc.url)?;
    }
    desc.state = AddonState::Downloaded;
    Ok(())
}

pub fn unpack_package(io: &dyn AddonIo, desc: &mut AddonDescriptor) -> Result<()> {
    if desc.unpack_dir.exists() {
        fs::remove_dir_all(&desc.unpack_dir).map_err(|e| {
            Error::io(format!("failed to clear {}: {e}", desc.unpack_dir.display()))
        })?;
    }
    util::ensure_dir(&desc.unpack_dir)?;
    io.unpack(&desc.xpi, &desc.unpack_dir)?;
    desc.state = AddonState::Unpacked;
    Ok(())
}

/// Renders the add-on's `moz.build`: every unpacked file, grouped by directory.
pub fn render_build_descriptor(id: &str, files: &FileTree) -> String {
    let mut groups: BTreeMap<Vec<&str>, Vec<&str>> = BTreeMap::new();
    for rel in files.paths() {
        if rel == "moz.build" {
            continue;
        }
        let mut segs: Vec<&str> = rel.split('/').collect();
        let Some(name) = segs.pop() else { continue };
        groups.entry(segs).or_default().push(name);
    }

    let mut out = String::from(
        "DEFINES[\"MOZ_APP_VERSION\"] = CONFIG[\"MOZ_APP_VERSION\"]\n\
         DEFINES[\"MOZ_APP_MAXVERSION\"] = CONFIG[\"MOZ_APP_MAXVERSION\"]\n",
    );
    for (dir, names) in groups {
        let mut target = format!("FINAL_TARGET_FILES.features[\"{id}\"]");
        for seg in dir {
            target.push_str(&format!("[\"{seg}\"]"));
        }
        out.push_str(&format!("\n{target} += [\n"));
        for n in names {
            out.push_str(&format!("    \"{n}\",\n"));
        }
        out.push_str("]\n");
    }
    out
}

pub fn generate_build_descriptor(desc: &AddonDescriptor) -> Result<()> {
    let files = FileTree::load(&desc.unpack_dir)?;
    if files.is_empty() {
        return Err(Error::precondition(format!(
            "add-on '{}' unpacked to an empty directory",
            desc.id
        )));
    }
    util::write_text(&desc.build_file, &render_build_descriptor(&desc.id, &files))
}

/// Commits the unpacked add-on into the engine repository (when there is one).
pub fn register_in_tree(
    vcs: &dyn VersionControl,
    log: &Log,
    tree: &Path,
    desc: &mut AddonDescriptor,
) -> Result<()> {
    if tree.join(".git").exists() {
        let message = format!("Add add-on {}", desc.id);
        if !vcs.commit_path(tree, &desc.unpack_dir, &message)? {
            log.debug(&format!("{}: unchanged; nothing to commit", desc.id));
        }
    } else {
        log.debug(&format!(
            "{} is not a repository; {} left uncommitted",
            tree.display(),
            desc.id
        ));
    }
    desc.state = AddonState::Registered;
    Ok(())
}

/// Replaces (or appends) the kiln-owned `DIRS` block listing every add-on.
pub fn wire_manifest_text(existing: &str, ids: &[&str]) -> String {
    let mut kept = String::new();
    let mut inside = false;
    for line in existing.lines() {
        match line.trim() {
            WIRING_BEGIN => inside = true,
            WIRING_END => inside = false,
            _ if !inside => {
                kept.push_str(line);
                kept.push('\n');
            }
            _ => {}
        }
    }
    let mut out = kept.trim_end().to_string();
    if ids.is_empty() {
        out.push('\n');
        return out;
    }
    out.push_str(&format!("\n\n{WIRING_BEGIN}\nDIRS += [\n"));
    for id in ids {
        out.push_str(&format!("    \"{id}\",\n"));
    }
    out.push_str(&format!("]\n{WIRING_END}\n"));
    out
}

pub fn wire_into_manifest(extensions_dir: &Path, addons: &[AddonDescriptor]) -> Result<()> {
    let manifest = extensions_dir.join("moz.build");
    let existing = fs::read_to_string(&manifest).map_err(|e| {
        Error::precondition(format!(
            "cannot read build manifest {}: {e}",
            manifest.display()
        ))
    })?;
    let ids: Vec<&str> = addons.iter().map(|a| a.id.as_str()).collect();
    util::write_text(&manifest, &wire_manifest_text(&existing, &ids))
}

/// Runs every add-on through all stages, one at a time; the first failure ends the run.
pub fn integrate_addons(
    io: &dyn AddonIo,
    vcs: &dyn VersionControl,
    log: &Log,
    cfg: &AddonsConfig,
    engine_dir: &Path,
    downloads_dir: &Path,
) -> Result<Vec<AddonDescriptor>> {
    if !engine_dir.is_dir() {
        return Err(Error::precondition(format!(
            "engine tree {} does not exist",
            engine_dir.display()
        )));
    }
    let extensions = engine_dir.join("browser").join("extensions");
    let mut done = Vec::new();
    for (id, source) in cfg.addons()? {
        let fail = |stage: &str, e: Error| e.context(format!("add-on '{id}' ({stage})"));
        let url = resolve_download_url(io, cfg, &id, &source).map_err(|e| fail("resolve", e))?;
        let unpack_dir = extensions.join(&id);
        let mut desc = AddonDescriptor {
            xpi: downloads_dir.join(format!("{id}.xpi")),
            build_file: unpack_dir.join("moz.build"),
            unpack_dir,
            url,
            id: id.clone(),
            state: AddonState::Resolved,
        };
        download_package(io, log, &mut desc).map_err(|e| fail("download", e))?;
        unpack_package(io, &mut desc).map_err(|e| fail("unpack", e))?;
        generate_build_descriptor(&desc).map_err(|e| fail("build file", e))?;
        register_in_tree(vcs, log, engine_dir, &mut desc).map_err(|e| fail("register", e))?;
        log.info(&format!("{id}: integrated"));
        done.push(desc);
    }
    if !done.is_empty() {
        wire_into_manifest(&extensions, &done)?;
    }
    Ok(done)
}

impl AddonsConfig {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let io = ToolAddonIo::new(
            Duration::from_secs(cfg.timeout_secs.max(1)),
            ctx.tools().unzip.clone(),
            ctx.logger().clone(),
            ctx.dispatch_options(),
        )?;
        let vcs = ctx.vcs();
        let done = integrate_addons(
            &io,
            vcs.as_ref(),
            ctx.logger(),
            cfg,
            &ws.engine_dir,
            &ws.downloads_dir(),
        )?;
        ctx.logger()
            .success(&format!("{} add-on(s) integrated", done.len()));
        Ok(())
    }
}

#[Module(
    id = "addons",
    config = AddonsConfig,
    config_path = "addons",
    tasks = [AddonsConfig]
)]
pub struct AddonsModule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_star_runs() {
        assert!(glob_match("*.xpi", "ublock-1.2.xpi"));
        assert!(glob_match("ublock*firefox*.xpi", "ublock-1.2-firefox-signed.xpi"));
        assert!(glob_match("exact.xpi", "exact.xpi"));
        assert!(!glob_match("*.xpi", "ublock.zip"));
        assert!(!glob_match("a*a", "a"));
    }

    #[test]
    fn addon_tables_parse_by_source() {
        let cfg: AddonsConfig = toml::from_str(
            r#"
timeout_secs = 5
[ublock]
source = "amo"
amo_id = "ublock-origin"
[tabs]
source = "github"
repo = "acme/tabs"
version = "v1.0"
file_glob = "*.xpi"
"#,
        )
        .expect("parse");
        assert_eq!(cfg.timeout_secs, 5);
        let addons = cfg.addons().expect("addons");
        assert_eq!(addons.len(), 2);
        assert_eq!(addons[0].0, "tabs");
        assert_eq!(
            addons[1].1,
            AddonSource::Amo {
                amo_id: "ublock-origin".into()
            }
        );
    }

    #[test]
    fn rejects_path_like_ids() {
        assert!(validate_addon_id("../escape").is_err());
        assert!(validate_addon_id("a/b").is_err());
        validate_addon_id("ublock").expect("plain id");
    }

    #[test]
    fn build_descriptor_groups_files_by_directory() {
        let mut files = FileTree::new();
        files.insert("manifest.json", "{}");
        files.insert("background.js", "");
        files.insert("icons/48.png", "");
        let out = render_build_descriptor("ublock", &files);
        assert!(out.contains(
            "FINAL_TARGET_FILES.features[\"ublock\"] += [\n    \"background.js\",\n    \"manifest.json\",\n]\n"
        ));
        assert!(out.contains(
            "FINAL_TARGET_FILES.features[\"ublock\"][\"icons\"] += [\n    \"48.png\",\n]\n"
        ));
    }

    #[test]
    fn manifest_wiring_is_replaced_not_duplicated() {
        let base = "DIRS += [\n    \"pdfjs\",\n]\n";
        let once = wire_manifest_text(base, &["ublock"]);
        let twice = wire_manifest_text(&once, &["tabs", "ublock"]);
        assert_eq!(twice.matches(WIRING_BEGIN).count(), 1);
        assert!(twice.starts_with(base));
        assert!(twice.contains("    \"tabs\",\n    \"ublock\",\n"));
        assert_eq!(wire_manifest_text(&once, &[]), base);
    }
}
