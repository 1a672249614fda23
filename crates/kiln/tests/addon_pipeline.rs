use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use kiln::dispatch::{Captured, DispatchOptions};
use kiln::logging::{Log, MemorySink};
use kiln::modules::addons::{AddonIo, AddonState, AddonsConfig, integrate_addons};
use kiln::vcs::{Direction, GitEngine, VersionControl};

/// Serves canned API responses and writes a tiny add-on on unpack.
#[derive(Default)]
struct FakeIo {
    downloads: Mutex<Vec<String>>,
}

impl AddonIo for FakeIo {
    fn fetch_text(&self, url: &str) -> kiln::Result<String> {
        if url.ends_with("/repos/acme/tabs/releases/tags/v2.1") {
            return Ok(r#"{"assets": [
                {"name": "tabs-2.1.zip", "browser_download_url": "https://dl.invalid/tabs.zip"},
                {"name": "tabs-2.1-firefox.xpi", "browser_download_url": "https://dl.invalid/tabs.xpi"}
            ]}"#
            .into());
        }
        if url.ends_with("/addons/addon/ublock-origin/") {
            return Ok(
                r#"{"current_version": {"file": {"url": "https://dl.invalid/ublock.xpi"}}}"#.into(),
            );
        }
        Err(kiln::Error::msg(format!("unexpected fetch {url}")))
    }

    fn download(&self, url: &str, dst: &Path) -> kiln::Result<()> {
        self.downloads.lock().expect("lock").push(url.to_string());
        fs::create_dir_all(dst.parent().expect("parent"))?;
        fs::write(dst, format!("xpi from {url}"))?;
        Ok(())
    }

    fn unpack(&self, archive: &Path, dst: &Path) -> kiln::Result<()> {
        let body = fs::read_to_string(archive)?;
        fs::create_dir_all(dst.join("icons"))?;
        fs::write(dst.join("manifest.json"), body)?;
        fs::write(dst.join("icons/48.png"), "icon")?;
        Ok(())
    }
}

#[derive(Default)]
struct CommitLog {
    commits: Mutex<Vec<String>>,
}

impl VersionControl for CommitLog {
    fn init(&self, _: &Path) -> kiln::Result<()> {
        Ok(())
    }
    fn checkout_orphan(&self, _: &Path, _: &str) -> kiln::Result<()> {
        Ok(())
    }
    fn configure(&self, _: &Path, _: &str, _: &str) -> kiln::Result<()> {
        Ok(())
    }
    fn add_all(&self, _: &Path) -> kiln::Result<()> {
        Ok(())
    }
    fn commit(&self, _: &Path, _: &str) -> kiln::Result<()> {
        Ok(())
    }
    fn create_branch(&self, _: &Path, _: &str) -> kiln::Result<()> {
        Ok(())
    }
    fn commit_path(&self, _: &Path, _: &Path, message: &str) -> kiln::Result<bool> {
        self.commits.lock().expect("lock").push(message.to_string());
        Ok(true)
    }
    fn apply_patch(&self, _: &Path, _: &Path, _: Direction, _: &[String]) -> kiln::Result<Captured> {
        Ok(Captured::default())
    }
    fn reset(&self, _: &Path) -> kiln::Result<()> {
        Ok(())
    }
    fn clean(&self, _: &Path) -> kiln::Result<()> {
        Ok(())
    }
}

fn config() -> AddonsConfig {
    toml::from_str(
        r#"
amo_api = "https://amo.invalid/api/v5/"
github_api = "https://gh.invalid"

[ublock]
source = "amo"
amo_id = "ublock-origin"

[tabs]
source = "github"
repo = "acme/tabs"
version = "v2.1"
file_glob = "*-firefox.xpi"
"#,
    )
    .expect("config")
}

fn engine(root: &Path) -> std::path::PathBuf {
    let tree = root.join("engine");
    fs::create_dir_all(tree.join("browser/extensions")).expect("mkdir");
    fs::create_dir_all(tree.join(".git")).expect("mkdir git");
    fs::write(
        tree.join("browser/extensions/moz.build"),
        "DIRS += [\n    \"pdfjs\",\n]\n",
    )
    .expect("moz.build");
    tree
}

#[test]
fn addons_are_unpacked_described_committed_and_wired() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let tree = engine(tmp.path());
    let downloads = tmp.path().join(".kiln/downloads");
    let io = FakeIo::default();
    let vcs = CommitLog::default();
    let log = Log::new(Arc::new(MemorySink::default()));

    let done = integrate_addons(&io, &vcs, &log, &config(), &tree, &downloads).expect("integrate");
    assert_eq!(done.len(), 2);
    assert!(done.iter().all(|d| d.state == AddonState::Registered));

    assert_eq!(
        *io.downloads.lock().expect("lock"),
        vec!["https://dl.invalid/tabs.xpi", "https://dl.invalid/ublock.xpi"]
    );
    assert_eq!(
        *vcs.commits.lock().expect("lock"),
        vec!["Add add-on tabs", "Add add-on ublock"]
    );

    let ublock = tree.join("browser/extensions/ublock");
    assert_eq!(
        fs::read_to_string(ublock.join("manifest.json")).expect("manifest"),
        "xpi from https://dl.invalid/ublock.xpi"
    );
    let build = fs::read_to_string(ublock.join("moz.build")).expect("moz.build");
    assert!(build.contains("FINAL_TARGET_FILES.features[\"ublock\"][\"icons\"] += [\n    \"48.png\",\n]"));

    let wiring = fs::read_to_string(tree.join("browser/extensions/moz.build")).expect("wiring");
    assert!(wiring.starts_with("DIRS += [\n    \"pdfjs\",\n]\n"));
    assert!(wiring.contains("    \"tabs\",\n    \"ublock\",\n"));
}

#[test]
fn second_run_reuses_downloads_and_keeps_one_wiring_block() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let tree = engine(tmp.path());
    let downloads = tmp.path().join(".kiln/downloads");
    let vcs = CommitLog::default();
    let log = Log::new(Arc::new(MemorySink::default()));

    integrate_addons(&FakeIo::default(), &vcs, &log, &config(), &tree, &downloads)
        .expect("first");
    let io = FakeIo::default();
    integrate_addons(&io, &vcs, &log, &config(), &tree, &downloads).expect("second");

    assert!(io.downloads.lock().expect("lock").is_empty());
    let wiring = fs::read_to_string(tree.join("browser/extensions/moz.build")).expect("wiring");
    assert_eq!(wiring.matches("# kiln: add-ons begin").count(), 1);
}

#[test]
fn unmatched_release_asset_names_the_addon() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let tree = engine(tmp.path());
    let mut cfg = config();
    cfg.entries.remove("ublock");
    let tabs: toml::Table = toml::from_str(
        "source = \"github\"\nrepo = \"acme/tabs\"\nversion = \"v2.1\"\nfile_glob = \"*.crx\"\n",
    )
    .expect("entry");
    cfg.entries.insert("tabs".into(), toml::Value::Table(tabs));

    let err = integrate_addons(
        &FakeIo::default(),
        &CommitLog::default(),
        &Log::new(Arc::new(MemorySink::default())),
        &cfg,
        &tree,
        &tmp.path().join("dl"),
    )
    .expect_err("no asset");
    assert!(err.to_string().starts_with("add-on 'tabs' (resolve): "));
    assert!(err.operator_must_fix());
}

#[test]
fn missing_extensions_manifest_is_a_precondition_failure() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let tree = engine(tmp.path());
    fs::remove_file(tree.join("browser/extensions/moz.build")).expect("rm");

    let err = integrate_addons(
        &FakeIo::default(),
        &CommitLog::default(),
        &Log::new(Arc::new(MemorySink::default())),
        &config(),
        &tree,
        &tmp.path().join("dl"),
    )
    .expect_err("no manifest");
    assert!(err.operator_must_fix());
}

fn have_git() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git_out(tree: &Path, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(tree)
        .output()
        .expect("git");
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn reruns_commit_only_the_addon_and_only_when_it_changed() {
    if !have_git() {
        return;
    }
    let tmp = tempfile::tempdir().expect("tempdir");
    let tree = tmp.path().join("engine");
    fs::create_dir_all(tree.join("browser/extensions")).expect("mkdir");
    fs::write(
        tree.join("browser/extensions/moz.build"),
        "DIRS += [\n    \"pdfjs\",\n]\n",
    )
    .expect("moz.build");
    fs::write(tree.join("patched.c"), "int x = 1;\n").expect("source");

    let log = Log::new(Arc::new(MemorySink::default()));
    let opts = DispatchOptions::default()
        .env_var("GIT_AUTHOR_NAME", "kiln")
        .env_var("GIT_AUTHOR_EMAIL", "kiln@localhost")
        .env_var("GIT_COMMITTER_NAME", "kiln")
        .env_var("GIT_COMMITTER_EMAIL", "kiln@localhost");
    let git = GitEngine::new("git", log.clone(), opts);
    git.init(&tree).expect("init");
    git.add_all(&tree).expect("add");
    git.commit(&tree, "base").expect("base commit");
    fs::write(tree.join("patched.c"), "int x = 2;\n").expect("patch source");

    let mut cfg = config();
    cfg.entries.remove("tabs");
    let downloads = tmp.path().join(".kiln/downloads");
    for run in 1..=3 {
        integrate_addons(&FakeIo::default(), &git, &log, &cfg, &tree, &downloads)
            .unwrap_or_else(|e| panic!("run {run}: {e}"));
    }

    assert_eq!(
        git_out(&tree, &["log", "--format=%s"]),
        "Add add-on ublock\nbase\n"
    );
    let committed = git_out(&tree, &["show", "--name-only", "--format=", "HEAD"]);
    assert!(committed.contains("browser/extensions/ublock/manifest.json"));
    assert!(!committed.contains("patched.c"), "{committed}");
    assert!(!committed.contains("browser/extensions/moz.build"), "{committed}");

    let status = git_out(&tree, &["status", "--porcelain"]);
    assert!(status.contains(" M patched.c"), "{status}");
    assert!(status.contains(" M browser/extensions/moz.build"), "{status}");
}
