//! Release updater for the zapret bundle
//!
//! Features:
//! - Resolve the latest tag from the GitHub "releases/latest" redirect
//! - Download the tagged zip (no timeout, archives can be large)
//! - Unpack into releases/<tag> through a staging directory
//! - Idempotent: an existing releases/<tag> is never downloaded again

use crate::error::{HostError, Result};
use crate::settings::Settings;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "zapret-ui/1.0";
const CHECK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackOutcome {
    AlreadyPresent,
    Unpacked,
}

#[derive(Clone)]
pub struct ReleaseUpdater {
    settings: Settings,
    check_client: reqwest::Client,
    download_client: reqwest::Client,
}

impl ReleaseUpdater {
    pub fn new(settings: &Settings) -> Result<Self> {
        let check_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(CHECK_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        let download_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            settings: settings.clone(),
            check_client,
            download_client,
        })
    }

    pub fn release_path(&self, tag: &str) -> PathBuf {
        self.settings.releases_dir().join(tag)
    }

    /// Resolve the latest published tag
    pub async fn latest_tag(&self) -> Result<String> {
        let url = &self.settings.latest_url;
        debug!(url = %url, "checking latest release");

        let response = self.check_client.get(url).send().await?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| response.url().to_string());

        tag_from_url(&location)
            .ok_or_else(|| HostError::Network(format!("cannot parse latest tag from {}", location)))
    }

    /// Download and unpack `tag` unless it is already present
    pub async fn download_and_unpack(&self, tag: &str) -> Result<UnpackOutcome> {
        if tag.is_empty() {
            return Err(HostError::NotFound("release tag is empty".to_string()));
        }

        tokio::fs::create_dir_all(self.settings.releases_dir()).await?;
        let target = self.release_path(tag);
        if tokio::fs::metadata(&target).await.map(|m| m.is_dir()).unwrap_or(false) {
            debug!(tag, "release already unpacked");
            return Ok(UnpackOutcome::AlreadyPresent);
        }

        let url = self.settings.download_url(tag);
        info!("Downloading release {} from {}", tag, url);

        let response = self.download_client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(HostError::Download(format!("{} ({})", response.status(), url)));
        }
        let bytes = response.bytes().await?;
        info!("Downloaded {} bytes, unpacking", bytes.len());

        tokio::task::spawn_blocking(move || unpack_archive(&bytes, &target))
            .await
            .map_err(|e| HostError::Archive(format!("unpack task failed: {}", e)))??;

        info!("Release {} unpacked", tag);
        Ok(UnpackOutcome::Unpacked)
    }
}

/// Last non-empty path segment of a URL
fn tag_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(str::to_string)
}

/// Extract a zip into `target`. Work happens in a sibling staging directory
/// that is renamed into place only once every entry is written.
pub fn unpack_archive(data: &[u8], target: &Path) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| HostError::NotFound(format!("no parent for {}", target.display())))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{}-{}.partial", name, uuid::Uuid::new_v4()));

    if let Err(e) = extract_into(data, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&staging, target) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    Ok(())
}

fn extract_into(data: &[u8], dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    std::fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping archive entry outside destination");
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // CRC and deflate failures only surface while reading the entry
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| HostError::Archive(format!("{}: {}", entry.name(), e)))?;
        let mut out = std::fs::File::create(&out_path)?;
        out.write_all(&content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn bundle_zip() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let opts = zip::write::SimpleFileOptions::default();
        writer.add_directory("bin/", opts).unwrap();
        writer.start_file("bin/winws.exe", opts).unwrap();
        writer.write_all(b"MZ").unwrap();
        writer.start_file("general.bat", opts).unwrap();
        writer.write_all(b"@echo off").unwrap();
        writer.start_file("utils/test zapret.ps1", opts).unwrap();
        writer.write_all(b"Write-Host test").unwrap();
        writer.finish().unwrap().into_inner()
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn settings_for(base: &str, dir: &Path) -> Settings {
        let mut settings = Settings::with_base_dir(dir);
        settings.latest_url = format!("{base}/releases/latest");
        settings.download_template = format!("{base}/download/{{tag}}/bundle-{{tag}}.zip");
        settings
    }

    #[test]
    fn test_tag_from_url() {
        assert_eq!(
            tag_from_url("https://github.com/Flowseal/zapret-discord-youtube/releases/tag/1.8.3"),
            Some("1.8.3".to_string())
        );
        assert_eq!(tag_from_url("https://x/releases/tag/1.9.0/"), Some("1.9.0".to_string()));
        assert_eq!(tag_from_url("https://x/tag/1.9.0?ref=y"), Some("1.9.0".to_string()));
        assert_eq!(tag_from_url(""), None);
    }

    #[tokio::test]
    async fn test_latest_tag_from_redirect() {
        let app = Router::new().route(
            "/releases/latest",
            get(|| async {
                (
                    StatusCode::FOUND,
                    [(header::LOCATION, "https://github.com/o/r/releases/tag/1.9.2")],
                )
            }),
        );
        let base = serve(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let updater = ReleaseUpdater::new(&settings_for(&base, tmp.path())).unwrap();

        assert_eq!(updater.latest_tag().await.unwrap(), "1.9.2");
    }

    #[tokio::test]
    async fn test_latest_tag_falls_back_to_request_url() {
        let app = Router::new().route("/releases/tag/2.0.0/", get(|| async { "ok" }));
        let base = serve(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = settings_for(&base, tmp.path());
        settings.latest_url = format!("{base}/releases/tag/2.0.0/");
        let updater = ReleaseUpdater::new(&settings).unwrap();

        assert_eq!(updater.latest_tag().await.unwrap(), "2.0.0");
    }

    #[tokio::test]
    async fn test_latest_tag_network_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings::with_base_dir(tmp.path());
        settings.latest_url = "http://127.0.0.1:1/releases/latest".to_string();
        let updater = ReleaseUpdater::new(&settings).unwrap();

        assert!(matches!(updater.latest_tag().await, Err(HostError::Network(_))));
    }

    #[tokio::test]
    async fn test_unpack_is_idempotent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let archive = bundle_zip();
        let app = Router::new().route(
            "/download/{tag}/{file}",
            get(move || {
                let counter = counter.clone();
                let archive = archive.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    archive
                }
            }),
        );
        let base = serve(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let updater = ReleaseUpdater::new(&settings_for(&base, tmp.path())).unwrap();

        assert_eq!(updater.download_and_unpack("1.9.2").await.unwrap(), UnpackOutcome::Unpacked);
        assert_eq!(
            updater.download_and_unpack("1.9.2").await.unwrap(),
            UnpackOutcome::AlreadyPresent
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let root = updater.release_path("1.9.2");
        assert_eq!(std::fs::read(root.join("bin/winws.exe")).unwrap(), b"MZ");
        assert!(root.join("general.bat").is_file());
        assert!(root.join("utils/test zapret.ps1").is_file());
    }

    #[tokio::test]
    async fn test_http_error_is_download_error() {
        let app = Router::new().route(
            "/download/{tag}/{file}",
            get(|| async { StatusCode::NOT_FOUND }),
        );
        let base = serve(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let updater = ReleaseUpdater::new(&settings_for(&base, tmp.path())).unwrap();

        let err = updater.download_and_unpack("9.9.9").await.unwrap_err();
        assert!(matches!(err, HostError::Download(_)), "{err}");
        assert!(!updater.release_path("9.9.9").exists());
    }

    #[tokio::test]
    async fn test_corrupt_archive_leaves_nothing_behind() {
        let app = Router::new().route(
            "/download/{tag}/{file}",
            get(|| async { b"definitely not a zip".to_vec() }),
        );
        let base = serve(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let updater = ReleaseUpdater::new(&settings_for(&base, tmp.path())).unwrap();

        let err = updater.download_and_unpack("1.0.0").await.unwrap_err();
        assert!(matches!(err, HostError::Archive(_)), "{err}");
        assert!(!updater.release_path("1.0.0").exists());
        let leftovers = std::fs::read_dir(tmp.path().join("releases")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_corrupt_entry_is_archive_error() {
        let payload = b"winws payload that will be damaged";
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let opts = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("bin/winws.exe", opts).unwrap();
        writer.write_all(payload).unwrap();
        let mut data = writer.finish().unwrap().into_inner();

        let at = data
            .windows(payload.len())
            .position(|w| w == payload)
            .unwrap();
        data[at + 3] ^= 0xFF;

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("1.2.3");
        let err = unpack_archive(&data, &target).unwrap_err();
        assert!(matches!(err, HostError::Archive(_)), "{err:?}");
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_tag_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let updater = ReleaseUpdater::new(&Settings::with_base_dir(tmp.path())).unwrap();
        assert!(matches!(
            updater.download_and_unpack("").await,
            Err(HostError::NotFound(_))
        ));
    }
}
