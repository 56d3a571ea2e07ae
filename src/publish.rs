//! Publish workflow: one-shot and multi-request (start/file/finish), both
//! ending at the same common finalization.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::db::manifest::ServerBuildRow;
use crate::db::{ContentStore, ManifestStore};
use crate::error::PublishError;
use crate::hashing::{ObjectHash, canonical_manifest_text};
use crate::layout::{self, BuildLayout};

/// A classified publish artifact.
enum Classified {
    Client(String),
    Server { platform: String, file_name: String },
    Unrecognized,
}

fn classify(name: &str, client_zip_name: &str, server_zip_name: &str) -> Classified {
    if name == format!("{client_zip_name}.zip") {
        return Classified::Client(name.to_string());
    }
    if let Some(rest) = name.strip_prefix(server_zip_name)
        && let Some(platform) = rest.strip_suffix(".zip")
    {
        return Classified::Server {
            platform: platform.trim_start_matches(['_', '-']).to_string(),
            file_name: name.to_string(),
        };
    }
    Classified::Unrecognized
}

struct ClassifiedArtifacts {
    client: Option<String>,
    servers: Vec<(String, String)>,
}

fn classify_all(names: &[String], client_zip_name: &str, server_zip_name: &str) -> ClassifiedArtifacts {
    let mut client = None;
    let mut servers = Vec::new();
    for name in names {
        match classify(name, client_zip_name, server_zip_name) {
            Classified::Client(n) => client = Some(n),
            Classified::Server { platform, file_name } => servers.push((platform, file_name)),
            Classified::Unrecognized => {}
        }
    }
    ClassifiedArtifacts { client, servers }
}

/// One-shot publish: downloads `archive_url` to a delete-on-close temp file,
/// opens it as a zip, and extracts its classified inner entries into the
/// version directory.
pub async fn publish_one_shot(
    content: &ContentStore,
    manifest: &ManifestStore,
    layout: &BuildLayout,
    http: &reqwest::Client,
    fork: &str,
    version: &str,
    engine_version: &str,
    client_zip_name: &str,
    server_zip_name: &str,
    archive_url: &str,
    base_url: &str,
) -> Result<i64, PublishError> {
    if manifest.version_exists(fork, version)? {
        return Err(PublishError::VersionExists {
            fork: fork.to_string(),
            version: version.to_string(),
        });
    }

    let mut temp = tempfile::NamedTempFile::new()?;
    let response = http.get(archive_url).send().await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        temp.write_all(&chunk)?;
    }
    temp.flush()?;
    temp.seek(SeekFrom::Start(0))?;

    let version_dir = layout.version_dir(fork, version)?;
    std::fs::create_dir_all(&version_dir)?;

    let result = (|| -> Result<i64, PublishError> {
        let mut archive = ZipArchive::new(temp.reopen()?)?;
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).map(|f| f.name().to_string()))
            .collect::<Result<_, _>>()?;

        for name in &names {
            let mut entry = archive.by_name(name)?;
            if entry.is_dir() || name.ends_with('/') {
                continue;
            }
            layout::validate_file_component(name)?;
            let out_path = version_dir.join(name);
            let mut out = File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out)?;
        }

        finalize(content, manifest, &version_dir, fork, version, engine_version, client_zip_name, server_zip_name, base_url)
    })();

    match result {
        Ok(version_id) => Ok(version_id),
        Err(err) => {
            let _ = std::fs::remove_dir_all(&version_dir);
            Err(err)
        }
    }
}

/// `/start`: creates a `PublishInProgress` row, aborting any prior one for
/// the same `(fork, version)` (files deleted, row removed, then recreated).
pub fn start_multi_publish(
    manifest: &ManifestStore,
    layout: &BuildLayout,
    fork: &str,
    version: &str,
    engine_version: &str,
) -> Result<(), PublishError> {
    let start_time = chrono::Utc::now().to_rfc3339();
    let aborted_prior = manifest.start_publish(fork, version, engine_version, &start_time)?;
    let version_dir = layout.version_dir(fork, version)?;
    if aborted_prior {
        let _ = std::fs::remove_dir_all(&version_dir);
    }
    std::fs::create_dir_all(&version_dir)?;
    Ok(())
}

/// `/file`: streams `data` into `<versionDir>/<file_name>`, rejecting if the
/// destination already exists.
pub fn write_multi_publish_file(
    layout: &BuildLayout,
    fork: &str,
    version: &str,
    file_name: &str,
    data: &[u8],
) -> Result<(), PublishError> {
    layout::validate_publish_file_name(file_name)?;
    let path = layout.artifact_path(fork, version, file_name)?;
    if path.exists() {
        return Err(PublishError::FileExists(file_name.to_string()));
    }
    let mut out = File::create(&path)?;
    out.write_all(data)?;
    Ok(())
}

/// `/finish`: classifies on-disk artifacts, requires exactly one client
/// artifact, then runs common finalization. On any failure the version
/// directory and in-progress row are removed (abort).
pub fn finish_multi_publish(
    content: &ContentStore,
    manifest: &ManifestStore,
    layout: &BuildLayout,
    fork: &str,
    version: &str,
    engine_version: &str,
    client_zip_name: &str,
    server_zip_name: &str,
    base_url: &str,
) -> Result<i64, PublishError> {
    let version_dir = layout.version_dir(fork, version)?;

    let result = (|| -> Result<i64, PublishError> {
        if manifest.version_exists(fork, version)? {
            return Err(PublishError::VersionExists {
                fork: fork.to_string(),
                version: version.to_string(),
            });
        }
        let names = list_version_files(&version_dir)?;
        let classified = classify_all(&names, client_zip_name, server_zip_name);
        if classified.client.is_none() {
            return Err(PublishError::MissingClientArtifact);
        }
        finalize(content, manifest, &version_dir, fork, version, engine_version, client_zip_name, server_zip_name, base_url)
    })();

    match result {
        Ok(version_id) => {
            manifest.finish_publish(fork, version)?;
            Ok(version_id)
        }
        Err(err) => {
            let _ = std::fs::remove_dir_all(&version_dir);
            manifest.finish_publish(fork, version)?;
            Err(err)
        }
    }
}

fn list_version_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file()
            && let Some(name) = entry.file_name().to_str()
        {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Common finalization: compute checksums and manifest hash from the
/// on-disk client zip, generate `build.json`, inject it into every server
/// artifact, and commit the `ForkVersion` row.
#[allow(clippy::too_many_arguments)]
fn finalize(
    _content: &ContentStore,
    manifest: &ManifestStore,
    version_dir: &Path,
    fork: &str,
    version: &str,
    engine_version: &str,
    client_zip_name: &str,
    server_zip_name: &str,
    base_url: &str,
) -> Result<i64, PublishError> {
    let names = list_version_files(version_dir)?;
    let classified = classify_all(&names, client_zip_name, server_zip_name);
    let client_file = classified.client.clone().ok_or(PublishError::MissingClientArtifact)?;
    let client_path = version_dir.join(&client_file);

    let client_sha256 = sha256_file(&client_path)?;
    let manifest_hash = manifest_hash_from_zip(&client_path)?;

    let build_json = generate_build_json(base_url, &client_sha256, &manifest_hash, engine_version);

    let mut server_builds = Vec::with_capacity(classified.servers.len());
    for (platform, file_name) in &classified.servers {
        let server_path = version_dir.join(file_name);
        inject_build_json(&server_path, &build_json)?;
        let sha256 = sha256_file(&server_path)?;
        let size = std::fs::metadata(&server_path)?.len() as i64;
        server_builds.push(ServerBuildRow {
            platform: platform.clone(),
            file_name: file_name.clone(),
            sha256,
            size: Some(size),
        });
    }

    let publish_time = chrono::Utc::now().to_rfc3339();
    let version_id = manifest.insert_fork_version(
        fork,
        version,
        &publish_time,
        engine_version,
        &client_file,
        &client_sha256,
        &server_builds,
    )?;

    Ok(version_id)
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Reopens the client zip, sorts entries ordinally, hashes each entry's
/// contents with BLAKE2b, and hashes the resulting canonical manifest text.
fn manifest_hash_from_zip(path: &Path) -> Result<ObjectHash, PublishError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;

    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).map(|f| f.name().to_string()))
        .collect::<Result<_, _>>()?;
    names.sort();

    let mut entries = Vec::with_capacity(names.len());
    for name in &names {
        let mut entry = archive.by_name(name)?;
        if entry.is_dir() || name.ends_with('/') {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        entries.push((ObjectHash::hash(&data), name.clone()));
    }

    let text = canonical_manifest_text(&entries);
    Ok(ObjectHash::hash(text.as_bytes()))
}

fn generate_build_json(base_url: &str, client_sha256: &str, manifest_hash: &ObjectHash, engine_version: &str) -> Vec<u8> {
    let manifest_url = format!("{base_url}fork/{{FORK_ID}}/version/{{FORK_VERSION}}/manifest");
    let manifest_download_url = format!("{base_url}fork/{{FORK_ID}}/version/{{FORK_VERSION}}/download");
    let doc = serde_json::json!({
        "download": manifest_download_url,
        "version": "{FORK_VERSION}",
        "hash": client_sha256,
        "fork_id": "{FORK_ID}",
        "engine_version": engine_version,
        "manifest_url": manifest_url,
        "manifest_download_url": manifest_download_url,
        "manifest_hash": manifest_hash.to_hex_lower(),
    });
    serde_json::to_vec_pretty(&doc).expect("build.json is always serializable")
}

/// Rewrites `zip_path` with any existing `build.json` entry removed and a
/// new one containing `build_json_bytes` added, then atomically replaces the
/// original. In-place zip update isn't available in the `zip` crate's
/// read/write split, so this follows spec.md 9's documented fallback.
fn inject_build_json(zip_path: &Path, build_json_bytes: &[u8]) -> Result<(), PublishError> {
    let input = File::open(zip_path)?;
    let mut archive = ZipArchive::new(input)?;

    let temp_path = zip_path.with_extension("zip.tmp");
    let output = File::create(&temp_path)?;
    let mut writer = zip::ZipWriter::new(output);
    let options: zip::write::FileOptions<'_, ()> =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.name() == "build.json" {
            continue;
        }
        writer.start_file(entry.name().to_string(), options)?;
        std::io::copy(&mut entry, &mut writer)?;
    }

    writer.start_file("build.json", options)?;
    writer.write_all(build_json_bytes)?;
    writer.finish()?;

    std::fs::rename(&temp_path, zip_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options: zip::write::FileOptions<'_, ()> =
                zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn classifies_client_and_server_artifacts() {
        let names = vec![
            "client.zip".to_string(),
            "server_linux-x64.zip".to_string(),
            "server_win-x64.zip".to_string(),
            "readme.txt".to_string(),
        ];
        let classified = classify_all(&names, "client", "server");
        assert_eq!(classified.client, Some("client.zip".to_string()));
        assert_eq!(classified.servers.len(), 2);
        assert!(classified.servers.iter().any(|(p, _)| p == "linux-x64"));
    }

    #[test]
    fn multi_publish_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let content = ContentStore::open(Path::new(":memory:"), 1).unwrap();
        let manifest = ManifestStore::open(Path::new(":memory:"), 1).unwrap();
        manifest.upsert_fork("wow", "tok", "client", "server", false, "{}", "[]", None).unwrap();
        let layout = BuildLayout::new(tmp.path());

        start_multi_publish(&manifest, &layout, "wow", "1.0.0", "200.0.0").unwrap();

        let client_zip = zip_bytes(&[("a.txt", b"hello")]);
        write_multi_publish_file(&layout, "wow", "1.0.0", "client.zip", &client_zip).unwrap();

        let server_zip = zip_bytes(&[("server_bin", b"binary-content")]);
        write_multi_publish_file(&layout, "wow", "1.0.0", "server_linux-x64.zip", &server_zip).unwrap();

        let version_id = finish_multi_publish(
            &content, &manifest, &layout, "wow", "1.0.0", "200.0.0", "client", "server", "https://cdn.example.com/",
        )
        .unwrap();

        assert!(manifest.version_exists("wow", "1.0.0").unwrap());
        assert!(!manifest.in_progress_exists("wow", "1.0.0").unwrap());
        let builds = manifest.server_builds(version_id).unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].platform, "linux-x64");

        let server_zip_path = layout.artifact_path("wow", "1.0.0", "server_linux-x64.zip").unwrap();
        let file = File::open(server_zip_path).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        let mut build_json_entry = archive.by_name("build.json").unwrap();
        let mut contents = String::new();
        build_json_entry.read_to_string(&mut contents).unwrap();
        assert!(contents.contains("{FORK_ID}"));
    }

    #[test]
    fn finish_without_client_artifact_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let content = ContentStore::open(Path::new(":memory:"), 1).unwrap();
        let manifest = ManifestStore::open(Path::new(":memory:"), 1).unwrap();
        manifest.upsert_fork("wow", "tok", "client", "server", false, "{}", "[]", None).unwrap();
        let layout = BuildLayout::new(tmp.path());

        start_multi_publish(&manifest, &layout, "wow", "1.0.0", "200.0.0").unwrap();
        let result = finish_multi_publish(
            &content, &manifest, &layout, "wow", "1.0.0", "200.0.0", "client", "server", "https://cdn.example.com/",
        );
        assert!(matches!(result, Err(PublishError::MissingClientArtifact)));
        assert!(!manifest.in_progress_exists("wow", "1.0.0").unwrap());
    }

    #[test]
    fn restarting_publish_clears_prior_files() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = ManifestStore::open(Path::new(":memory:"), 1).unwrap();
        manifest.upsert_fork("wow", "tok", "client", "server", false, "{}", "[]", None).unwrap();
        let layout = BuildLayout::new(tmp.path());

        start_multi_publish(&manifest, &layout, "wow", "2.3.0", "200.0.0").unwrap();
        write_multi_publish_file(&layout, "wow", "2.3.0", "client.zip", b"partial").unwrap();
        write_multi_publish_file(&layout, "wow", "2.3.0", "server_linux-x64.zip", b"partial").unwrap();

        start_multi_publish(&manifest, &layout, "wow", "2.3.0", "200.0.0").unwrap();
        let version_dir = layout.version_dir("wow", "2.3.0").unwrap();
        let remaining: Vec<_> = std::fs::read_dir(&version_dir).unwrap().collect();
        assert!(remaining.is_empty());
    }
}
