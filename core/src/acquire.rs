//! Scenario acquisition: download, decryption, extraction and integrity
//! check of the published measurement files.
//!
//! Each scenario is published as an encrypted `tar.bz2` archive holding
//! `<scenario>.h5`.  The expected SHA-256 of every `.h5` file is listed in a
//! checksum manifest (`scenarios.checksum`, `sha256sum` format) shipped
//! next to the code.  Acquisition runs four steps, each of which is skipped
//! when its output already exists (unless `overwrite` is set):
//!
//! ```text
//! <out>/.tmp/<id>.tar.bz2.encrypted --openssl--> <out>/.tmp/<id>.tar.bz2 --tar--> <out>/<id>.h5
//! ```
//!
//! Decryption and extraction shell out to `openssl` and `tar`.  The HTTP
//! download needs the `fetch` feature.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

pub const DEFAULT_SERVER: &str = "https://ftp.tu-ilmenau.de";
pub const DEFAULT_REMOTE_DIR: &str = "/hpc-private/ems1/test1/";
pub const CHECKSUM_FILE: &str = "scenarios.checksum";

/// Read size when hashing (8 MiB).
const HASH_CHUNK: usize = 1 << 23;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("network error: {0}")]
    Network(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("scenario '{0}' is not listed in the checksum manifest")]
    UnknownScenario(String),

    #[error("invalid checksum manifest, line {line}: {reason}")]
    Manifest { line: usize, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> AcquireError + '_ {
    move |source| AcquireError::Io {
        path: path.display().to_string(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// Expected SHA-256 per published file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: BTreeMap<String, String>,
}

impl ChecksumManifest {
    /// Parse `<sha256-hex>  <file>` lines (two spaces, as written by
    /// `sha256sum`).  Blank lines are ignored.
    pub fn parse(text: &str) -> Result<Self, AcquireError> {
        let mut entries = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let bad = |reason: &str| AcquireError::Manifest {
                line: n + 1,
                reason: reason.to_string(),
            };
            let (hash, file) = line.split_once("  ").ok_or_else(|| bad("expected '<hash>  <file>'"))?;
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(bad("hash is not 64 hex digits"));
            }
            if file.is_empty() {
                return Err(bad("missing file name"));
            }
            entries.insert(file.to_string(), hash.to_ascii_lowercase());
        }
        Ok(Self { entries })
    }

    pub fn from_file(path: &Path) -> Result<Self, AcquireError> {
        let text = fs::read_to_string(path).map_err(io_error(path))?;
        Self::parse(&text)
    }

    /// Scenario ids: listed `.h5` files without their extension.
    pub fn scenarios(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter_map(|file| file.strip_suffix(".h5"))
            .map(str::to_string)
            .collect()
    }

    /// Expected hash of `<scenario>.h5`.
    pub fn expected(&self, scenario: &str) -> Option<&str> {
        self.entries.get(&format!("{}.h5", scenario)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lowercase hex SHA-256 of a file, read in 8 MiB chunks.
pub fn sha256_file(path: &Path) -> Result<String, AcquireError> {
    let mut file = File::open(path).map_err(io_error(path))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buffer).map_err(io_error(path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file against its expected hash.
pub fn verify_file(path: &Path, expected: &str) -> Result<(), AcquireError> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(AcquireError::IntegrityMismatch {
            file: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    info!("SHA-256 of {} matches the manifest", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Paths and options
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquireOptions {
    pub server: String,
    /// Directory on the server, with leading and trailing slash.
    pub remote_dir: String,
    /// Redo every step even if its output exists.
    pub overwrite: bool,
    /// Check the extracted file against the manifest.
    pub verify: bool,
    /// Delete the temporary archives afterwards.
    pub cleanup: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
            overwrite: false,
            verify: true,
            cleanup: true,
        }
    }
}

/// Every location involved in acquiring one scenario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScenarioPaths {
    pub url: String,
    pub tmp_dir: PathBuf,
    pub encrypted: PathBuf,
    pub archive: PathBuf,
    pub h5: PathBuf,
    /// Archive member holding the measurement.
    pub member: String,
}

impl ScenarioPaths {
    pub fn new(output_dir: &Path, scenario: &str, options: &AcquireOptions) -> Self {
        let tmp_dir = output_dir.join(".tmp");
        Self {
            url: format!("{}{}{}.tar.bz2", options.server, options.remote_dir, scenario),
            encrypted: tmp_dir.join(format!("{}.tar.bz2.encrypted", scenario)),
            archive: tmp_dir.join(format!("{}.tar.bz2", scenario)),
            h5: output_dir.join(format!("{}.h5", scenario)),
            member: format!("{}.h5", scenario),
            tmp_dir,
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Stream `url` into `out_file`.
///
/// Bytes land in `<out_file>.part` first, which is renamed only once the
/// transfer is complete, so `out_file` never holds a partial download.
#[cfg(feature = "fetch")]
pub fn download(url: &str, out_file: &Path) -> Result<u64, AcquireError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .map_err(|e| AcquireError::Network(format!("failed to create HTTP client: {}", e)))?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| AcquireError::Network(format!("request to {} failed: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(AcquireError::Network(format!("HTTP {} for {}", response.status(), url)));
    }
    let expected = response.content_length();
    info!(
        "Downloading {} ({} bytes)",
        url,
        expected.map_or_else(|| "unknown".to_string(), |n| n.to_string())
    );

    let part = part_path(out_file);
    let written = match receive(&mut response, &part, url, expected) {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
    };
    fs::rename(&part, out_file).map_err(io_error(out_file))?;
    Ok(written)
}

#[cfg(feature = "fetch")]
fn receive(
    response: &mut reqwest::blocking::Response,
    part: &Path,
    url: &str,
    expected: Option<u64>,
) -> Result<u64, AcquireError> {
    let mut file = File::create(part).map_err(io_error(part))?;
    let written = io::copy(response, &mut file)
        .map_err(|e| AcquireError::Network(format!("transfer of {} interrupted: {}", url, e)))?;
    file.flush().map_err(io_error(part))?;

    if let Some(expected) = expected.filter(|&n| n != 0 && n != written) {
        return Err(AcquireError::Network(format!(
            "received {} of {} bytes from {}",
            written, expected, url
        )));
    }
    Ok(written)
}

#[cfg(not(feature = "fetch"))]
pub fn download(url: &str, _out_file: &Path) -> Result<u64, AcquireError> {
    Err(AcquireError::Network(format!(
        "downloading {} requires the `fetch` feature",
        url
    )))
}

/// Temporary name a download is written under until it completes.
pub fn part_path(out_file: &Path) -> PathBuf {
    let mut name = out_file.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Decrypt an AES-256 `openssl enc` file.  The password is passed on
/// stdin, never on the command line.
pub fn decrypt_file(in_file: &Path, password: &str, out_file: &Path) -> Result<(), AcquireError> {
    info!("Decrypting {} as {}", in_file.display(), out_file.display());
    let mut child = Command::new("openssl")
        .args(["enc", "-d", "-aes256", "-pass", "stdin", "-in"])
        .arg(in_file)
        .arg("-out")
        .arg(out_file)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| AcquireError::Decryption(format!("cannot run openssl: {}", e)))?;

    // stdin is closed when the handle drops, before waiting on the child.
    let fed = match child.stdin.take() {
        Some(mut stdin) => writeln!(stdin, "{}", password),
        None => Ok(()),
    };
    let output = child.wait_with_output();
    let output = match (fed, output) {
        (Ok(()), Ok(output)) => output,
        (Err(e), _) => {
            let _ = fs::remove_file(out_file);
            return Err(AcquireError::Decryption(format!("cannot pass password to openssl: {}", e)));
        }
        (_, Err(e)) => {
            let _ = fs::remove_file(out_file);
            return Err(AcquireError::Decryption(format!("openssl did not finish: {}", e)));
        }
    };

    if !output.status.success() {
        let _ = fs::remove_file(out_file);
        return Err(AcquireError::Decryption(format!(
            "openssl exited with {} ({}); is the password correct?",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim(),
        )));
    }
    Ok(())
}

/// Extract one member of a `tar.bz2` archive into `out_dir`.
pub fn extract_member(archive: &Path, out_dir: &Path, member: &str) -> Result<PathBuf, AcquireError> {
    info!("Unpacking {} from {} to {}", member, archive.display(), out_dir.display());
    let output = Command::new("tar")
        .arg("-xjf")
        .arg(archive)
        .arg("-C")
        .arg(out_dir)
        .arg(member)
        .output()
        .map_err(|e| AcquireError::Extraction(format!("cannot run tar: {}", e)))?;

    if !output.status.success() {
        return Err(AcquireError::Extraction(format!(
            "tar exited with {} ({})",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim(),
        )));
    }
    let extracted = out_dir.join(member);
    if !extracted.exists() {
        return Err(AcquireError::Extraction(format!(
            "{} not found in {}",
            member,
            archive.display()
        )));
    }
    Ok(extracted)
}

// ---------------------------------------------------------------------------
// Acquirer
// ---------------------------------------------------------------------------

/// Fetches scenarios into one output directory.
#[derive(Clone, Debug)]
pub struct Acquirer {
    manifest: ChecksumManifest,
    output_dir: PathBuf,
    options: AcquireOptions,
}

impl Acquirer {
    pub fn new(manifest: ChecksumManifest, output_dir: impl Into<PathBuf>, options: AcquireOptions) -> Self {
        Self {
            manifest,
            output_dir: output_dir.into(),
            options,
        }
    }

    pub fn manifest(&self) -> &ChecksumManifest {
        &self.manifest
    }

    pub fn paths(&self, scenario: &str) -> ScenarioPaths {
        ScenarioPaths::new(&self.output_dir, scenario, &self.options)
    }

    /// Make `<out>/<scenario>.h5` available and return its path.
    pub fn acquire(&self, scenario: &str, password: &str) -> Result<PathBuf, AcquireError> {
        let expected = self
            .manifest
            .expected(scenario)
            .ok_or_else(|| AcquireError::UnknownScenario(scenario.to_string()))?;
        let paths = self.paths(scenario);

        if paths.h5.exists() && !self.options.overwrite {
            if !self.options.verify {
                warn!("Skipping SHA-256 check of existing {}", paths.h5.display());
                return Ok(paths.h5);
            }
            match verify_file(&paths.h5, expected) {
                Ok(()) => {
                    info!("{} already present and verified", paths.h5.display());
                    return Ok(paths.h5);
                }
                Err(AcquireError::IntegrityMismatch { actual, .. }) => {
                    warn!(
                        "Existing {} has SHA-256 {}; acquiring it again",
                        paths.h5.display(),
                        actual
                    );
                }
                Err(e) => return Err(e),
            }
        }

        fs::create_dir_all(&paths.tmp_dir).map_err(io_error(&paths.tmp_dir))?;

        let reused = paths.encrypted.exists() && !self.options.overwrite;
        if reused {
            info!("Reusing previously downloaded {}", paths.encrypted.display());
        } else {
            download(&paths.url, &paths.encrypted)?;
        }

        if !paths.archive.exists() || self.options.overwrite {
            match decrypt_file(&paths.encrypted, password, &paths.archive) {
                Ok(()) => {}
                // A leftover download may be damaged; fetch it once more.
                Err(e) if reused => {
                    warn!("{}; downloading {} again", e, paths.encrypted.display());
                    fs::remove_file(&paths.encrypted).map_err(io_error(&paths.encrypted))?;
                    download(&paths.url, &paths.encrypted)?;
                    decrypt_file(&paths.encrypted, password, &paths.archive)?;
                }
                Err(e) => return Err(e),
            }
        } else {
            info!("Reusing previously decrypted {}", paths.archive.display());
        }

        let h5 = extract_member(&paths.archive, &self.output_dir, &paths.member)?;

        if self.options.verify {
            verify_file(&h5, expected)?;
        } else {
            warn!("Skipping SHA-256 check of {}", h5.display());
        }

        if self.options.cleanup {
            self.cleanup(&paths)?;
        }
        Ok(h5)
    }

    fn cleanup(&self, paths: &ScenarioPaths) -> Result<(), AcquireError> {
        for file in [&paths.encrypted, &paths.archive] {
            if file.exists() {
                fs::remove_file(file).map_err(io_error(file))?;
            }
        }
        // Other scenarios may still have temporaries in the directory.
        if let Err(e) = fs::remove_dir(&paths.tmp_dir) {
            debug!("keeping {}: {}", paths.tmp_dir.display(), e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn manifest_for(scenario: &str, hash: &str) -> ChecksumManifest {
        ChecksumManifest::parse(&format!("{}  {}.h5\n", hash, scenario)).unwrap()
    }

    fn offline_options() -> AcquireOptions {
        AcquireOptions {
            server: "http://127.0.0.1:9".to_string(),
            ..AcquireOptions::default()
        }
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.bin");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), ABC_SHA256);
    }

    #[test]
    fn manifest_lists_scenarios() {
        let text = format!(
            "{}  1_sinwave.h5\n\n{}  2_circle.h5\n",
            ABC_SHA256,
            ABC_SHA256.to_uppercase()
        );
        let manifest = ChecksumManifest::parse(&text).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.scenarios(), vec!["1_sinwave", "2_circle"]);
        assert_eq!(manifest.expected("2_circle"), Some(ABC_SHA256));
        assert_eq!(manifest.expected("3_missing"), None);
    }

    #[test]
    fn manifest_rejects_malformed_lines() {
        let err = ChecksumManifest::parse("deadbeef  x.h5\n").unwrap_err();
        assert!(matches!(err, AcquireError::Manifest { line: 1, .. }));

        let err = ChecksumManifest::parse(&format!("{}  a.h5\n{} b.h5\n", ABC_SHA256, ABC_SHA256)).unwrap_err();
        assert!(matches!(err, AcquireError::Manifest { line: 2, .. }));
    }

    #[test]
    fn scenario_paths_follow_server_layout() {
        let paths = ScenarioPaths::new(Path::new("/data"), "1_sinwave", &AcquireOptions::default());
        assert_eq!(
            paths.url,
            "https://ftp.tu-ilmenau.de/hpc-private/ems1/test1/1_sinwave.tar.bz2"
        );
        assert_eq!(paths.encrypted, Path::new("/data/.tmp/1_sinwave.tar.bz2.encrypted"));
        assert_eq!(paths.archive, Path::new("/data/.tmp/1_sinwave.tar.bz2"));
        assert_eq!(paths.h5, Path::new("/data/1_sinwave.h5"));
        assert_eq!(paths.member, "1_sinwave.h5");
    }

    #[test]
    fn verify_reports_both_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.h5");
        fs::write(&path, b"abd").unwrap();
        match verify_file(&path, ABC_SHA256) {
            Err(AcquireError::IntegrityMismatch { expected, actual, .. }) => {
                assert_eq!(expected, ABC_SHA256);
                assert_ne!(actual, ABC_SHA256);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn verified_file_is_returned_without_network() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1_sinwave.h5"), b"abc").unwrap();
        let acquirer = Acquirer::new(manifest_for("1_sinwave", ABC_SHA256), dir.path(), offline_options());

        let path = acquirer.acquire("1_sinwave", "unused").unwrap();
        assert_eq!(path, dir.path().join("1_sinwave.h5"));
        assert!(!dir.path().join(".tmp").exists());
    }

    #[test]
    fn corrupt_file_triggers_new_download() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1_sinwave.h5"), b"abd").unwrap();
        let acquirer = Acquirer::new(manifest_for("1_sinwave", ABC_SHA256), dir.path(), offline_options());

        let err = acquirer.acquire("1_sinwave", "unused").unwrap_err();
        assert!(matches!(err, AcquireError::Network(_)), "{:?}", err);
    }

    #[test]
    fn unverified_existing_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1_sinwave.h5"), b"anything").unwrap();
        let options = AcquireOptions {
            verify: false,
            ..offline_options()
        };
        let acquirer = Acquirer::new(manifest_for("1_sinwave", ABC_SHA256), dir.path(), options);
        assert!(acquirer.acquire("1_sinwave", "unused").is_ok());
    }

    #[test]
    fn unknown_scenario_is_rejected_first() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = Acquirer::new(manifest_for("1_sinwave", ABC_SHA256), dir.path(), offline_options());
        assert!(matches!(
            acquirer.acquire("9_other", "pw"),
            Err(AcquireError::UnknownScenario(ref s)) if s == "9_other"
        ));
    }

    #[test]
    fn decrypting_missing_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = decrypt_file(&dir.path().join("none.encrypted"), "pw", &dir.path().join("out.tar.bz2"))
            .unwrap_err();
        assert!(matches!(err, AcquireError::Decryption(_)));
        assert!(!dir.path().join("out.tar.bz2").exists());
    }

    #[test]
    fn damaged_leftover_download_is_fetched_again() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = Acquirer::new(manifest_for("1_sinwave", ABC_SHA256), dir.path(), offline_options());
        let paths = acquirer.paths("1_sinwave");
        fs::create_dir_all(&paths.tmp_dir).unwrap();
        fs::write(&paths.encrypted, b"junk!").unwrap();

        for _ in 0..2 {
            let err = acquirer.acquire("1_sinwave", "pw").unwrap_err();
            assert!(matches!(err, AcquireError::Network(_)), "{:?}", err);
            assert!(!paths.encrypted.exists());
            assert!(!part_path(&paths.encrypted).exists());
        }
        assert!(!paths.archive.exists());
    }

    #[test]
    fn partial_downloads_use_a_side_name() {
        let out = Path::new("/data/.tmp/1_sinwave.tar.bz2.encrypted");
        assert_eq!(part_path(out), Path::new("/data/.tmp/1_sinwave.tar.bz2.encrypted.part"));
    }

    #[test]
    fn decrypting_junk_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("junk.encrypted");
        fs::write(&input, b"junk!").unwrap();
        let out = dir.path().join("out.tar.bz2");

        let err = decrypt_file(&input, "pw", &out).unwrap_err();
        assert!(matches!(err, AcquireError::Decryption(_)));
        assert!(!out.exists());
    }

    #[test]
    fn extracting_missing_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_member(&dir.path().join("none.tar.bz2"), dir.path(), "x.h5").unwrap_err();
        assert!(matches!(err, AcquireError::Extraction(_)));
    }
}
