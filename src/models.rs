//! Locating, downloading and opening the face detection models.
//!
//! Sources are tried in order. Each gets up to `attempts` tries, every try is
//! bounded by `timeout`, and failed tries are spaced by `retry_delay`. A local
//! directory that simply lacks the files is skipped without retrying. A
//! download that outlives its try keeps going and the next try waits on it
//! rather than starting another.

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{ModelSource, ModelsConfig};
use crate::error::ModelLoadError;

pub struct ModelArtifact {
    pub name: &'static str,
    pub compressed_name: &'static str,
    /// Hex SHA-256 of the decompressed file, when pinned.
    pub sha256: Option<&'static str>,
    pub size_mb: u32,
}

pub const FACE_DETECTOR: ModelArtifact = ModelArtifact {
    name: "mmod_human_face_detector.dat",
    compressed_name: "mmod_human_face_detector.dat.bz2",
    sha256: None,
    size_mb: 1,
};

pub const LANDMARK_PREDICTOR: ModelArtifact = ModelArtifact {
    name: "shape_predictor_68_face_landmarks.dat",
    compressed_name: "shape_predictor_68_face_landmarks.dat.bz2",
    sha256: None,
    size_mb: 100,
};

pub const REQUIRED_MODELS: [ModelArtifact; 2] = [FACE_DETECTOR, LANDMARK_PREDICTOR];

/// First required artifact not present in `dir`.
pub fn missing_artifact(dir: &Path) -> Option<&'static str> {
    REQUIRED_MODELS
        .iter()
        .find(|m| !dir.join(m.name).is_file())
        .map(|m| m.name)
}

pub fn models_exist_in(dir: &Path) -> bool {
    missing_artifact(dir).is_none()
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data).iter().map(|b| format!("{:02x}", b)).collect()
}

fn verify_checksum(name: &'static str, expected: Option<&str>, data: &[u8]) -> Result<(), ModelLoadError> {
    match expected {
        Some(expected) if !sha256_hex(data).eq_ignore_ascii_case(expected) => {
            Err(ModelLoadError::Checksum { artifact: name })
        }
        _ => Ok(()),
    }
}

/// Blocking download of `<base_url>/<compressed_name>` into `dest_dir`.
///
/// The file is written under a temporary name and renamed once complete, so an
/// interrupted download never looks like a usable model.
pub fn download_and_extract(
    artifact: &ModelArtifact,
    base_url: &str,
    dest_dir: &Path,
    timeout: Duration,
) -> Result<PathBuf, ModelLoadError> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), artifact.compressed_name);
    let download_err = |reason: String| ModelLoadError::Download {
        artifact: artifact.name,
        reason,
    };

    fs::create_dir_all(dest_dir)?;
    info!("Downloading {} from {}", artifact.name, url);

    let response = ureq::get(&url)
        .timeout(timeout)
        .call()
        .map_err(|e| download_err(e.to_string()))?;

    let capacity = response
        .header("content-length")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(artifact.size_mb as usize * 1024 * 1024);

    let mut compressed = Vec::with_capacity(capacity);
    response
        .into_reader()
        .read_to_end(&mut compressed)
        .map_err(|e| download_err(e.to_string()))?;

    debug!("Downloaded {} bytes, decompressing", compressed.len());

    let mut data = Vec::new();
    bzip2::read::BzDecoder::new(&compressed[..])
        .read_to_end(&mut data)
        .map_err(|e| download_err(format!("decompression failed: {}", e)))?;

    verify_checksum(artifact.name, artifact.sha256, &data)?;

    let final_path = dest_dir.join(artifact.name);
    let partial_path = dest_dir.join(format!("{}.part", artifact.name));
    File::create(&partial_path)?.write_all(&data)?;
    fs::rename(&partial_path, &final_path)?;

    info!("Saved {} ({} bytes) to {:?}", artifact.name, data.len(), final_path);
    Ok(final_path)
}

#[derive(Debug, Clone)]
pub struct ModelLoader {
    sources: Vec<ModelSource>,
    attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl ModelLoader {
    pub fn new(sources: Vec<ModelSource>, attempts: u32, retry_delay: Duration, timeout: Duration) -> Self {
        Self {
            sources,
            attempts: attempts.max(1),
            retry_delay,
            timeout,
        }
    }

    pub fn from_config(config: &ModelsConfig) -> Self {
        Self::new(
            config.sources.clone(),
            config.attempts,
            Duration::from_secs_f64(config.retry_delay_secs.max(0.0)),
            Duration::from_secs_f64(config.timeout_secs.max(0.0)),
        )
    }

    /// Resolves a model directory and hands it to `open`, which builds the
    /// detector. Returns [`ModelLoadError::Exhausted`] once every source has
    /// used up its tries.
    pub async fn load<T, F>(&self, mut open: F) -> Result<T, ModelLoadError>
    where
        F: FnMut(&Path) -> anyhow::Result<T>,
    {
        let mut tries = 0;

        for source in &self.sources {
            let mut download = None;

            for attempt in 1..=self.attempts {
                tries += 1;

                let resolved = self.resolve(source, &mut download).await;

                let result = resolved.and_then(|dir| {
                    open(&dir).map_err(|e| ModelLoadError::Open {
                        dir: dir.clone(),
                        reason: format!("{:#}", e),
                    })
                });

                match result {
                    Ok(models) => {
                        info!("Models loaded from {:?} (try {})", source, tries);
                        return Ok(models);
                    }
                    Err(e) if !e.is_retryable() => {
                        debug!("Skipping model source {:?}: {}", source, e);
                        break;
                    }
                    Err(e) => {
                        warn!("Model source {:?} failed (attempt {}/{}): {}", source, attempt, self.attempts, e);
                        if attempt < self.attempts {
                            tokio::time::sleep(self.retry_delay).await;
                        }
                    }
                }
            }
        }

        warn!("No usable face detection models after {} tries", tries);
        Err(ModelLoadError::Exhausted { attempts: tries })
    }

    async fn resolve(
        &self,
        source: &ModelSource,
        download: &mut Option<JoinHandle<Result<PathBuf, ModelLoadError>>>,
    ) -> Result<PathBuf, ModelLoadError> {
        match source {
            ModelSource::Local { dir } => match missing_artifact(dir) {
                None => Ok(dir.clone()),
                Some(artifact) => Err(ModelLoadError::Missing {
                    artifact,
                    dir: dir.clone(),
                }),
            },
            ModelSource::Remote { base_url, cache_dir } => {
                if download.is_none() && models_exist_in(cache_dir) {
                    return Ok(cache_dir.clone());
                }

                if download.is_some() {
                    debug!("Still downloading into {:?}, waiting on it", cache_dir);
                }
                let task = download.get_or_insert_with(|| self.spawn_download(base_url, cache_dir));

                let joined = match tokio::time::timeout(self.timeout, task).await {
                    Ok(joined) => joined,
                    Err(_) => return Err(ModelLoadError::Timeout(self.timeout)),
                };
                *download = None;

                joined.map_err(|e| ModelLoadError::Download {
                    artifact: FACE_DETECTOR.name,
                    reason: format!("download task failed: {}", e),
                })?
            }
        }
    }

    fn spawn_download(&self, base_url: &str, cache_dir: &Path) -> JoinHandle<Result<PathBuf, ModelLoadError>> {
        let base_url = base_url.to_string();
        let cache_dir = cache_dir.to_path_buf();
        // The transfer may span every try of this source.
        let timeout = self.timeout * self.attempts;

        tokio::task::spawn_blocking(move || -> Result<PathBuf, ModelLoadError> {
            for artifact in REQUIRED_MODELS.iter() {
                if !cache_dir.join(artifact.name).is_file() {
                    download_and_extract(artifact, &base_url, &cache_dir, timeout)?;
                }
            }
            Ok(cache_dir)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn populate(dir: &Path) {
        for artifact in REQUIRED_MODELS.iter() {
            fs::write(dir.join(artifact.name), b"model").unwrap();
        }
    }

    fn loader(sources: Vec<ModelSource>, attempts: u32) -> ModelLoader {
        ModelLoader::new(sources, attempts, Duration::from_secs(2), Duration::from_secs(10))
    }

    #[test]
    fn detects_missing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(missing_artifact(dir.path()), Some(FACE_DETECTOR.name));

        fs::write(dir.path().join(FACE_DETECTOR.name), b"x").unwrap();
        assert_eq!(missing_artifact(dir.path()), Some(LANDMARK_PREDICTOR.name));

        populate(dir.path());
        assert!(models_exist_in(dir.path()));
    }

    #[test]
    fn checksum_is_compared_in_hex() {
        let abc = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(verify_checksum("m", Some(abc), b"abc").is_ok());
        assert!(verify_checksum("m", None, b"anything").is_ok());
        assert!(matches!(
            verify_checksum("m", Some(abc), b"abd"),
            Err(ModelLoadError::Checksum { artifact: "m" })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_next_local_source() {
        let empty = tempfile::tempdir().unwrap();
        let full = tempfile::tempdir().unwrap();
        populate(full.path());

        let loader = loader(
            vec![
                ModelSource::Local { dir: empty.path().to_path_buf() },
                ModelSource::Local { dir: full.path().to_path_buf() },
            ],
            3,
        );

        let dir = loader.load(|dir| Ok(dir.to_path_buf())).await.unwrap();
        assert_eq!(dir, full.path());
    }

    #[tokio::test(start_paused = true)]
    async fn open_failures_are_retried_after_a_delay() {
        let full = tempfile::tempdir().unwrap();
        populate(full.path());
        let calls = Cell::new(0);

        let loader = loader(vec![ModelSource::Local { dir: full.path().to_path_buf() }], 3);
        let started = tokio::time::Instant::now();

        let result = loader
            .load(|_| {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    anyhow::bail!("corrupt model");
                }
                Ok(calls.get())
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_every_source_reports_tries() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        populate(b.path());

        let loader = loader(
            vec![
                ModelSource::Local { dir: a.path().to_path_buf() },
                ModelSource::Local { dir: b.path().to_path_buf() },
            ],
            2,
        );

        // One skipped missing source plus two failed opens.
        let err = loader
            .load(|_| -> anyhow::Result<()> { anyhow::bail!("unsupported format") })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelLoadError::Exhausted { attempts: 3 }));
    }

    // A server that accepts connections and never answers.
    fn silent_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        std::thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming().flatten() {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (url, connections)
    }

    #[tokio::test]
    async fn slow_download_is_awaited_not_restarted() {
        let (base_url, connections) = silent_server();
        let cache = tempfile::tempdir().unwrap();

        let loader = ModelLoader::new(
            vec![ModelSource::Remote {
                base_url,
                cache_dir: cache.path().to_path_buf(),
            }],
            2,
            Duration::ZERO,
            Duration::from_millis(200),
        );

        let err = loader.load(|dir| Ok(dir.to_path_buf())).await.unwrap_err();
        assert!(matches!(err, ModelLoadError::Exhausted { attempts: 2 }));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert!(missing_artifact(cache.path()).is_some());
    }
}
