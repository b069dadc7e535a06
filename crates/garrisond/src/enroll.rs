//! Enrollment: derive embeddings from the photo directory, cache them, and
//! rebuild when the directory changes.
//!
//! Rebuilds run on a dedicated worker thread with its own analyzer, so the
//! recognition engine keeps matching against the previous complete set until
//! the new one is swapped in.

use garrison_core::enrollment::label_from_file_stem;
use garrison_core::{BgrImage, EnrolledIdentity, EnrollmentStore, FaceAnalyzer};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Images larger than this on either side are downscaled before analysis.
pub const MAX_ENROLL_DIMENSION: u32 = 800;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const SETTLE_POLLS: usize = 5;
const SETTLE_DELAY: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("enrollment cache: {0}")]
    Cache(#[from] serde_json::Error),
    #[error("bad decoded frame: {0}")]
    Frame(#[from] garrison_core::ImageError),
    #[error("face analysis failed: {0}")]
    Analyzer(#[from] garrison_core::AnalyzerError),
    #[error("no face found")]
    NoFace,
    #[error("enrollment worker stopped")]
    WorkerGone,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    identities: Vec<EnrolledIdentity>,
}

pub fn is_enrollment_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Enrollment images in `dir`, sorted by file name.
pub fn scan_dir(dir: &Path) -> Result<Vec<PathBuf>, EnrollError> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_enrollment_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Decode an enrollment photo into BGR, downscaling oversized images.
pub fn load_image(path: &Path) -> Result<BgrImage, EnrollError> {
    let mut img = image::open(path)?;
    if img.width() > MAX_ENROLL_DIMENSION || img.height() > MAX_ENROLL_DIMENSION {
        img = img.resize(MAX_ENROLL_DIMENSION, MAX_ENROLL_DIMENSION, FilterType::Triangle);
    }
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let bgr: Vec<u8> = rgb
        .into_raw()
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    Ok(BgrImage::new(width, height, bgr)?)
}

fn enroll_one(path: &Path, label: String, analyzer: &mut dyn FaceAnalyzer) -> Result<EnrolledIdentity, EnrollError> {
    let image = load_image(path)?;
    let mut faces = analyzer.analyze(&image)?;
    if faces.len() > 1 {
        tracing::warn!(path = %path.display(), faces = faces.len(), "multiple faces; using the first");
    }
    if faces.is_empty() {
        return Err(EnrollError::NoFace);
    }
    Ok(EnrolledIdentity::new(label, faces.swap_remove(0).embedding))
}

/// Derive the enrolled set from every conforming photo in `dir`.
///
/// Photos with a non-conforming name, an undecodable body or no face are
/// skipped with a warning.
pub fn build_from_dir(
    dir: &Path,
    analyzer: &mut dyn FaceAnalyzer,
) -> Result<Vec<EnrolledIdentity>, EnrollError> {
    let mut identities = Vec::new();
    for path in scan_dir(dir)? {
        let Some(label) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(label_from_file_stem)
        else {
            tracing::warn!(path = %path.display(), "skipping file not named First_Last_<id>");
            continue;
        };
        match enroll_one(&path, label, analyzer) {
            Ok(identity) => {
                tracing::info!(label = %identity.label, "enrolled");
                identities.push(identity);
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping enrollment photo"),
        }
    }
    Ok(identities)
}

/// Cached enrolled set, or `None` when the cache is missing, corrupt or empty.
pub fn load_cache(path: &Path) -> Option<Vec<EnrolledIdentity>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::info!(path = %path.display(), error = %e, "no enrollment cache");
            return None;
        }
    };
    match serde_json::from_str::<CacheFile>(&text) {
        Ok(cache) if !cache.identities.is_empty() => Some(cache.identities),
        Ok(_) => {
            tracing::warn!(path = %path.display(), "enrollment cache is empty");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "enrollment cache is corrupt");
            None
        }
    }
}

/// Write the cache through a temporary file so readers never see half of it.
pub fn save_cache(path: &Path, identities: &[EnrolledIdentity]) -> Result<(), EnrollError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(&CacheFile {
        identities: identities.to_vec(),
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Owns the enrollment analyzer and publishes rebuilt sets into the store.
pub struct Enroller {
    dir: PathBuf,
    cache_path: PathBuf,
    analyzer: Box<dyn FaceAnalyzer + Send>,
    store: Arc<EnrollmentStore>,
}

impl Enroller {
    pub fn new(
        dir: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
        analyzer: Box<dyn FaceAnalyzer + Send>,
        store: Arc<EnrollmentStore>,
    ) -> Self {
        Self {
            dir: dir.into(),
            cache_path: cache_path.into(),
            analyzer,
            store,
        }
    }

    /// Publish the cached set, rebuilding from the photos if the cache is unusable.
    pub fn load_or_rebuild(&mut self) -> usize {
        match load_cache(&self.cache_path) {
            Some(identities) => {
                let count = identities.len();
                tracing::info!(count, "loaded enrolled set from cache");
                self.store.replace(identities);
                count
            }
            None => self.rebuild(),
        }
    }

    /// Re-derive every embedding, save the cache and swap the set in.
    ///
    /// On a failed directory scan the previous set stays in place.
    pub fn rebuild(&mut self) -> usize {
        let identities = match build_from_dir(&self.dir, self.analyzer.as_mut()) {
            Ok(identities) => identities,
            Err(e) => {
                tracing::error!(dir = %self.dir.display(), error = %e, "enrollment rebuild failed");
                return self.store.len();
            }
        };
        if identities.is_empty() {
            tracing::warn!(dir = %self.dir.display(), "no faces enrolled; every face will be unknown");
        }
        if let Err(e) = save_cache(&self.cache_path, &identities) {
            tracing::warn!(path = %self.cache_path.display(), error = %e, "cannot write enrollment cache");
        }
        let count = identities.len();
        self.store.replace(identities);
        count
    }
}

/// Clone-safe handle to the enrollment worker thread.
#[derive(Clone)]
pub struct EnrollHandle {
    tx: mpsc::Sender<()>,
    running: Arc<AtomicBool>,
}

impl EnrollHandle {
    /// Queue a rebuild. Returns `false` if one is already running.
    pub fn request_reload(&self) -> Result<bool, EnrollError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("enrollment rebuild already running; skipping");
            return Ok(false);
        }
        if self.tx.send(()).is_err() {
            self.running.store(false, Ordering::Release);
            return Err(EnrollError::WorkerGone);
        }
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Spawn the enrollment worker. It publishes the initial set, then serves
/// rebuild requests.
pub fn spawn_enroller(mut enroller: Enroller) -> std::io::Result<EnrollHandle> {
    let (tx, rx) = mpsc::channel::<()>();
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);

    std::thread::Builder::new()
        .name("garrison-enroll".into())
        .spawn(move || {
            enroller.load_or_rebuild();
            flag.store(false, Ordering::Release);
            while rx.recv().is_ok() {
                let count = enroller.rebuild();
                tracing::info!(count, "enrollment rebuild finished");
                flag.store(false, Ordering::Release);
            }
            tracing::info!("enrollment worker exiting");
        })?;

    Ok(EnrollHandle { tx, running })
}

/// Size and modification time per enrollment image.
pub type DirSnapshot = BTreeMap<PathBuf, (u64, Option<SystemTime>)>;

pub async fn snapshot_dir(dir: &Path) -> std::io::Result<DirSnapshot> {
    let mut snapshot = DirSnapshot::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_enrollment_image(&path) {
            continue;
        }
        let meta = entry.metadata().await?;
        if meta.is_file() {
            snapshot.insert(path, (meta.len(), meta.modified().ok()));
        }
    }
    Ok(snapshot)
}

/// Paths added or modified between two snapshots.
pub fn changed_paths(old: &DirSnapshot, new: &DirSnapshot) -> Vec<PathBuf> {
    new.iter()
        .filter(|(path, stat)| old.get(*path) != Some(*stat))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Wait until `path` stops growing. Gives up after a bounded number of polls.
pub async fn wait_until_settled(path: &Path, polls: usize, delay: Duration) -> bool {
    let mut last: Option<u64> = None;
    for _ in 0..polls {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 && last == Some(meta.len()) => return true,
            Ok(meta) => {
                tracing::debug!(path = %path.display(), size = meta.len(), "waiting for file to finish copying");
                last = Some(meta.len());
            }
            Err(_) => {
                tracing::debug!(path = %path.display(), "file vanished while settling");
                last = None;
            }
        }
        tokio::time::sleep(delay).await;
    }
    false
}

/// Poll the enrollment directory and request a rebuild when it changes.
pub async fn watch_directory(dir: PathBuf, interval: Duration, handle: EnrollHandle) {
    tracing::info!(dir = %dir.display(), interval_secs = interval.as_secs(), "watching enrollment directory");
    let mut known = snapshot_dir(&dir).await.unwrap_or_default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let current = match snapshot_dir(&dir).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot scan enrollment directory");
                continue;
            }
        };
        if current == known {
            continue;
        }

        for path in changed_paths(&known, &current) {
            tracing::info!(path = %path.display(), "enrollment image changed");
            if !wait_until_settled(&path, SETTLE_POLLS, SETTLE_DELAY).await {
                tracing::warn!(path = %path.display(), "file still changing; rebuilding anyway");
            }
        }

        match handle.request_reload() {
            // Re-read after settling so the next diff starts from the final sizes.
            Ok(true) => known = snapshot_dir(&dir).await.unwrap_or(current),
            // Busy: keep the old snapshot so the change is picked up next tick.
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, "enrollment watcher stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garrison_core::{AnalyzerError, BoundingBox, Embedding, FaceObservation};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("garrison-enroll-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        image::RgbImage::from_pixel(width, height, image::Rgb([120, 130, 140]))
            .save(path)
            .unwrap();
    }

    /// Reports one face whose embedding encodes the frame width.
    struct WidthAnalyzer {
        calls: usize,
    }

    impl FaceAnalyzer for WidthAnalyzer {
        fn analyze(&mut self, frame: &BgrImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
            self.calls += 1;
            if frame.width() == 13 {
                return Ok(Vec::new());
            }
            Ok(vec![FaceObservation {
                region: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 },
                embedding: Embedding::new(vec![frame.width() as f32, frame.height() as f32]),
            }])
        }
    }

    #[test]
    fn test_build_skips_bad_names_and_faceless_photos() {
        let dir = temp_dir("build");
        write_png(&dir.join("Jane_Doe_7.png"), 20, 10);
        write_png(&dir.join("John_Roe2_8.png"), 30, 10);
        write_png(&dir.join("Nobody_Here_9.png"), 13, 10);
        write_png(&dir.join("badname.png"), 20, 10);
        std::fs::write(dir.join("notes.txt"), "ignore me").unwrap();

        let mut analyzer = WidthAnalyzer { calls: 0 };
        let identities = build_from_dir(&dir, &mut analyzer).unwrap();

        let labels: Vec<_> = identities.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["7 - Jane Doe", "8 - John Roe"]);
        assert_eq!(analyzer.calls, 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_large_images_are_downscaled() {
        let dir = temp_dir("large");
        let path = dir.join("Big_Face_1.png");
        write_png(&path, 1600, 1200);
        let img = load_image(&path).unwrap();
        assert_eq!(img.dimensions(), (800, 600));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_cache_round_trip_and_fallbacks() {
        let dir = temp_dir("cache");
        let cache = dir.join("encodings.json");
        assert!(load_cache(&cache).is_none());

        let set = vec![EnrolledIdentity::new("7 - Jane Doe", Embedding::new(vec![0.1, 0.2]))];
        save_cache(&cache, &set).unwrap();
        assert_eq!(load_cache(&cache), Some(set));

        save_cache(&cache, &[]).unwrap();
        assert!(load_cache(&cache).is_none());

        std::fs::write(&cache, "{not json").unwrap();
        assert!(load_cache(&cache).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_cache_triggers_rebuild() {
        let dir = temp_dir("rebuild");
        let photos = dir.join("photos");
        std::fs::create_dir_all(&photos).unwrap();
        write_png(&photos.join("Jane_Doe_7.png"), 20, 10);
        let cache = dir.join("encodings.json");
        std::fs::write(&cache, "garbage").unwrap();

        let store = Arc::new(EnrollmentStore::default());
        let mut enroller = Enroller::new(&photos, &cache, Box::new(WidthAnalyzer { calls: 0 }), store.clone());
        assert_eq!(enroller.load_or_rebuild(), 1);
        assert_eq!(store.current_identities()[0].label, "7 - Jane Doe");
        assert!(load_cache(&cache).is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_changed_paths() {
        let mut old = DirSnapshot::new();
        old.insert(PathBuf::from("a.jpg"), (10, None));
        old.insert(PathBuf::from("b.jpg"), (10, None));
        let mut new = old.clone();
        new.insert(PathBuf::from("b.jpg"), (20, None));
        new.insert(PathBuf::from("c.jpg"), (5, None));

        assert_eq!(changed_paths(&old, &new), vec![PathBuf::from("b.jpg"), PathBuf::from("c.jpg")]);
    }

    #[test]
    fn test_image_extension_filter() {
        assert!(is_enrollment_image(Path::new("x/Jane_Doe_7.JPG")));
        assert!(is_enrollment_image(Path::new("Jane_Doe_7.jpeg")));
        assert!(!is_enrollment_image(Path::new("Jane_Doe_7.gif")));
        assert!(!is_enrollment_image(Path::new("Jane_Doe_7")));
    }

    #[tokio::test]
    async fn test_settled_file() {
        let dir = temp_dir("settle");
        let path = dir.join("Jane_Doe_7.png");
        std::fs::write(&path, b"0123456789").unwrap();
        assert!(wait_until_settled(&path, 3, Duration::from_millis(1)).await);
        assert!(!wait_until_settled(&dir.join("missing.png"), 2, Duration::from_millis(1)).await);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reload_is_refused_while_running() {
        let (tx, _rx) = mpsc::channel();
        let handle = EnrollHandle { tx, running: Arc::new(AtomicBool::new(false)) };
        assert!(handle.request_reload().unwrap());
        assert!(handle.is_running());
        assert!(!handle.request_reload().unwrap());
    }

    #[test]
    fn test_reload_without_worker_fails() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let handle = EnrollHandle { tx, running: Arc::new(AtomicBool::new(false)) };
        assert!(matches!(handle.request_reload(), Err(EnrollError::WorkerGone)));
        assert!(!handle.is_running());
    }
}
