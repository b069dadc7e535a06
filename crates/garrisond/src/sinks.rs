//! Punch photos and operator/speech notifications.

use chrono::{DateTime, Local};
use garrison_core::{BgrImage, FaceOutcome, FrameReport, Identity, Notifier, PhotoError, PhotoSink};
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Writes one JPEG per punch into a directory served under `url_prefix`.
pub struct PhotoDirectory {
    dir: PathBuf,
    url_prefix: String,
}

impl PhotoDirectory {
    pub fn new(dir: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            url_prefix: url_prefix.into(),
        }
    }

    /// `<Display_Name>_<user_id>_<YYYYmmdd_HHMMSS>.jpg`
    pub fn file_name(identity: &Identity, at: DateTime<Local>) -> String {
        let name = identity.display_name.split_whitespace().collect::<Vec<_>>().join("_");
        format!("{name}_{}_{}.jpg", identity.user_id, at.format("%Y%m%d_%H%M%S"))
    }
}

impl PhotoSink for PhotoDirectory {
    fn save_photo(
        &mut self,
        frame: &BgrImage,
        identity: &Identity,
        at: DateTime<Local>,
    ) -> Result<String, PhotoError> {
        std::fs::create_dir_all(&self.dir)?;

        let file_name = Self::file_name(identity, at);
        let path = self.dir.join(&file_name);

        let rgb: Vec<u8> = frame
            .data()
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect();
        let image = image::RgbImage::from_raw(frame.width(), frame.height(), rgb)
            .ok_or_else(|| PhotoError::Encode(format!("bad frame geometry {:?}", frame.dimensions())))?;
        image
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .map_err(|e| PhotoError::Encode(e.to_string()))?;

        tracing::debug!(path = %path.display(), "punch photo saved");
        Ok(format!("{}/{}", self.url_prefix.trim_end_matches('/'), file_name))
    }
}

/// Logs every frame outcome and speaks the kiosk prompts.
pub struct Announcer {
    speech_command: Option<Vec<String>>,
    lockout_secs: i64,
}

impl Announcer {
    pub fn new(speech_command: Option<Vec<String>>, lockout_secs: i64) -> Self {
        Self {
            speech_command: speech_command.filter(|c| !c.is_empty()),
            lockout_secs,
        }
    }

    /// Phrases to speak for `report`, in order.
    pub fn phrases(&self, report: &FrameReport) -> Vec<String> {
        let mut phrases: Vec<String> = report
            .outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                FaceOutcome::PunchAccepted(event) => Some(format!(
                    "Welcome {}, punch {}",
                    event.identity.first_name(),
                    event.punch_type
                )),
                FaceOutcome::Unknown { notify: true, .. } => {
                    Some("User not found, please contact HR department".to_string())
                }
                _ => None,
            })
            .collect();

        if report.lockout_engaged.is_some() {
            phrases.push(format!(
                "Fake Face Detected, please try again in {} seconds",
                self.lockout_secs
            ));
        }
        phrases
    }

    fn speak(&self, phrase: &str) {
        let Some((program, args)) = self.speech_command.as_deref().and_then(|c| c.split_first()) else {
            return;
        };
        let spawned = Command::new(program)
            .args(args)
            .arg(phrase)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            // Reap in the background so speech never stalls the engine.
            Ok(mut child) => {
                let _ = std::thread::Builder::new()
                    .name("garrison-speech".into())
                    .spawn(move || child.wait());
            }
            Err(e) => tracing::warn!(program = %program, error = %e, "speech command failed"),
        }
    }
}

impl Notifier for Announcer {
    fn announce(&mut self, report: &FrameReport) {
        for outcome in &report.outcomes {
            match outcome {
                FaceOutcome::Unknown { notify: true, .. } => {
                    tracing::info!("unrecognized face at kiosk");
                }
                FaceOutcome::LockedOut { label } => {
                    tracing::debug!(%label, "recognition suspended by spoof lockout");
                }
                other => tracing::trace!(label = other.label(), "face outcome"),
            }
        }
        if let Some(until) = report.lockout_engaged {
            tracing::warn!(%until, "spoof alert: recognition locked");
        }

        for phrase in self.phrases(report) {
            self.speak(&phrase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use garrison_core::{BoundingBox, PunchEvent, PunchType};

    fn t0() -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn jane() -> Identity {
        Identity { user_id: 7, display_name: "Jane Doe".into() }
    }

    fn report(outcomes: Vec<FaceOutcome>, lockout: bool) -> FrameReport {
        FrameReport {
            timestamp: t0(),
            outcomes,
            lockout_engaged: lockout.then_some(t0()),
        }
    }

    fn region() -> BoundingBox {
        BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 }
    }

    #[test]
    fn test_photo_file_name() {
        let name = PhotoDirectory::file_name(&jane(), t0());
        assert!(name.starts_with("Jane_Doe_7_"));
        assert!(name.ends_with(&format!("{}.jpg", t0().format("%Y%m%d_%H%M%S"))));
    }

    #[test]
    fn test_save_photo_writes_jpeg() {
        let dir = std::env::temp_dir().join(format!("garrison-photos-{}", std::process::id()));
        let mut sink = PhotoDirectory::new(&dir, "/uploads/");
        let frame = BgrImage::filled(16, 12, [10, 120, 240]);

        let reference = sink.save_photo(&frame, &jane(), t0()).unwrap();
        let file_name = PhotoDirectory::file_name(&jane(), t0());
        assert_eq!(reference, format!("/uploads/{file_name}"));

        let written = image::open(dir.join(&file_name)).unwrap();
        assert_eq!((written.width(), written.height()), (16, 12));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_welcome_phrase() {
        let announcer = Announcer::new(None, 30);
        let event = PunchEvent {
            identity: jane(),
            punch_type: PunchType::In,
            timestamp: t0(),
            photo_reference: "/uploads/x.jpg".into(),
        };
        let phrases = announcer.phrases(&report(vec![FaceOutcome::PunchAccepted(event)], false));
        assert_eq!(phrases, vec!["Welcome Jane, punch IN".to_string()]);
    }

    #[test]
    fn test_unknown_phrase_only_when_notified() {
        let announcer = Announcer::new(None, 30);
        let quiet = report(vec![FaceOutcome::Unknown { region: region(), notify: false }], false);
        assert!(announcer.phrases(&quiet).is_empty());

        let loud = report(vec![FaceOutcome::Unknown { region: region(), notify: true }], false);
        assert_eq!(
            announcer.phrases(&loud),
            vec!["User not found, please contact HR department".to_string()]
        );
    }

    #[test]
    fn test_spoof_alert_once_per_lockout() {
        let announcer = Announcer::new(None, 30);
        let engaged = report(vec![FaceOutcome::LivenessFailed { label: "7 - Jane Doe".into() }], true);
        assert_eq!(
            announcer.phrases(&engaged),
            vec!["Fake Face Detected, please try again in 30 seconds".to_string()]
        );
        let locked = report(vec![FaceOutcome::LockedOut { label: "7 - Jane Doe".into() }], false);
        assert!(announcer.phrases(&locked).is_empty());
    }

    #[test]
    fn test_announce_without_speech_is_silent() {
        let mut announcer = Announcer::new(Some(vec![]), 30);
        announcer.announce(&report(vec![FaceOutcome::Unknown { region: region(), notify: true }], true));
    }
}
