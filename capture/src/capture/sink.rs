use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use common::api::CaptureResult;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{camera::Camera, metadata::embed_position};
use crate::{
    config::{CameraTuning, NamingScheme},
    error::{RigError, RigResult},
    plan::{file_safe_id, Visit},
};

/// What a single capture produced. A failed metadata embed still leaves a saved image.
#[derive(Debug)]
pub struct CaptureReport {
    pub result: CaptureResult,
    pub metadata_error: Option<RigError>,
}

pub struct CaptureSink {
    camera: Box<dyn Camera>,
    session_dir: PathBuf,
    tuning: CameraTuning,
    naming: NamingScheme,
    session_stamp: String,
    /// Pass suffixes are only needed when targets are visited more than once.
    repeated: bool,
}

pub fn file_name(naming: NamingScheme, visit: &Visit, session_stamp: &str, now: DateTime<Local>, repeated: bool) -> String {
    let id = file_safe_id(&visit.target.id);
    let stem = match naming {
        NamingScheme::TargetId => id,
        NamingScheme::TimestampTarget => format!("{}_{}", session_stamp, id),
        NamingScheme::TargetTimestamp => format!("{}_{}", id, now.format("%Y-%m-%d_%H-%M-%S")),
        NamingScheme::Sequence => return format!("{:03}.jpg", visit.sequence),
    };
    if repeated {
        format!("{}_r{}.jpg", stem, visit.pass)
    } else {
        format!("{}.jpg", stem)
    }
}

fn process(frame: DynamicImage, tuning: &CameraTuning) -> DynamicImage {
    let frame = if tuning.rotate_180 { frame.rotate180() } else { frame };
    match tuning.output_size() {
        Some((width, height)) if (frame.width(), frame.height()) != (width, height) => {
            frame.resize_exact(width, height, FilterType::Triangle)
        }
        _ => frame,
    }
}

fn encode_and_write(
    frame: DynamicImage,
    tuning: &CameraTuning,
    path: &Path,
    target_id: &str,
    position: (f64, f64),
) -> RigResult<Option<RigError>> {
    let rgb = process(frame, tuning).to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, tuning.jpeg_quality)
        .encode_image(&rgb)
        .map_err(|e| RigError::capture(target_id, format!("encoding failed: {}", e)))?;
    let (bytes, metadata_error) = if tuning.embed_position {
        match embed_position(&jpeg, target_id, position.0, position.1, tuning.position_precision, tuning.dpi) {
            Ok(tagged) => (tagged, None),
            Err(e) => (jpeg, Some(e)),
        }
    } else {
        (jpeg, None)
    };
    std::fs::write(path, bytes)
        .map_err(|e| RigError::capture(target_id, format!("cannot write {}: {}", path.display(), e)))?;
    Ok(metadata_error)
}

impl CaptureSink {
    pub fn new(
        camera: Box<dyn Camera>,
        session_dir: PathBuf,
        tuning: CameraTuning,
        naming: NamingScheme,
        repetitions: u32,
    ) -> Self {
        CaptureSink {
            camera,
            session_dir,
            tuning,
            naming,
            session_stamp: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            repeated: repetitions > 1,
        }
    }
    pub fn describe_camera(&self) -> String {
        self.camera.describe()
    }

    /// Grabs a fresh frame for `visit` and saves it under the session directory.
    pub async fn capture(&mut self, visit: &Visit) -> CaptureReport {
        let target = &visit.target;
        // The first read after a pause returns a frame buffered before the move.
        drop(self.camera.read_frame().await);
        sleep(self.tuning.stabilization()).await;
        let Some(frame) = self.camera.read_frame().await else {
            let error = RigError::capture(&target.id, "camera returned no frame");
            warn!("{}", error);
            return CaptureReport { result: CaptureResult::failure(&target.id, error.to_string()), metadata_error: None };
        };
        let path = self
            .session_dir
            .join(file_name(self.naming, visit, &self.session_stamp, Local::now(), self.repeated));
        let tuning = self.tuning.clone();
        let target_id = target.id.clone();
        let position = (target.x, target.y);
        let written = tokio::task::spawn_blocking({
            let path = path.clone();
            move || encode_and_write(frame, &tuning, &path, &target_id, position)
        })
        .await
        .unwrap_or_else(|e| Err(RigError::capture(&target.id, format!("writer task failed: {}", e))));
        match written {
            Ok(metadata_error) => {
                if let Some(e) = &metadata_error {
                    warn!("{} saved without position: {}", path.display(), e);
                }
                debug!("saved {}", path.display());
                CaptureReport { result: CaptureResult::success(&target.id, path), metadata_error }
            }
            Err(error) => {
                warn!("{}", error);
                CaptureReport { result: CaptureResult::failure(&target.id, error.to_string()), metadata_error: None }
            }
        }
    }

    pub fn release(&mut self) {
        self.camera.release();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;
    use common::api::Target;

    use super::*;
    use crate::capture::{camera::SyntheticCamera, metadata::read_position};

    fn visit(id: &str, x: f64, y: f64, pass: u32, sequence: usize) -> Visit {
        Visit { target: Target::new(id, x, y), pass, sequence }
    }

    fn small_tuning() -> CameraTuning {
        CameraTuning {
            capture_width: 64,
            capture_height: 36,
            stabilization_ms: 1,
            ..Default::default()
        }
    }

    /// Counts reads and only delivers the listed ones.
    struct FlakyCamera {
        reads: usize,
        deliver: Vec<usize>,
    }
    #[async_trait]
    impl Camera for FlakyCamera {
        async fn read_frame(&mut self) -> Option<DynamicImage> {
            self.reads += 1;
            self.deliver
                .contains(&self.reads)
                .then(|| DynamicImage::new_rgb8(8, 8))
        }
        fn release(&mut self) {}
        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    #[test]
    fn naming_schemes() {
        let now = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let v = visit("B01", 0.0, 0.0, 2, 14);
        assert_eq!(file_name(NamingScheme::TargetId, &v, "S", now, false), "B01.jpg");
        assert_eq!(file_name(NamingScheme::TargetId, &v, "S", now, true), "B01_r2.jpg");
        assert_eq!(file_name(NamingScheme::TimestampTarget, &v, "20240305_140700", now, false), "20240305_140700_B01.jpg");
        assert_eq!(file_name(NamingScheme::TargetTimestamp, &v, "S", now, false), "B01_2024-03-05_14-07-09.jpg");
        assert_eq!(file_name(NamingScheme::Sequence, &v, "S", now, true), "014.jpg");
        assert_eq!(file_name(NamingScheme::TargetId, &visit("a/b", 0.0, 0.0, 1, 1), "S", now, false), "a_b.jpg");
    }

    #[tokio::test]
    async fn saves_resized_rotated_frame_with_position() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = CameraTuning { output_width: Some(32), output_height: Some(18), rotate_180: true, ..small_tuning() };
        let mut sink = CaptureSink::new(
            Box::new(SyntheticCamera::new(64, 36)),
            dir.path().to_path_buf(),
            tuning,
            NamingScheme::TargetId,
            1,
        );
        let report = sink.capture(&visit("B03", -12.5, 40.25, 1, 1)).await;
        assert!(report.result.succeeded);
        assert!(report.metadata_error.is_none());
        let path = report.result.file_path.unwrap();
        assert_eq!(path, dir.path().join("B03.jpg"));
        let bytes = std::fs::read(&path).unwrap();
        let tag = read_position(&bytes).unwrap().unwrap();
        assert_eq!((tag.x, tag.y), (-12.5, 40.25));
        let saved = image::load_from_memory(&bytes).unwrap();
        assert_eq!((saved.width(), saved.height()), (32, 18));
    }

    #[tokio::test]
    async fn stale_frame_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        // Only the very first read succeeds; that one must be thrown away.
        let camera = FlakyCamera { reads: 0, deliver: vec![1] };
        let mut sink = CaptureSink::new(Box::new(camera), dir.path().to_path_buf(), small_tuning(), NamingScheme::TargetId, 1);
        let report = sink.capture(&visit("B04", 0.0, 0.0, 1, 1)).await;
        assert!(!report.result.succeeded);
        assert!(report.result.file_path.is_none());
        assert!(report.result.error.unwrap().contains("no frame"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unwritable_directory_fails_the_capture() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let camera = FlakyCamera { reads: 0, deliver: vec![2] };
        let mut sink = CaptureSink::new(Box::new(camera), missing, small_tuning(), NamingScheme::TargetId, 1);
        let report = sink.capture(&visit("B05", 0.0, 0.0, 1, 1)).await;
        assert!(!report.result.succeeded);
        assert!(report.result.error.unwrap().contains("cannot write"));
    }
}
