//! The recognition loop: capture, detect, match, log, render.

use crate::display::{Annotation, Viewer};
use crate::ledger::{Ledger, Recorded};
use crate::registry::Registry;
use chrono::NaiveDateTime;
use image::imageops::{self, FilterType};
use image::RgbImage;
use rollcall_hw::{CameraError, Frame, FrameSource};
use rollcall_vision::{AnalyzerError, DistanceMatcher, FaceAnalyzer, Matcher};
use std::borrow::Cow;
use thiserror::Error;

pub const UNKNOWN_LABEL: &str = "Unknown";
const BANNER: &str = "Q to quit";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub threshold: f32,
    /// Analyse every Nth frame; the rest reuse the last annotations.
    pub frame_interval: u32,
    /// Downscale factor in (0, 1] applied before analysis.
    pub process_scale: f32,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub frames: u64,
    pub analysed: u64,
    /// People newly marked present during this run.
    pub recorded: Vec<String>,
}

pub struct Session<A: FaceAnalyzer> {
    analyzer: A,
    registry: Registry,
    matcher: DistanceMatcher,
    ledger: Ledger,
    opts: SessionOptions,
    frames_seen: u64,
    annotations: Vec<Annotation>,
    ledger_failing: bool,
    summary: RunSummary,
}

impl<A: FaceAnalyzer> Session<A> {
    pub fn new(analyzer: A, registry: Registry, ledger: Ledger, opts: SessionOptions) -> Self {
        Self {
            analyzer,
            registry,
            matcher: DistanceMatcher,
            ledger,
            opts,
            frames_seen: 0,
            annotations: Vec::new(),
            ledger_failing: false,
            summary: RunSummary::default(),
        }
    }

    #[cfg(test)]
    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    /// Run until the viewer asks to stop. Losing the camera is the only
    /// error; everything else is logged and the loop carries on.
    pub fn run<S, V>(
        mut self,
        frames: &mut S,
        viewer: &mut V,
        mut clock: impl FnMut() -> NaiveDateTime,
    ) -> Result<RunSummary, SessionError>
    where
        S: FrameSource + ?Sized,
        V: Viewer + ?Sized,
    {
        while !viewer.stop_requested() {
            let frame = frames.next_good_frame()?;
            let annotations = self.process_frame(&frame, clock());
            if let Err(e) = viewer.show(&frame.image, annotations, Some(BANNER)) {
                tracing::warn!(error = %e, "display update failed");
            }
        }

        tracing::info!(
            frames = self.summary.frames,
            analysed = self.summary.analysed,
            recorded = self.summary.recorded.len(),
            "recognition stopped"
        );
        Ok(self.summary)
    }

    /// Handle one frame and return the annotations to draw over it.
    pub fn process_frame(&mut self, frame: &Frame, now: NaiveDateTime) -> &[Annotation] {
        let analyse = self.frames_seen % self.opts.frame_interval.max(1) as u64 == 0;
        self.frames_seen += 1;
        self.summary.frames += 1;
        if !analyse {
            return &self.annotations;
        }

        if frame.is_dark {
            tracing::debug!(sequence = frame.sequence, "dark frame; not analysed");
            self.annotations.clear();
            return &self.annotations;
        }

        self.summary.analysed += 1;
        match self.analyse(&frame.image, now) {
            Ok(annotations) => self.annotations = annotations,
            Err(e) => tracing::warn!(sequence = frame.sequence, error = %e, "frame analysis failed"),
        }
        &self.annotations
    }

    fn analyse(
        &mut self,
        image: &RgbImage,
        now: NaiveDateTime,
    ) -> Result<Vec<Annotation>, AnalyzerError> {
        let probe = downscale(image, self.opts.process_scale);
        let factor = image.width() as f32 / probe.width() as f32;

        let faces = self.analyzer.locate(&probe)?;
        let mut annotations = Vec::with_capacity(faces.len());
        for face in faces {
            let bbox = face.rescaled(factor);
            let encoding = match self.analyzer.encode(&probe, &face) {
                Ok(encoding) => encoding,
                Err(e) => {
                    tracing::debug!(error = %e, "cannot encode face");
                    annotations.push(Annotation {
                        bbox,
                        label: UNKNOWN_LABEL.to_string(),
                        known: false,
                    });
                    continue;
                }
            };

            let result = self
                .matcher
                .compare(&encoding, self.registry.faces(), self.opts.threshold);
            match result.name {
                Some(name) => {
                    tracing::debug!(%name, distance = result.distance, "face recognised");
                    self.log_presence(&name, now);
                    annotations.push(Annotation {
                        bbox,
                        label: name,
                        known: true,
                    });
                }
                None => annotations.push(Annotation {
                    bbox,
                    label: UNKNOWN_LABEL.to_string(),
                    known: false,
                }),
            }
        }
        Ok(annotations)
    }

    fn log_presence(&mut self, name: &str, now: NaiveDateTime) {
        match self.ledger.record_if_absent(name, now) {
            Ok(Recorded::New(record)) => {
                println!("{} marked present at {}", record.name, record.time);
                self.summary.recorded.push(record.name);
                self.ledger_failing = false;
            }
            Ok(Recorded::AlreadyPresent) => {}
            Err(e) => {
                // Only the first of a run of failures is a warning.
                if self.ledger_failing {
                    tracing::debug!(name, error = %e, "ledger write still failing");
                } else {
                    tracing::warn!(name, error = %e, "cannot record attendance; will retry");
                }
                self.ledger_failing = true;
            }
        }
    }
}

fn downscale(image: &RgbImage, scale: f32) -> Cow<'_, RgbImage> {
    if scale >= 1.0 {
        return Cow::Borrowed(image);
    }
    let width = ((image.width() as f32 * scale).round() as u32).max(1);
    let height = ((image.height() as f32 * scale).round() as u32).max(1);
    Cow::Owned(imageops::resize(image, width, height, FilterType::Triangle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::HeadlessViewer;
    use crate::testing::{face, shaded, FakeAnalyzer, QueuedFrames};
    use rollcall_vision::{Encoding, KnownFace};
    use std::path::Path;

    const ALICE: u8 = 50;
    const STRANGER: u8 = 100;
    const ALICE_AND_STRANGER: u8 = 150;

    fn analyzer() -> FakeAnalyzer {
        FakeAnalyzer::new()
            .script(ALICE, vec![face(5.0, 5.0, vec![1.0, 0.0])])
            .script(STRANGER, vec![face(5.0, 5.0, vec![0.0, 1.0])])
            .script(
                ALICE_AND_STRANGER,
                vec![face(5.0, 5.0, vec![1.0, 0.0]), face(30.0, 5.0, vec![0.0, 1.0])],
            )
    }

    fn registry() -> Registry {
        Registry::from_faces(vec![KnownFace {
            name: "Alice".into(),
            source: "center.jpg".into(),
            encoding: Encoding::new(vec![1.0, 0.0]),
        }])
    }

    fn session(reports: &Path, frame_interval: u32, process_scale: f32) -> Session<FakeAnalyzer> {
        Session::new(
            analyzer(),
            registry(),
            Ledger::new(reports),
            SessionOptions {
                threshold: 1.10,
                frame_interval,
                process_scale,
            },
        )
    }

    fn nine_am() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-01-01 09:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn frames(shades: &[u8]) -> QueuedFrames {
        QueuedFrames::new(shades.iter().map(|&s| shaded(s)))
    }

    fn names_on(reports: &Path, date: NaiveDateTime) -> Vec<String> {
        Ledger::new(reports)
            .entries(date.date())
            .unwrap()
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    #[test]
    fn test_known_face_logged_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut viewer = HeadlessViewer::new(Some(2));

        let summary = session(dir.path(), 1, 1.0)
            .run(&mut frames(&[ALICE, ALICE]), &mut viewer, nine_am)
            .unwrap();

        assert_eq!(summary.recorded, vec!["Alice"]);
        assert_eq!(summary.analysed, 2);
        assert_eq!(names_on(dir.path(), nine_am()), vec!["Alice"]);
        let shown = &viewer.last_annotations;
        assert_eq!(shown.len(), 1);
        assert!(shown[0].known);
        assert_eq!(shown[0].label, "Alice");
    }

    #[test]
    fn test_unknown_face_is_displayed_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports");
        let mut viewer = HeadlessViewer::new(Some(1));

        let summary = session(&reports, 1, 1.0)
            .run(&mut frames(&[STRANGER]), &mut viewer, nine_am)
            .unwrap();

        assert!(summary.recorded.is_empty());
        assert!(!reports.exists());
        assert_eq!(viewer.last_annotations[0].label, UNKNOWN_LABEL);
        assert!(!viewer.last_annotations[0].known);
    }

    #[test]
    fn test_skipped_frames_reuse_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 5, 1.0);
        let mut source = frames(&[ALICE; 7]);

        for _ in 0..6 {
            let frame = source.next_frame().unwrap();
            s.process_frame(&frame, nine_am());
        }
        let frame = source.next_frame().unwrap();
        let last = s.process_frame(&frame, nine_am()).to_vec();

        assert_eq!(s.analyzer().locate_calls, 2);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].label, "Alice");
        assert_eq!(names_on(dir.path(), nine_am()), vec!["Alice"]);
    }

    #[test]
    fn test_restart_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..2 {
            session(dir.path(), 1, 1.0)
                .run(&mut frames(&[ALICE]), &mut HeadlessViewer::new(Some(1)), nine_am)
                .unwrap();
        }
        assert_eq!(names_on(dir.path(), nine_am()), vec!["Alice"]);
    }

    #[test]
    fn test_ledger_failure_does_not_stop_loop() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("reports");
        std::fs::write(&blocked, b"not a directory").unwrap();
        let mut viewer = HeadlessViewer::new(Some(3));

        let summary = session(&blocked, 1, 1.0)
            .run(&mut frames(&[ALICE; 3]), &mut viewer, nine_am)
            .unwrap();

        assert_eq!(summary.frames, 3);
        assert!(summary.recorded.is_empty());
        assert!(viewer.last_annotations[0].known);
    }

    #[test]
    fn test_camera_loss_ends_run_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = session(dir.path(), 1, 1.0).run(
            &mut frames(&[ALICE]),
            &mut HeadlessViewer::new(None),
            nine_am,
        );
        assert!(matches!(result, Err(SessionError::Camera(_))));
        // The sighting before the loss is still on disk.
        assert_eq!(names_on(dir.path(), nine_am()), vec!["Alice"]);
    }

    #[test]
    fn test_corrupt_frames_do_not_end_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut source =
            QueuedFrames::with_corrupt([None, Some(shaded(ALICE)), None, Some(shaded(ALICE))]);
        let mut viewer = HeadlessViewer::new(Some(2));

        let summary = session(dir.path(), 1, 1.0)
            .run(&mut source, &mut viewer, nine_am)
            .unwrap();

        assert_eq!(summary.frames, 2);
        assert_eq!(summary.recorded, vec!["Alice"]);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_faces_in_one_frame_handled_independently() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 1, 1.0);
        let frame = Frame::from_image(shaded(ALICE_AND_STRANGER), 1);

        let annotations = s.process_frame(&frame, nine_am()).to_vec();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].label, "Alice");
        assert!(annotations[0].known);
        assert_eq!(annotations[1].label, UNKNOWN_LABEL);
        assert!(!annotations[1].known);
        assert!((annotations[1].bbox.x - 30.0).abs() < 1e-3);

        assert_eq!(names_on(dir.path(), nine_am()), vec!["Alice"]);
    }

    #[test]
    fn test_downscaled_boxes_map_back_to_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 1, 0.5);
        let frame = Frame::from_image(shaded(ALICE), 1);

        let annotations = s.process_frame(&frame, nine_am());
        assert!((annotations[0].bbox.x - 10.0).abs() < 1e-3);
        assert!((annotations[0].bbox.width - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_enroll_then_two_sightings_same_day() {
        use crate::enroll::{enroll, EnrollOptions};
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let known = dir.path().join("known_faces");
        let reports = dir.path().join("reports");
        let opts = EnrollOptions {
            min_confidence: 0.6,
            max_attempts: 1,
            settle: Duration::ZERO,
            overwrite: false,
        };
        enroll(
            "Alice",
            &known,
            &opts,
            &mut analyzer(),
            &mut frames(&[ALICE; 5]),
            &mut HeadlessViewer::new(None),
        )
        .unwrap();

        let mut engine = analyzer();
        let registry = Registry::load(&known, &mut engine).unwrap();
        assert_eq!(registry.people().get("Alice"), Some(&5));

        let mut s = Session::new(
            engine,
            registry,
            Ledger::new(&reports),
            SessionOptions {
                threshold: 1.10,
                frame_interval: 1,
                process_scale: 1.0,
            },
        );
        let at = |t: &str| {
            NaiveDateTime::parse_from_str(&format!("2024-01-01 {t}"), "%Y-%m-%d %H:%M:%S").unwrap()
        };
        let frame = Frame::from_image(shaded(ALICE), 1);
        s.process_frame(&frame, at("09:00:01"));
        let frame = Frame::from_image(shaded(ALICE), 50);
        s.process_frame(&frame, at("09:05:00"));

        let rows = Ledger::new(&reports).entries(at("09:00:01").date()).unwrap().to_vec();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Alice");
        assert_eq!(rows[0].time, "09:00:01");
    }

    #[test]
    fn test_dark_frame_not_analysed() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 1, 1.0);
        let frame = Frame::from_image(RgbImage::new(64, 48), 1);

        assert!(s.process_frame(&frame, nine_am()).is_empty());
        assert_eq!(s.analyzer().locate_calls, 0);
    }
}
