//! Non-blocking audio file import with progress polling.

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;

use strata_blocks::DirManager;
use strata_core::Progress;
use strata_track::WaveTrack;

use crate::pipeline::import_wav;

/// Status of a background import operation.
pub enum ImportStatus {
    /// No progress yet (just started).
    Pending,
    /// Import is in progress (0.0 to 1.0).
    Running(f32),
    /// Import completed successfully.
    Complete(Vec<WaveTrack>),
    /// Import failed with an error message.
    Failed(String),
}

/// Handle to a background WAV import.
///
/// Created by [`ImportHandle::start`]; poll with
/// [`ImportHandle::progress`] each frame, or block on
/// [`ImportHandle::wait`].
pub struct ImportHandle {
    progress_rx: Receiver<f32>,
    thread: Option<JoinHandle<std::result::Result<Vec<WaveTrack>, String>>>,
    last_progress: Option<f32>,
}

impl ImportHandle {
    /// Start importing `path` on a dedicated thread.
    pub fn start(dir: Arc<DirManager>, path: impl AsRef<Path>) -> ImportHandle {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = crossbeam_channel::bounded(64);

        let thread = std::thread::Builder::new()
            .name("strata-import".into())
            .spawn(move || {
                let mut tracks = Vec::new();
                let outcome = import_wav(&dir, &path, &mut tracks, |p| {
                    let _ = tx.try_send(p);
                    true
                })
                .map_err(|e| e.to_string())?;
                match outcome {
                    Progress::Success => Ok(tracks),
                    other => Err(format!("import ended with {other:?}")),
                }
            })
            .expect("failed to spawn import thread");

        ImportHandle {
            progress_rx: rx,
            thread: Some(thread),
            last_progress: None,
        }
    }

    /// Poll for the latest progress (non-blocking). Drains all
    /// pending progress messages and returns the most recent; once
    /// the worker finishes, returns `Complete` or `Failed`.
    pub fn progress(&mut self) -> ImportStatus {
        while let Ok(p) = self.progress_rx.try_recv() {
            self.last_progress = Some(p);
        }

        if let Some(thread) = &self.thread {
            if thread.is_finished() {
                let thread = self.thread.take().unwrap();
                return match thread.join() {
                    Ok(Ok(tracks)) => ImportStatus::Complete(tracks),
                    Ok(Err(message)) => ImportStatus::Failed(message),
                    Err(_) => ImportStatus::Failed("import thread panicked".to_string()),
                };
            }
        } else {
            return ImportStatus::Failed("import already consumed".to_string());
        }

        match self.last_progress {
            Some(p) => ImportStatus::Running(p),
            None => ImportStatus::Pending,
        }
    }

    /// Block until the import finishes.
    pub fn wait(mut self) -> std::result::Result<Vec<WaveTrack>, String> {
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result,
                Err(_) => Err("import thread panicked".to_string()),
            },
            None => Err("import already consumed".to_string()),
        }
    }

    /// Whether the worker has finished (non-blocking).
    pub fn is_done(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_import_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DirManager::new(tmp.path().join("proj"));
        let wav = tmp.path().join("in.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&wav, spec).unwrap();
        for i in 0..4410i16 {
            writer.write_sample(i).unwrap();
        }
        writer.finalize().unwrap();

        let handle = ImportHandle::start(dir, &wav);
        let tracks = handle.wait().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].clips()[0].num_samples(), 4410);
    }

    #[test]
    fn test_missing_file_reports_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DirManager::new(tmp.path().join("proj"));
        let mut handle = ImportHandle::start(dir, tmp.path().join("nope.wav"));

        loop {
            match handle.progress() {
                ImportStatus::Failed(_) => break,
                ImportStatus::Complete(_) => panic!("expected a failure"),
                _ => std::thread::yield_now(),
            }
        }
    }
}
