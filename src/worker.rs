//! Background jobs and the hand-off back to the editor thread.
//!
//! Slow collaborators (inpaint, image generation, OCR) run on named worker
//! threads. They never touch the [`EditorSession`] directly: results are
//! posted as closures through a [`UiPoster`] and applied when the owner of
//! the session calls [`UiQueue::drain`] (once per frame in a GUI, in a loop
//! for headless callers).

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::DynamicImage;

use crate::session::{EditorSession, Notice};

pub type UiTask = Box<dyn FnOnce(&mut EditorSession) + Send + 'static>;

/// Receiving end, owned by whoever owns the session.
pub struct UiQueue {
    tx: mpsc::Sender<UiTask>,
    rx: mpsc::Receiver<UiTask>,
}

impl Default for UiQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UiQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub fn poster(&self) -> UiPoster {
        UiPoster { tx: self.tx.clone() }
    }

    /// Apply every task posted so far; returns how many ran.
    pub fn drain(&self, session: &mut EditorSession) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task(session);
            ran += 1;
        }
        ran
    }

    /// Block up to `timeout` for one task and apply it.
    pub fn wait_one(&self, session: &mut EditorSession, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                task(session);
                true
            }
            Err(_) => false,
        }
    }
}

/// Sending end, cloned into worker threads.
#[derive(Clone)]
pub struct UiPoster {
    tx: mpsc::Sender<UiTask>,
}

impl UiPoster {
    /// Queue `task` for the editor thread. Returns false once the queue is gone.
    pub fn post(&self, task: impl FnOnce(&mut EditorSession) + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }

    pub fn notify(&self, notice: Notice) -> bool {
        self.post(move |s| s.notify(notice))
    }
}

/// Progress messages from a worker, shown as status notices.
#[derive(Clone)]
pub struct Progress {
    poster: UiPoster,
}

impl Progress {
    pub fn report(&self, msg: impl Into<String>) {
        let _ = self.poster.notify(Notice::Status(msg.into()));
    }
}

/// Run `job` on a named thread. A panicking job is logged and reported as an
/// error notice instead of taking the editor down.
pub fn spawn_worker<F>(name: &str, poster: UiPoster, job: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce(UiPoster, Progress) + Send + 'static,
{
    let label = name.to_string();
    thread::Builder::new().name(format!("slidefe-{}", name)).spawn(move || {
        let progress = Progress { poster: poster.clone() };
        let job_poster = poster.clone();
        if panic::catch_unwind(AssertUnwindSafe(move || job(job_poster, progress))).is_err() {
            crate::log_err!("worker '{}' panicked", label);
            let _ = poster.notify(Notice::Error(format!("{} failed unexpectedly", label)));
        }
    })
}

/// A PNG written to a temporary file for collaborators that want a path.
/// The file is removed when this value is dropped.
pub struct TempImage {
    file: tempfile::NamedTempFile,
}

impl TempImage {
    pub fn write_png(img: &DynamicImage) -> io::Result<Self> {
        let file = tempfile::Builder::new().prefix("slidefe_").suffix(".png").tempfile()?;
        img.save_with_format(file.path(), image::ImageFormat::Png)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{MemoryImageStore, Page};
    use crate::settings::EditorSettings;
    use image::RgbaImage;
    use std::sync::Arc;

    fn session() -> EditorSession {
        EditorSession::new_with_pages(vec![Page::blank(8, 8)], EditorSettings::default(), Arc::new(MemoryImageStore::new()))
    }

    #[test]
    fn worker_results_apply_on_drain() {
        let queue = UiQueue::new();
        let mut s = session();
        let handle = spawn_worker("test", queue.poster(), |poster, progress| {
            progress.report("halfway");
            poster.post(|s| s.name = "from worker".into());
        })
        .unwrap();
        handle.join().unwrap();
        assert_eq!(queue.drain(&mut s), 2);
        assert_eq!(s.name, "from worker");
        assert_eq!(s.take_notices(), vec![Notice::Status("halfway".into())]);
        assert_eq!(queue.drain(&mut s), 0);
    }

    #[test]
    fn panicking_worker_reports_error() {
        let queue = UiQueue::new();
        let mut s = session();
        let handle = spawn_worker("boom", queue.poster(), |_, _| panic!("kaput")).unwrap();
        handle.join().unwrap();
        assert!(queue.wait_one(&mut s, Duration::from_secs(1)));
        assert!(matches!(s.take_notices().as_slice(), [Notice::Error(_)]));
    }

    #[test]
    fn temp_image_is_removed_on_drop() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(2, 2));
        let tmp = TempImage::write_png(&img).unwrap();
        let path = tmp.path().to_path_buf();
        assert!(path.is_file());
        drop(tmp);
        assert!(!path.exists());
    }
}
