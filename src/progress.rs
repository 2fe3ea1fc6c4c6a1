//! Progress-callback trait for per-page refinement and translation events.
//!
//! Inject an [`Arc<dyn TranscribeProgressCallback>`] via
//! [`crate::config::TranscribeConfigBuilder::progress_callback`] to receive
//! events as pages move through the stages.
//!
//! Callers forward events wherever they like (a progress bar, a channel, a
//! job table) without the library knowing how the host communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_transcribe::{TranscribeConfig, TranscribeProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl TranscribeProgressCallback for Counter {
//!     fn on_page_complete(&self, _page: usize, _total: usize, _len: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = TranscribeConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the run as it processes each page.
///
/// Pages are processed concurrently, so the per-page methods may be called
/// from different tasks at once. Every method defaults to a no-op.
pub trait TranscribeProgressCallback: Send + Sync {
    /// Called once, after rendering, before any page is processed.
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a page starts its first stage.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called each time a page enters a new refinement state.
    ///
    /// `stage` is the state's display name (`ocr_extracted`,
    /// `feedback_refined(1)`, …).
    fn on_stage(&self, page_num: usize, stage: &str) {
        let _ = (page_num, stage);
    }

    /// Called when a page's artifact is persisted.
    ///
    /// `output_len` is the byte length of the written Markdown.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, output_len: usize) {
        let _ = (page_num, total_pages, output_len);
    }

    /// Called when a page fails; the run continues with the others.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after every page has been attempted.
    fn on_run_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// Default when no callback is configured.
pub struct NoopProgressCallback;

impl TranscribeProgressCallback for NoopProgressCallback {}

/// The type stored in [`crate::config::TranscribeConfig`].
pub type ProgressCallback = Arc<dyn TranscribeProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Tracking {
        completes: AtomicUsize,
        errors: AtomicUsize,
        stages: Mutex<Vec<String>>,
        success: AtomicUsize,
    }

    impl TranscribeProgressCallback for Tracking {
        fn on_stage(&self, page_num: usize, stage: &str) {
            self.stages
                .lock()
                .expect("lock")
                .push(format!("{page_num}:{stage}"));
        }

        fn on_page_complete(&self, _page: usize, _total: usize, _len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_run_complete(&self, _total: usize, success_count: usize) {
            self.success.store(success_count, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(5);
        cb.on_page_start(1, 5);
        cb.on_stage(1, "ocr_extracted");
        cb.on_page_complete(1, 5, 42);
        cb.on_page_error(2, 5, "some error");
        cb.on_run_complete(5, 4);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = Arc::new(Tracking::default());
        let cb: ProgressCallback = tracker.clone();

        cb.on_stage(1, "initial_converted");
        cb.on_page_complete(1, 2, 100);
        cb.on_page_error(2, 2, "timeout");
        cb.on_run_complete(2, 1);

        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.success.load(Ordering::SeqCst), 1);
        assert_eq!(
            *tracker.stages.lock().expect("lock"),
            vec!["1:initial_converted".to_string()]
        );
    }
}
