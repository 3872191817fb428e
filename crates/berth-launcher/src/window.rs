use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::Context;

/// Opaque id a [`WindowBackend`] assigns to a window it opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    Opened(WindowId),
    Focused(WindowId),
}

pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Opens instance URLs for the user.
pub trait WindowManager: Send + Sync {
    /// Focuses the window already showing `url`, or opens a new one.
    fn open_or_focus(&self, url: &str) -> anyhow::Result<WindowAction>;

    /// Runs `callback` once the window showing `url` is closed.
    fn on_closed(&self, url: &str, callback: CloseCallback);

    /// Reports that the user closed the window showing `url`.
    fn closed(&self, url: &str);
}

/// Whatever actually draws windows.
pub trait WindowBackend: Send + Sync {
    fn open(&self, url: &str) -> anyhow::Result<WindowId>;
    fn focus(&self, id: WindowId) -> anyhow::Result<()>;

    /// Whether [`WindowManager::closed`] will be called when the user closes one of
    /// this backend's windows. Without that, a remembered window may be long gone.
    fn reports_close(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct Windows {
    open: HashMap<String, WindowId>,
    on_close: HashMap<String, Vec<CloseCallback>>,
}

/// Tracks one window per URL on top of a [`WindowBackend`].
///
/// Closing a window only forgets it here; the instance behind the URL keeps running.
/// Windows of a backend that does not report closes are never remembered, so every
/// `open_or_focus` opens one and close callbacks never run.
pub struct WindowRegistry<B> {
    backend: B,
    windows: Arc<Mutex<Windows>>,
}

impl<B: WindowBackend> WindowRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            windows: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self, url: &str) -> bool {
        self.lock().open.contains_key(url)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: WindowBackend> WindowManager for WindowRegistry<B> {
    fn open_or_focus(&self, url: &str) -> anyhow::Result<WindowAction> {
        let existing = self.lock().open.get(url).copied();
        if let Some(id) = existing {
            self.backend
                .focus(id)
                .with_context(|| format!("focus window for {url}"))?;
            tracing::debug!(%url, "focused existing window");
            return Ok(WindowAction::Focused(id));
        }

        let id = self
            .backend
            .open(url)
            .with_context(|| format!("open window for {url}"))?;
        if self.backend.reports_close() {
            self.lock().open.insert(url.to_string(), id);
        }
        tracing::info!(%url, "opened window");
        Ok(WindowAction::Opened(id))
    }

    fn on_closed(&self, url: &str, callback: CloseCallback) {
        self.lock()
            .on_close
            .entry(url.to_string())
            .or_default()
            .push(callback);
    }

    fn closed(&self, url: &str) {
        let callbacks = {
            let mut windows = self.lock();
            if windows.open.remove(url).is_none() {
                return;
            }
            windows.on_close.remove(url).unwrap_or_default()
        };
        tracing::debug!(%url, "window closed");
        for cb in callbacks {
            cb();
        }
    }
}

/// Shows instances in the user's browser through the desktop URL opener.
///
/// A browser tab can neither be focused nor watched from outside: opening an instance
/// again opens a fresh tab.
#[derive(Debug, Default)]
pub struct BrowserBackend {
    next_id: std::sync::atomic::AtomicU64,
}

impl BrowserBackend {
    fn opener() -> (&'static str, &'static [&'static str]) {
        if cfg!(target_os = "macos") {
            ("open", &[])
        } else if cfg!(target_os = "windows") {
            ("cmd", &["/C", "start", ""])
        } else {
            ("xdg-open", &[])
        }
    }
}

impl WindowBackend for BrowserBackend {
    fn open(&self, url: &str) -> anyhow::Result<WindowId> {
        let (program, args) = Self::opener();
        std::process::Command::new(program)
            .args(args)
            .arg(url)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .with_context(|| format!("run {program}"))?;
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(WindowId(id))
    }

    fn focus(&self, _id: WindowId) -> anyhow::Result<()> {
        Ok(())
    }

    fn reports_close(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct RecordingBackend {
        opened: Mutex<Vec<String>>,
        focused: AtomicUsize,
    }

    impl WindowBackend for RecordingBackend {
        fn open(&self, url: &str) -> anyhow::Result<WindowId> {
            let mut opened = self.opened.lock().unwrap();
            opened.push(url.to_string());
            Ok(WindowId(opened.len() as u64))
        }

        fn focus(&self, _id: WindowId) -> anyhow::Result<()> {
            self.focused.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingBackend;

    impl WindowBackend for FailingBackend {
        fn open(&self, _url: &str) -> anyhow::Result<WindowId> {
            anyhow::bail!("no display")
        }

        fn focus(&self, _id: WindowId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn second_open_focuses_instead_of_duplicating() {
        let reg = WindowRegistry::new(RecordingBackend::default());
        let first = reg.open_or_focus("http://localhost:19000").unwrap();
        let second = reg.open_or_focus("http://localhost:19000").unwrap();

        assert_eq!(first, WindowAction::Opened(WindowId(1)));
        assert_eq!(second, WindowAction::Focused(WindowId(1)));
        assert_eq!(reg.backend().opened.lock().unwrap().len(), 1);
        assert_eq!(reg.backend().focused.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_clears_entry_and_runs_callbacks_once() {
        let reg = WindowRegistry::new(RecordingBackend::default());
        let url = "http://localhost:19001";
        reg.open_or_focus(url).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        reg.on_closed(url, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        reg.closed(url);
        reg.closed(url);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!reg.is_open(url));

        assert_eq!(reg.open_or_focus(url).unwrap(), WindowAction::Opened(WindowId(2)));
    }

    /// Opens like a browser does: no close notifications.
    #[derive(Default)]
    struct TabBackend {
        opened: AtomicUsize,
    }

    impl WindowBackend for TabBackend {
        fn open(&self, _url: &str) -> anyhow::Result<WindowId> {
            Ok(WindowId(self.opened.fetch_add(1, Ordering::SeqCst) as u64))
        }

        fn focus(&self, _id: WindowId) -> anyhow::Result<()> {
            panic!("nothing to focus")
        }

        fn reports_close(&self) -> bool {
            false
        }
    }

    #[test]
    fn unwatched_windows_are_reopened_not_focused() {
        let reg = WindowRegistry::new(TabBackend::default());
        let url = "http://localhost:19003";
        assert_eq!(reg.open_or_focus(url).unwrap(), WindowAction::Opened(WindowId(0)));
        assert_eq!(reg.open_or_focus(url).unwrap(), WindowAction::Opened(WindowId(1)));
        assert!(!reg.is_open(url));
        assert!(!BrowserBackend::default().reports_close());
    }

    #[test]
    fn backend_failure_leaves_no_entry() {
        let reg = WindowRegistry::new(FailingBackend);
        let err = reg.open_or_focus("http://localhost:19002").unwrap_err();
        assert!(format!("{err:#}").contains("no display"));
        assert!(!reg.is_open("http://localhost:19002"));
    }
}
