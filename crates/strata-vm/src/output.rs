//! Output sinks for `Print` and the fatal-error page

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Opaque write target owned by the request
pub trait OutputSink {
    /// Write raw bytes
    fn write(&mut self, bytes: &[u8]);

    /// Send the client elsewhere (used for the configured error page)
    fn redirect(&mut self, _url: &str) {}
}

/// Writes to the process's standard output
#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&mut self, bytes: &[u8]) {
        let _ = std::io::stdout().write_all(bytes);
    }
}

/// In-memory sink whose buffer stays readable from outside the context
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    buf: Rc<RefCell<Vec<u8>>>,
    redirects: Rc<RefCell<Vec<String>>>,
}

impl SharedBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered output as UTF-8 (lossy)
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.borrow()).into_owned()
    }

    /// Redirect targets requested so far
    pub fn redirects(&self) -> Vec<String> {
        self.redirects.borrow().clone()
    }

    /// Discard buffered output
    pub fn clear(&self) {
        self.buf.borrow_mut().clear();
    }
}

impl OutputSink for SharedBuffer {
    fn write(&mut self, bytes: &[u8]) {
        self.buf.borrow_mut().extend_from_slice(bytes);
    }

    fn redirect(&mut self, url: &str) {
        self.redirects.borrow_mut().push(url.to_string());
    }
}
