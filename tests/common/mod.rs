//! Shared helpers for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use resilient_db::config::ResilientDbConfig;
use resilient_db::executor::QueryExecutor;
use resilient_db::test_helpers::{test_config, MockConnectionManager};
use std::io;
use std::sync::Arc;
use tracing::subscriber::DefaultGuard;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Captures formatted log output for assertions.
///
/// Installed as the thread-local default, so use it from `#[tokio::test]`
/// functions running on the current-thread runtime.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

pub fn mock_executor() -> (MockConnectionManager, QueryExecutor<MockConnectionManager>) {
    mock_executor_with(test_config())
}

pub fn mock_executor_with(
    config: ResilientDbConfig,
) -> (MockConnectionManager, QueryExecutor<MockConnectionManager>) {
    let manager = MockConnectionManager::new();
    let executor =
        QueryExecutor::with_manager(manager.clone(), config).expect("valid test configuration");
    (manager, executor)
}
