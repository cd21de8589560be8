//! Event output sink
//!
//! When `[output] store` is configured, a wildcard subscription records
//! every dispatched event. Events are buffered during a stop and appended
//! to the store as JSON Lines by a continue-hook, so file I/O happens just
//! before the VM resumes rather than inside dispatch.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::{Event, EventFilter};
use crate::error::Result;
use crate::event::{ContinueHookId, EventManager, Subscription};

#[derive(Debug, Serialize)]
struct RecordedEvent {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: Event,
}

type Buffer = Rc<RefCell<Vec<RecordedEvent>>>;

pub struct OutputManager {
    path: PathBuf,
    em: Rc<EventManager>,
    buffer: Buffer,
    sub: Rc<Subscription>,
    hook: ContinueHookId,
}

impl OutputManager {
    pub fn new(em: Rc<EventManager>, path: PathBuf) -> Result<Rc<Self>> {
        let buffer: Buffer = Rc::new(RefCell::new(Vec::new()));

        let record_buffer = Rc::clone(&buffer);
        let sub = Subscription::new(EventFilter::Any, move |event| {
            record_buffer.borrow_mut().push(RecordedEvent {
                timestamp: Utc::now(),
                event: event.clone(),
            });
            Ok(())
        });
        em.request_event(&sub, false)?;

        let flush_buffer = Rc::clone(&buffer);
        let flush_path = path.clone();
        let hook = em.add_continue_hook(move || flush(&flush_path, &flush_buffer));

        tracing::debug!("recording events to {}", path.display());
        Ok(Rc::new(Self {
            path,
            em,
            buffer,
            sub,
            hook,
        }))
    }

    pub fn uninit(&self) -> Result<()> {
        self.em.cancel_event(&self.sub)?;
        self.em.remove_continue_hook(self.hook)?;
        flush(&self.path, &self.buffer);
        Ok(())
    }
}

/// Append the buffered events to the store. On I/O failure the buffer is
/// kept so the events are retried at the next flush.
fn flush(path: &Path, buffer: &Buffer) {
    let mut events = buffer.borrow_mut();
    if events.is_empty() {
        return;
    }

    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            for event in events.iter() {
                let line = serde_json::to_string(event)?;
                writeln!(file, "{}", line)?;
            }
            Ok(())
        });

    match result {
        Ok(()) => events.clear(),
        Err(error) => {
            tracing::warn!("failed to record events to {}: {}", path.display(), error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Arch, SingleStepMethod};
    use crate::testutil::MockHypervisor;

    fn temp_store(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vmlens-{}-{}", std::process::id(), name))
    }

    #[test]
    fn events_are_written_as_json_lines() {
        let hv = MockHypervisor::new(Arch::X86_64, 1);
        let em = EventManager::new(hv);
        let path = temp_store("events.jsonl");
        let _ = std::fs::remove_file(&path);

        let output = OutputManager::new(Rc::clone(&em), path.clone()).unwrap();
        em.dispatch(&Event::VmReady);
        em.dispatch(&Event::SingleStep {
            cpu: 1,
            method: SingleStepMethod::Debug,
        });
        em.call_continue_hooks();
        output.uninit().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "VmReady");
        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(lines[1]["type"], "SingleStep");
        assert_eq!(lines[1]["cpu"], 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn uninit_removes_subscription_and_hook() {
        let hv = MockHypervisor::new(Arch::X86_64, 1);
        let em = EventManager::new(hv);
        let path = temp_store("uninit.jsonl");
        let _ = std::fs::remove_file(&path);

        let output = OutputManager::new(Rc::clone(&em), path.clone()).unwrap();
        output.uninit().unwrap();

        // Nothing is recorded after teardown.
        em.dispatch(&Event::VmReady);
        em.call_continue_hooks();
        assert!(!path.exists());
    }
}
